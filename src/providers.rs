use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

use crate::error::{Result, SlidekitError};
use crate::settings::Settings;

const OPENAI_CHAT_COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";
const GROQ_CHAT_COMPLETIONS_URL: &str = "https://api.groq.com/openai/v1/chat/completions";
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
const DEFAULT_GROQ_MODEL: &str = "llama-3.3-70b-versatile";
const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";

/// The selectable text-generation backends. Two speak the OpenAI
/// chat-completions dialect; Gemini has its own envelope on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Groq,
    Gemini,
}

impl Provider {
    pub fn name(self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Groq => "groq",
            Provider::Gemini => "gemini",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything needed to issue one provider call. Building it is pure; the
/// caller owns the HTTP.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: serde_json::Value,
}

/// Maps `(provider, prompt)` to a concrete HTTP request, failing only when
/// the provider's credential is absent.
pub fn build_request(
    provider: Provider,
    prompt: &str,
    settings: &Settings,
) -> Result<ProviderRequest> {
    match provider {
        Provider::OpenAi => {
            let key = settings
                .openai_key()
                .ok_or(SlidekitError::MissingCredentials("openai"))?;
            let model = settings
                .openai_model
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string());
            Ok(chat_completions_request(
                OPENAI_CHAT_COMPLETIONS_URL,
                &key,
                &model,
                prompt,
            ))
        }
        Provider::Groq => {
            let key = settings
                .groq_key()
                .ok_or(SlidekitError::MissingCredentials("groq"))?;
            let model = settings
                .groq_model
                .clone()
                .unwrap_or_else(|| DEFAULT_GROQ_MODEL.to_string());
            Ok(chat_completions_request(
                GROQ_CHAT_COMPLETIONS_URL,
                &key,
                &model,
                prompt,
            ))
        }
        Provider::Gemini => {
            let key = settings
                .gemini_key()
                .ok_or(SlidekitError::MissingCredentials("gemini"))?;
            let model = settings
                .gemini_model
                .clone()
                .unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string());
            Ok(ProviderRequest {
                url: format!("{GEMINI_BASE_URL}/{model}:generateContent"),
                headers: vec![("X-goog-api-key".to_string(), key)],
                body: json!({
                    "contents": [
                        { "role": "user", "parts": [ { "text": prompt } ] }
                    ],
                    "generationConfig": { "responseMimeType": "application/json" }
                }),
            })
        }
    }
}

fn chat_completions_request(url: &str, key: &str, model: &str, prompt: &str) -> ProviderRequest {
    ProviderRequest {
        url: url.to_string(),
        headers: vec![("Authorization".to_string(), format!("Bearer {key}"))],
        body: json!({
            "model": model,
            "messages": [ { "role": "user", "content": prompt } ],
            "temperature": 0.7,
            "response_format": { "type": "json_object" }
        }),
    }
}

/// Unwraps a provider's response envelope down to the model's text payload.
pub fn unwrap_response(provider: Provider, value: &serde_json::Value) -> Result<String> {
    let text = match provider {
        Provider::OpenAi | Provider::Groq => value
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|t| t.as_str())
            .map(|s| s.to_string()),
        Provider::Gemini => gemini_first_text(value),
    };
    text.filter(|t| !t.trim().is_empty()).ok_or_else(|| {
        SlidekitError::SchemaValidationError(format!("empty completion from {provider}"))
    })
}

/// Gemini nests text under candidates[].content.parts[].text; take the first
/// non-empty part.
fn gemini_first_text(value: &serde_json::Value) -> Option<String> {
    let candidates = value.get("candidates")?.as_array()?;
    for candidate in candidates {
        let Some(parts) = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
        else {
            continue;
        };
        for part in parts {
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                if !text.is_empty() {
                    return Some(text.to_string());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with_keys() -> Settings {
        Settings {
            openai_api_key: Some("sk-test".to_string()),
            groq_api_key: Some("gsk-test".to_string()),
            gemini_api_key: Some("AIza-test".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn openai_request_uses_bearer_auth_and_chat_envelope() {
        let req = build_request(Provider::OpenAi, "hello", &settings_with_keys()).unwrap();
        assert_eq!(req.url, OPENAI_CHAT_COMPLETIONS_URL);
        assert_eq!(
            req.headers,
            vec![("Authorization".to_string(), "Bearer sk-test".to_string())]
        );
        assert_eq!(req.body["messages"][0]["content"], "hello");
        assert_eq!(req.body["model"], DEFAULT_OPENAI_MODEL);
    }

    #[test]
    fn groq_request_targets_groq_endpoint_with_same_envelope() {
        let req = build_request(Provider::Groq, "hi", &settings_with_keys()).unwrap();
        assert_eq!(req.url, GROQ_CHAT_COMPLETIONS_URL);
        assert_eq!(req.body["model"], DEFAULT_GROQ_MODEL);
        assert_eq!(req.body["messages"][0]["role"], "user");
    }

    #[test]
    fn gemini_request_uses_goog_header_and_contents_envelope() {
        let req = build_request(Provider::Gemini, "prompt text", &settings_with_keys()).unwrap();
        assert!(req.url.ends_with(":generateContent"));
        assert!(req.url.contains(DEFAULT_GEMINI_MODEL));
        assert_eq!(req.headers[0].0, "X-goog-api-key");
        assert_eq!(req.body["contents"][0]["parts"][0]["text"], "prompt text");
    }

    #[test]
    fn model_overrides_from_settings_are_honored() {
        let settings = Settings {
            gemini_model: Some("gemini-exp".to_string()),
            ..settings_with_keys()
        };
        let req = build_request(Provider::Gemini, "x", &settings).unwrap();
        assert!(req.url.contains("gemini-exp"));
    }

    #[test]
    fn missing_key_fails_with_missing_credentials() {
        if std::env::var("OPENAI_API_KEY").is_ok() {
            return;
        }
        let err = build_request(Provider::OpenAi, "x", &Settings::default()).unwrap_err();
        assert!(matches!(err, SlidekitError::MissingCredentials("openai")));
    }

    #[test]
    fn unwrap_chat_completions_content() {
        let value = serde_json::json!({
            "choices": [ { "message": { "role": "assistant", "content": "{\"slides\":[]}" } } ]
        });
        assert_eq!(
            unwrap_response(Provider::OpenAi, &value).unwrap(),
            "{\"slides\":[]}"
        );
    }

    #[test]
    fn unwrap_gemini_candidates() {
        let value = serde_json::json!({
            "candidates": [
                { "content": { "parts": [ { "text": "" }, { "text": "payload" } ] } }
            ]
        });
        assert_eq!(unwrap_response(Provider::Gemini, &value).unwrap(), "payload");
    }

    #[test]
    fn empty_envelope_is_an_error() {
        let err = unwrap_response(Provider::Groq, &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, SlidekitError::SchemaValidationError(_)));
    }

    #[test]
    fn provider_parses_from_lowercase_strings() {
        assert_eq!(
            serde_json::from_str::<Provider>("\"openai\"").unwrap(),
            Provider::OpenAi
        );
        assert_eq!(
            serde_json::from_str::<Provider>("\"gemini\"").unwrap(),
            Provider::Gemini
        );
    }
}
