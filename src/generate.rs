use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Result, SlidekitError};
use crate::images::ImageService;
use crate::providers::{build_request, unwrap_response, Provider};
use crate::settings::Settings;

pub const MAX_SLIDE_COUNT: usize = 10;
const HOOK_MAX_CHARS: usize = 80;
const BODY_MAX_CHARS: usize = 400;

/// Text generation is the slowest call in the pipeline.
const GENERATION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// Substituted whenever a slide's stock-photo lookup fails or comes back
/// empty. Image sourcing degrades gracefully; text generation never does.
pub const FALLBACK_IMAGE_URL: &str =
    "https://images.unsplash.com/photo-1557683316-973673baf926?w=1200&q=80";

/// Raw per-slide output of the model, before image resolution.
#[derive(Debug, Clone, Deserialize)]
pub struct SlideDraft {
    pub text: String,
    #[serde(rename = "imageQuery")]
    pub image_query: String,
}

#[derive(Debug, Deserialize)]
struct SlidesEnvelope {
    slides: Vec<SlideDraft>,
}

/// A finished slide: text plus a resolved background image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedSlide {
    pub id: usize,
    pub text: String,
    pub image_url: String,
}

/// Produces N slide texts plus one background image per slide from a theme
/// description, across any of the selectable backends.
pub struct ContentGenerator {
    settings: Settings,
    client: reqwest::Client,
    images: Arc<ImageService>,
}

impl ContentGenerator {
    pub fn new(settings: Settings, images: Arc<ImageService>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(GENERATION_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            settings,
            client,
            images,
        }
    }

    pub async fn generate(
        &self,
        theme: &str,
        provider: Provider,
        slide_count: usize,
    ) -> Result<Vec<GeneratedSlide>> {
        if slide_count == 0 || slide_count > MAX_SLIDE_COUNT {
            return Err(SlidekitError::SchemaValidationError(format!(
                "slide count must be between 1 and {MAX_SLIDE_COUNT}, got {slide_count}"
            )));
        }

        let prompt = build_prompt(theme, slide_count);
        let request = build_request(provider, &prompt, &self.settings)?;

        info!(%provider, slide_count, "requesting slide content");
        let mut req = self.client.post(&request.url).json(&request.body);
        for (k, v) in &request.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let resp = req.send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(%provider, status = status.as_u16(), "provider returned an error");
            return Err(SlidekitError::ProviderHttpError {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: serde_json::Value = resp.json().await?;
        let payload = unwrap_response(provider, &envelope)?;

        let images = self.images.clone();
        assemble(&payload, slide_count, move |query: String| {
            let images = images.clone();
            async move {
                let results = images.search_stock(&query, 1).await?;
                Ok(results.into_iter().next().map(|d| d.src))
            }
        })
        .await
    }
}

/// Validates the model payload and resolves one background image per slide.
/// Validation failures short-circuit before any image lookup happens.
pub(crate) async fn assemble<F, Fut>(
    payload: &str,
    slide_count: usize,
    lookup: F,
) -> Result<Vec<GeneratedSlide>>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<Option<String>>>,
{
    let drafts = parse_slides(payload, slide_count)?;
    Ok(resolve_slide_images(drafts, lookup).await)
}

/// Fans out the per-slide lookups concurrently; a failure in one slide's
/// lookup substitutes the fallback URL and leaves the others untouched.
async fn resolve_slide_images<F, Fut>(drafts: Vec<SlideDraft>, lookup: F) -> Vec<GeneratedSlide>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<Option<String>>>,
{
    let lookup = &lookup;
    let futures = drafts.into_iter().enumerate().map(|(idx, draft)| async move {
        let image_url = match lookup(draft.image_query.clone()).await {
            Ok(Some(url)) => url,
            Ok(None) => {
                debug!(query = %draft.image_query, "no stock result, using fallback");
                FALLBACK_IMAGE_URL.to_string()
            }
            Err(e) => {
                warn!(query = %draft.image_query, error = %e, "image lookup failed, using fallback");
                FALLBACK_IMAGE_URL.to_string()
            }
        };
        GeneratedSlide {
            id: idx + 1,
            text: draft.text,
            image_url,
        }
    });
    join_all(futures).await
}

/// Strict schema check: exactly `slide_count` entries, each with non-empty
/// text and image query.
pub(crate) fn parse_slides(payload: &str, slide_count: usize) -> Result<Vec<SlideDraft>> {
    let cleaned = strip_code_fences(payload);
    let envelope: SlidesEnvelope = serde_json::from_str(cleaned).map_err(|e| {
        SlidekitError::SchemaValidationError(format!("payload is not a slides object: {e}"))
    })?;

    if envelope.slides.len() != slide_count {
        return Err(SlidekitError::SchemaValidationError(format!(
            "expected {slide_count} slides, got {}",
            envelope.slides.len()
        )));
    }
    for (idx, slide) in envelope.slides.iter().enumerate() {
        if slide.text.trim().is_empty() {
            return Err(SlidekitError::SchemaValidationError(format!(
                "slide {} has empty text",
                idx + 1
            )));
        }
        if slide.image_query.trim().is_empty() {
            return Err(SlidekitError::SchemaValidationError(format!(
                "slide {} has empty imageQuery",
                idx + 1
            )));
        }
    }
    Ok(envelope.slides)
}

/// Models often wrap JSON in markdown fences despite instructions not to.
fn strip_code_fences(payload: &str) -> &str {
    let trimmed = payload.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}

fn build_prompt(theme: &str, slide_count: usize) -> String {
    format!(
        r#"You write carousel slides for social media.

Task: produce exactly {slide_count} slides about the theme below.

Rules:
- Slide 1 is a short, attention-grabbing hook of at most {HOOK_MAX_CHARS} characters.
- Slides 2..{slide_count} are explanatory text of at most {BODY_MAX_CHARS} characters each.
- Every slide gets an "imageQuery": 2-4 plain English words describing a fitting stock background photo.
- Keep the tone confident and concrete; no hashtags, no emoji.

Output strictly a JSON object in this exact shape, with no commentary and no markdown fences:
{{"slides": [{{"text": "...", "imageQuery": "..."}}]}}

The "slides" array must contain exactly {slide_count} entries.

Theme:
{theme}
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn payload(n: usize) -> String {
        let slides: Vec<String> = (1..=n)
            .map(|i| format!(r#"{{"text": "slide {i} body", "imageQuery": "query {i}"}}"#))
            .collect();
        format!(r#"{{"slides": [{}]}}"#, slides.join(","))
    }

    #[test]
    fn parse_accepts_exact_count() {
        let drafts = parse_slides(&payload(3), 3).unwrap();
        assert_eq!(drafts.len(), 3);
        assert_eq!(drafts[0].text, "slide 1 body");
        assert_eq!(drafts[2].image_query, "query 3");
    }

    #[test]
    fn parse_rejects_wrong_count() {
        let err = parse_slides(&payload(4), 5).unwrap_err();
        match err {
            SlidekitError::SchemaValidationError(msg) => {
                assert!(msg.contains("expected 5"), "got: {msg}")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn parse_rejects_empty_text_and_query() {
        let bad_text = r#"{"slides": [{"text": "  ", "imageQuery": "ok"}]}"#;
        assert!(parse_slides(bad_text, 1).is_err());
        let bad_query = r#"{"slides": [{"text": "ok", "imageQuery": ""}]}"#;
        assert!(parse_slides(bad_query, 1).is_err());
    }

    #[test]
    fn parse_strips_markdown_fences() {
        let fenced = format!("```json\n{}\n```", payload(2));
        let drafts = parse_slides(&fenced, 2).unwrap();
        assert_eq!(drafts.len(), 2);
    }

    #[tokio::test]
    async fn schema_failure_never_reaches_image_lookup() {
        let calls = AtomicU32::new(0);
        let result = assemble(&payload(4), 5, |_query| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(Some("https://img.test/a.jpg".to_string())) }
        })
        .await;

        assert!(matches!(
            result.unwrap_err(),
            SlidekitError::SchemaValidationError(_)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_lookup_falls_back_without_touching_other_slides() {
        let slides = assemble(&payload(5), 5, |query| async move {
            if query == "query 3" {
                Err(SlidekitError::NoQualityImagesFound)
            } else {
                Ok(Some(format!("https://img.test/{}.jpg", query.replace(' ', "-"))))
            }
        })
        .await
        .unwrap();

        assert_eq!(slides.len(), 5);
        assert_eq!(slides[2].image_url, FALLBACK_IMAGE_URL);
        assert_eq!(slides[0].image_url, "https://img.test/query-1.jpg");
        assert_eq!(slides[4].image_url, "https://img.test/query-5.jpg");
    }

    #[tokio::test]
    async fn empty_lookup_result_uses_fallback() {
        let slides = assemble(&payload(1), 1, |_query| async { Ok(None) }).await.unwrap();
        assert_eq!(slides[0].image_url, FALLBACK_IMAGE_URL);
    }

    #[tokio::test]
    async fn slide_ids_are_one_based_and_ordered() {
        let slides = assemble(&payload(3), 3, |_q| async {
            Ok(Some("https://img.test/x.jpg".to_string()))
        })
        .await
        .unwrap();
        let ids: Vec<usize> = slides.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn prompt_names_the_slide_count_and_bounds() {
        let prompt = build_prompt("Rust for beginners", 5);
        assert!(prompt.contains("exactly 5 slides"));
        assert!(prompt.contains("Rust for beginners"));
        assert!(prompt.contains("80 characters"));
    }

    #[test]
    fn fence_stripping_handles_plain_and_labeled_fences() {
        assert_eq!(strip_code_fences("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_code_fences("{}"), "{}");
    }
}
