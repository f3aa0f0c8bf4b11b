use once_cell::sync::Lazy;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::{TtlCache, HTML_TTL};
use crate::error::{Result, SlidekitError};

/// Bodies shorter than this are almost always relay error pages or empty
/// proxy responses, not the target document.
const MIN_BODY_LEN: usize = 100;

const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_JITTER_MS: u64 = 250;
const DEFAULT_RETRIES_PER_RELAY: u32 = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// How a relay wraps the target body in its own response.
#[derive(Debug, Clone, Copy)]
pub enum BodyUnwrap {
    /// Target body passed through untouched.
    Raw,
    /// Target body nested in a JSON field of the relay's envelope.
    JsonField(&'static str),
}

/// One relay endpoint: pure data, no behavior of its own.
pub struct RelayDescriptor {
    pub name: &'static str,
    pub build_url: fn(&str) -> String,
    pub unwrap: BodyUnwrap,
    pub headers: &'static [(&'static str, &'static str)],
}

fn encode(target: &str) -> String {
    url::form_urlencoded::byte_serialize(target.as_bytes()).collect()
}

fn allorigins_url(target: &str) -> String {
    format!("https://api.allorigins.win/get?url={}", encode(target))
}

fn corsproxy_url(target: &str) -> String {
    format!("https://corsproxy.io/?url={}", encode(target))
}

fn codetabs_url(target: &str) -> String {
    format!("https://api.codetabs.com/v1/proxy?quest={}", encode(target))
}

/// Fixed relay order; any one of them may be down or rate-limited for a
/// given target, so the chain walks them until a body is accepted.
pub static RELAYS: Lazy<Vec<RelayDescriptor>> = Lazy::new(|| {
    vec![
        RelayDescriptor {
            name: "allorigins",
            build_url: allorigins_url,
            unwrap: BodyUnwrap::JsonField("contents"),
            headers: &[("Accept", "application/json")],
        },
        RelayDescriptor {
            name: "corsproxy",
            build_url: corsproxy_url,
            unwrap: BodyUnwrap::Raw,
            headers: &[],
        },
        RelayDescriptor {
            name: "codetabs",
            build_url: codetabs_url,
            unwrap: BodyUnwrap::Raw,
            headers: &[],
        },
    ]
});

/// Rotated per attempt to lower the odds of anti-scraping blocks. Heuristic,
/// not a guarantee.
static USER_AGENTS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    ]
});

fn attempt_headers(relay: &RelayDescriptor) -> Vec<(String, String)> {
    let ua = USER_AGENTS[rand::thread_rng().gen_range(0..USER_AGENTS.len())];
    let mut headers = vec![
        ("User-Agent".to_string(), ua.to_string()),
        ("Accept-Language".to_string(), "en-US,en;q=0.9".to_string()),
        ("Referer".to_string(), "https://www.google.com/".to_string()),
    ];
    for (k, v) in relay.headers {
        headers.push(((*k).to_string(), (*v).to_string()));
    }
    headers
}

fn unwrap_body(relay: &RelayDescriptor, raw: &str) -> std::result::Result<String, String> {
    match relay.unwrap {
        BodyUnwrap::Raw => Ok(raw.to_string()),
        BodyUnwrap::JsonField(field) => {
            let value: serde_json::Value = serde_json::from_str(raw)
                .map_err(|e| format!("envelope parse failed: {e}"))?;
            value
                .get(field)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| format!("envelope missing '{field}' field"))
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..BACKOFF_JITTER_MS);
    Duration::from_millis(BACKOFF_BASE_MS * 2u64.pow(attempt.saturating_sub(1)) + jitter)
}

/// Core chain walk, generic over the transport so the fallthrough and
/// exhaustion semantics can be exercised without a network.
pub(crate) async fn fetch_through_relays_with<F, Fut>(
    relays: &[RelayDescriptor],
    target_url: &str,
    max_retries_per_relay: u32,
    mut fetch: F,
) -> Result<String>
where
    F: FnMut(String, Vec<(String, String)>) -> Fut,
    Fut: Future<Output = std::result::Result<String, String>>,
{
    let mut last_relay = "none";
    let mut last_error = "no relays configured".to_string();

    for relay in relays {
        for attempt in 0..max_retries_per_relay {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
            let url = (relay.build_url)(target_url);
            let headers = attempt_headers(relay);
            last_relay = relay.name;

            match fetch(url, headers).await {
                Ok(raw) => match unwrap_body(relay, &raw) {
                    Ok(body) if body.len() >= MIN_BODY_LEN => {
                        info!(relay = relay.name, attempt, len = body.len(), "relay fetch ok");
                        return Ok(body);
                    }
                    Ok(body) => {
                        last_error = format!("body too short ({} chars)", body.len());
                        debug!(relay = relay.name, attempt, %last_error, "rejected body");
                    }
                    Err(e) => {
                        last_error = e;
                        debug!(relay = relay.name, attempt, %last_error, "unwrap failed");
                    }
                },
                Err(e) => {
                    last_error = e;
                    warn!(relay = relay.name, attempt, %last_error, "relay attempt failed");
                }
            }
        }
    }

    Err(SlidekitError::AllRelaysExhausted {
        relay: last_relay.to_string(),
        message: last_error,
    })
}

/// Retrieves arbitrary page bodies through the relay list, caching accepted
/// bodies by target URL.
pub struct RelayChain {
    client: reqwest::Client,
    cache: TtlCache<String>,
}

impl RelayChain {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            cache: TtlCache::new(HTML_TTL),
        }
    }

    pub async fn fetch(&self, target_url: &str) -> Result<String> {
        self.fetch_with_retries(target_url, DEFAULT_RETRIES_PER_RELAY)
            .await
    }

    pub async fn fetch_with_retries(
        &self,
        target_url: &str,
        max_retries_per_relay: u32,
    ) -> Result<String> {
        if let Some(body) = self.cache.get(target_url) {
            debug!(target = target_url, "relay cache hit");
            return Ok(body);
        }

        let client = self.client.clone();
        let body = fetch_through_relays_with(
            &RELAYS,
            target_url,
            max_retries_per_relay,
            move |url, headers| {
                let client = client.clone();
                async move {
                    let mut req = client.get(&url);
                    for (k, v) in &headers {
                        req = req.header(k.as_str(), v.as_str());
                    }
                    let resp = req.send().await.map_err(|e| format!("request failed: {e}"))?;
                    let status = resp.status();
                    if !status.is_success() {
                        return Err(format!("HTTP {status}"));
                    }
                    resp.text().await.map_err(|e| format!("body read failed: {e}"))
                }
            },
        )
        .await?;

        self.cache.set(target_url, body.clone());
        Ok(body)
    }
}

impl Default for RelayChain {
    fn default() -> Self {
        Self::new()
    }
}
