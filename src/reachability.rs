use std::time::Duration;
use tracing::{debug, trace};
use url::Url;

use crate::cache::{TtlCache, REACHABILITY_TTL};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Width/height applied when normalizing resize query parameters.
const NORMALIZED_DIMENSION: &str = "1200";

const RESIZE_PARAMS: &[&str] = &["w", "h", "width", "height", "size", "resize"];

/// Decides whether an image URL (or a near variant of it) is actually
/// retrievable. Verdicts are cached; a probe success is best-effort and does
/// not guarantee content integrity.
pub struct Reachability {
    client: reqwest::Client,
    cache: TtlCache<bool>,
}

impl Reachability {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            cache: TtlCache::new(REACHABILITY_TTL),
        }
    }

    /// HEAD-probes a URL, caching the verdict either way.
    pub async fn probe(&self, url: &str) -> bool {
        if let Some(verdict) = self.cache.get(url) {
            trace!(url, verdict, "reachability cache hit");
            return verdict;
        }
        let verdict = match self.client.head(url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        };
        self.cache.set(url, verdict);
        verdict
    }

    /// Probes the original URL and then its rewrites in order, returning the
    /// first that answers.
    pub async fn resolve_working_variant(&self, original: &str) -> Option<String> {
        for candidate in candidate_variants(original) {
            if self.probe(&candidate).await {
                debug!(original, resolved = %candidate, "working variant found");
                return Some(candidate);
            }
        }
        debug!(original, "no working variant");
        None
    }
}

impl Default for Reachability {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordered rewrites of an image URL that commonly rescue broken candidates:
/// query stripping, resize-parameter normalization, modern-format fallback,
/// numbered CDN subdomain collapse, and an https upgrade. The original comes
/// first; each rewrite is applied to the original independently.
pub fn candidate_variants(original: &str) -> Vec<String> {
    let mut out = vec![original.to_string()];
    let mut push = |candidate: String, out: &mut Vec<String>| {
        if !out.contains(&candidate) {
            out.push(candidate);
        }
    };

    if let Some(idx) = original.find('?') {
        push(original[..idx].to_string(), &mut out);
    }

    if let Some(normalized) = normalize_resize_params(original) {
        push(normalized, &mut out);
    }

    // Byte offsets into the lowercased copy only line up for ASCII input.
    let lower = original.to_ascii_lowercase();
    for modern in [".webp", ".avif"] {
        if let Some(idx) = lower.find(modern) {
            let mut swapped = String::with_capacity(original.len());
            swapped.push_str(&original[..idx]);
            swapped.push_str(".jpg");
            swapped.push_str(&original[idx + modern.len()..]);
            push(swapped, &mut out);
        }
    }

    if let Some(collapsed) = collapse_numbered_subdomain(original) {
        push(collapsed, &mut out);
    }

    if let Some(rest) = original.strip_prefix("http://") {
        push(format!("https://{rest}"), &mut out);
    }

    out
}

/// Rewrites known resize query parameters (`w`, `h`, `width`, ...) to a fixed
/// large size, leaving every other parameter untouched.
fn normalize_resize_params(original: &str) -> Option<String> {
    let url = Url::parse(original).ok()?;
    if url.query().is_none() {
        return None;
    }
    let mut touched = false;
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            if RESIZE_PARAMS.contains(&k.to_lowercase().as_str()) && v.parse::<u32>().is_ok() {
                touched = true;
                (k.into_owned(), NORMALIZED_DIMENSION.to_string())
            } else {
                (k.into_owned(), v.into_owned())
            }
        })
        .collect();
    if !touched {
        return None;
    }
    let mut rewritten = url.clone();
    rewritten
        .query_pairs_mut()
        .clear()
        .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    Some(rewritten.to_string())
}

/// `img3.example.com` style hosts usually have an un-numbered sibling that
/// serves the same content with laxer rules.
fn collapse_numbered_subdomain(original: &str) -> Option<String> {
    let url = Url::parse(original).ok()?;
    let host = url.host_str()?;
    let (first, rest) = host.split_once('.')?;
    let stripped: &str = first.trim_end_matches(|c: char| c.is_ascii_digit());
    if stripped.is_empty() || stripped.len() == first.len() {
        return None;
    }
    let mut rewritten = url.clone();
    rewritten.set_host(Some(&format!("{stripped}.{rest}"))).ok()?;
    Some(rewritten.to_string())
}
