use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use std::collections::HashSet;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{TtlCache, DIMENSIONS_TTL};
use crate::error::{Result, SlidekitError};
use crate::images::{ImageDescriptor, ImageOrigin};
use crate::reachability::Reachability;
use crate::relay::RelayChain;

/// Extensions that mark a URL as pointing straight at an image file.
const DIRECT_IMAGE_EXTENSIONS: &[&str] =
    &[".jpg", ".jpeg", ".png", ".webp", ".gif", ".bmp", ".svg"];

/// Extensions accepted by the quality filter. Narrower than the direct set:
/// gif/bmp/svg candidates are almost never usable slide backgrounds.
const QUALITY_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".webp"];

/// Substrings in a URL or alt text that mark decorative or low-quality
/// assets.
static DENYLIST: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "thumbnail", "icon", "logo", "sprite", "avatar", "banner", "advert",
        "tracking", "pixel", "beacon", "button", "social", "widget", "placeholder",
        "loading", "spinner", "separator", "divider", "watermark", "copyright",
        "signature", "badge", "medal", "flag", "emoji",
    ]
});

/// Tokens too short for a plain substring match: `ad` would reject
/// `loading`, `gradient` and most header images. These only fire when the
/// match is delimited by non-alphanumeric neighbors, as in `/ad/` or `-ads-`.
const BOUNDED_DENY_TOKENS: &[&str] = &["ad", "ads"];

const LAZY_SRC_ATTRS: &[&str] = &["data-src", "data-lazy-src", "data-original"];

const DIMENSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub min_width: u32,
    pub min_height: u32,
    pub max_results: usize,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            min_width: 300,
            min_height: 200,
            max_results: 15,
        }
    }
}

/// A raw image candidate before reachability and quality checks.
#[derive(Debug, Clone)]
pub struct ImageCandidate {
    pub src: String,
    pub alt: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Pulls a bounded, deduplicated, quality-filtered set of images out of an
/// arbitrary web page fetched through the relay chain.
pub struct PageExtractor {
    relay: Arc<RelayChain>,
    reach: Arc<Reachability>,
    dims_cache: TtlCache<(u32, u32)>,
    client: reqwest::Client,
}

impl PageExtractor {
    pub fn new(relay: Arc<RelayChain>, reach: Arc<Reachability>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DIMENSION_PROBE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            relay,
            reach,
            dims_cache: TtlCache::new(DIMENSIONS_TTL),
            client,
        }
    }

    pub async fn extract(
        &self,
        page_url: &str,
        opts: &ExtractOptions,
    ) -> Result<Vec<ImageDescriptor>> {
        let base = parse_page_url(page_url)?;

        if is_direct_image_url(page_url) {
            return self.extract_direct(page_url, opts).await;
        }

        let html = self.relay.fetch(page_url).await?;
        let candidates = collect_candidates(&html, &base);
        info!(page = page_url, candidates = candidates.len(), "collected image candidates");

        let mut results = Vec::new();
        for cand in candidates {
            if results.len() >= opts.max_results {
                break;
            }
            let Some(resolved) = self.reach.resolve_working_variant(&cand.src).await else {
                debug!(src = %cand.src, "candidate unreachable, dropped");
                continue;
            };
            let (width, height) = match (cand.width, cand.height) {
                (Some(w), Some(h)) => (Some(w), Some(h)),
                _ => match self.load_dimensions(&resolved).await {
                    Some((w, h)) => (Some(w), Some(h)),
                    None => (cand.width, cand.height),
                },
            };
            let checked = ImageCandidate {
                src: resolved,
                alt: cand.alt,
                width,
                height,
            };
            if passes_quality(&checked, opts.min_width, opts.min_height) {
                results.push(ImageDescriptor {
                    src: checked.src,
                    alt: checked.alt,
                    width: checked.width,
                    height: checked.height,
                    origin: ImageOrigin::PageExtraction,
                });
            }
        }

        if results.is_empty() {
            return Err(SlidekitError::NoQualityImagesFound);
        }
        Ok(results)
    }

    /// Short-circuit for URLs that are themselves images: no page fetch, one
    /// resolution, one quality check.
    async fn extract_direct(
        &self,
        image_url: &str,
        opts: &ExtractOptions,
    ) -> Result<Vec<ImageDescriptor>> {
        let Some(resolved) = self.reach.resolve_working_variant(image_url).await else {
            return Err(SlidekitError::NoQualityImagesFound);
        };
        let dims = self.load_dimensions(&resolved).await;
        let candidate = ImageCandidate {
            src: resolved,
            alt: String::new(),
            width: dims.map(|d| d.0),
            height: dims.map(|d| d.1),
        };
        if !passes_quality(&candidate, opts.min_width, opts.min_height) {
            return Err(SlidekitError::NoQualityImagesFound);
        }
        Ok(vec![ImageDescriptor {
            src: candidate.src,
            alt: candidate.alt,
            width: candidate.width,
            height: candidate.height,
            origin: ImageOrigin::PageExtraction,
        }])
    }

    /// Fetches the image and decodes just enough to read its pixel size,
    /// bounded by a hard timeout. A timeout or decode failure leaves the
    /// dimensions unknown rather than failing the candidate.
    async fn load_dimensions(&self, url: &str) -> Option<(u32, u32)> {
        if let Some(dims) = self.dims_cache.get(url) {
            return Some(dims);
        }
        let fetch = async {
            let resp = self.client.get(url).send().await.ok()?;
            resp.bytes().await.ok()
        };
        let bytes = match tokio::time::timeout(DIMENSION_PROBE_TIMEOUT, fetch).await {
            Ok(Some(bytes)) => bytes,
            _ => {
                warn!(url, "dimension probe timed out or failed");
                return None;
            }
        };
        let dims = image::ImageReader::new(Cursor::new(&bytes))
            .with_guessed_format()
            .ok()?
            .into_dimensions()
            .ok()?;
        self.dims_cache.set(url, dims);
        Some(dims)
    }
}

fn parse_page_url(page_url: &str) -> Result<Url> {
    let parsed =
        Url::parse(page_url).map_err(|_| SlidekitError::InvalidUrl(page_url.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        _ => Err(SlidekitError::InvalidUrl(page_url.to_string())),
    }
}

pub fn is_direct_image_url(raw: &str) -> bool {
    let path = match Url::parse(raw) {
        Ok(url) => url.path().to_ascii_lowercase(),
        Err(_) => return false,
    };
    DIRECT_IMAGE_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

/// Runs the four collection passes over a parsed document, merging into one
/// set deduplicated by absolute URL. First occurrence wins, so pass order is
/// the implicit candidate priority.
pub fn collect_candidates(html: &str, base: &Url) -> Vec<ImageCandidate> {
    let doc = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    let mut push = |cand: ImageCandidate| {
        if seen.insert(cand.src.clone()) {
            out.push(cand);
        }
    };

    collect_img_tags(&doc, base, &mut push);
    collect_inline_styles(&doc, base, &mut push);
    collect_meta_tags(&doc, base, &mut push);
    collect_json_ld(&doc, base, &mut push);

    out
}

fn collect_img_tags(doc: &Html, base: &Url, push: &mut impl FnMut(ImageCandidate)) {
    let Ok(selector) = Selector::parse("img") else {
        return;
    };
    for el in doc.select(&selector) {
        let raw_src = el
            .value()
            .attr("src")
            .filter(|s| !s.trim().is_empty())
            .or_else(|| {
                LAZY_SRC_ATTRS
                    .iter()
                    .find_map(|attr| el.value().attr(attr).filter(|s| !s.trim().is_empty()))
            })
            .map(|s| s.to_string())
            .or_else(|| {
                el.value()
                    .attr("data-srcset")
                    .and_then(|set| set.split(',').next())
                    .and_then(|entry| entry.split_whitespace().next())
                    .map(|s| s.to_string())
            });
        let Some(raw_src) = raw_src else { continue };
        let Some(src) = normalize_url(&raw_src, base) else {
            continue;
        };
        let alt = el
            .value()
            .attr("alt")
            .or_else(|| el.value().attr("title"))
            .unwrap_or("")
            .to_string();
        push(ImageCandidate {
            src,
            alt,
            width: parse_dimension_attr(el.value().attr("width")),
            height: parse_dimension_attr(el.value().attr("height")),
        });
    }
}

fn collect_inline_styles(doc: &Html, base: &Url, push: &mut impl FnMut(ImageCandidate)) {
    let Ok(selector) = Selector::parse("[style]") else {
        return;
    };
    for el in doc.select(&selector) {
        let Some(style) = el.value().attr("style") else {
            continue;
        };
        let Some(raw) = background_image_url(style) else {
            continue;
        };
        let Some(src) = normalize_url(&raw, base) else {
            continue;
        };
        push(ImageCandidate {
            src,
            alt: String::new(),
            width: None,
            height: None,
        });
    }
}

fn collect_meta_tags(doc: &Html, base: &Url, push: &mut impl FnMut(ImageCandidate)) {
    let selector = Selector::parse(
        "meta[property=\"og:image\"], meta[name=\"og:image\"], \
         meta[property=\"twitter:image\"], meta[name=\"twitter:image\"]",
    );
    let Ok(selector) = selector else { return };
    for el in doc.select(&selector) {
        let Some(content) = el.value().attr("content").filter(|s| !s.trim().is_empty()) else {
            continue;
        };
        let Some(src) = normalize_url(content, base) else {
            continue;
        };
        push(ImageCandidate {
            src,
            alt: String::new(),
            width: None,
            height: None,
        });
    }
}

fn collect_json_ld(doc: &Html, base: &Url, push: &mut impl FnMut(ImageCandidate)) {
    let Ok(selector) = Selector::parse("script[type=\"application/ld+json\"]") else {
        return;
    };
    for el in doc.select(&selector) {
        let text: String = el.text().collect();
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
            debug!("unparseable JSON-LD block skipped");
            continue;
        };
        let mut urls = Vec::new();
        walk_json_ld(&value, None, &mut urls);
        for raw in urls {
            if let Some(src) = normalize_url(&raw, base) {
                push(ImageCandidate {
                    src,
                    alt: String::new(),
                    width: None,
                    height: None,
                });
            }
        }
    }
}

/// Recursively collects string values that look like image URLs and sit
/// under a key whose name contains `image`, `url`, or `contentUrl`.
fn walk_json_ld(value: &serde_json::Value, key: Option<&str>, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) => {
            let key_matches = key.map(|k| {
                let k = k.to_ascii_lowercase();
                k.contains("image") || k.contains("url") || k.contains("contenturl")
            });
            if key_matches == Some(true) && looks_like_image_url(s) {
                out.push(s.clone());
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                walk_json_ld(item, key, out);
            }
        }
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                walk_json_ld(v, Some(k), out);
            }
        }
        _ => {}
    }
}

fn looks_like_image_url(s: &str) -> bool {
    let lower = s.to_ascii_lowercase();
    (lower.starts_with("http") || lower.starts_with("//") || lower.starts_with('/'))
        && DIRECT_IMAGE_EXTENSIONS.iter().any(|ext| lower.contains(ext))
}

/// Pulls the first `url(...)` out of a `background-image` declaration.
fn background_image_url(style: &str) -> Option<String> {
    let lower = style.to_ascii_lowercase();
    let decl_start = lower.find("background-image")?;
    let after = &style[decl_start..];
    let open = after.find("url(")?;
    let rest = &after[open + 4..];
    let close = rest.find(')')?;
    let raw = rest[..close].trim().trim_matches('"').trim_matches('\'').trim();
    if raw.is_empty() || raw.starts_with("data:") {
        return None;
    }
    Some(raw.to_string())
}

fn parse_dimension_attr(attr: Option<&str>) -> Option<u32> {
    attr.and_then(|v| v.trim().trim_end_matches("px").parse::<u32>().ok())
}

/// Normalizes a possibly relative URL against the page base. Unparseable
/// URLs are dropped, never fatal to the pass that found them.
fn normalize_url(raw: &str, base: &Url) -> Option<String> {
    let joined = base.join(raw.trim()).ok()?;
    match joined.scheme() {
        "http" | "https" => Some(joined.to_string()),
        _ => None,
    }
}

/// True when `token` appears in `text` delimited on both sides by a
/// non-alphanumeric byte (or the string edge).
fn has_bounded_token(text: &str, token: &str) -> bool {
    let bytes = text.as_bytes();
    let mut start = 0;
    while let Some(pos) = text[start..].find(token) {
        let i = start + pos;
        let j = i + token.len();
        let before_ok = i == 0 || !bytes[i - 1].is_ascii_alphanumeric();
        let after_ok = j == bytes.len() || !bytes[j].is_ascii_alphanumeric();
        if before_ok && after_ok {
            return true;
        }
        start = i + 1;
    }
    false
}

/// The quality verdict: computed fresh per candidate, never stored.
pub fn passes_quality(candidate: &ImageCandidate, min_width: u32, min_height: u32) -> bool {
    let url_lower = candidate.src.to_ascii_lowercase();
    if !QUALITY_EXTENSIONS.iter().any(|ext| url_lower.contains(ext)) {
        return false;
    }

    let alt_lower = candidate.alt.to_ascii_lowercase();
    if DENYLIST
        .iter()
        .any(|token| url_lower.contains(token) || alt_lower.contains(token))
    {
        return false;
    }
    if BOUNDED_DENY_TOKENS
        .iter()
        .any(|token| has_bounded_token(&url_lower, token) || has_bounded_token(&alt_lower, token))
    {
        return false;
    }

    // Unknown dimensions pass permissively; only a known-small image fails.
    if let (Some(w), Some(h)) = (candidate.width, candidate.height) {
        if w < min_width || h < min_height {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://news.example.com/articles/today").unwrap()
    }

    fn candidate(src: &str, alt: &str, dims: Option<(u32, u32)>) -> ImageCandidate {
        ImageCandidate {
            src: src.to_string(),
            alt: alt.to_string(),
            width: dims.map(|d| d.0),
            height: dims.map(|d| d.1),
        }
    }

    #[test]
    fn direct_image_urls_detected_by_extension() {
        assert!(is_direct_image_url("https://example.com/a.JPG"));
        assert!(is_direct_image_url("https://example.com/pic.webp?x=1"));
        assert!(!is_direct_image_url("https://example.com/page.html"));
        assert!(!is_direct_image_url("not a url"));
    }

    #[test]
    fn img_tags_prefer_src_then_lazy_attributes() {
        let html = r#"
            <img data-src="/lazy.jpg" alt="lazy one">
            <img src="/eager.jpg" data-src="/ignored.jpg" alt="eager">
            <img data-srcset="/set-a.jpg 320w, /set-b.jpg 640w">
        "#;
        let cands = collect_candidates(html, &base());
        let srcs: Vec<&str> = cands.iter().map(|c| c.src.as_str()).collect();
        assert_eq!(
            srcs,
            vec![
                "https://news.example.com/lazy.jpg",
                "https://news.example.com/eager.jpg",
                "https://news.example.com/set-a.jpg",
            ]
        );
        assert_eq!(cands[0].alt, "lazy one");
    }

    #[test]
    fn duplicate_urls_across_attributes_collapse_to_one() {
        let html = r#"
            <img src="https://cdn.example.com/photo.jpg" alt="first">
            <img data-src="https://cdn.example.com/photo.jpg" alt="second">
        "#;
        let cands = collect_candidates(html, &base());
        assert_eq!(cands.len(), 1);
        assert_eq!(cands[0].alt, "first");
    }

    #[test]
    fn declared_dimensions_are_captured() {
        let html = r#"<img src="/a.jpg" width="640" height="480">"#;
        let cands = collect_candidates(html, &base());
        assert_eq!(cands[0].width, Some(640));
        assert_eq!(cands[0].height, Some(480));
    }

    #[test]
    fn inline_background_images_are_collected() {
        let html = r#"<div style="color: red; background-image: url('/hero.jpg'); padding: 4px"></div>"#;
        let cands = collect_candidates(html, &base());
        assert_eq!(cands[0].src, "https://news.example.com/hero.jpg");
    }

    #[test]
    fn meta_og_and_twitter_images_are_collected() {
        let html = r#"
            <meta property="og:image" content="https://cdn.example.com/og.jpg">
            <meta name="twitter:image" content="//cdn.example.com/tw.jpg">
        "#;
        let cands = collect_candidates(html, &base());
        let srcs: Vec<&str> = cands.iter().map(|c| c.src.as_str()).collect();
        assert!(srcs.contains(&"https://cdn.example.com/og.jpg"));
        assert!(srcs.contains(&"https://cdn.example.com/tw.jpg"));
    }

    #[test]
    fn json_ld_images_are_walked_recursively() {
        let html = r#"<script type="application/ld+json">
            {"@type": "Article",
             "image": {"url": "https://cdn.example.com/ld.jpg"},
             "publisher": {"name": "News"},
             "video": {"contentUrl": "https://cdn.example.com/embed.png"},
             "headline": "https://unrelated.example.com/story.jpg"}
        </script>"#;
        let cands = collect_candidates(html, &base());
        let srcs: Vec<&str> = cands.iter().map(|c| c.src.as_str()).collect();
        assert!(srcs.contains(&"https://cdn.example.com/ld.jpg"));
        assert!(srcs.contains(&"https://cdn.example.com/embed.png"));
        // Image-looking value under a non-matching key is not collected.
        assert!(!srcs.iter().any(|s| s.contains("unrelated")));
    }

    #[test]
    fn malformed_json_ld_does_not_abort_other_passes() {
        let html = r#"
            <script type="application/ld+json">{not json</script>
            <img src="/ok.jpg">
        "#;
        let cands = collect_candidates(html, &base());
        assert_eq!(cands.len(), 1);
        assert!(cands[0].src.ends_with("/ok.jpg"));
    }

    #[test]
    fn unparseable_urls_are_dropped_silently() {
        let html = r#"<img src="http://"><img src="/fine.jpg">"#;
        let cands = collect_candidates(html, &base());
        assert_eq!(cands.len(), 1);
    }

    #[test]
    fn denylisted_url_is_rejected_regardless_of_dimensions() {
        let cand = candidate(
            "https://example.com/assets/logo-nav.png",
            "",
            Some((1920, 1080)),
        );
        assert!(!passes_quality(&cand, 300, 200));
    }

    #[test]
    fn denylisted_alt_text_is_rejected() {
        let cand = candidate("https://example.com/a.jpg", "site logo", Some((800, 600)));
        assert!(!passes_quality(&cand, 300, 200));
    }

    #[test]
    fn exact_minimum_dimensions_are_accepted() {
        let cand = candidate("https://example.com/photos/mountain.png", "", Some((300, 200)));
        assert!(passes_quality(&cand, 300, 200));
    }

    #[test]
    fn below_minimum_width_is_rejected() {
        let cand = candidate("https://example.com/photos/mountain.png", "", Some((299, 200)));
        assert!(!passes_quality(&cand, 300, 200));
    }

    #[test]
    fn ad_path_segment_is_rejected() {
        let cand = candidate("https://example.com/ad/photo.jpg", "", Some((800, 600)));
        assert!(!passes_quality(&cand, 300, 200));
        let cand = candidate("https://example.com/img/photo-ad.jpg", "", Some((800, 600)));
        assert!(!passes_quality(&cand, 300, 200));
        let cand = candidate("https://example.com/serve/ads/1.jpg", "", Some((800, 600)));
        assert!(!passes_quality(&cand, 300, 200));
    }

    #[test]
    fn ad_inside_a_word_does_not_reject() {
        let cand = candidate("https://example.com/img/gradient.png", "", Some((800, 600)));
        assert!(passes_quality(&cand, 300, 200));
        let cand = candidate("https://example.com/img/shadow-play.jpg", "", Some((800, 600)));
        assert!(passes_quality(&cand, 300, 200));
    }

    #[test]
    fn bounded_token_matching_respects_delimiters() {
        assert!(has_bounded_token("/ad/photo.jpg", "ad"));
        assert!(has_bounded_token("photo-ad.jpg", "ad"));
        assert!(has_bounded_token("ad", "ad"));
        assert!(!has_bounded_token("loading.jpg", "ad"));
        assert!(!has_bounded_token("roads.jpg", "ads"));
    }

    #[test]
    fn unknown_dimensions_pass_permissively() {
        let cand = candidate("https://example.com/photos/river.jpg", "", None);
        assert!(passes_quality(&cand, 300, 200));
    }

    #[test]
    fn non_quality_extension_is_rejected() {
        let cand = candidate("https://example.com/animation.gif", "", Some((800, 600)));
        assert!(!passes_quality(&cand, 300, 200));
    }

    #[test]
    fn background_image_declaration_parsing() {
        assert_eq!(
            background_image_url("background-image: url(\"https://x.test/a.jpg\")"),
            Some("https://x.test/a.jpg".to_string())
        );
        assert_eq!(background_image_url("background-image: url(data:image/png;base64,AAA)"), None);
        assert_eq!(background_image_url("color: blue"), None);
    }

    #[test]
    fn invalid_page_url_fails_fast() {
        let err = parse_page_url("notaurl").unwrap_err();
        assert!(matches!(err, SlidekitError::InvalidUrl(_)));
        let err = parse_page_url("ftp://example.com/x").unwrap_err();
        assert!(matches!(err, SlidekitError::InvalidUrl(_)));
    }
}
