use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use crate::error::{Result, SlidekitError};
use crate::extract::{is_direct_image_url, ExtractOptions, PageExtractor};
use crate::reachability::Reachability;
use crate::relay::RelayChain;
use crate::settings::Settings;

const UNSPLASH_SEARCH_URL: &str = "https://api.unsplash.com/search/photos";
const STOCK_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
const ALLOWED_UPLOAD_MIME: &[&str] = &["image/jpeg", "image/png", "image/webp", "image/gif"];

/// Where a descriptor came from. The editor layer treats all origins alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageOrigin {
    StockSearch,
    Upload,
    DirectUrl,
    PageExtraction,
}

/// The one image shape every acquisition mode converges on. Immutable once
/// returned; callers copy what they need into their own slide state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageDescriptor {
    pub src: String,
    pub alt: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub origin: ImageOrigin,
}

#[derive(Debug, Deserialize)]
struct UnsplashSearchResponse {
    results: Option<Vec<UnsplashPhoto>>,
}

#[derive(Debug, Deserialize)]
struct UnsplashPhoto {
    width: Option<u32>,
    height: Option<u32>,
    description: Option<String>,
    alt_description: Option<String>,
    urls: Option<UnsplashUrls>,
}

#[derive(Debug, Deserialize)]
struct UnsplashUrls {
    regular: Option<String>,
    full: Option<String>,
}

/// Single entry point for image acquisition: stock search, local upload,
/// direct URL ingestion, and page extraction.
pub struct ImageService {
    settings: Settings,
    client: reqwest::Client,
    reach: Arc<Reachability>,
    extractor: PageExtractor,
}

impl ImageService {
    pub fn new(settings: Settings) -> Self {
        let relay = Arc::new(RelayChain::new());
        let reach = Arc::new(Reachability::new());
        let client = reqwest::Client::builder()
            .timeout(STOCK_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            settings,
            client,
            reach: reach.clone(),
            extractor: PageExtractor::new(relay, reach),
        }
    }

    /// Keyword search against the curated stock-photo API. Results are
    /// trusted reachable; the API serves only hosted, working assets.
    pub async fn search_stock(&self, query: &str, per_page: u32) -> Result<Vec<ImageDescriptor>> {
        let key = self
            .settings
            .unsplash_key()
            .ok_or(SlidekitError::MissingCredentials("unsplash"))?;

        let resp = self
            .client
            .get(UNSPLASH_SEARCH_URL)
            .header("Authorization", format!("Client-ID {key}"))
            .query(&[("query", query), ("per_page", &per_page.to_string())])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SlidekitError::ProviderHttpError {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: UnsplashSearchResponse = resp.json().await?;
        let descriptors: Vec<ImageDescriptor> = parsed
            .results
            .unwrap_or_default()
            .into_iter()
            .filter_map(map_stock_photo)
            .collect();
        info!(query, found = descriptors.len(), "stock search done");
        Ok(descriptors)
    }

    /// Validates and decodes a locally uploaded file handed over as base64
    /// (optionally a full data URI). True pixel dimensions come from the
    /// decoded bytes, not from anything the caller declared.
    pub fn upload(
        &self,
        file_name: &str,
        mime: &str,
        base64_data: &str,
    ) -> Result<ImageDescriptor> {
        validate_upload_mime(mime)?;

        let payload = strip_data_uri(base64_data);
        let bytes = B64
            .decode(payload)
            .map_err(|e| SlidekitError::UnsupportedFileType(format!("bad base64 payload: {e}")))?;
        if bytes.len() > MAX_UPLOAD_BYTES {
            return Err(SlidekitError::FileTooLarge {
                size: bytes.len(),
                limit: MAX_UPLOAD_BYTES,
            });
        }

        let reader = image::ImageReader::new(Cursor::new(&bytes))
            .with_guessed_format()
            .map_err(|e| SlidekitError::UnsupportedFileType(e.to_string()))?;
        // The data URI is labeled from the detected format; the declared
        // MIME type only gates the allow-list.
        let detected_mime = reader
            .format()
            .map(|f| f.to_mime_type())
            .ok_or_else(|| {
                SlidekitError::UnsupportedFileType("unrecognized image data".to_string())
            })?;
        let (width, height) = reader
            .into_dimensions()
            .map_err(|e| SlidekitError::UnsupportedFileType(e.to_string()))?;

        debug!(file_name, width, height, detected_mime, "upload accepted");
        Ok(ImageDescriptor {
            src: format!("data:{detected_mime};base64,{}", B64.encode(&bytes)),
            alt: file_name.to_string(),
            width: Some(width),
            height: Some(height),
            origin: ImageOrigin::Upload,
        })
    }

    /// Ingests a user-pasted image URL: syntactic check, extension check,
    /// then reachability resolution through the variant rewriter.
    pub async fn from_url(&self, raw_url: &str) -> Result<ImageDescriptor> {
        let parsed =
            Url::parse(raw_url).map_err(|_| SlidekitError::InvalidUrl(raw_url.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") || !is_direct_image_url(raw_url) {
            return Err(SlidekitError::InvalidUrl(raw_url.to_string()));
        }

        let resolved = self
            .reach
            .resolve_working_variant(raw_url)
            .await
            .ok_or_else(|| SlidekitError::ImageUnreachable(raw_url.to_string()))?;

        Ok(ImageDescriptor {
            src: resolved,
            alt: String::new(),
            width: None,
            height: None,
            origin: ImageOrigin::DirectUrl,
        })
    }

    /// Pulls quality-filtered images out of an arbitrary web page.
    pub async fn extract_from_page(
        &self,
        page_url: &str,
        opts: &ExtractOptions,
    ) -> Result<Vec<ImageDescriptor>> {
        self.extractor.extract(page_url, opts).await
    }
}

fn map_stock_photo(photo: UnsplashPhoto) -> Option<ImageDescriptor> {
    let urls = photo.urls?;
    let src = urls.regular.or(urls.full)?;
    let alt = photo
        .description
        .or(photo.alt_description)
        .unwrap_or_default();
    Some(ImageDescriptor {
        src,
        alt,
        width: photo.width,
        height: photo.height,
        origin: ImageOrigin::StockSearch,
    })
}

fn validate_upload_mime(mime: &str) -> Result<()> {
    let mime = mime.trim().to_ascii_lowercase();
    if ALLOWED_UPLOAD_MIME.contains(&mime.as_str()) {
        Ok(())
    } else {
        Err(SlidekitError::UnsupportedFileType(mime))
    }
}

fn strip_data_uri(s: &str) -> &str {
    match s.find(',') {
        Some(idx) if s.starts_with("data:") => &s[idx + 1..],
        _ => s,
    }
}
