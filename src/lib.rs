//! Content acquisition pipeline for AI carousel slides.
//!
//! Two entry points matter to callers: [`ContentGenerator`] turns a theme
//! description into slide texts with background images, and [`ImageService`]
//! acquires images from stock search, local upload, a direct URL, or an
//! arbitrary web page fetched through the relay chain.

mod cache;
mod error;
mod extract;
mod generate;
mod images;
mod providers;
mod reachability;
mod relay;
mod settings;

pub use cache::TtlCache;
pub use error::{Result, SlidekitError};
pub use extract::{ExtractOptions, PageExtractor};
pub use generate::{ContentGenerator, GeneratedSlide, FALLBACK_IMAGE_URL, MAX_SLIDE_COUNT};
pub use images::{ImageDescriptor, ImageOrigin, ImageService};
pub use providers::Provider;
pub use reachability::Reachability;
pub use relay::RelayChain;
pub use settings::Settings;

use tracing_subscriber::EnvFilter;

/// Installs a global tracing subscriber honoring `RUST_LOG`. Safe to call
/// more than once; later calls are no-ops.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}
