use thiserror::Error;

/// Failure taxonomy for the acquisition pipeline.
///
/// Per-candidate failures inside multi-candidate operations (relay retries,
/// extraction passes) are absorbed and logged by the component that saw them;
/// only whole-operation failures surface through this type.
#[derive(Debug, Error)]
pub enum SlidekitError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("all relays exhausted, last was '{relay}': {message}")]
    AllRelaysExhausted { relay: String, message: String },

    #[error("image unreachable: {0}")]
    ImageUnreachable(String),

    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("file too large: {size} bytes (limit {limit})")]
    FileTooLarge { size: usize, limit: usize },

    #[error("missing credentials for {0}")]
    MissingCredentials(&'static str),

    #[error("provider error: HTTP {status}: {body}")]
    ProviderHttpError { status: u16, body: String },

    #[error("schema validation failed: {0}")]
    SchemaValidationError(String),

    #[error("no quality images found")]
    NoQualityImagesFound,

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SlidekitError>;
