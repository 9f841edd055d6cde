use thiserror::Error;

/// regmirror error types.
#[derive(Error, Debug)]
pub enum MirrorError {
    /// Invalid run configuration (bad auth entry, unusable data dir, empty
    /// image list). Detected before any pipeline starts and fatal to the run.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Image reference string could not be parsed.
    #[error("Invalid image reference '{reference}': {message}")]
    InvalidReference { reference: String, message: String },

    /// Registry demanded authentication and none was available.
    #[error("Authentication required by {registry}")]
    AuthRequired { registry: String },

    /// Registry refused the presented credentials.
    #[error("Authentication rejected by {registry}: {message}")]
    AuthRejected { registry: String, message: String },

    /// Manifest or blob does not exist on the remote registry.
    #[error("Not found on {registry}: {reference}")]
    ReferenceNotFound { registry: String, reference: String },

    /// Manifest index has no entry for the requested platform.
    #[error("No manifest for platform {platform} in {reference}")]
    PlatformNotFound { reference: String, platform: String },

    /// Manifest payload is not a known manifest or index schema.
    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// Streamed content did not hash to its declared digest. Never retried.
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Transport-level or 5xx registry failure. The only retryable class.
    #[error("Registry request failed: {message}")]
    Network { message: String },

    /// Local store failure.
    #[error("Store error: {0}")]
    Store(String),

    /// The run was cancelled before this operation completed.
    #[error("Pull cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl MirrorError {
    /// True only for transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MirrorError::Network { .. })
    }
}

impl From<serde_json::Error> for MirrorError {
    fn from(err: serde_json::Error) -> Self {
        MirrorError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for MirrorError {
    fn from(err: serde_yaml::Error) -> Self {
        MirrorError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for MirrorError {
    fn from(err: reqwest::Error) -> Self {
        MirrorError::Network {
            message: err.to_string(),
        }
    }
}

/// Result type alias for regmirror operations.
pub type Result<T> = std::result::Result<T, MirrorError>;
