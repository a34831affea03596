//! Domain-level error taxonomy for fanout.

/// Fanout domain errors.
#[derive(Debug, thiserror::Error)]
pub enum FanoutError {
    #[error("invalid build target: {0}")]
    InvalidTarget(String),

    #[error("invalid build matrix: {0}")]
    InvalidMatrix(String),

    #[error("invalid image digest {digest:?}: {reason}")]
    InvalidDigest { digest: String, reason: String },

    #[error("invalid version {version:?}: {reason}")]
    InvalidVersion { version: String, reason: String },

    #[error("unknown trigger event: {0}")]
    UnknownEvent(String),

    #[error("git error: {0}")]
    Git(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for fanout domain operations.
pub type Result<T> = std::result::Result<T, FanoutError>;
