/*!
Error types for the blobkeep core.
*/

use blobkeep_retry::RetryableError;
use thiserror::Error;

/// Result type used throughout the blobkeep core.
pub type Result<T> = std::result::Result<T, BackupError>;

/// Errors raised while constructing the backup service or running its operations.
#[derive(Error, Debug)]
pub enum BackupError {
    /// I/O errors during file or stream operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON configuration errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The configured compression algorithm is not one we know
    #[error("compressor not found: {0}")]
    CompressorNotFound(String),

    /// The codec rejected the configured level
    #[error("invalid compression level {level} for {algorithm}: expected {min}..={max}")]
    InvalidCompressionLevel {
        algorithm: &'static str,
        level: i32,
        min: i32,
        max: i32,
    },

    /// The configured storage backend is not one we know
    #[error("invalid storage type: {0}")]
    InvalidStorageType(String),

    /// An option could not be applied onto the configuration
    #[error("failed to apply option {option}: {reason}")]
    OptionFailed { option: &'static str, reason: String },

    /// Session establishment (credentials, endpoint, bucket access) failed
    #[error("Session error: {0}")]
    Session(String),

    /// The requested object does not exist
    #[error("object not found: {key}")]
    NotFound { key: String },

    /// Backend transport or service errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// The backend failed in a way that may succeed on a later attempt
    /// (timeouts, dispatch failures, throttling, 5xx responses)
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Compression/decompression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// A delete or copy capability could not be obtained from the bucket
    #[error("failed to acquire {capability} capability: {reason}")]
    Capability {
        capability: &'static str,
        reason: String,
    },

    /// The caller's context was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// The caller's deadline passed before the operation finished
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
}

impl BackupError {
    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new error for a backend failure worth retrying
    pub fn unavailable<S: Into<String>>(msg: S) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create a new session error
    pub fn session<S: Into<String>>(msg: S) -> Self {
        Self::Session(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found<S: Into<String>>(key: S) -> Self {
        Self::NotFound { key: key.into() }
    }

    pub fn option_failed<S: Into<String>>(option: &'static str, reason: S) -> Self {
        Self::OptionFailed {
            option,
            reason: reason.into(),
        }
    }

    pub fn capability<S: Into<String>>(capability: &'static str, reason: S) -> Self {
        Self::Capability {
            capability,
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// True for the cancellation family (explicit cancel or expired deadline).
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

impl RetryableError for BackupError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            Self::DeadlineExceeded => true,
            _ => false,
        }
    }
}
