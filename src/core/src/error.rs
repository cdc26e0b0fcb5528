use std::time::Duration;

use thiserror::Error;

/// Why an image pull failed.
///
/// The distinction drives retry behavior: transient failures are retried
/// with backoff, a missing tag ends the work item as skipped, and a denied
/// pull fails without retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PullFailure {
    /// Network trouble, timeouts, 5xx responses
    #[error("transient: {0}")]
    Transient(String),

    /// The tag (or the requested platform) no longer exists upstream
    #[error("tag missing: {0}")]
    TagMissing(String),

    /// Authentication or authorization refused
    #[error("denied: {0}")]
    Denied(String),
}

/// imirror error types
#[derive(Error, Debug)]
pub enum MirrorError {
    /// Network or DNS failure talking to the registry, after retries
    #[error("Registry unreachable: {repository} - {message}")]
    RegistryUnreachable { repository: String, message: String },

    /// Unexpected registry API response
    #[error("Registry error: {repository} {status} - {message}")]
    RegistryError {
        repository: String,
        status: u16,
        message: String,
    },

    /// Registry asked us to slow down
    #[error("Rate limited: {repository}, retry after {retry_after_secs}s")]
    RateLimited {
        repository: String,
        retry_after_secs: u64,
    },

    /// Filter policy rejected every tag the registry returned
    #[error("No matching tag: {component}")]
    NoMatchingTag { component: String },

    /// Image pull failed
    #[error("Pull failed: {reference} ({arch}) - {cause}")]
    PullFailed {
        reference: String,
        arch: String,
        cause: PullFailure,
    },

    /// Serializing the pulled image to an archive stream failed
    #[error("Save failed: {reference} - {message}")]
    SaveFailed { reference: String, message: String },

    /// Compressing the archive stream failed
    #[error("Compress failed: {path} - {message}")]
    CompressFailed { path: String, message: String },

    /// Writing the archive to disk failed
    #[error("Write failed: {path} - {message}")]
    WriteFailed { path: String, message: String },

    /// A different version's archive already occupies the same slot
    #[error("Path collision: {path} already holds {existing}, refusing to write {requested}")]
    PathCollision {
        path: String,
        existing: String,
        requested: String,
    },

    /// A progress or version file could not be read back
    #[error("State corrupt: {path} - {message}")]
    StateCorrupt { path: String, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Run was cancelled before the operation finished
    #[error("Cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl MirrorError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            MirrorError::RegistryUnreachable { .. } | MirrorError::RateLimited { .. } => true,
            MirrorError::RegistryError { status, .. } => *status >= 500,
            MirrorError::PullFailed { cause, .. } => matches!(cause, PullFailure::Transient(_)),
            _ => false,
        }
    }

    /// Whether the failure is an explicit non-retryable condition that ends
    /// a work item as skipped rather than failed.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            MirrorError::PullFailed {
                cause: PullFailure::TagMissing(_),
                ..
            }
        )
    }

    /// Server-provided wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            MirrorError::RateLimited {
                retry_after_secs, ..
            } => Some(Duration::from_secs(*retry_after_secs)),
            _ => None,
        }
    }

    /// Stable name of the failure kind, used in reports and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            MirrorError::RegistryUnreachable { .. } => "RegistryUnreachable",
            MirrorError::RegistryError { .. } => "RegistryError",
            MirrorError::RateLimited { .. } => "RateLimited",
            MirrorError::NoMatchingTag { .. } => "NoMatchingTag",
            MirrorError::PullFailed { .. } => "PullFailed",
            MirrorError::SaveFailed { .. } => "SaveFailed",
            MirrorError::CompressFailed { .. } => "CompressFailed",
            MirrorError::WriteFailed { .. } => "WriteFailed",
            MirrorError::PathCollision { .. } => "PathCollision",
            MirrorError::StateCorrupt { .. } => "StateCorrupt",
            MirrorError::ConfigError(_) => "ConfigError",
            MirrorError::Cancelled => "Cancelled",
            MirrorError::IoError(_) => "IoError",
            MirrorError::SerializationError(_) => "SerializationError",
        }
    }
}

impl From<serde_json::Error> for MirrorError {
    fn from(err: serde_json::Error) -> Self {
        MirrorError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for MirrorError {
    fn from(err: serde_yaml::Error) -> Self {
        MirrorError::SerializationError(err.to_string())
    }
}

/// Result type alias for imirror operations
pub type Result<T> = std::result::Result<T, MirrorError>;
