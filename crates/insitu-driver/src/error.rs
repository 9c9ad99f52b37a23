use insitu_detect::DetectError;
use insitu_sync::SyncError;
use insitu_trace::TraceError;
use thiserror::Error;

/// Errors from the analysis pipeline.
///
/// Per-event trace errors are counted by the driver, never returned from
/// [`Driver::run`](crate::Driver::run); the `Trace` variant exists for
/// callers feeding the store directly.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("trace error: {0}")]
    Trace(#[from] TraceError),

    #[error("detector error: {0}")]
    Detect(#[from] DetectError),

    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("event source error: {0}")]
    Source(String),

    #[error("provenance sink error: {0}")]
    Sink(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<serde_json::Error> for DriverError {
    fn from(e: serde_json::Error) -> Self {
        DriverError::Serialization(e.to_string())
    }
}

/// Convenience type alias for driver results.
pub type DriverResult<T> = Result<T, DriverError>;
