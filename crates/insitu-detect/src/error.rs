use thiserror::Error;

/// Errors from detector construction and model handling.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("unknown algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("invalid detector config: {0}")]
    InvalidConfig(String),

    #[error("trace error: {0}")]
    Trace(#[from] insitu_trace::TraceError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for DetectError {
    fn from(e: serde_json::Error) -> Self {
        DetectError::Serialization(e.to_string())
    }
}

/// Convenience type alias for detection results.
pub type DetectResult<T> = Result<T, DetectError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = DetectError::UnknownAlgorithm("hbos".into());
        assert!(e.to_string().contains("hbos"));

        let e = DetectError::InvalidConfig("sigma must be positive".into());
        assert!(e.to_string().contains("sigma"));
    }

    #[test]
    fn serde_error_conversion() {
        let err = serde_json::from_str::<u32>("nope").unwrap_err();
        let e: DetectError = err.into();
        assert!(matches!(e, DetectError::Serialization(_)));
    }
}
