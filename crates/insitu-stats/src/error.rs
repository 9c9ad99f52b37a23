use thiserror::Error;

/// Errors from statistics queries and state decoding.
#[derive(Debug, Error, PartialEq)]
pub enum StatsError {
    #[error("no data: statistic requires at least {required} samples, have {count}")]
    NoData { required: u64, count: u64 },

    #[error("undefined statistic: {0}")]
    Undefined(&'static str),

    #[error("invalid accumulator state: {0}")]
    InvalidState(String),
}

/// Convenience type alias for statistics results.
pub type StatsResult<T> = Result<T, StatsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = StatsError::NoData {
            required: 2,
            count: 1,
        };
        assert!(e.to_string().contains("at least 2"));

        let e = StatsError::InvalidState("negative m2".into());
        assert!(e.to_string().contains("negative m2"));
    }
}
