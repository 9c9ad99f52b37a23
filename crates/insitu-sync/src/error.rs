use thiserror::Error;

/// Errors from the synchronization layer.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unknown message type {0}")]
    UnknownMessageType(i32),

    #[error("unknown message kind {0}")]
    UnknownMessageKind(i32),

    #[error("no handler for kind {kind} type {msg_type}")]
    NoHandler { kind: i32, msg_type: i32 },

    #[error("message body of {size} bytes exceeds limit of {max}")]
    BodyTooLarge { size: usize, max: usize },

    #[error("unsupported payload version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("unexpected reply: expected type {expected}, got {found}")]
    UnexpectedReply { expected: i32, found: i32 },

    #[error("server error: {0}")]
    Remote(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("connection closed by peer")]
    Disconnected,

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("work queue is full")]
    QueueFull,

    #[error("work queue is closed")]
    QueueClosed,

    #[error("lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl SyncError {
    /// Whether the connection to the peer is unusable after this error.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            SyncError::Io(_) | SyncError::Disconnected | SyncError::Timeout(_)
        )
    }
}

/// Convenience type alias for sync results.
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = SyncError::NoHandler {
            kind: 3,
            msg_type: 2,
        };
        assert!(e.to_string().contains("kind 3"));

        let e = SyncError::BodyTooLarge { size: 10, max: 5 };
        assert!(e.to_string().contains("10 bytes"));
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let e: SyncError = io_err.into();
        assert!(e.is_connection_error());
        assert!(!SyncError::QueueFull.is_connection_error());
    }
}
