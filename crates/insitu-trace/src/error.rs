use insitu_types::{CallId, CallLabel, FunctionId, ThreadKey};
use thiserror::Error;

/// Per-event integrity errors. The offending event is dropped and the store
/// is left unchanged.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TraceError {
    #[error("call stack violation on {thread}: exit of function {found} but top of stack is {expected}")]
    CallStackViolation {
        thread: ThreadKey,
        expected: FunctionId,
        found: FunctionId,
    },

    #[error("empty call stack on {thread}: exit of function {fid} with no open call")]
    EmptyCallStack { thread: ThreadKey, fid: FunctionId },

    #[error("no open call on {thread} to attach {what} at t={timestamp}")]
    NoOpenCall {
        thread: ThreadKey,
        what: &'static str,
        timestamp: u64,
    },

    #[error("timestamp regression on {thread}: {timestamp} < last seen {last}")]
    TimestampRegression {
        thread: ThreadKey,
        timestamp: u64,
        last: u64,
    },

    #[error("call not found: {0}")]
    UnknownCall(CallId),

    #[error("call {id} already labeled {current}")]
    LabelAlreadyAssigned { id: CallId, current: CallLabel },
}

/// Convenience type alias for trace results.
pub type TraceResult<T> = Result<T, TraceError>;
