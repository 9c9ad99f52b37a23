//! # insitu-trace
//!
//! Rebuilds the call forest of every (program, rank, thread) from a stream
//! of entry/exit events.
//!
//! ```text
//!   Event ──► EventStore ──┬── per-thread open stack (spans steps)
//!                          ├── completed-call arena (CallId → ExecData)
//!                          └── entry-time index (window queries)
//!                                   │ flush()
//!                                   ▼
//!                              CallBatch (grouped per function)
//! ```
//!
//! Parent/child relations are stored as [`CallId`](insitu_types::CallId)
//! references, never as pointers into the arena, so a flushed batch can be
//! moved and shared freely.

#![deny(unsafe_code)]

pub mod call;
pub mod error;
pub mod store;
mod window;

pub use call::{CommRecord, CounterSample, ExecData};
pub use error::{TraceError, TraceResult};
pub use store::{AddOutcome, CallBatch, EventStore};

/// Name used when the trace reader did not provide one.
pub const UNKNOWN_NAME: &str = "unknown";
