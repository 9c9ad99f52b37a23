//! Core type definitions shared by every insitu crate.
//!
//! No business logic: identifiers, the instrumentation [`Event`] record
//! produced by the trace reader, and the classification [`CallLabel`].

pub mod event;
pub mod ids;
pub mod label;

pub use event::{CommKind, Event, EventData, EventKind};
pub use ids::{CallId, CounterId, FunctionId, ProgramId, RankId, ThreadId, ThreadKey};
pub use label::CallLabel;
