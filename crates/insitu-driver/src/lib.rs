//! # insitu-driver
//!
//! The per-rank analysis pipeline.
//!
//! ```text
//!   EventSource (VecSource | JsonLinesSource)
//!        │ begin_step / events / end_step
//!        ▼
//!   Driver ──► EventStore ──► OutlierDetector ──► ProvenanceWriter ──► ProvenanceSink
//!        │
//!        └──► PsClient (optional; local-only when absent or unreachable)
//! ```
//!
//! A rank processes its trace sequentially; the only background work is
//! the provenance writer thread.

#![deny(unsafe_code)]

pub mod config;
pub mod driver;
pub mod error;
pub mod sink;
pub mod source;

pub use config::DriverConfig;
pub use driver::{Driver, DriverReport};
pub use error::{DriverError, DriverResult};
pub use sink::{JsonLinesSink, MemorySink, ProvenanceSink, ProvenanceStats, ProvenanceWriter};
pub use source::{EventSource, JsonLinesSource, SourceStatus, VecSource};
