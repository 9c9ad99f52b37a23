//! # insitu-sync
//!
//! Wire protocol, global stores and network endpoints that connect the
//! per-rank analysis daemons (AD) to the parameter server (PS).
//!
//! ```text
//!   AD rank 0 ─┐                        ┌──────────── PsState ────────────┐
//!   AD rank 1 ─┼── TCP (24-byte header ─┤ ParameterStore   (global model) │
//!   AD rank N ─┘    + JSON body)        │ GlobalCounterStats              │
//!        PsClient                       │ GlobalAnomalyStats              │
//!                       NetServer ──►   │ GlobalFunctionIndexMap          │
//!                       WorkQueue       └──────────────────────────────────┘
//! ```
//!
//! Every request gets exactly one reply of type `request + 10`, or
//! `RepError` when the handler fails. A `ReqQuit` with an empty body stops
//! the server after in-flight requests complete.

#![deny(unsafe_code)]

pub mod client;
pub mod error;
pub mod global;
pub mod handler;
pub mod index;
pub mod params;
pub mod payload;
pub mod persist;
pub mod protocol;
pub mod queue;
pub mod server;

pub use client::{ClientConfig, PsClient};
pub use error::{SyncError, SyncResult};
pub use global::{GlobalAnomalyStats, GlobalCounterStats, ProgramAnomalySummary};
pub use handler::{Handler, HandlerTable, PsState};
pub use index::GlobalFunctionIndexMap;
pub use params::ParameterStore;
pub use payload::{
    AnomalyStatsReport, CombinedReply, CombinedReport, Command, CounterStatsReport,
    RankAnomalyStats, ServerStatus,
};
pub use persist::ModelDocument;
pub use protocol::{Header, Message, MessageKind, MessageType};
pub use queue::WorkQueue;
pub use server::{NetServer, ServerConfig, ShutdownHandle};
