//! # insitu-daemon
//!
//! Shared setup for the `insitu-ps` (parameter server) and `insitu-ad`
//! (per-rank analysis) binaries.

#![deny(unsafe_code)]

pub mod config;
pub mod logging;

pub use config::{AdDaemonConfig, PsDaemonConfig};
