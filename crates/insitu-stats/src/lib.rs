//! # insitu-stats
//!
//! Numerically stable streaming statistics that can be merged across
//! ranks. A [`RunningStats`] accumulates count, mean and the second to
//! fourth central moments in O(1) per sample; two accumulators built from
//! disjoint datasets merge into the accumulator of their union.
//!
//! The serialized form is the raw accumulator state, never derived
//! values, so that merges performed after a network hop stay exact.

#![deny(unsafe_code)]

pub mod error;
pub mod running;

pub use error::{StatsError, StatsResult};
pub use running::{RunningStats, RunningStatsState, StatsSummary};
