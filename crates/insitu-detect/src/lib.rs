//! # insitu-detect
//!
//! Streaming outlier detection over completed calls, one statistical model
//! per function.
//!
//! ```text
//!   CallBatch (one step)
//!       │  per function, completion order
//!       ▼
//!   OutlierDetector::classify ──► Algorithm::evaluate(value, model[f])
//!       │                              │
//!       │                              └── Verdict { label, score, severity }
//!       ├──► model[f].push(value)      (per OutlierPolicy)
//!       ├──► delta[f].push(value)      (pushed to the PS at the next sync)
//!       └──► AnomalyMetrics            (per-function counts and scores)
//! ```
//!
//! After a sync the detector scores against the merged global model
//! returned by the parameter server; while disconnected it keeps scoring
//! against its local model and the delta keeps growing.

#![deny(unsafe_code)]

pub mod algorithm;
pub mod detector;
pub mod error;
pub mod metrics;
pub mod model;
pub mod provenance;

pub use algorithm::{Algorithm, DetectorConfig, OutlierPolicy, SigmaParams, Verdict};
pub use detector::{FunctionStepCounts, OutlierDetector, StepAnomalies};
pub use error::{DetectError, DetectResult};
pub use metrics::{AnomalyMetrics, FunctionMetrics};
pub use model::FunctionModel;
pub use provenance::{prune_normals, ProvenanceRecord, WindowEntry};

/// Default sigma threshold.
pub const DEFAULT_SIGMA: f64 = 3.0;

/// Default number of samples required before a function can be flagged.
pub const DEFAULT_MIN_SAMPLES: u64 = 5;
