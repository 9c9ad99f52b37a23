//! Versioned JSON payloads carried in message bodies.
//!
//! Every body is an envelope `{"version": 1, "payload": ...}`. Statistics
//! travel as raw accumulator state so merges on the server stay exact.

use std::collections::BTreeMap;

use insitu_detect::AnomalyMetrics;
use insitu_stats::RunningStats;
use insitu_types::{FunctionId, ProgramId, RankId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Current payload encoding version.
pub const PAYLOAD_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    version: u32,
    payload: T,
}

#[derive(Deserialize)]
struct VersionOnly {
    version: u32,
}

pub fn encode<T: Serialize>(payload: &T) -> SyncResult<Vec<u8>> {
    Ok(serde_json::to_vec(&Envelope {
        version: PAYLOAD_VERSION,
        payload,
    })?)
}

pub fn decode<T: DeserializeOwned>(body: &[u8]) -> SyncResult<T> {
    match serde_json::from_slice::<Envelope<T>>(body) {
        Ok(env) if env.version == PAYLOAD_VERSION => Ok(env.payload),
        Ok(env) => Err(SyncError::UnsupportedVersion {
            found: env.version,
            expected: PAYLOAD_VERSION,
        }),
        Err(e) => match serde_json::from_slice::<VersionOnly>(body) {
            Ok(v) if v.version != PAYLOAD_VERSION => Err(SyncError::UnsupportedVersion {
                found: v.version,
                expected: PAYLOAD_VERSION,
            }),
            _ => Err(e.into()),
        },
    }
}

// ── Payload types ───────────────────────────────────────────────────────

/// Per-step anomaly summary of one rank.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AnomalyStatsReport {
    pub pid: ProgramId,
    pub rid: RankId,
    pub step: u64,
    pub calls: u64,
    pub outliers: u64,
    pub first_entry: Option<u64>,
    pub last_exit: Option<u64>,
}

/// Global view of one rank's anomaly history.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RankAnomalyStats {
    /// Distribution of outliers per reported step.
    pub outliers_per_step: RunningStats,
    pub total_outliers: u64,
    pub total_calls: u64,
    pub steps: u64,
    pub last_step: Option<u64>,
}

/// Counter statistics of one rank, keyed by counter name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CounterStatsReport {
    pub pid: ProgramId,
    pub rid: RankId,
    pub step: u64,
    pub counters: BTreeMap<String, RunningStats>,
}

/// Request for the global counter statistics of a program.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CounterStatsQuery {
    pub pid: ProgramId,
    /// Counter names; empty means all.
    #[serde(default)]
    pub names: Vec<String>,
}

/// Per-function anomaly metrics of one rank, keyed by global function index.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AnomalyMetricsReport {
    pub pid: ProgramId,
    pub rid: RankId,
    pub metrics: AnomalyMetrics,
}

/// Request for global anomaly statistics.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AnomalyStatsQuery {
    pub pid: ProgramId,
    pub rid: RankId,
}

/// Anomaly stats, counter stats and metrics pushed in one request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CombinedReport {
    pub anomaly: AnomalyStatsReport,
    pub counters: CounterStatsReport,
    #[serde(default)]
    pub metrics: AnomalyMetrics,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CombinedReply {
    pub anomaly: RankAnomalyStats,
    pub counters: BTreeMap<String, RunningStats>,
    pub metrics: AnomalyMetrics,
}

/// Rank-local function table to translate to global indices.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionIndexRequest {
    pub pid: ProgramId,
    pub functions: BTreeMap<FunctionId, String>,
}

/// Local function id → global index.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionIndexReply {
    pub indices: BTreeMap<FunctionId, u64>,
}

/// Administrative command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Reset every global store.
    Clear,
    /// Report store sizes.
    Status,
}

/// Store sizes and counters reported by the `status` command.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub functions: usize,
    pub function_indices: usize,
    pub counters: usize,
    pub ranks: usize,
    pub requests: u64,
    pub uptime_secs: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub error: String,
}
