//! Provenance records for classified calls.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use insitu_stats::{RunningStats, StatsSummary};
use insitu_trace::{CommRecord, CounterSample, ExecData};
use insitu_types::{CallLabel, FunctionId, ProgramId, RankId, ThreadId};
use serde::{Deserialize, Serialize};

use crate::error::DetectResult;

/// A neighbouring call on the same thread.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WindowEntry {
    pub event_id: String,
    pub fid: FunctionId,
    pub func_name: String,
    pub entry: u64,
    pub exit: u64,
    pub label: CallLabel,
}

impl From<&ExecData> for WindowEntry {
    fn from(call: &ExecData) -> Self {
        Self {
            event_id: call.id.to_string(),
            fid: call.fid,
            func_name: call.func_name.clone(),
            entry: call.entry,
            exit: call.exit,
            label: call.label(),
        }
    }
}

/// Structured record describing one classified call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub event_id: String,
    pub pid: ProgramId,
    pub rid: RankId,
    pub tid: ThreadId,
    pub fid: FunctionId,
    pub func_name: String,
    pub entry: u64,
    pub exit: u64,
    pub runtime: u64,
    pub exclusive_runtime: u64,
    pub label: CallLabel,
    pub score: f64,
    pub severity: f64,
    pub parent: Option<String>,
    pub children: Vec<String>,
    pub counters: Vec<CounterSample>,
    pub comms: Vec<CommRecord>,
    pub step: u64,
    /// Function statistics at the time the record was built.
    pub func_stats: StatsSummary,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event_window: Vec<WindowEntry>,
    pub recorded_at: DateTime<Utc>,
}

impl ProvenanceRecord {
    pub fn from_call(step: u64, call: &ExecData, stats: Option<&RunningStats>) -> Self {
        let thread = call.thread();
        Self {
            event_id: call.id.to_string(),
            pid: thread.pid,
            rid: thread.rid,
            tid: thread.tid,
            fid: call.fid,
            func_name: call.func_name.clone(),
            entry: call.entry,
            exit: call.exit,
            runtime: call.runtime(),
            exclusive_runtime: call.exclusive_runtime(),
            label: call.label(),
            score: call.score(),
            severity: call.severity(),
            parent: call.parent.map(|p| p.to_string()),
            children: call.children.iter().map(|c| c.to_string()).collect(),
            counters: call.counters.clone(),
            comms: call.comms.clone(),
            step,
            func_stats: stats.map(RunningStats::summary).unwrap_or_default(),
            event_window: Vec::new(),
            recorded_at: Utc::now(),
        }
    }

    /// Attach the calls surrounding this one, itself excluded.
    pub fn with_window<'a>(mut self, window: impl IntoIterator<Item = &'a ExecData>) -> Self {
        self.event_window = window
            .into_iter()
            .filter(|c| c.id.to_string() != self.event_id)
            .map(WindowEntry::from)
            .collect();
        self
    }

    pub fn to_json(&self) -> DetectResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// The `keep` most recently completed normal calls of every function,
/// oldest first within a function.
pub fn prune_normals<'a>(
    calls: impl IntoIterator<Item = &'a ExecData>,
    keep: usize,
) -> Vec<&'a ExecData> {
    if keep == 0 {
        return Vec::new();
    }
    let mut per_function: BTreeMap<FunctionId, Vec<&ExecData>> = BTreeMap::new();
    for call in calls {
        if call.label() == CallLabel::Normal {
            per_function.entry(call.fid).or_default().push(call);
        }
    }
    let mut kept = Vec::new();
    for (_, mut group) in per_function {
        group.sort_by_key(|c| (c.exit, c.id.index));
        let skip = group.len().saturating_sub(keep);
        kept.extend(group.into_iter().skip(skip));
    }
    kept
}
