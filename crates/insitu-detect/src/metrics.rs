//! Per-function anomaly metrics.
//!
//! Accumulated on the AD between syncs and merged on the PS into a global
//! per-function view.

use std::collections::{BTreeMap, HashMap};

use insitu_stats::RunningStats;
use insitu_trace::ExecData;
use insitu_types::FunctionId;
use serde::{Deserialize, Serialize};

/// Anomaly counts and score distributions of one function.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionMetrics {
    pub func_name: String,
    /// Classified calls.
    pub calls: u64,
    pub outliers: u64,
    /// Scores of outlier calls.
    pub score: RunningStats,
    /// Severities of outlier calls.
    pub severity: RunningStats,
    pub first_step: Option<u64>,
    pub last_step: Option<u64>,
}

impl FunctionMetrics {
    pub fn merge_from(&mut self, other: &FunctionMetrics) {
        if self.func_name.is_empty() {
            self.func_name = other.func_name.clone();
        }
        self.calls += other.calls;
        self.outliers += other.outliers;
        self.score.merge_from(&other.score);
        self.severity.merge_from(&other.severity);
        self.first_step = min_opt(self.first_step, other.first_step);
        self.last_step = self.last_step.max(other.last_step);
    }
}

fn min_opt(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Anomaly metrics keyed by function id.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnomalyMetrics {
    functions: BTreeMap<FunctionId, FunctionMetrics>,
}

impl AnomalyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one classified call observed in `step`.
    pub fn record(&mut self, step: u64, call: &ExecData) {
        let m = self.functions.entry(call.fid).or_default();
        if m.func_name.is_empty() {
            m.func_name = call.func_name.clone();
        }
        m.calls += 1;
        if call.is_outlier() {
            m.outliers += 1;
            m.score.push(call.score());
            m.severity.push(call.severity());
        }
        m.first_step = Some(m.first_step.map_or(step, |s| s.min(step)));
        m.last_step = Some(m.last_step.map_or(step, |s| s.max(step)));
    }

    pub fn insert(&mut self, fid: FunctionId, metrics: FunctionMetrics) -> Option<FunctionMetrics> {
        self.functions.insert(fid, metrics)
    }

    pub fn get(&self, fid: FunctionId) -> Option<&FunctionMetrics> {
        self.functions.get(&fid)
    }

    pub fn iter(&self) -> impl Iterator<Item = (FunctionId, &FunctionMetrics)> {
        self.functions.iter().map(|(fid, m)| (*fid, m))
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Keep only the functions for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(FunctionId) -> bool) {
        self.functions.retain(|fid, _| keep(*fid));
    }

    pub fn total_outliers(&self) -> u64 {
        self.functions.values().map(|m| m.outliers).sum()
    }

    pub fn merge_from(&mut self, other: &AnomalyMetrics) {
        for (fid, m) in &other.functions {
            self.functions.entry(*fid).or_default().merge_from(m);
        }
    }

    /// Re-key through `map`, dropping unmapped functions.
    pub fn remap(&self, map: &HashMap<FunctionId, FunctionId>) -> AnomalyMetrics {
        let mut out = AnomalyMetrics::new();
        for (fid, m) in &self.functions {
            if let Some(to) = map.get(fid) {
                out.functions.entry(*to).or_default().merge_from(m);
            }
        }
        out
    }
}
