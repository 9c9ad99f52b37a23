//! Global counter and anomaly statistics aggregated across ranks.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use insitu_detect::{AnomalyMetrics, FunctionMetrics};
use insitu_stats::RunningStats;
use insitu_types::{FunctionId, ProgramId, RankId};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::payload::{AnomalyStatsReport, CounterStatsReport, RankAnomalyStats};

// ── Counter statistics ──────────────────────────────────────────────────

/// Running statistics per (program, counter name).
#[derive(Debug, Default)]
pub struct GlobalCounterStats {
    stats: Mutex<HashMap<(ProgramId, String), RunningStats>>,
}

impl GlobalCounterStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> SyncResult<MutexGuard<'_, HashMap<(ProgramId, String), RunningStats>>> {
        self.stats
            .lock()
            .map_err(|_| SyncError::LockPoisoned("counter stats"))
    }

    /// Merge a rank's counter statistics and return the global values of
    /// the counters it reported.
    pub fn add(&self, report: &CounterStatsReport) -> SyncResult<BTreeMap<String, RunningStats>> {
        let mut stats = self.lock()?;
        let mut merged = BTreeMap::new();
        for (name, s) in &report.counters {
            let global = stats.entry((report.pid, name.clone())).or_default();
            global.merge_from(s);
            merged.insert(name.clone(), global.clone());
        }
        Ok(merged)
    }

    pub fn get(&self, pid: ProgramId, name: &str) -> SyncResult<Option<RunningStats>> {
        Ok(self.lock()?.get(&(pid, name.to_string())).cloned())
    }

    /// All counters of `pid`, or only `names` when non-empty.
    pub fn query(&self, pid: ProgramId, names: &[String]) -> SyncResult<BTreeMap<String, RunningStats>> {
        let stats = self.lock()?;
        Ok(stats
            .iter()
            .filter(|((p, name), _)| *p == pid && (names.is_empty() || names.contains(name)))
            .map(|((_, name), s)| (name.clone(), s.clone()))
            .collect())
    }

    pub fn len(&self) -> SyncResult<usize> {
        Ok(self.lock()?.len())
    }

    pub fn clear(&self) -> SyncResult<()> {
        self.lock()?.clear();
        Ok(())
    }
}

// ── Anomaly statistics ──────────────────────────────────────────────────

#[derive(Debug, Default)]
struct AnomalyState {
    ranks: HashMap<(ProgramId, RankId), RankAnomalyStats>,
    functions: HashMap<(ProgramId, FunctionId), FunctionMetrics>,
}

/// Per-rank anomaly history and per-function anomaly metrics.
#[derive(Debug, Default)]
pub struct GlobalAnomalyStats {
    state: Mutex<AnomalyState>,
}

/// Program-wide totals derived from [`GlobalAnomalyStats`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgramAnomalySummary {
    pub ranks: usize,
    pub total_outliers: u64,
    pub total_calls: u64,
}

impl GlobalAnomalyStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> SyncResult<MutexGuard<'_, AnomalyState>> {
        self.state
            .lock()
            .map_err(|_| SyncError::LockPoisoned("anomaly stats"))
    }

    /// Account one step report and return the rank's updated history.
    pub fn add_step(&self, report: &AnomalyStatsReport) -> SyncResult<RankAnomalyStats> {
        let mut state = self.lock()?;
        let rank = state.ranks.entry((report.pid, report.rid)).or_default();
        rank.outliers_per_step.push(report.outliers as f64);
        rank.total_outliers += report.outliers;
        rank.total_calls += report.calls;
        rank.steps += 1;
        rank.last_step = rank.last_step.max(Some(report.step));
        Ok(rank.clone())
    }

    /// Merge per-function metrics and return the global metrics of the
    /// functions reported.
    pub fn add_metrics(&self, pid: ProgramId, metrics: &AnomalyMetrics) -> SyncResult<AnomalyMetrics> {
        let mut state = self.lock()?;
        let mut merged = AnomalyMetrics::new();
        for (fid, m) in metrics.iter() {
            let global = state.functions.entry((pid, fid)).or_default();
            global.merge_from(m);
            merged.insert(fid, global.clone());
        }
        Ok(merged)
    }

    pub fn rank(&self, pid: ProgramId, rid: RankId) -> SyncResult<Option<RankAnomalyStats>> {
        Ok(self.lock()?.ranks.get(&(pid, rid)).cloned())
    }

    pub fn function(&self, pid: ProgramId, fid: FunctionId) -> SyncResult<Option<FunctionMetrics>> {
        Ok(self.lock()?.functions.get(&(pid, fid)).cloned())
    }

    pub fn program_summary(&self, pid: ProgramId) -> SyncResult<ProgramAnomalySummary> {
        let state = self.lock()?;
        let mut summary = ProgramAnomalySummary::default();
        for ((p, _), rank) in &state.ranks {
            if *p == pid {
                summary.ranks += 1;
                summary.total_outliers += rank.total_outliers;
                summary.total_calls += rank.total_calls;
            }
        }
        Ok(summary)
    }

    pub fn rank_count(&self) -> SyncResult<usize> {
        Ok(self.lock()?.ranks.len())
    }

    pub fn clear(&self) -> SyncResult<()> {
        let mut state = self.lock()?;
        state.ranks.clear();
        state.functions.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(pid: ProgramId, rid: RankId, entries: &[(&str, &[f64])]) -> CounterStatsReport {
        CounterStatsReport {
            pid,
            rid,
            step: 0,
            counters: entries
                .iter()
                .map(|(n, xs)| (n.to_string(), RunningStats::from_samples(xs.iter().copied())))
                .collect(),
        }
    }

    #[test]
    fn counters_merge_per_program_and_name() {
        let g = GlobalCounterStats::new();
        g.add(&counters(0, 0, &[("cycles", &[1.0, 2.0])])).unwrap();
        let merged = g.add(&counters(0, 1, &[("cycles", &[3.0])])).unwrap();
        assert_eq!(merged["cycles"].count(), 3);

        g.add(&counters(1, 0, &[("cycles", &[100.0])])).unwrap();
        assert_eq!(g.get(0, "cycles").unwrap().unwrap().count(), 3);
        assert_eq!(g.get(1, "cycles").unwrap().unwrap().count(), 1);
        assert_eq!(g.len().unwrap(), 2);
        assert_eq!(g.query(0, &[]).unwrap().len(), 1);
        assert!(g.query(0, &["misses".into()]).unwrap().is_empty());
    }

    #[test]
    fn rank_history_accumulates() {
        let g = GlobalAnomalyStats::new();
        for (step, outliers) in [(0, 2), (1, 0), (2, 4)] {
            g.add_step(&AnomalyStatsReport {
                pid: 0,
                rid: 5,
                step,
                calls: 10,
                outliers,
                ..Default::default()
            })
            .unwrap();
        }
        let rank = g.rank(0, 5).unwrap().unwrap();
        assert_eq!(rank.steps, 3);
        assert_eq!(rank.total_outliers, 6);
        assert_eq!(rank.outliers_per_step.mean(), 2.0);
        assert_eq!(rank.last_step, Some(2));

        let summary = g.program_summary(0).unwrap();
        assert_eq!(summary.ranks, 1);
        assert_eq!(summary.total_calls, 30);
    }

    #[test]
    fn metrics_merge_per_program_and_function() {
        let g = GlobalAnomalyStats::new();
        let mut m = FunctionMetrics {
            func_name: "solve".into(),
            calls: 10,
            outliers: 1,
            ..Default::default()
        };
        m.score.push(4.0);
        let mut report = AnomalyMetrics::new();
        report.insert(3, m);

        g.add_metrics(0, &report).unwrap();
        let merged = g.add_metrics(0, &report).unwrap();
        let f = merged.get(3).unwrap();
        assert_eq!(f.calls, 20);
        assert_eq!(f.outliers, 2);
        assert_eq!(f.score.count(), 2);
        assert!(g.function(1, 3).unwrap().is_none());
    }
}
