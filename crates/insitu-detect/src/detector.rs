//! The per-rank outlier detector.

use std::collections::BTreeMap;

use insitu_stats::RunningStats;
use insitu_trace::{CallBatch, ExecData};
use insitu_types::{CallId, CallLabel, FunctionId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::algorithm::{Algorithm, DetectorConfig, OutlierPolicy, Verdict};
use crate::error::DetectResult;
use crate::metrics::AnomalyMetrics;
use crate::model::FunctionModel;

/// Per-function counts for one step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionStepCounts {
    pub calls: u64,
    pub outliers: u64,
}

/// Classification summary of one step.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StepAnomalies {
    pub step: u64,
    /// Smallest entry and largest exit over the step's calls.
    pub first_entry: Option<u64>,
    pub last_exit: Option<u64>,
    pub outliers: Vec<CallId>,
    pub per_function: BTreeMap<FunctionId, FunctionStepCounts>,
}

impl StepAnomalies {
    pub fn outlier_count(&self) -> usize {
        self.outliers.len()
    }

    pub fn call_count(&self) -> u64 {
        self.per_function.values().map(|c| c.calls).sum()
    }
}

/// Scores completed calls against a per-function model.
///
/// `model` is what calls are scored against. `delta` holds only what this
/// rank observed since the last successful sync and is what gets pushed to
/// the parameter server.
pub struct OutlierDetector {
    config: DetectorConfig,
    algorithm: Algorithm,
    model: FunctionModel,
    delta: FunctionModel,
    metrics: AnomalyMetrics,
    step: u64,
}

impl OutlierDetector {
    pub fn new(config: DetectorConfig) -> DetectResult<Self> {
        let algorithm = Algorithm::from_config(&config)?;
        Ok(Self {
            config,
            algorithm,
            model: FunctionModel::new(),
            delta: FunctionModel::new(),
            metrics: AnomalyMetrics::new(),
            step: 0,
        })
    }

    pub fn with_defaults() -> Self {
        Self {
            algorithm: Algorithm::SigmaThreshold(crate::SigmaParams {
                sigma: crate::DEFAULT_SIGMA,
                min_samples: crate::DEFAULT_MIN_SAMPLES,
            }),
            config: DetectorConfig::default(),
            model: FunctionModel::new(),
            delta: FunctionModel::new(),
            metrics: AnomalyMetrics::new(),
            step: 0,
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn algorithm(&self) -> &Algorithm {
        &self.algorithm
    }

    /// The model calls are scored against.
    pub fn model(&self) -> &FunctionModel {
        &self.model
    }

    pub fn function_stats(&self, fid: FunctionId) -> Option<&RunningStats> {
        self.model.get(fid)
    }

    /// Statistics accumulated since the last sync.
    pub fn local_delta(&self) -> &FunctionModel {
        &self.delta
    }

    /// Anomaly metrics not yet reported to the parameter server.
    pub fn metrics(&self) -> &AnomalyMetrics {
        &self.metrics
    }

    /// Keep only the metrics of functions for which `keep` returns true.
    pub fn retain_metrics(&mut self, keep: impl FnMut(FunctionId) -> bool) {
        self.metrics.retain(keep);
    }

    pub fn set_step(&mut self, step: u64) {
        self.step = step;
    }

    fn value_of(&self, call: &ExecData) -> f64 {
        if self.config.exclusive_runtime {
            call.exclusive_runtime() as f64
        } else {
            call.runtime() as f64
        }
    }

    /// Verdict for `call` against the current model, without side effects.
    pub fn evaluate(&self, call: &ExecData) -> Verdict {
        let value = self.value_of(call);
        match self.model.get(call.fid) {
            Some(stats) => self.algorithm.evaluate(value, stats),
            None => self.algorithm.evaluate(value, &RunningStats::new()),
        }
    }

    /// Label `call` against the statistics seen so far, then fold its value
    /// into the model. Already-labeled calls are returned unchanged.
    pub fn classify(&mut self, call: &mut ExecData) -> CallLabel {
        if call.label().is_terminal() {
            return call.label();
        }
        let verdict = self.evaluate(call);
        if let Err(e) = call.set_label(verdict.label, verdict.score, verdict.severity) {
            warn!(call = %call.id, error = %e, "classification rejected");
            return call.label();
        }

        let keep = match self.config.outlier_policy {
            OutlierPolicy::IncludeOutliers => true,
            OutlierPolicy::ExcludeOutliers => verdict.label != CallLabel::Outlier,
        };
        if keep {
            let value = self.value_of(call);
            self.model.entry(call.fid).push(value);
            self.delta.entry(call.fid).push(value);
        }
        self.metrics.record(self.step, call);
        verdict.label
    }

    /// Classify `calls` of function `fid` in order; returns how many were
    /// newly flagged.
    pub fn compute_outliers(&mut self, fid: FunctionId, calls: &mut [ExecData]) -> usize {
        let mut flagged = 0;
        for call in calls.iter_mut() {
            if call.fid != fid {
                warn!(call = %call.id, expected = fid, found = call.fid, "call skipped: wrong function");
                continue;
            }
            if call.label().is_terminal() {
                continue;
            }
            if self.classify(call) == CallLabel::Outlier {
                flagged += 1;
            }
        }
        flagged
    }

    /// Classify every call of a flushed step.
    pub fn run_batch(&mut self, step: u64, batch: &mut CallBatch) -> StepAnomalies {
        self.set_step(step);
        let mut summary = StepAnomalies {
            step,
            ..Default::default()
        };

        for fid in batch.function_ids() {
            let Some(calls) = batch.calls_mut(fid) else {
                continue;
            };
            let flagged = self.compute_outliers(fid, calls);
            summary.per_function.insert(
                fid,
                FunctionStepCounts {
                    calls: calls.len() as u64,
                    outliers: flagged as u64,
                },
            );
            for call in calls.iter() {
                if call.is_outlier() {
                    summary.outliers.push(call.id);
                }
                summary.first_entry = Some(summary.first_entry.map_or(call.entry, |t| t.min(call.entry)));
                summary.last_exit = Some(summary.last_exit.map_or(call.exit, |t| t.max(call.exit)));
            }
        }

        debug!(
            step,
            calls = summary.call_count(),
            outliers = summary.outlier_count(),
            functions = summary.per_function.len(),
            "step classified"
        );
        summary
    }

    /// Adopt the global statistics returned by the parameter server.
    ///
    /// The server merged this rank's delta into `global` before replying,
    /// so delta entries of the functions in `global` are dropped rather than
    /// merged again. Functions that were not sent stay pending.
    pub fn sync_param(&mut self, global: &FunctionModel) {
        self.model.replace(global);
        for (fid, _) in global.iter() {
            self.delta.remove(fid);
        }
        debug!(
            functions = global.len(),
            pending = self.delta.len(),
            "adopted global model"
        );
    }

    /// Merge another model into the local one without a server round trip.
    pub fn merge_param(&mut self, other: &FunctionModel) {
        self.model.merge_from(other);
    }

    /// Re-score an already labeled call against the current model, for
    /// replay of retained normal calls.
    pub fn replay(&self, call: &mut ExecData) {
        let verdict = self.evaluate(call);
        call.relabel_for_replay(verdict.label, verdict.score, verdict.severity);
    }
}
