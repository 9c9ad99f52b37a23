//! Detection algorithms and detector configuration.
//!
//! The set of algorithms is closed: [`Algorithm`] is a sum type and
//! selection by name goes through a small registration table.

use insitu_stats::RunningStats;
use insitu_types::CallLabel;
use serde::{Deserialize, Serialize};

use crate::error::{DetectError, DetectResult};
use crate::{DEFAULT_MIN_SAMPLES, DEFAULT_SIGMA};

// ── Config ──────────────────────────────────────────────────────────────

/// Whether outlier runtimes are folded back into the function model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlierPolicy {
    /// Every classified call updates the model. The model follows a shifted
    /// regime, at the cost of scores decaying during a sustained anomaly.
    #[default]
    IncludeOutliers,
    /// Only normal calls update the model.
    ExcludeOutliers,
}

/// Detector configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Registered algorithm name.
    #[serde(default = "default_algorithm")]
    pub algorithm: String,

    /// Threshold in standard deviations.
    #[serde(default = "default_sigma")]
    pub sigma: f64,

    /// Samples a function needs before any call can be flagged.
    #[serde(default = "default_min_samples")]
    pub min_samples: u64,

    #[serde(default)]
    pub outlier_policy: OutlierPolicy,

    /// Score exclusive instead of inclusive runtime.
    #[serde(default)]
    pub exclusive_runtime: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            sigma: DEFAULT_SIGMA,
            min_samples: DEFAULT_MIN_SAMPLES,
            outlier_policy: OutlierPolicy::default(),
            exclusive_runtime: false,
        }
    }
}

fn default_algorithm() -> String {
    "sstd".to_string()
}

fn default_sigma() -> f64 {
    DEFAULT_SIGMA
}

fn default_min_samples() -> u64 {
    DEFAULT_MIN_SAMPLES
}

// ── Verdict ─────────────────────────────────────────────────────────────

/// Outcome of evaluating one value against a function's statistics.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Verdict {
    pub label: CallLabel,
    /// `|z|`, or 0 when no score could be computed.
    pub score: f64,
    /// Exceedance over the threshold, 0 for normal calls.
    pub severity: f64,
}

impl Verdict {
    fn normal(score: f64) -> Self {
        Self {
            label: CallLabel::Normal,
            score,
            severity: 0.0,
        }
    }
}

// ── Algorithms ──────────────────────────────────────────────────────────

/// Parameters of the sigma-threshold algorithm.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SigmaParams {
    pub sigma: f64,
    pub min_samples: u64,
}

/// Supported detection algorithms.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum Algorithm {
    /// Flags a value whose z-score against the function's running mean
    /// and population standard deviation exceeds `sigma`.
    SigmaThreshold(SigmaParams),
}

type Constructor = fn(&DetectorConfig) -> DetectResult<Algorithm>;

const REGISTRY: &[(&str, Constructor)] = &[("sstd", sigma_threshold)];

fn sigma_threshold(config: &DetectorConfig) -> DetectResult<Algorithm> {
    if !config.sigma.is_finite() || config.sigma <= 0.0 {
        return Err(DetectError::InvalidConfig(format!(
            "sigma must be a positive finite number, got {}",
            config.sigma
        )));
    }
    Ok(Algorithm::SigmaThreshold(SigmaParams {
        sigma: config.sigma,
        min_samples: config.min_samples,
    }))
}

impl Algorithm {
    /// Look up `name` in the registration table and build it from `config`.
    pub fn from_name(name: &str, config: &DetectorConfig) -> DetectResult<Self> {
        REGISTRY
            .iter()
            .find(|(n, _)| *n == name)
            .ok_or_else(|| DetectError::UnknownAlgorithm(name.to_string()))
            .and_then(|(_, build)| build(config))
    }

    pub fn from_config(config: &DetectorConfig) -> DetectResult<Self> {
        Self::from_name(&config.algorithm, config)
    }

    /// Registered algorithm names.
    pub fn available() -> impl Iterator<Item = &'static str> {
        REGISTRY.iter().map(|(n, _)| *n)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::SigmaThreshold(_) => "sstd",
        }
    }

    /// Classify `value` against the statistics accumulated so far.
    pub fn evaluate(&self, value: f64, stats: &RunningStats) -> Verdict {
        match self {
            Algorithm::SigmaThreshold(p) => {
                if stats.count() < p.min_samples {
                    return Verdict::normal(0.0);
                }
                let sd = stats.stddev(0);
                if !sd.is_finite() || sd < f64::EPSILON {
                    return Verdict::normal(0.0);
                }
                let z = ((value - stats.mean()) / sd).abs();
                if z > p.sigma {
                    Verdict {
                        label: CallLabel::Outlier,
                        score: z,
                        severity: z - p.sigma,
                    }
                } else {
                    Verdict::normal(z)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sstd(sigma: f64, min_samples: u64) -> Algorithm {
        Algorithm::SigmaThreshold(SigmaParams { sigma, min_samples })
    }

    #[test]
    fn registry_lookup() {
        let config = DetectorConfig::default();
        let alg = Algorithm::from_config(&config).unwrap();
        assert_eq!(alg.name(), "sstd");
        assert_eq!(Algorithm::available().collect::<Vec<_>>(), vec!["sstd"]);

        let err = Algorithm::from_name("hbos", &config).unwrap_err();
        assert!(matches!(err, DetectError::UnknownAlgorithm(_)));
    }

    #[test]
    fn rejects_bad_sigma() {
        let config = DetectorConfig {
            sigma: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            Algorithm::from_config(&config),
            Err(DetectError::InvalidConfig(_))
        ));
    }

    #[test]
    fn bootstrap_is_always_normal() {
        let alg = sstd(3.0, 5);
        let stats = RunningStats::from_samples([1.0, 2.0, 3.0, 4.0]);
        let v = alg.evaluate(1e9, &stats);
        assert_eq!(v.label, CallLabel::Normal);
    }

    #[test]
    fn zero_variance_is_normal() {
        let alg = sstd(3.0, 5);
        let stats = RunningStats::from_samples([10.0; 5]);
        let v = alg.evaluate(12.0, &stats);
        assert_eq!(v.label, CallLabel::Normal);
        assert_eq!(v.score, 0.0);
    }

    #[test]
    fn threshold_is_strict() {
        let alg = sstd(3.0, 5);
        let stats = RunningStats::from_samples([10.0, 20.0, 10.0, 20.0, 10.0, 20.0]);
        let threshold = stats.mean() + 3.0 * stats.stddev(0);
        let eps = 1e-6;

        let above = alg.evaluate(threshold + eps, &stats);
        assert_eq!(above.label, CallLabel::Outlier);
        assert!(above.severity > 0.0);
        assert!((above.score - 3.0).abs() < 1e-6);

        let below = alg.evaluate(threshold - eps, &stats);
        assert_eq!(below.label, CallLabel::Normal);
        assert_eq!(below.severity, 0.0);

        // symmetric on the low side
        let low = alg.evaluate(stats.mean() - 3.0 * stats.stddev(0) - eps, &stats);
        assert_eq!(low.label, CallLabel::Outlier);
    }

    #[test]
    fn config_defaults_from_empty_json() {
        let config: DetectorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, DetectorConfig::default());
        assert_eq!(config.outlier_policy, OutlierPolicy::IncludeOutliers);
    }
}
