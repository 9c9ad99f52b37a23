//! Streaming moment accumulator with exact parallel merge.
//!
//! Updates use the single-pass central-moment recurrences (Welford for the
//! second moment, Terriberry's extension for the third and fourth) so no
//! sum-of-squares cancellation occurs. Merging uses the pairwise
//! combination formulas of Chan et al. / Pébay, which reproduce the state
//! that pushing all samples into one accumulator would have produced, up to
//! floating-point rounding.

use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

use crate::error::{StatsError, StatsResult};

/// Streaming accumulator of count, mean, min/max and central moments M2..M4.
///
/// An empty accumulator has `min = +∞` and `max = −∞`. Derived statistics
/// that are undefined for the current state are reported as `NaN`; the
/// `try_*` variants report them as [`StatsError`] instead.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(into = "RunningStatsState", try_from = "RunningStatsState")]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    m3: f64,
    m4: f64,
    min: f64,
    max: f64,
}

impl Default for RunningStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RunningStats {
    pub fn new() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            m3: 0.0,
            m4: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    /// Build an accumulator from a sequence of samples.
    pub fn from_samples<I: IntoIterator<Item = f64>>(samples: I) -> Self {
        let mut stats = Self::new();
        for x in samples {
            stats.push(x);
        }
        stats
    }

    /// Incorporate one sample in O(1).
    pub fn push(&mut self, x: f64) {
        let n1 = self.count as f64;
        self.count += 1;
        let n = self.count as f64;

        let delta = x - self.mean;
        let delta_n = delta / n;
        let delta_n2 = delta_n * delta_n;
        let term1 = delta * delta_n * n1;

        self.mean += delta_n;
        self.m4 += term1 * delta_n2 * (n * n - 3.0 * n + 3.0) + 6.0 * delta_n2 * self.m2
            - 4.0 * delta_n * self.m3;
        self.m3 += term1 * delta_n * (n - 2.0) - 3.0 * delta_n * self.m2;
        self.m2 += term1;

        if x < self.min {
            self.min = x;
        }
        if x > self.max {
            self.max = x;
        }
    }

    /// Combine two independently accumulated states into the state of the
    /// union of their datasets. Empty operands are the identity.
    pub fn merge(a: &RunningStats, b: &RunningStats) -> RunningStats {
        if a.count == 0 {
            return b.clone();
        }
        if b.count == 0 {
            return a.clone();
        }

        let na = a.count as f64;
        let nb = b.count as f64;
        let n = na + nb;

        let delta = b.mean - a.mean;
        let d2 = delta * delta;
        let d3 = d2 * delta;
        let d4 = d2 * d2;

        let mean = (na * a.mean + nb * b.mean) / n;
        let m2 = a.m2 + b.m2 + d2 * na * nb / n;
        let m3 = a.m3
            + b.m3
            + d3 * na * nb * (na - nb) / (n * n)
            + 3.0 * delta * (na * b.m2 - nb * a.m2) / n;
        let m4 = a.m4
            + b.m4
            + d4 * na * nb * (na * na - na * nb + nb * nb) / (n * n * n)
            + 6.0 * d2 * (na * na * b.m2 + nb * nb * a.m2) / (n * n)
            + 4.0 * delta * (na * b.m3 - nb * a.m3) / n;

        RunningStats {
            count: a.count + b.count,
            mean,
            m2,
            m3,
            m4,
            min: a.min.min(b.min),
            max: a.max.max(b.max),
        }
    }

    /// Merge `other` into `self` in place.
    pub fn merge_from(&mut self, other: &RunningStats) {
        *self = RunningStats::merge(self, other);
    }

    /// Reset to the empty state.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Sample mean, `NaN` when empty.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            f64::NAN
        } else {
            self.mean
        }
    }

    /// `M2 / (n - ddof)`; `NaN` when `n <= ddof`.
    pub fn variance(&self, ddof: u64) -> f64 {
        if self.count <= ddof {
            f64::NAN
        } else {
            self.m2 / (self.count - ddof) as f64
        }
    }

    pub fn stddev(&self, ddof: u64) -> f64 {
        self.variance(ddof).sqrt()
    }

    /// Population skewness `sqrt(n) * M3 / M2^1.5`; `NaN` for empty or
    /// zero-variance data.
    pub fn skewness(&self) -> f64 {
        if self.count == 0 || self.m2 == 0.0 {
            return f64::NAN;
        }
        (self.count as f64).sqrt() * self.m3 / self.m2.powf(1.5)
    }

    /// Excess kurtosis `n * M4 / M2^2 - 3`; `NaN` for empty or
    /// zero-variance data.
    pub fn kurtosis(&self) -> f64 {
        if self.count == 0 || self.m2 == 0.0 {
            return f64::NAN;
        }
        self.count as f64 * self.m4 / (self.m2 * self.m2) - 3.0
    }

    /// Smallest sample, `+∞` when empty.
    pub fn min(&self) -> f64 {
        self.min
    }

    /// Largest sample, `−∞` when empty.
    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn try_mean(&self) -> StatsResult<f64> {
        if self.count == 0 {
            return Err(StatsError::NoData {
                required: 1,
                count: 0,
            });
        }
        Ok(self.mean)
    }

    pub fn try_variance(&self, ddof: u64) -> StatsResult<f64> {
        if self.count <= ddof {
            return Err(StatsError::NoData {
                required: ddof + 1,
                count: self.count,
            });
        }
        Ok(self.variance(ddof))
    }

    pub fn try_stddev(&self, ddof: u64) -> StatsResult<f64> {
        self.try_variance(ddof).map(f64::sqrt)
    }

    pub fn try_skewness(&self) -> StatsResult<f64> {
        self.try_mean()?;
        if self.m2 == 0.0 {
            return Err(StatsError::Undefined("skewness of zero-variance data"));
        }
        Ok(self.skewness())
    }

    pub fn try_kurtosis(&self) -> StatsResult<f64> {
        self.try_mean()?;
        if self.m2 == 0.0 {
            return Err(StatsError::Undefined("kurtosis of zero-variance data"));
        }
        Ok(self.kurtosis())
    }

    /// Derived statistics for reporting (population variance).
    pub fn summary(&self) -> StatsSummary {
        let defined = |v: f64| if v.is_finite() { Some(v) } else { None };
        StatsSummary {
            count: self.count,
            mean: defined(self.mean()),
            stddev: defined(self.stddev(0)),
            skewness: defined(self.skewness()),
            kurtosis: defined(self.kurtosis()),
            min: defined(self.min),
            max: defined(self.max),
        }
    }
}

impl Add for RunningStats {
    type Output = RunningStats;

    fn add(self, rhs: RunningStats) -> RunningStats {
        RunningStats::merge(&self, &rhs)
    }
}

impl<'a> Add<&'a RunningStats> for &'a RunningStats {
    type Output = RunningStats;

    fn add(self, rhs: &'a RunningStats) -> RunningStats {
        RunningStats::merge(self, rhs)
    }
}

impl AddAssign<&RunningStats> for RunningStats {
    fn add_assign(&mut self, rhs: &RunningStats) {
        self.merge_from(rhs);
    }
}

impl Extend<f64> for RunningStats {
    fn extend<I: IntoIterator<Item = f64>>(&mut self, iter: I) {
        for x in iter {
            self.push(x);
        }
    }
}

impl FromIterator<f64> for RunningStats {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        Self::from_samples(iter)
    }
}

// ── Wire state ──────────────────────────────────────────────────────────

/// Raw accumulator state as it crosses the wire.
///
/// `min`/`max` are `None` for an empty accumulator since JSON has no
/// infinities.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunningStatsState {
    pub count: u64,
    pub mean: f64,
    pub m2: f64,
    pub m3: f64,
    pub m4: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl From<RunningStats> for RunningStatsState {
    fn from(s: RunningStats) -> Self {
        let (min, max) = if s.count == 0 {
            (None, None)
        } else {
            (Some(s.min), Some(s.max))
        };
        Self {
            count: s.count,
            mean: s.mean,
            m2: s.m2,
            m3: s.m3,
            m4: s.m4,
            min,
            max,
        }
    }
}

impl TryFrom<RunningStatsState> for RunningStats {
    type Error = StatsError;

    fn try_from(s: RunningStatsState) -> Result<Self, Self::Error> {
        if s.count == 0 {
            return Ok(RunningStats::new());
        }
        let (min, max) = match (s.min, s.max) {
            (Some(min), Some(max)) => (min, max),
            _ => {
                return Err(StatsError::InvalidState(format!(
                    "count {} without min/max",
                    s.count
                )))
            }
        };
        if ![s.mean, s.m2, s.m3, s.m4, min, max]
            .iter()
            .all(|v| v.is_finite())
        {
            return Err(StatsError::InvalidState("non-finite moment".into()));
        }
        if s.m2 < 0.0 || s.m4 < 0.0 {
            return Err(StatsError::InvalidState(format!(
                "negative even moment (m2={}, m4={})",
                s.m2, s.m4
            )));
        }
        if min > max {
            return Err(StatsError::InvalidState(format!(
                "min {} greater than max {}",
                min, max
            )));
        }
        Ok(RunningStats {
            count: s.count,
            mean: s.mean,
            m2: s.m2,
            m3: s.m3,
            m4: s.m4,
            min,
            max,
        })
    }
}

/// Derived statistics; `None` where the statistic is undefined.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSummary {
    pub count: u64,
    pub mean: Option<f64>,
    pub stddev: Option<f64>,
    pub skewness: Option<f64>,
    pub kurtosis: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}
