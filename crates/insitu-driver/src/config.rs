//! Analysis pipeline configuration.

use insitu_detect::DetectorConfig;
use insitu_types::{ProgramId, RankId};
use serde::{Deserialize, Serialize};

use crate::error::{DriverError, DriverResult};

/// Driver configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Program analysed by this rank
    #[serde(default)]
    pub program: ProgramId,

    /// Rank analysed by this driver
    #[serde(default)]
    pub rank: RankId,

    #[serde(default)]
    pub detector: DetectorConfig,

    /// Sync with the parameter server every N steps (0 disables)
    #[serde(default = "default_sync_every_steps")]
    pub sync_every_steps: u64,

    /// Also sync once this many outliers accumulated (0 disables)
    #[serde(default)]
    pub sync_every_outliers: u64,

    /// Consecutive not-ready polls before giving up
    #[serde(default = "default_max_idle_polls")]
    pub max_idle_polls: u32,

    /// Sleep between not-ready polls, in milliseconds
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,

    /// Neighbouring calls attached to each outlier record
    #[serde(default = "default_provenance_window")]
    pub provenance_window: usize,

    /// Most recent normal calls per function recorded each step
    #[serde(default)]
    pub record_normals: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            program: 0,
            rank: 0,
            detector: DetectorConfig::default(),
            sync_every_steps: default_sync_every_steps(),
            sync_every_outliers: 0,
            max_idle_polls: default_max_idle_polls(),
            idle_poll_ms: default_idle_poll_ms(),
            provenance_window: default_provenance_window(),
            record_normals: 0,
        }
    }
}

fn default_sync_every_steps() -> u64 {
    1
}

fn default_max_idle_polls() -> u32 {
    100
}

fn default_idle_poll_ms() -> u64 {
    100
}

fn default_provenance_window() -> usize {
    5
}

impl DriverConfig {
    pub fn validate(&self) -> DriverResult<()> {
        if !(self.detector.sigma.is_finite() && self.detector.sigma > 0.0) {
            return Err(DriverError::InvalidConfig(format!(
                "detector.sigma must be positive, got {}",
                self.detector.sigma
            )));
        }
        if self.max_idle_polls == 0 {
            return Err(DriverError::InvalidConfig(
                "max_idle_polls must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
