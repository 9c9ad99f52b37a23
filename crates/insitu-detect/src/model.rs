//! Per-function statistics model.

use std::collections::{BTreeMap, HashMap};

use insitu_stats::RunningStats;
use insitu_types::FunctionId;
use serde::{Deserialize, Serialize};

/// Mapping from function id to the running statistics of its runtimes.
///
/// Serializes as a JSON object keyed by function id, carrying the raw
/// accumulator state of every entry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionModel {
    stats: BTreeMap<FunctionId, RunningStats>,
}

impl FunctionModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, fid: FunctionId) -> Option<&RunningStats> {
        self.stats.get(&fid)
    }

    /// Entry for `fid`, created empty if absent.
    pub fn entry(&mut self, fid: FunctionId) -> &mut RunningStats {
        self.stats.entry(fid).or_default()
    }

    pub fn insert(&mut self, fid: FunctionId, stats: RunningStats) -> Option<RunningStats> {
        self.stats.insert(fid, stats)
    }

    pub fn remove(&mut self, fid: FunctionId) -> Option<RunningStats> {
        self.stats.remove(&fid)
    }

    pub fn contains(&self, fid: FunctionId) -> bool {
        self.stats.contains_key(&fid)
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    pub fn clear(&mut self) {
        self.stats.clear();
    }

    pub fn function_ids(&self) -> Vec<FunctionId> {
        self.stats.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (FunctionId, &RunningStats)> {
        self.stats.iter().map(|(fid, s)| (*fid, s))
    }

    /// Merge every entry of `other` into this model (union of datasets).
    pub fn merge_from(&mut self, other: &FunctionModel) {
        for (fid, stats) in &other.stats {
            self.stats.entry(*fid).or_default().merge_from(stats);
        }
    }

    /// Overwrite this model's entries with those present in `other`.
    /// Entries absent from `other` are kept.
    pub fn replace(&mut self, other: &FunctionModel) {
        for (fid, stats) in &other.stats {
            self.stats.insert(*fid, stats.clone());
        }
    }

    /// Copy of the entries for `fids` that exist in this model.
    pub fn subset(&self, fids: impl IntoIterator<Item = FunctionId>) -> FunctionModel {
        fids.into_iter()
            .filter_map(|fid| self.stats.get(&fid).map(|s| (fid, s.clone())))
            .collect()
    }

    /// Re-key through `map`. Entries without a mapping are dropped; entries
    /// mapped to the same key are merged.
    pub fn remap(&self, map: &HashMap<FunctionId, FunctionId>) -> FunctionModel {
        let mut out = FunctionModel::new();
        for (fid, stats) in &self.stats {
            if let Some(to) = map.get(fid) {
                out.entry(*to).merge_from(stats);
            }
        }
        out
    }
}

impl FromIterator<(FunctionId, RunningStats)> for FunctionModel {
    fn from_iter<I: IntoIterator<Item = (FunctionId, RunningStats)>>(iter: I) -> Self {
        Self {
            stats: iter.into_iter().collect(),
        }
    }
}
