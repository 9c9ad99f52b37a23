//! Global function numbering shared by all ranks.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use insitu_types::{FunctionId, ProgramId};
use tracing::debug;

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Default)]
struct IndexState {
    indices: HashMap<(ProgramId, String), u64>,
    next: u64,
}

/// Assigns a dense global index to every (program, function name) the first
/// time any rank reports it.
#[derive(Debug, Default)]
pub struct GlobalFunctionIndexMap {
    state: Mutex<IndexState>,
}

impl GlobalFunctionIndexMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> SyncResult<MutexGuard<'_, IndexState>> {
        self.state
            .lock()
            .map_err(|_| SyncError::LockPoisoned("function index"))
    }

    pub fn lookup_or_insert(&self, pid: ProgramId, name: &str) -> SyncResult<u64> {
        let mut state = self.lock()?;
        Ok(Self::assign(&mut state, pid, name))
    }

    fn assign(state: &mut IndexState, pid: ProgramId, name: &str) -> u64 {
        if let Some(idx) = state.indices.get(&(pid, name.to_string())) {
            return *idx;
        }
        let idx = state.next;
        state.next += 1;
        state.indices.insert((pid, name.to_string()), idx);
        debug!(pid, function = name, index = idx, "assigned global function index");
        idx
    }

    /// Translate a rank-local `{fid → name}` table into `{fid → global index}`
    /// under a single lock acquisition.
    pub fn translate(
        &self,
        pid: ProgramId,
        functions: &BTreeMap<FunctionId, String>,
    ) -> SyncResult<BTreeMap<FunctionId, u64>> {
        let mut state = self.lock()?;
        Ok(functions
            .iter()
            .map(|(fid, name)| (*fid, Self::assign(&mut state, pid, name)))
            .collect())
    }

    pub fn get(&self, pid: ProgramId, name: &str) -> SyncResult<Option<u64>> {
        Ok(self.lock()?.indices.get(&(pid, name.to_string())).copied())
    }

    pub fn len(&self) -> SyncResult<usize> {
        Ok(self.lock()?.indices.len())
    }

    pub fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.lock()?.indices.is_empty())
    }

    /// `program → name → index`, for persistence.
    pub fn snapshot(&self) -> SyncResult<BTreeMap<ProgramId, BTreeMap<String, u64>>> {
        let state = self.lock()?;
        let mut out: BTreeMap<ProgramId, BTreeMap<String, u64>> = BTreeMap::new();
        for ((pid, name), idx) in &state.indices {
            out.entry(*pid).or_default().insert(name.clone(), *idx);
        }
        Ok(out)
    }

    /// Replace the map with a persisted snapshot; new names continue after
    /// the largest restored index.
    pub fn restore(&self, snapshot: &BTreeMap<ProgramId, BTreeMap<String, u64>>) -> SyncResult<()> {
        let mut state = self.lock()?;
        state.indices.clear();
        state.next = 0;
        for (pid, names) in snapshot {
            for (name, idx) in names {
                state.indices.insert((*pid, name.clone()), *idx);
                state.next = state.next.max(idx + 1);
            }
        }
        Ok(())
    }

    pub fn clear(&self) -> SyncResult<()> {
        let mut state = self.lock()?;
        state.indices.clear();
        state.next = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_in_first_report_order() {
        let map = GlobalFunctionIndexMap::new();
        assert_eq!(map.lookup_or_insert(0, "main").unwrap(), 0);
        assert_eq!(map.lookup_or_insert(0, "solve").unwrap(), 1);
        assert_eq!(map.lookup_or_insert(0, "main").unwrap(), 0);
        // same name in another program is a different function
        assert_eq!(map.lookup_or_insert(1, "main").unwrap(), 2);
        assert_eq!(map.len().unwrap(), 3);
    }

    #[test]
    fn translate_local_table() {
        let map = GlobalFunctionIndexMap::new();
        map.lookup_or_insert(0, "b").unwrap();
        let local = BTreeMap::from([(7, "a".to_string()), (3, "b".to_string())]);
        let global = map.translate(0, &local).unwrap();
        assert_eq!(global[&3], 0);
        assert_eq!(global[&7], 1);
    }

    #[test]
    fn snapshot_restore_continues_numbering() {
        let map = GlobalFunctionIndexMap::new();
        map.lookup_or_insert(0, "x").unwrap();
        map.lookup_or_insert(2, "y").unwrap();
        let snap = map.snapshot().unwrap();

        let restored = GlobalFunctionIndexMap::new();
        restored.restore(&snap).unwrap();
        assert_eq!(restored.get(2, "y").unwrap(), Some(1));
        assert_eq!(restored.lookup_or_insert(0, "z").unwrap(), 2);
    }

    #[test]
    fn concurrent_registration_agrees() {
        use std::sync::Arc;

        let map = Arc::new(GlobalFunctionIndexMap::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let map = map.clone();
                std::thread::spawn(move || {
                    let foo = map.lookup_or_insert(0, "foo").unwrap();
                    let own = map.lookup_or_insert(0, &format!("f{i}")).unwrap();
                    (foo, own)
                })
            })
            .collect();
        let results: Vec<(u64, u64)> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let foo = results[0].0;
        assert!(results.iter().all(|(f, _)| *f == foo));
        let mut own: Vec<u64> = results.iter().map(|(_, o)| *o).collect();
        own.sort_unstable();
        own.dedup();
        assert_eq!(own.len(), 8);
        assert!(!own.contains(&foo));
        assert_eq!(map.len().unwrap(), 9);
    }
}
