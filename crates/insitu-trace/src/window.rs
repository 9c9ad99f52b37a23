//! Per-thread ordered index of completed calls by entry time.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use insitu_types::{CallId, ThreadKey};

/// `(entry, index)` keys make calls entered at the same timestamp distinct
/// and keep them in entry order.
#[derive(Clone, Debug, Default)]
pub(crate) struct EntryIndex {
    by_thread: HashMap<ThreadKey, BTreeMap<(u64, u64), CallId>>,
}

impl EntryIndex {
    pub(crate) fn insert(&mut self, id: CallId, entry: u64) {
        self.by_thread
            .entry(id.thread)
            .or_default()
            .insert((entry, id.index), id);
    }

    /// Ids with entry time in `[t_start, t_end]`.
    pub(crate) fn range(&self, thread: &ThreadKey, t_start: u64, t_end: u64) -> Vec<CallId> {
        if t_start > t_end {
            return Vec::new();
        }
        self.by_thread
            .get(thread)
            .map(|calls| {
                calls
                    .range((t_start, 0)..=(t_end, u64::MAX))
                    .map(|(_, id)| *id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Up to `n` ids before and after `id`, with `id` itself in the middle.
    pub(crate) fn around(&self, id: &CallId, entry: u64, n: usize) -> Vec<CallId> {
        let Some(calls) = self.by_thread.get(&id.thread) else {
            return Vec::new();
        };
        let key = (entry, id.index);

        let mut window: Vec<CallId> = calls
            .range(..key)
            .rev()
            .take(n)
            .map(|(_, cid)| *cid)
            .collect();
        window.reverse();
        window.push(*id);
        window.extend(
            calls
                .range((Bound::Excluded(key), Bound::Unbounded))
                .take(n)
                .map(|(_, cid)| *cid),
        );
        window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_entry_time_keeps_index_order() {
        let thread = ThreadKey::new(0, 0, 0);
        let mut index = EntryIndex::default();
        index.insert(CallId::new(thread, 2), 10);
        index.insert(CallId::new(thread, 1), 10);
        index.insert(CallId::new(thread, 0), 5);

        let ids: Vec<u64> = index.range(&thread, 0, 10).iter().map(|c| c.index).collect();
        assert_eq!(ids, vec![0, 1, 2]);

        let around = index.around(&CallId::new(thread, 1), 10, 1);
        let ids: Vec<u64> = around.iter().map(|c| c.index).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }
}
