//! Per-thread call-stack reconstruction.
//!
//! Entry events open frames, exit events close the top frame and move the
//! finished call into the arena. Counter and communication events attach
//! to the innermost open frame. Open stacks survive [`EventStore::flush`],
//! so calls spanning several analysis steps complete with their original
//! entry time.

use std::collections::{BTreeMap, HashMap};

use insitu_types::{CallId, CounterId, Event, EventData, FunctionId, ThreadKey};
use tracing::debug;

use crate::call::{CommRecord, CounterSample, ExecData};
use crate::error::{TraceError, TraceResult};
use crate::window::EntryIndex;
use crate::UNKNOWN_NAME;

/// What an accepted event did to the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// An entry opened a new frame.
    Opened(CallId),
    /// An exit completed a call.
    Completed(CallId),
    /// A counter or comm event was attached to an open frame.
    Attached(CallId),
}

/// A call that has been entered but not yet exited.
#[derive(Debug)]
struct OpenFrame {
    id: CallId,
    fid: FunctionId,
    entry: u64,
    parent: Option<CallId>,
    children: Vec<CallId>,
    child_runtime: u64,
    counters: Vec<CounterSample>,
    comms: Vec<CommRecord>,
}

#[derive(Debug, Default)]
struct ThreadState {
    stack: Vec<OpenFrame>,
    next_index: u64,
    last_timestamp: Option<u64>,
}

/// Reconstructs completed calls from the event stream of one rank.
#[derive(Debug, Default)]
pub struct EventStore {
    threads: HashMap<ThreadKey, ThreadState>,
    completed: Vec<ExecData>,
    index: HashMap<CallId, usize>,
    window: EntryIndex,
    func_names: HashMap<FunctionId, String>,
    counter_names: HashMap<CounterId, String>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_function(&mut self, fid: FunctionId, name: impl Into<String>) {
        self.func_names.insert(fid, name.into());
    }

    pub fn register_counter(&mut self, counter_id: CounterId, name: impl Into<String>) {
        self.counter_names.insert(counter_id, name.into());
    }

    pub fn function_name(&self, fid: FunctionId) -> &str {
        self.func_names
            .get(&fid)
            .map(String::as_str)
            .unwrap_or(UNKNOWN_NAME)
    }

    pub fn function_names(&self) -> &HashMap<FunctionId, String> {
        &self.func_names
    }

    pub fn counter_name(&self, counter_id: CounterId) -> &str {
        self.counter_names
            .get(&counter_id)
            .map(String::as_str)
            .unwrap_or(UNKNOWN_NAME)
    }

    /// Feed one event. On error the event is dropped and nothing changes.
    pub fn add_event(&mut self, event: &Event) -> TraceResult<AddOutcome> {
        let thread = event.thread;
        if !self.threads.contains_key(&thread) {
            if let Some(e) = unopened_thread_error(event) {
                return Err(e);
            }
        }
        let state = self.threads.entry(thread).or_default();

        if let Some(last) = state.last_timestamp {
            if event.timestamp < last {
                return Err(TraceError::TimestampRegression {
                    thread,
                    timestamp: event.timestamp,
                    last,
                });
            }
        }

        let outcome = match &event.data {
            EventData::Entry { fid } => {
                let id = CallId::new(thread, state.next_index);
                state.next_index += 1;
                let parent = state.stack.last().map(|f| f.id);
                state.stack.push(OpenFrame {
                    id,
                    fid: *fid,
                    entry: event.timestamp,
                    parent,
                    children: Vec::new(),
                    child_runtime: 0,
                    counters: Vec::new(),
                    comms: Vec::new(),
                });
                AddOutcome::Opened(id)
            }
            EventData::Exit { fid } => {
                let top = state
                    .stack
                    .last()
                    .ok_or(TraceError::EmptyCallStack { thread, fid: *fid })?;
                if top.fid != *fid {
                    return Err(TraceError::CallStackViolation {
                        thread,
                        expected: top.fid,
                        found: *fid,
                    });
                }
                let frame = match state.stack.pop() {
                    Some(frame) => frame,
                    None => return Err(TraceError::EmptyCallStack { thread, fid: *fid }),
                };
                let runtime = event.timestamp.saturating_sub(frame.entry);
                if let Some(parent) = state.stack.last_mut() {
                    parent.children.push(frame.id);
                    parent.child_runtime += runtime;
                }

                let id = frame.id;
                let name = self
                    .func_names
                    .get(&frame.fid)
                    .cloned()
                    .unwrap_or_else(|| UNKNOWN_NAME.to_string());
                let call = ExecData::complete(
                    id,
                    frame.fid,
                    name,
                    frame.entry,
                    event.timestamp,
                    frame.parent,
                    frame.children,
                    frame.child_runtime,
                    frame.counters,
                    frame.comms,
                );
                self.window.insert(id, call.entry);
                self.index.insert(id, self.completed.len());
                self.completed.push(call);
                AddOutcome::Completed(id)
            }
            EventData::Comm {
                kind,
                partner,
                tag,
                bytes,
            } => {
                let frame = state.stack.last_mut().ok_or(TraceError::NoOpenCall {
                    thread,
                    what: "communication event",
                    timestamp: event.timestamp,
                })?;
                frame.comms.push(CommRecord {
                    kind: *kind,
                    partner: *partner,
                    tag: *tag,
                    bytes: *bytes,
                    timestamp: event.timestamp,
                });
                AddOutcome::Attached(frame.id)
            }
            EventData::Counter { counter_id, value } => {
                let frame = state.stack.last_mut().ok_or(TraceError::NoOpenCall {
                    thread,
                    what: "counter",
                    timestamp: event.timestamp,
                })?;
                let name = self
                    .counter_names
                    .get(counter_id)
                    .cloned()
                    .unwrap_or_else(|| UNKNOWN_NAME.to_string());
                frame.counters.push(CounterSample {
                    counter_id: *counter_id,
                    name,
                    value: *value,
                    timestamp: event.timestamp,
                });
                AddOutcome::Attached(frame.id)
            }
        };

        state.last_timestamp = Some(event.timestamp);
        Ok(outcome)
    }

    /// Look up a completed call of the current step.
    pub fn get_call(&self, id: &CallId) -> Option<&ExecData> {
        self.index.get(id).map(|&i| &self.completed[i])
    }

    /// Completed calls of `thread` whose entry time lies in
    /// `[t_start, t_end]`, ordered by entry time.
    pub fn calls_in_window(&self, thread: &ThreadKey, t_start: u64, t_end: u64) -> Vec<&ExecData> {
        self.window
            .range(thread, t_start, t_end)
            .iter()
            .filter_map(|id| self.get_call(id))
            .collect()
    }

    /// The call `id` plus up to `n` completed calls before and after it on
    /// the same thread, ordered by entry time.
    pub fn calls_around(&self, id: &CallId, n: usize) -> TraceResult<Vec<&ExecData>> {
        let call = self.get_call(id).ok_or(TraceError::UnknownCall(*id))?;
        Ok(self
            .window
            .around(id, call.entry, n)
            .iter()
            .filter_map(|cid| self.get_call(cid))
            .collect())
    }

    /// Detach every completed call of the current step. Open stacks persist.
    pub fn flush(&mut self) -> CallBatch {
        let calls = std::mem::take(&mut self.completed);
        let window = std::mem::take(&mut self.window);
        self.index.clear();
        debug!(
            completed = calls.len(),
            open = self.open_calls(),
            "event store flushed"
        );
        CallBatch::build(calls, window)
    }

    /// Depth of the open stack of `thread`.
    pub fn open_depth(&self, thread: &ThreadKey) -> usize {
        self.threads.get(thread).map(|s| s.stack.len()).unwrap_or(0)
    }

    /// Total open frames across all threads.
    pub fn open_calls(&self) -> usize {
        self.threads.values().map(|s| s.stack.len()).sum()
    }

    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }
}

// ── Flushed batch ───────────────────────────────────────────────────────

/// The completed calls of one step, grouped per function in completion
/// order.
#[derive(Clone, Debug, Default)]
pub struct CallBatch {
    by_function: BTreeMap<FunctionId, Vec<ExecData>>,
    index: HashMap<CallId, (FunctionId, usize)>,
    window: EntryIndex,
}

impl CallBatch {
    pub fn from_calls(calls: Vec<ExecData>) -> Self {
        let mut window = EntryIndex::default();
        for call in &calls {
            window.insert(call.id, call.entry);
        }
        Self::build(calls, window)
    }

    fn build(calls: Vec<ExecData>, window: EntryIndex) -> Self {
        let mut batch = CallBatch {
            window,
            ..Default::default()
        };
        for call in calls {
            let group = batch.by_function.entry(call.fid).or_default();
            batch.index.insert(call.id, (call.fid, group.len()));
            group.push(call);
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn function_ids(&self) -> Vec<FunctionId> {
        self.by_function.keys().copied().collect()
    }

    pub fn get(&self, id: &CallId) -> Option<&ExecData> {
        let (fid, i) = self.index.get(id)?;
        self.by_function.get(fid).map(|calls| &calls[*i])
    }

    pub fn calls(&self, fid: FunctionId) -> &[ExecData] {
        self.by_function
            .get(&fid)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Same as [`EventStore::calls_around`], restricted to this batch.
    pub fn calls_around(&self, id: &CallId, n: usize) -> TraceResult<Vec<&ExecData>> {
        let call = self.get(id).ok_or(TraceError::UnknownCall(*id))?;
        Ok(self
            .window
            .around(id, call.entry, n)
            .iter()
            .filter_map(|cid| self.get(cid))
            .collect())
    }

    pub fn calls_mut(&mut self, fid: FunctionId) -> Option<&mut [ExecData]> {
        self.by_function.get_mut(&fid).map(Vec::as_mut_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExecData> {
        self.by_function.values().flatten()
    }

    pub fn into_calls(self) -> Vec<ExecData> {
        self.by_function.into_values().flatten().collect()
    }
}

/// Error for any event other than an entry on a thread with no history.
fn unopened_thread_error(event: &Event) -> Option<TraceError> {
    let thread = event.thread;
    match &event.data {
        EventData::Entry { .. } => None,
        EventData::Exit { fid } => Some(TraceError::EmptyCallStack { thread, fid: *fid }),
        EventData::Comm { .. } => Some(TraceError::NoOpenCall {
            thread,
            what: "communication event",
            timestamp: event.timestamp,
        }),
        EventData::Counter { .. } => Some(TraceError::NoOpenCall {
            thread,
            what: "counter",
            timestamp: event.timestamp,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use insitu_types::CallLabel;

    fn t0() -> ThreadKey {
        ThreadKey::new(0, 0, 0)
    }

    fn feed(store: &mut EventStore, events: &[Event]) {
        for e in events {
            store.add_event(e).unwrap();
        }
    }

    #[test]
    fn nested_calls_are_linked() {
        let mut store = EventStore::new();
        store.register_function(1, "main");
        store.register_function(2, "solve");
        store.register_function(3, "mpi_wait");

        feed(
            &mut store,
            &[
                Event::entry(t0(), 1, 0),
                Event::entry(t0(), 2, 10),
                Event::entry(t0(), 3, 12),
                Event::exit(t0(), 3, 20),
                Event::exit(t0(), 2, 30),
                Event::entry(t0(), 2, 40),
                Event::exit(t0(), 2, 45),
                Event::exit(t0(), 1, 100),
            ],
        );

        assert_eq!(store.completed_len(), 4);
        assert_eq!(store.open_depth(&t0()), 0);

        let main_id = CallId::new(t0(), 0);
        let solve_a = CallId::new(t0(), 1);
        let wait = CallId::new(t0(), 2);
        let solve_b = CallId::new(t0(), 3);

        let main = store.get_call(&main_id).unwrap();
        assert_eq!(main.func_name, "main");
        assert_eq!(main.runtime(), 100);
        assert_eq!(main.children, vec![solve_a, solve_b]);
        assert_eq!(main.parent, None);
        assert_eq!(main.exclusive_runtime(), 100 - 20 - 5);

        let a = store.get_call(&solve_a).unwrap();
        assert_eq!(a.parent, Some(main_id));
        assert_eq!(a.children, vec![wait]);
        assert_eq!(a.runtime(), 20);

        let w = store.get_call(&wait).unwrap();
        assert_eq!(w.parent, Some(solve_a));
        assert!(w.children.is_empty());
        assert_eq!(w.label(), CallLabel::Unclassified);
    }

    #[test]
    fn mismatched_exit_is_a_violation() {
        let mut store = EventStore::new();
        feed(&mut store, &[Event::entry(t0(), 1, 0), Event::entry(t0(), 2, 1)]);

        let err = store.add_event(&Event::exit(t0(), 1, 5)).unwrap_err();
        assert_eq!(
            err,
            TraceError::CallStackViolation {
                thread: t0(),
                expected: 2,
                found: 1
            }
        );
        // dropped: stack unchanged
        assert_eq!(store.open_depth(&t0()), 2);
        assert_eq!(store.completed_len(), 0);
    }

    #[test]
    fn exit_on_empty_stack() {
        let mut store = EventStore::new();
        let err = store.add_event(&Event::exit(t0(), 4, 5)).unwrap_err();
        assert_eq!(err, TraceError::EmptyCallStack { thread: t0(), fid: 4 });
    }

    #[test]
    fn rejected_events_do_not_register_a_thread() {
        let mut store = EventStore::new();
        let other = ThreadKey::new(0, 0, 1);
        assert!(store.add_event(&Event::exit(other, 4, 5)).is_err());
        assert!(store.add_event(&Event::counter(other, 7, 100, 6)).is_err());
        assert_eq!(store.thread_count(), 0);

        feed(&mut store, &[Event::entry(t0(), 1, 0)]);
        assert!(store.add_event(&Event::exit(other, 1, 5)).is_err());
        assert_eq!(store.thread_count(), 1);
    }

    #[test]
    fn counters_and_comms_attach_to_innermost_frame() {
        let mut store = EventStore::new();
        store.register_counter(7, "PAPI_TOT_CYC");
        feed(
            &mut store,
            &[
                Event::entry(t0(), 1, 0),
                Event::entry(t0(), 2, 5),
                Event::counter(t0(), 7, 1234, 6),
                Event::send(t0(), 3, 11, 4096, 7),
                Event::exit(t0(), 2, 9),
                Event::recv(t0(), 3, 11, 4096, 10),
                Event::exit(t0(), 1, 12),
            ],
        );

        let inner = store.get_call(&CallId::new(t0(), 1)).unwrap();
        assert_eq!(inner.counters.len(), 1);
        assert_eq!(inner.counters[0].name, "PAPI_TOT_CYC");
        assert_eq!(inner.counters[0].value, 1234);
        assert_eq!(inner.comms.len(), 1);
        assert_eq!(inner.comms[0].partner, 3);

        let outer = store.get_call(&CallId::new(t0(), 0)).unwrap();
        assert!(outer.counters.is_empty());
        assert_eq!(outer.comms.len(), 1);
    }

    #[test]
    fn counter_without_open_call_fails() {
        let mut store = EventStore::new();
        let err = store.add_event(&Event::counter(t0(), 1, 5, 0)).unwrap_err();
        assert!(matches!(err, TraceError::NoOpenCall { .. }));
    }

    #[test]
    fn timestamp_regression_is_rejected() {
        let mut store = EventStore::new();
        feed(&mut store, &[Event::entry(t0(), 1, 50)]);
        let err = store.add_event(&Event::exit(t0(), 1, 40)).unwrap_err();
        assert!(matches!(err, TraceError::TimestampRegression { .. }));
        assert_eq!(store.open_depth(&t0()), 1);
    }

    #[test]
    fn threads_are_independent() {
        let mut store = EventStore::new();
        let t1 = ThreadKey::new(0, 0, 1);
        feed(
            &mut store,
            &[
                Event::entry(t0(), 1, 0),
                Event::entry(t1, 1, 1),
                Event::exit(t0(), 1, 3),
                Event::exit(t1, 1, 9),
            ],
        );
        assert_eq!(store.thread_count(), 2);
        assert_eq!(store.get_call(&CallId::new(t1, 0)).unwrap().runtime(), 8);
    }

    #[test]
    fn window_query_is_inclusive() {
        let mut store = EventStore::new();
        for i in 0..10u64 {
            feed(
                &mut store,
                &[Event::entry(t0(), 1, i * 10), Event::exit(t0(), 1, i * 10 + 5)],
            );
        }
        let hits = store.calls_in_window(&t0(), 20, 50);
        let entries: Vec<u64> = hits.iter().map(|c| c.entry).collect();
        assert_eq!(entries, vec![20, 30, 40, 50]);
        assert!(store.calls_in_window(&t0(), 51, 59).is_empty());
        assert!(store.calls_in_window(&t0(), 50, 20).is_empty());
        assert!(store
            .calls_in_window(&ThreadKey::new(9, 9, 9), 0, 100)
            .is_empty());
    }

    #[test]
    fn calls_around_an_anomaly() {
        let mut store = EventStore::new();
        for i in 0..10u64 {
            feed(
                &mut store,
                &[Event::entry(t0(), 1, i * 10), Event::exit(t0(), 1, i * 10 + 5)],
            );
        }
        let center = CallId::new(t0(), 5);
        let window = store.calls_around(&center, 2).unwrap();
        let idx: Vec<u64> = window.iter().map(|c| c.id.index).collect();
        assert_eq!(idx, vec![3, 4, 5, 6, 7]);

        let edge = store.calls_around(&CallId::new(t0(), 0), 3).unwrap();
        assert_eq!(edge.len(), 4);

        assert!(store.calls_around(&CallId::new(t0(), 99), 1).is_err());
    }

    #[test]
    fn flush_keeps_open_stacks() {
        let mut store = EventStore::new();
        feed(
            &mut store,
            &[
                Event::entry(t0(), 1, 0),
                Event::entry(t0(), 2, 5),
                Event::exit(t0(), 2, 8),
            ],
        );
        let batch = store.flush();
        assert_eq!(batch.len(), 1);
        assert_eq!(store.completed_len(), 0);
        assert_eq!(store.open_depth(&t0()), 1);

        // the outer call finishes in the next step with its original entry
        feed(&mut store, &[Event::exit(t0(), 1, 30)]);
        let batch = store.flush();
        let outer = batch.get(&CallId::new(t0(), 0)).unwrap();
        assert_eq!(outer.entry, 0);
        assert_eq!(outer.runtime(), 30);
        assert_eq!(outer.children, vec![CallId::new(t0(), 1)]);
    }

    #[test]
    fn batch_groups_per_function_in_completion_order() {
        let mut store = EventStore::new();
        feed(
            &mut store,
            &[
                Event::entry(t0(), 2, 0),
                Event::exit(t0(), 2, 1),
                Event::entry(t0(), 1, 2),
                Event::exit(t0(), 1, 3),
                Event::entry(t0(), 2, 4),
                Event::exit(t0(), 2, 9),
            ],
        );
        let mut batch = store.flush();
        assert_eq!(batch.function_ids(), vec![1, 2]);
        let runtimes: Vec<u64> = batch.calls(2).iter().map(|c| c.runtime()).collect();
        assert_eq!(runtimes, vec![1, 5]);
        assert!(batch.calls(42).is_empty());

        let calls = batch.calls_mut(1).unwrap();
        calls[0].set_label(CallLabel::Normal, 0.0, 0.0).unwrap();
        assert_eq!(batch.calls(1)[0].label(), CallLabel::Normal);

        let around = batch.calls_around(&CallId::new(t0(), 1), 1).unwrap();
        let idx: Vec<u64> = around.iter().map(|c| c.id.index).collect();
        assert_eq!(idx, vec![0, 1, 2]);
        assert_eq!(batch.into_calls().len(), 3);
    }
}
