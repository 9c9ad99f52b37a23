//! Property tests: well-nested entry/exit streams rebuild exactly one call
//! per pair with the nesting reproduced in parent/child links.

use std::collections::HashMap;

use insitu_trace::EventStore;
use insitu_types::{CallId, Event, ThreadKey};
use proptest::prelude::*;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Expected {
    fid: u64,
    entry: u64,
    exit: u64,
    parent: Option<u64>,
    children: Vec<u64>,
}

/// Turn (open?, fid, gap) steps into a properly nested event stream plus
/// the calls it should produce, keyed by entry order.
fn build(thread: ThreadKey, steps: &[(bool, u64, u64)]) -> (Vec<Event>, HashMap<u64, Expected>) {
    let mut events = Vec::new();
    let mut expected: HashMap<u64, Expected> = HashMap::new();
    let mut stack: Vec<u64> = Vec::new();
    let mut next = 0u64;
    let mut now = 0u64;

    let close = |stack: &mut Vec<u64>, now: u64, events: &mut Vec<Event>, expected: &mut HashMap<u64, Expected>| {
        if let Some(idx) = stack.pop() {
            let call = expected.get_mut(&idx).unwrap();
            call.exit = now;
            events.push(Event::exit(thread, call.fid, now));
        }
    };

    for &(open, fid, gap) in steps {
        now += gap;
        if open || stack.is_empty() {
            let parent = stack.last().copied();
            if let Some(p) = parent {
                expected.get_mut(&p).unwrap().children.push(next);
            }
            expected.insert(
                next,
                Expected {
                    fid,
                    entry: now,
                    exit: 0,
                    parent,
                    children: Vec::new(),
                },
            );
            events.push(Event::entry(thread, fid, now));
            stack.push(next);
            next += 1;
        } else {
            close(&mut stack, now, &mut events, &mut expected);
        }
    }
    while !stack.is_empty() {
        now += 1;
        close(&mut stack, now, &mut events, &mut expected);
    }
    (events, expected)
}

fn arb_steps() -> impl Strategy<Value = Vec<(bool, u64, u64)>> {
    proptest::collection::vec((any::<bool>(), 1u64..6, 0u64..50), 1..120)
}

// ---------------------------------------------------------------------------
// Property Tests
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn one_call_per_pair_with_correct_links(steps in arb_steps()) {
        let thread = ThreadKey::new(0, 1, 0);
        let (events, expected) = build(thread, &steps);

        let mut store = EventStore::new();
        for e in &events {
            store.add_event(e).unwrap();
        }

        prop_assert_eq!(store.completed_len(), expected.len());
        prop_assert_eq!(store.open_depth(&thread), 0);

        for (idx, exp) in &expected {
            let call = store.get_call(&CallId::new(thread, *idx)).unwrap();
            prop_assert_eq!(call.fid, exp.fid);
            prop_assert_eq!(call.entry, exp.entry);
            prop_assert_eq!(call.runtime(), exp.exit - exp.entry);
            prop_assert_eq!(call.parent.map(|p| p.index), exp.parent);
            let children: Vec<u64> = call.children.iter().map(|c| c.index).collect();
            prop_assert_eq!(&children, &exp.children);
            prop_assert!(call.exclusive_runtime() <= call.runtime());
        }
    }

    #[test]
    fn flushing_mid_stream_loses_nothing(steps in arb_steps(), cut in any::<prop::sample::Index>()) {
        let thread = ThreadKey::new(0, 0, 3);
        let (events, expected) = build(thread, &steps);
        let cut = cut.index(events.len());

        let mut store = EventStore::new();
        for e in &events[..cut] {
            store.add_event(e).unwrap();
        }
        let first = store.flush();
        for e in &events[cut..] {
            store.add_event(e).unwrap();
        }
        let second = store.flush();

        prop_assert_eq!(first.len() + second.len(), expected.len());
        for (idx, exp) in &expected {
            let id = CallId::new(thread, *idx);
            let call = first.get(&id).or_else(|| second.get(&id)).unwrap();
            prop_assert_eq!(call.entry, exp.entry);
            prop_assert_eq!(call.exit, exp.exit);
        }
    }
}
