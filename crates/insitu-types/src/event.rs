//! Instrumentation events as delivered by the trace reader.
//!
//! Events are immutable once produced. Timestamps are non-decreasing per
//! thread; nothing is assumed about ordering across threads.

use serde::{Deserialize, Serialize};

use crate::ids::{CounterId, FunctionId, RankId, ThreadKey};

/// Coarse classification of an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Entry,
    Exit,
    Send,
    Recv,
    Counter,
}

/// Direction of a communication event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommKind {
    Send,
    Recv,
}

/// Kind-specific payload of an event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventData {
    Entry {
        fid: FunctionId,
    },
    Exit {
        fid: FunctionId,
    },
    Comm {
        kind: CommKind,
        partner: RankId,
        tag: u32,
        bytes: u64,
    },
    Counter {
        counter_id: CounterId,
        value: u64,
    },
}

/// A single instrumentation record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub thread: ThreadKey,
    pub timestamp: u64,
    pub data: EventData,
}

impl Event {
    pub fn entry(thread: ThreadKey, fid: FunctionId, timestamp: u64) -> Self {
        Self {
            thread,
            timestamp,
            data: EventData::Entry { fid },
        }
    }

    pub fn exit(thread: ThreadKey, fid: FunctionId, timestamp: u64) -> Self {
        Self {
            thread,
            timestamp,
            data: EventData::Exit { fid },
        }
    }

    pub fn send(thread: ThreadKey, partner: RankId, tag: u32, bytes: u64, timestamp: u64) -> Self {
        Self {
            thread,
            timestamp,
            data: EventData::Comm {
                kind: CommKind::Send,
                partner,
                tag,
                bytes,
            },
        }
    }

    pub fn recv(thread: ThreadKey, partner: RankId, tag: u32, bytes: u64, timestamp: u64) -> Self {
        Self {
            thread,
            timestamp,
            data: EventData::Comm {
                kind: CommKind::Recv,
                partner,
                tag,
                bytes,
            },
        }
    }

    pub fn counter(thread: ThreadKey, counter_id: CounterId, value: u64, timestamp: u64) -> Self {
        Self {
            thread,
            timestamp,
            data: EventData::Counter { counter_id, value },
        }
    }

    pub fn kind(&self) -> EventKind {
        match &self.data {
            EventData::Entry { .. } => EventKind::Entry,
            EventData::Exit { .. } => EventKind::Exit,
            EventData::Comm {
                kind: CommKind::Send,
                ..
            } => EventKind::Send,
            EventData::Comm {
                kind: CommKind::Recv,
                ..
            } => EventKind::Recv,
            EventData::Counter { .. } => EventKind::Counter,
        }
    }

    /// Function id for entry/exit events.
    pub fn function_id(&self) -> Option<FunctionId> {
        match &self.data {
            EventData::Entry { fid } | EventData::Exit { fid } => Some(*fid),
            _ => None,
        }
    }
}
