//! Completed-call record.

use insitu_types::{CallId, CallLabel, CommKind, CounterId, FunctionId, RankId, ThreadKey};
use serde::{Deserialize, Serialize};

use crate::error::{TraceError, TraceResult};

/// A counter sample observed while a call was the innermost open frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CounterSample {
    pub counter_id: CounterId,
    pub name: String,
    pub value: u64,
    pub timestamp: u64,
}

/// A send/recv observed while a call was the innermost open frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommRecord {
    pub kind: CommKind,
    pub partner: RankId,
    pub tag: u32,
    pub bytes: u64,
    pub timestamp: u64,
}

/// A function invocation with both entry and exit observed.
///
/// Immutable after completion except for the classification, which is
/// assigned once. `parent` is known at completion; `children` were collected
/// while the call was open.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecData {
    pub id: CallId,
    pub fid: FunctionId,
    pub func_name: String,
    pub entry: u64,
    pub exit: u64,
    pub parent: Option<CallId>,
    pub children: Vec<CallId>,
    pub counters: Vec<CounterSample>,
    pub comms: Vec<CommRecord>,
    /// Runtime of this call minus the runtime of its direct children.
    exclusive: u64,
    label: CallLabel,
    score: f64,
    severity: f64,
}

impl ExecData {
    /// A standalone completed call with no relations attached.
    pub fn new(id: CallId, fid: FunctionId, func_name: impl Into<String>, entry: u64, exit: u64) -> Self {
        Self::complete(
            id,
            fid,
            func_name.into(),
            entry,
            exit.max(entry),
            None,
            Vec::new(),
            0,
            Vec::new(),
            Vec::new(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn complete(
        id: CallId,
        fid: FunctionId,
        func_name: String,
        entry: u64,
        exit: u64,
        parent: Option<CallId>,
        children: Vec<CallId>,
        child_runtime: u64,
        counters: Vec<CounterSample>,
        comms: Vec<CommRecord>,
    ) -> Self {
        let runtime = exit.saturating_sub(entry);
        Self {
            id,
            fid,
            func_name,
            entry,
            exit,
            parent,
            children,
            counters,
            comms,
            exclusive: runtime.saturating_sub(child_runtime),
            label: CallLabel::Unclassified,
            score: 0.0,
            severity: 0.0,
        }
    }

    pub fn thread(&self) -> ThreadKey {
        self.id.thread
    }

    /// Inclusive runtime `exit - entry`.
    pub fn runtime(&self) -> u64 {
        self.exit.saturating_sub(self.entry)
    }

    pub fn exclusive_runtime(&self) -> u64 {
        self.exclusive
    }

    pub fn label(&self) -> CallLabel {
        self.label
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn severity(&self) -> f64 {
        self.severity
    }

    pub fn is_outlier(&self) -> bool {
        self.label == CallLabel::Outlier
    }

    /// Assign the classification. Labels are terminal once assigned.
    pub fn set_label(&mut self, label: CallLabel, score: f64, severity: f64) -> TraceResult<()> {
        if !self.label.can_transition_to(label) {
            return Err(TraceError::LabelAlreadyAssigned {
                id: self.id,
                current: self.label,
            });
        }
        self.label = label;
        self.score = score;
        self.severity = severity;
        Ok(())
    }

    /// Overwrite the classification when replaying pruned provenance data.
    pub fn relabel_for_replay(&mut self, label: CallLabel, score: f64, severity: f64) {
        self.label = label;
        self.score = score;
        self.severity = severity;
    }
}
