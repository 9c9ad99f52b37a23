use serde::{Deserialize, Serialize};

/// Program index within a (possibly multi-program) workflow.
pub type ProgramId = u32;
/// MPI rank of the instrumented process.
pub type RankId = u32;
/// Thread index within a rank.
pub type ThreadId = u32;
/// Rank-local function index as assigned by the trace reader.
pub type FunctionId = u64;
/// Rank-local counter index as assigned by the trace reader.
pub type CounterId = u64;

/// Identifies one call stack: a single thread of a single rank of a program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadKey {
    pub pid: ProgramId,
    pub rid: RankId,
    pub tid: ThreadId,
}

impl ThreadKey {
    pub fn new(pid: ProgramId, rid: RankId, tid: ThreadId) -> Self {
        Self { pid, rid, tid }
    }
}

impl std::fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "p{}/r{}/t{}", self.pid, self.rid, self.tid)
    }
}

/// Stable identifier of a completed call.
///
/// `index` is a per-thread counter assigned when the entry event is seen,
/// so ids are unique for the lifetime of a run and survive step flushes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId {
    pub thread: ThreadKey,
    pub index: u64,
}

impl CallId {
    pub fn new(thread: ThreadKey, index: u64) -> Self {
        Self { thread, index }
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.thread, self.index)
    }
}
