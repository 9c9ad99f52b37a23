//! Event sources: where a rank's trace comes from.
//!
//! A source is polled one step at a time:
//!
//! ```text
//!   begin_step() ── Ready(step) ──► events() ──► end_step()
//!        │
//!        ├── NotReady     (nothing yet; poll again later)
//!        └── EndOfStream  (no more steps)
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;

use async_trait::async_trait;
use insitu_types::{CounterId, Event, FunctionId};
use serde::Deserialize;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, warn};

use crate::error::DriverResult;

/// Result of polling a source for the next step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceStatus {
    Ready(u64),
    NotReady,
    EndOfStream,
}

/// A step-wise producer of trace events.
#[async_trait]
pub trait EventSource: Send {
    /// Poll for the next step.
    async fn begin_step(&mut self) -> DriverResult<SourceStatus>;

    /// Events of the step opened by the last `Ready`.
    async fn events(&mut self) -> DriverResult<Vec<Event>>;

    /// Release the current step.
    async fn end_step(&mut self) -> DriverResult<()>;

    /// Function names known so far.
    fn function_names(&self) -> &BTreeMap<FunctionId, String>;

    /// Counter names known so far.
    fn counter_names(&self) -> &BTreeMap<CounterId, String>;

    /// Records the source could not decode and skipped.
    fn skipped(&self) -> u64 {
        0
    }
}

// ── In-memory source ────────────────────────────────────────────────────

/// Pre-built steps, numbered from zero. `None` entries poll as `NotReady`.
#[derive(Debug, Default)]
pub struct VecSource {
    steps: VecDeque<Option<Vec<Event>>>,
    current: Vec<Event>,
    next_step: u64,
    open_ended: bool,
    functions: BTreeMap<FunctionId, String>,
    counters: BTreeMap<CounterId, String>,
}

impl VecSource {
    pub fn new(steps: impl IntoIterator<Item = Vec<Event>>) -> Self {
        Self {
            steps: steps.into_iter().map(Some).collect(),
            ..Default::default()
        }
    }

    pub fn with_function(mut self, fid: FunctionId, name: impl Into<String>) -> Self {
        self.functions.insert(fid, name.into());
        self
    }

    pub fn with_counter(mut self, counter_id: CounterId, name: impl Into<String>) -> Self {
        self.counters.insert(counter_id, name.into());
        self
    }

    pub fn push_step(&mut self, events: Vec<Event>) {
        self.steps.push_back(Some(events));
    }

    pub fn push_not_ready(&mut self) {
        self.steps.push_back(None);
    }

    /// Once exhausted, poll as `NotReady` instead of `EndOfStream`.
    pub fn open_ended(mut self) -> Self {
        self.open_ended = true;
        self
    }
}

#[async_trait]
impl EventSource for VecSource {
    async fn begin_step(&mut self) -> DriverResult<SourceStatus> {
        Ok(match self.steps.pop_front() {
            Some(Some(events)) => {
                self.current = events;
                let step = self.next_step;
                self.next_step += 1;
                SourceStatus::Ready(step)
            }
            Some(None) => SourceStatus::NotReady,
            None if self.open_ended => SourceStatus::NotReady,
            None => SourceStatus::EndOfStream,
        })
    }

    async fn events(&mut self) -> DriverResult<Vec<Event>> {
        Ok(std::mem::take(&mut self.current))
    }

    async fn end_step(&mut self) -> DriverResult<()> {
        self.current.clear();
        Ok(())
    }

    fn function_names(&self) -> &BTreeMap<FunctionId, String> {
        &self.functions
    }

    fn counter_names(&self) -> &BTreeMap<CounterId, String> {
        &self.counters
    }
}

// ── JSON-lines source ───────────────────────────────────────────────────

/// One line of a JSON-lines trace.
///
/// ```text
/// {"fid": 3, "name": "solve"}                 function name
/// {"counter_id": 1, "name": "PAPI_TOT_CYC"}   counter name
/// {"step": 0}                                 start of step 0
/// {"thread": {...}, "timestamp": 10, "data": {"type": "entry", "fid": 3}}
/// {"end": true}                               end of stream
/// ```
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TraceLine {
    Step { step: u64 },
    End { end: bool },
    Function { fid: FunctionId, name: String },
    Counter { counter_id: CounterId, name: String },
    Event(Event),
}

enum Record {
    Step(u64),
    Event(Event),
    End,
}

/// Reads steps from a JSON-lines trace.
///
/// Events before the first `{"step": n}` marker form an implicit step. A
/// step is complete when the next marker, an `{"end": true}` line or the
/// end of input is reached. In follow mode the end of input means "not
/// ready yet" and only an end line finishes the stream; a trailing line
/// without its newline is held back until the rest of it arrives.
pub struct JsonLinesSource<R> {
    reader: BufReader<R>,
    partial: String,
    follow: bool,
    building: Option<u64>,
    buffer: Vec<Event>,
    current: Vec<Event>,
    implicit_next: u64,
    ended: bool,
    line_no: u64,
    skipped: u64,
    functions: BTreeMap<FunctionId, String>,
    counters: BTreeMap<CounterId, String>,
}

impl JsonLinesSource<File> {
    pub async fn open(path: &Path) -> DriverResult<Self> {
        let file = File::open(path).await?;
        debug!(path = %path.display(), "trace opened");
        Ok(Self::from_reader(file))
    }
}

impl<R: AsyncRead + Unpin + Send> JsonLinesSource<R> {
    pub fn from_reader(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            partial: String::new(),
            follow: false,
            building: None,
            buffer: Vec::new(),
            current: Vec::new(),
            implicit_next: 0,
            ended: false,
            line_no: 0,
            skipped: 0,
            functions: BTreeMap::new(),
            counters: BTreeMap::new(),
        }
    }

    /// Treat end of input as "not ready" until an end line arrives.
    pub fn following(mut self, follow: bool) -> Self {
        self.follow = follow;
        self
    }

    fn complete(&mut self, step: u64) -> SourceStatus {
        self.current = std::mem::take(&mut self.buffer);
        self.implicit_next = step + 1;
        SourceStatus::Ready(step)
    }

    fn finish(&mut self) -> SourceStatus {
        self.ended = true;
        match self.building.take() {
            Some(step) => self.complete(step),
            None => SourceStatus::EndOfStream,
        }
    }

    /// Next complete line, or `None` when input is exhausted for now.
    async fn next_line(&mut self) -> DriverResult<Option<String>> {
        self.reader.read_line(&mut self.partial).await?;
        if self.partial.ends_with('\n') {
            return Ok(Some(std::mem::take(&mut self.partial)));
        }
        if self.partial.is_empty() {
            return Ok(None);
        }
        // unterminated line at end of input: final unless more can follow
        if !self.follow || is_end_line(&self.partial) {
            return Ok(Some(std::mem::take(&mut self.partial)));
        }
        Ok(None)
    }

    /// Next step marker, event or end line. Name registrations are applied
    /// on the way; unreadable lines are skipped.
    async fn read_record(&mut self) -> DriverResult<Option<Record>> {
        loop {
            let Some(line) = self.next_line().await? else {
                return Ok(None);
            };
            self.line_no += 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<TraceLine>(line) {
                Ok(TraceLine::Step { step }) => return Ok(Some(Record::Step(step))),
                Ok(TraceLine::End { end: true }) => return Ok(Some(Record::End)),
                Ok(TraceLine::End { end: false }) => {}
                Ok(TraceLine::Function { fid, name }) => {
                    self.functions.insert(fid, name);
                }
                Ok(TraceLine::Counter { counter_id, name }) => {
                    self.counters.insert(counter_id, name);
                }
                Ok(TraceLine::Event(event)) => return Ok(Some(Record::Event(event))),
                Err(e) => {
                    self.skipped += 1;
                    warn!(line = self.line_no, error = %e, "unreadable trace line skipped");
                }
            }
        }
    }
}

/// An end line written without its trailing newline.
fn is_end_line(line: &str) -> bool {
    matches!(
        serde_json::from_str::<TraceLine>(line.trim()),
        Ok(TraceLine::End { end: true })
    )
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> EventSource for JsonLinesSource<R> {
    async fn begin_step(&mut self) -> DriverResult<SourceStatus> {
        if self.ended {
            return Ok(self.finish());
        }
        loop {
            match self.read_record().await? {
                Some(Record::Step(next)) => {
                    if let Some(done) = self.building.replace(next) {
                        return Ok(self.complete(done));
                    }
                }
                Some(Record::Event(event)) => {
                    if self.building.is_none() {
                        self.building = Some(self.implicit_next);
                    }
                    self.buffer.push(event);
                }
                Some(Record::End) => return Ok(self.finish()),
                None if self.follow => return Ok(SourceStatus::NotReady),
                None => return Ok(self.finish()),
            }
        }
    }

    async fn events(&mut self) -> DriverResult<Vec<Event>> {
        Ok(std::mem::take(&mut self.current))
    }

    async fn end_step(&mut self) -> DriverResult<()> {
        self.current.clear();
        Ok(())
    }

    fn function_names(&self) -> &BTreeMap<FunctionId, String> {
        &self.functions
    }

    fn counter_names(&self) -> &BTreeMap<CounterId, String> {
        &self.counters
    }

    fn skipped(&self) -> u64 {
        self.skipped
    }
}
