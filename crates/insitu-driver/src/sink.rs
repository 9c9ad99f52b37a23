//! Provenance sinks and the background writer that feeds them.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use insitu_detect::ProvenanceRecord;
use insitu_sync::WorkQueue;
use tracing::{debug, warn};

use crate::error::{DriverError, DriverResult};

/// Destination for provenance records.
///
/// Sinks are driven from a writer thread, never from the async runtime, so
/// blocking I/O is fine here.
pub trait ProvenanceSink: Send {
    fn write(&mut self, records: &[ProvenanceRecord]) -> DriverResult<()>;

    fn flush(&mut self) -> DriverResult<()> {
        Ok(())
    }
}

/// Appends one JSON document per line.
pub struct JsonLinesSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonLinesSink {
    pub fn create(path: &Path) -> DriverResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        debug!(path = %path.display(), "provenance sink opened");
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ProvenanceSink for JsonLinesSink {
    fn write(&mut self, records: &[ProvenanceRecord]) -> DriverResult<()> {
        for record in records {
            serde_json::to_writer(&mut self.writer, record)?;
            self.writer.write_all(b"\n")?;
        }
        Ok(())
    }

    fn flush(&mut self) -> DriverResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps records in memory. Clones share the same buffer.
#[derive(Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<ProvenanceRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ProvenanceRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ProvenanceSink for MemorySink {
    fn write(&mut self, records: &[ProvenanceRecord]) -> DriverResult<()> {
        self.records
            .lock()
            .map_err(|_| DriverError::Sink("memory sink lock poisoned".into()))?
            .extend_from_slice(records);
        Ok(())
    }
}

/// Counts reported when a [`ProvenanceWriter`] closes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProvenanceStats {
    pub written: u64,
    pub failed: u64,
}

/// Hands record batches to a single background thread so the analysis
/// loop never blocks on the sink. Batches are written in submission order.
pub struct ProvenanceWriter {
    queue: WorkQueue,
    sink: Arc<Mutex<Box<dyn ProvenanceSink>>>,
    written: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl ProvenanceWriter {
    pub fn new(sink: impl ProvenanceSink + 'static, capacity: usize) -> DriverResult<Self> {
        let sink: Box<dyn ProvenanceSink> = Box::new(sink);
        Ok(Self {
            queue: WorkQueue::new("provenance", 1, capacity)?,
            sink: Arc::new(Mutex::new(sink)),
            written: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Queue a batch. Waits only when the queue is full.
    pub async fn submit(&self, records: Vec<ProvenanceRecord>) -> DriverResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let sink = self.sink.clone();
        let written = self.written.clone();
        let failed = self.failed.clone();
        self.queue
            .submit(move || {
                let count = records.len() as u64;
                let result = match sink.lock() {
                    Ok(mut sink) => sink.write(&records),
                    Err(_) => Err(DriverError::Sink("sink lock poisoned".into())),
                };
                match result {
                    Ok(()) => {
                        written.fetch_add(count, Ordering::Relaxed);
                    }
                    Err(e) => {
                        failed.fetch_add(count, Ordering::Relaxed);
                        warn!(records = count, error = %e, "provenance batch dropped");
                    }
                }
            })
            .await?;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Write everything queued, flush the sink and stop the thread.
    pub async fn close(self) -> DriverResult<ProvenanceStats> {
        let Self {
            queue,
            sink,
            written,
            failed,
        } = self;
        let flushed = tokio::task::spawn_blocking(move || {
            queue.shutdown();
            match sink.lock() {
                Ok(mut sink) => sink.flush(),
                Err(_) => Err(DriverError::Sink("sink lock poisoned".into())),
            }
        })
        .await
        .map_err(|e| DriverError::Sink(format!("provenance writer join failed: {e}")))?;
        flushed?;

        let stats = ProvenanceStats {
            written: written.load(Ordering::Relaxed),
            failed: failed.load(Ordering::Relaxed),
        };
        debug!(written = stats.written, failed = stats.failed, "provenance writer closed");
        Ok(stats)
    }
}
