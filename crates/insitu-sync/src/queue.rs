//! Bounded work queue drained by a fixed pool of OS threads.
//!
//! Used for request dispatch on the parameter server and for background
//! provenance writes on the analysis daemon.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};

/// A unit of work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// N workers pulling one job at a time from a shared bounded channel.
///
/// Dropping the queue closes the channel; workers finish what is queued
/// and exit. [`WorkQueue::shutdown`] does the same and joins them.
pub struct WorkQueue {
    name: String,
    tx: Option<mpsc::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>, workers: usize, capacity: usize) -> SyncResult<Self> {
        let name = name.into();
        let (tx, rx) = mpsc::channel::<Job>(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(workers.max(1));
        for i in 0..workers.max(1) {
            let rx = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || worker_loop(rx))?;
            handles.push(handle);
        }
        debug!(queue = %name, workers = handles.len(), capacity, "work queue started");

        Ok(Self {
            name,
            tx: Some(tx),
            workers: handles,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    fn sender(&self) -> SyncResult<&mpsc::Sender<Job>> {
        self.tx.as_ref().ok_or(SyncError::QueueClosed)
    }

    /// Queue a job, waiting for capacity.
    pub async fn submit<F>(&self, job: F) -> SyncResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender()?
            .send(Box::new(job))
            .await
            .map_err(|_| SyncError::QueueClosed)
    }

    /// Queue a job without waiting.
    pub fn try_submit<F>(&self, job: F) -> SyncResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender()?.try_send(Box::new(job)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SyncError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SyncError::QueueClosed,
        })
    }

    /// Close the queue, let workers drain queued jobs, and join them.
    /// Blocks; call from a blocking context.
    pub fn shutdown(mut self) {
        self.close_and_join();
    }

    fn close_and_join(&mut self) {
        self.tx.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!(queue = %self.name, "worker panicked");
            }
        }
        debug!(queue = %self.name, "work queue stopped");
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.tx.take();
    }
}

fn worker_loop(rx: Arc<Mutex<mpsc::Receiver<Job>>>) {
    loop {
        let job = {
            let mut rx = match rx.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            rx.blocking_recv()
        };
        match job {
            Some(job) => job(),
            None => break,
        }
    }
}
