//! Server-side global parameter model.

use std::sync::{Mutex, MutexGuard};

use insitu_detect::FunctionModel;
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::payload;

/// Thread-safe global per-function model.
///
/// The lock is held only for the merge itself; payload decoding and
/// encoding happen outside it.
#[derive(Debug, Default)]
pub struct ParameterStore {
    model: Mutex<FunctionModel>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_model(model: FunctionModel) -> Self {
        Self {
            model: Mutex::new(model),
        }
    }

    fn lock(&self) -> SyncResult<MutexGuard<'_, FunctionModel>> {
        self.model
            .lock()
            .map_err(|_| SyncError::LockPoisoned("parameter store"))
    }

    /// Merge a serialized delta and return the serialized global state of
    /// the functions it touched.
    pub fn update(&self, delta: &[u8]) -> SyncResult<Vec<u8>> {
        let delta: FunctionModel = payload::decode(delta)?;
        let merged = self.update_model(&delta)?;
        payload::encode(&merged)
    }

    /// Merge `delta` and return the global entries for its function ids.
    pub fn update_model(&self, delta: &FunctionModel) -> SyncResult<FunctionModel> {
        let merged = {
            let mut model = self.lock()?;
            model.merge_from(delta);
            model.subset(delta.function_ids())
        };
        debug!(functions = delta.len(), "merged parameter delta");
        Ok(merged)
    }

    /// Serialized full global model.
    pub fn get_all(&self) -> SyncResult<Vec<u8>> {
        let snapshot = self.snapshot()?;
        payload::encode(&snapshot)
    }

    pub fn snapshot(&self) -> SyncResult<FunctionModel> {
        Ok(self.lock()?.clone())
    }

    pub fn clear(&self) -> SyncResult<()> {
        self.lock()?.clear();
        Ok(())
    }

    /// Replace the whole model, e.g. when loading a persisted document.
    pub fn assign(&self, model: FunctionModel) -> SyncResult<()> {
        *self.lock()? = model;
        Ok(())
    }

    pub fn len(&self) -> SyncResult<usize> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.lock()?.is_empty())
    }
}
