//! Model document persisted by the parameter server.
//!
//! ```json
//! {"func_index_map": {"0": {"main": 0, "solve": 1}}, "alg_params": {"0": {...}}}
//! ```
//!
//! The file is written to a `.tmp` sibling and renamed into place, so a
//! reader never sees a partially written document.

use std::collections::BTreeMap;
use std::path::Path;

use insitu_detect::FunctionModel;
use insitu_types::ProgramId;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::SyncResult;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelDocument {
    /// Program → function name → global index.
    #[serde(default)]
    pub func_index_map: BTreeMap<ProgramId, BTreeMap<String, u64>>,
    /// Global statistics keyed by global function index.
    #[serde(default)]
    pub alg_params: FunctionModel,
}

impl ModelDocument {
    pub fn save(&self, path: &Path) -> SyncResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, path)?;
        info!(
            path = %path.display(),
            functions = self.alg_params.len(),
            "model saved"
        );
        Ok(())
    }

    pub fn load(path: &Path) -> SyncResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let doc: ModelDocument = serde_json::from_str(&contents)?;
        info!(
            path = %path.display(),
            functions = doc.alg_params.len(),
            "model loaded"
        );
        Ok(doc)
    }

    /// Like [`load`](Self::load) but a missing file yields an empty document.
    pub fn load_or_default(path: &Path) -> SyncResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use insitu_stats::RunningStats;

    fn document() -> ModelDocument {
        ModelDocument {
            func_index_map: BTreeMap::from([(
                0,
                BTreeMap::from([("main".to_string(), 0), ("solve".to_string(), 1)]),
            )]),
            alg_params: [(1, RunningStats::from_samples([1.5, 2.25, 9.125]))]
                .into_iter()
                .collect(),
        }
    }

    #[test]
    fn save_and_load_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let doc = document();
        doc.save(&path).unwrap();

        assert!(!path.with_extension("tmp").exists());
        assert_eq!(ModelDocument::load(&path).unwrap(), doc);
    }

    #[test]
    fn json_shape() {
        let json = serde_json::to_value(document()).unwrap();
        assert_eq!(json["func_index_map"]["0"]["solve"], 1);
        assert_eq!(json["alg_params"]["1"]["count"], 3);
    }

    #[test]
    fn missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        assert!(ModelDocument::load(&path).is_err());
        assert_eq!(ModelDocument::load_or_default(&path).unwrap(), ModelDocument::default());
    }
}
