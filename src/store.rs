//! Per-handler state persistence.
//!
//! Each handler may persist one opaque serde blob to
//! `<data_dir>/<handler>.json`. The core never interprets the contents;
//! the format is whatever the handler serializes.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use thiserror::Error;

/// State store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Flat-file store for handler state blobs.
#[derive(Debug)]
pub struct StateStore {
    data_dir: PathBuf,
}

impl StateStore {
    /// Open the store, creating the data directory if needed.
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;
        Ok(Self { data_dir })
    }

    fn path_for(&self, handler: &str) -> PathBuf {
        self.data_dir.join(format!("{handler}.json"))
    }

    /// Load a handler's state blob. `Ok(None)` when no blob was ever saved.
    pub fn load<T: DeserializeOwned>(&self, handler: &str) -> Result<Option<T>, StoreError> {
        let path = self.path_for(handler);
        if !path.is_file() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Save a handler's state blob, replacing any previous one.
    pub fn save<T: Serialize>(&self, handler: &str, value: &T) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(value)?;
        // Write-then-rename so a crash mid-write never truncates the blob.
        let tmp = self.data_dir.join(format!("{handler}.json.tmp"));
        std::fs::write(&tmp, json)?;
        std::fs::rename(tmp, self.path_for(handler))?;
        Ok(())
    }
}
