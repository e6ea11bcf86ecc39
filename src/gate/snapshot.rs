//! Persisted gate state.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::window::Frame;

/// Serializable state of a gate, for recovery across restarts or migration
/// between backends.
///
/// `frames` are newest first and contiguous; `window_size_ms` and
/// `frame_step_ms` are checked against the live gate on restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateSnapshot {
    pub name: String,
    pub window_size_ms: i64,
    pub frame_step_ms: i64,
    pub frames: Vec<Frame>,
    pub sum: i64,
}

impl GateSnapshot {
    /// Write the snapshot as JSON, creating parent directories.
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Read a snapshot written by [`GateSnapshot::to_file`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
