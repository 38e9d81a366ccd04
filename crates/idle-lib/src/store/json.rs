//! JSON file backends
//!
//! State is stored one file per instance so a write only ever touches the
//! instance being updated. Every rewrite goes through `atomic_write`; history
//! is a JSON-lines file that is only ever appended to.

use super::{HistoryLog, PolicyStore, StateStore};
use crate::models::{HistoryEntry, IdleState};
use crate::policy::PolicyConfig;
use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Write `data` to `path` via a temp file, fsync and rename
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let temp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)
        .with_context(|| format!("Failed to create temp file {:?}", temp_path))?;

    file.write_all(data).context("Failed to write data")?;
    file.sync_all().context("Failed to sync temp file")?;

    std::fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

    Ok(())
}

/// File name for an instance id.
///
/// ASCII alphanumerics and `-` are kept; every other byte, `_` included, is
/// written as `_XX` hex, so distinct ids never share a file.
fn state_file_name(instance_id: &str) -> String {
    let mut name = String::with_capacity(instance_id.len() + 5);
    for byte in instance_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            name.push(byte as char);
        } else {
            name.push_str(&format!("_{:02x}", byte));
        }
    }
    name.push_str(".json");
    name
}

/// Idle state stored as `<dir>/<instance_id>.json`
pub struct JsonStateStore {
    dir: PathBuf,
}

impl JsonStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, instance_id: &str) -> PathBuf {
        self.dir.join(state_file_name(instance_id))
    }
}

impl StateStore for JsonStateStore {
    fn load_all(&self) -> Result<Vec<IdleState>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut states = Vec::new();
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read state directory {:?}", self.dir))?;

        for entry in entries {
            let path = entry.context("Failed to read directory entry")?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let data = std::fs::read(&path)
                .with_context(|| format!("Failed to read state file {:?}", path))?;
            let state: IdleState = serde_json::from_slice(&data)
                .with_context(|| format!("Failed to parse state file {:?}", path))?;
            states.push(state);
        }

        info!(dir = %self.dir.display(), instances = states.len(), "Loaded idle state from disk");
        Ok(states)
    }

    fn save(&self, state: &IdleState) -> Result<()> {
        let json = serde_json::to_vec_pretty(state).context("Failed to serialize idle state")?;
        let path = self.path_for(&state.instance_id);
        atomic_write(&path, &json)?;
        debug!(path = %path.display(), "Idle state written");
        Ok(())
    }

    fn remove(&self, instance_id: &str) -> Result<()> {
        let path = self.path_for(instance_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove state file {:?}", path)),
        }
    }
}

/// Policy document stored as a single JSON file
pub struct JsonPolicyStore {
    path: PathBuf,
}

impl JsonPolicyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PolicyStore for JsonPolicyStore {
    fn load(&self) -> Result<Option<PolicyConfig>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let data = std::fs::read(&self.path)
            .with_context(|| format!("Failed to read policy file {:?}", self.path))?;
        let config = serde_json::from_slice(&data)
            .with_context(|| format!("Failed to parse policy file {:?}", self.path))?;
        Ok(Some(config))
    }

    fn save(&self, config: &PolicyConfig) -> Result<()> {
        let json = serde_json::to_vec_pretty(config).context("Failed to serialize policies")?;
        atomic_write(&self.path, &json)
    }
}

/// History stored as JSON lines, one entry per line
pub struct JsonHistoryLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonHistoryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

impl HistoryLog for JsonHistoryLog {
    fn load_all(&self) -> Result<Vec<HistoryEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path)
            .with_context(|| format!("Failed to open history file {:?}", self.path))?;

        let mut entries = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line.context("Failed to read history file")?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryEntry>(&line) {
                Ok(entry) => entries.push(entry),
                // A crash mid-append can leave a torn final line
                Err(e) => warn!(line = line_no + 1, error = %e, "Skipping unreadable history line"),
            }
        }

        Ok(entries)
    }

    fn append(&self, entry: &HistoryEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry).context("Failed to serialize history entry")?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open history file {:?}", self.path))?;
        file.write_all(&line).context("Failed to append history entry")?;
        file.sync_data().context("Failed to sync history file")?;
        Ok(())
    }
}
