use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hash::FileMetadata;

pub const LOCAL_STATE_FILENAME: &str = "local_syncstate.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Queued,
    InProgress,
    Synced,
    Error,
    Rejected,
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncActionType {
    CreateLocal,
    ModifyLocal,
    DeleteLocal,
    CreateRemote,
    ModifyRemote,
    DeleteRemote,
    Noop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatusInfo {
    pub path: String,
    pub timestamp: DateTime<Utc>,
    pub status: SyncStatus,
    #[serde(default)]
    pub action: Option<SyncActionType>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Raised when [`LocalState::save`] (or an explicit environment check) finds that the
/// on-disk local-state file has disappeared while the data directory is still present.
/// This is fatal to the sync loop: an operator must investigate rather than risk the
/// sync engine re-deriving an empty "previous synced" baseline and mass-deleting the
/// remote copies of everything it thinks is newly absent.
#[derive(Debug)]
pub struct SyncEnvironmentError(pub String);

impl std::fmt::Display for SyncEnvironmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sync environment corrupted: {}", self.0)
    }
}

impl std::error::Error for SyncEnvironmentError {}

/// Per-client persistent record: last successfully synced metadata per path, plus the
/// last sync status per path. This is the basis for the three-way diff on every tick.
#[derive(Debug, Serialize, Deserialize)]
pub struct LocalStateData {
    #[serde(default)]
    pub states: HashMap<String, FileMetadata>,
    #[serde(default)]
    pub status_info: HashMap<String, SyncStatusInfo>,
}

impl Default for LocalStateData {
    fn default() -> Self {
        Self {
            states: HashMap::new(),
            status_info: HashMap::new(),
        }
    }
}

/// Guards [`LocalStateData`] behind a mutex (in-process) and persists it to a single
/// JSON file under a process-level lock (cross-process, via [`crate::workspace::WorkspaceLock`]
/// held by the owning client for the lifetime of the process).
pub struct LocalState {
    path: PathBuf,
    data: Mutex<LocalStateData>,
    has_saved_once: Mutex<bool>,
}

impl LocalState {
    pub fn path_for_data_dir(data_dir: &Path) -> PathBuf {
        data_dir.join("plugins").join(LOCAL_STATE_FILENAME)
    }

    /// Loads the local state file, or starts empty if it doesn't exist yet.
    pub fn load(path: PathBuf) -> Result<Self> {
        let data = if path.is_file() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("read local state {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parse local state {}", path.display()))?
        } else {
            LocalStateData::default()
        };
        let has_saved_once = path.is_file();
        Ok(Self {
            path,
            data: Mutex::new(data),
            has_saved_once: Mutex::new(has_saved_once),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_state(&self, rel_path: &str) -> Option<FileMetadata> {
        self.data.lock().unwrap().states.get(rel_path).cloned()
    }

    pub fn get_status(&self, rel_path: &str) -> Option<SyncStatusInfo> {
        self.data
            .lock()
            .unwrap()
            .status_info
            .get(rel_path)
            .cloned()
    }

    pub fn all_status(&self) -> Vec<SyncStatusInfo> {
        self.data.lock().unwrap().status_info.values().cloned().collect()
    }

    /// Records `path` as successfully synced with `metadata`, via `action`.
    /// Fails fast ([`SyncEnvironmentError`]) if the on-disk file vanished since load.
    pub fn insert_synced_file(
        &self,
        rel_path: &str,
        metadata: FileMetadata,
        action: SyncActionType,
    ) -> Result<()> {
        self.check_environment()?;
        let mut data = self.data.lock().unwrap();
        data.states.insert(rel_path.to_string(), metadata);
        data.status_info.insert(
            rel_path.to_string(),
            SyncStatusInfo {
                path: rel_path.to_string(),
                timestamp: Utc::now(),
                status: SyncStatus::Synced,
                action: Some(action),
                message: None,
            },
        );
        drop(data);
        self.save()
    }

    /// Updates only the status side (no change to the last-synced metadata), e.g. for
    /// QUEUED, IN_PROGRESS, ERROR, REJECTED, IGNORED transitions.
    pub fn insert_status_info(
        &self,
        rel_path: &str,
        status: SyncStatus,
        action: Option<SyncActionType>,
        message: Option<String>,
    ) -> Result<()> {
        self.check_environment()?;
        {
            let mut data = self.data.lock().unwrap();
            data.status_info.insert(
                rel_path.to_string(),
                SyncStatusInfo {
                    path: rel_path.to_string(),
                    timestamp: Utc::now(),
                    status,
                    action,
                    message,
                },
            );
        }
        self.save()
    }

    /// Marks `rel_path` ignored, but only if it isn't already ignored, so a stable
    /// ignore decision doesn't rewrite the file (and bump its timestamp) every tick.
    pub fn mark_ignored_if_changed(&self, rel_path: &str) -> Result<()> {
        let already_ignored = self
            .get_status(rel_path)
            .map(|s| s.status == SyncStatus::Ignored)
            .unwrap_or(false);
        if already_ignored {
            return Ok(());
        }
        self.insert_status_info(rel_path, SyncStatus::Ignored, None, None)
    }

    pub fn remove_path(&self, rel_path: &str) -> Result<()> {
        self.check_environment()?;
        {
            let mut data = self.data.lock().unwrap();
            data.states.remove(rel_path);
        }
        self.save()
    }

    /// Fails fast if the file existed at some point this process and has since
    /// vanished while its parent (the data directory) is still present -- a sign the
    /// environment was tampered with externally, not a normal first-run case.
    fn check_environment(&self) -> Result<()> {
        let has_saved_once = *self.has_saved_once.lock().unwrap();
        if !has_saved_once {
            return Ok(());
        }
        let data_dir = self.path.parent().and_then(|p| p.parent());
        let data_dir_exists = data_dir.map(|p| p.is_dir()).unwrap_or(true);
        if data_dir_exists && !self.path.is_file() {
            return Err(SyncEnvironmentError(format!(
                "local state file {} disappeared while data directory still exists",
                self.path.display()
            ))
            .into());
        }
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let data = self.data.lock().unwrap();
        let body = serde_json::to_vec_pretty(&*data).context("serialize local state")?;
        drop(data);
        crate::fsops::atomic_write(&self.path, &body)?;
        *self.has_saved_once.lock().unwrap() = true;
        Ok(())
    }
}
