//! Durable record of which files of a target version are already on disk.
//!
//! The store is constructed once by the host and shared by `Arc`. Every
//! mutation rewrites the whole file; the state is tiny and changes at most a
//! few times per second.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tokio::fs;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::manifest::UpdateFile;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct VersionState {
    pub target_version: Option<String>,
    pub completed_files: BTreeSet<String>,
    pub partial_downloads: HashMap<String, u64>,
    pub updated_at: Option<DateTime<Utc>>,
}

pub struct VersionStateStore {
    path: PathBuf,
    state: Mutex<VersionState>,
    write_lock: tokio::sync::Mutex<()>,
}

impl VersionStateStore {
    /// Loads `path`, falling back to an empty state when the file is missing
    /// or unreadable.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                error!(path = %path.display(), error = %e, "failed to parse download state, starting empty");
                VersionState::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => VersionState::default(),
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to read download state, starting empty");
                VersionState::default()
            }
        };
        Self {
            path,
            state: Mutex::new(state),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> VersionState {
        self.lock().clone()
    }

    /// Switching to a different version drops every completed and partial
    /// record.
    pub async fn initialize_for_version(&self, version: &str) -> Result<()> {
        {
            let mut state = self.lock();
            if state.target_version.as_deref() == Some(version) {
                return Ok(());
            }
            info!(from = ?state.target_version, to = version, "resetting download state for new version");
            state.target_version = Some(version.to_string());
            state.completed_files.clear();
            state.partial_downloads.clear();
            state.updated_at = Some(Utc::now());
        }
        self.persist().await
    }

    pub fn is_file_downloaded(&self, path: &str) -> bool {
        self.lock().completed_files.contains(path)
    }

    pub async fn mark_file_as_downloaded(&self, path: &str) -> Result<()> {
        {
            let mut state = self.lock();
            let had_partial = state.partial_downloads.remove(path).is_some();
            if !state.completed_files.insert(path.to_string()) && !had_partial {
                return Ok(());
            }
            state.updated_at = Some(Utc::now());
        }
        self.persist().await
    }

    pub async fn update_partial_download(&self, path: &str, downloaded: u64) -> Result<()> {
        {
            let mut state = self.lock();
            state.partial_downloads.insert(path.to_string(), downloaded);
            state.updated_at = Some(Utc::now());
        }
        self.persist().await
    }

    pub fn get_partial_download_size(&self, path: &str) -> u64 {
        self.lock().partial_downloads.get(path).copied().unwrap_or(0)
    }

    /// Entries of `files` whose local path is not recorded as completed.
    pub fn filter_pending_downloads(&self, files: &[UpdateFile]) -> Vec<UpdateFile> {
        let state = self.lock();
        files
            .iter()
            .filter(|f| !state.completed_files.contains(&f.local_path))
            .cloned()
            .collect()
    }

    pub async fn clear_state(&self) -> Result<()> {
        let _write = self.write_lock.lock().await;
        *self.lock() = VersionState::default();
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VersionState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("download state lock was poisoned, continuing with inner value");
            poisoned.into_inner()
        })
    }

    /// Writes the latest state. Writers are serialised and each one
    /// serialises the state only after taking its turn, so the file never
    /// goes back to an older snapshot.
    async fn persist(&self) -> Result<()> {
        let _write = self.write_lock.lock().await;
        let content = serde_json::to_string_pretty(&*self.lock())?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let mut tmp = self.path.as_os_str().to_os_string();
        tmp.push(".tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
