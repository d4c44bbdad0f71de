//! Local file-based state storage backend.
//!
//! This module provides a file-based state storage for local development and
//! single-machine use. Writes go to a temporary file that is synced and then
//! renamed over the state file, so a crash never leaves a torn document.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{GantryError, Result, StateError};

use super::lock::{LockInfo, LOCK_EXPIRY_SECS};
use super::store::StateStore;
use super::types::StateDocument;

/// Default state directory name.
const STATE_DIR: &str = ".gantry";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
}

impl LocalStateStore {
    /// Creates a store in the default state directory under `project_dir`.
    #[must_use]
    pub fn in_project(project_dir: impl AsRef<Path>) -> Self {
        Self::with_base_dir(project_dir.as_ref().join(STATE_DIR))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
        }
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                GantryError::State(StateError::backend(format!("Failed to create state directory: {e}")))
            })?;
        }
        Ok(())
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        match fs::read_to_string(&self.lock_path).await {
            Ok(content) => LockInfo::from_json(&content).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(lock_failed("read", &e)),
        }
    }

    /// Creates the lock file. Returns false if one already exists.
    async fn create_lock_file(&self, lock_info: &LockInfo) -> Result<bool> {
        self.ensure_dir().await?;
        let content = lock_info.to_json()?;

        let opened = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await;
        let mut file = match opened {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(lock_failed("create", &e)),
        };

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| lock_failed("write", &e))?;
        file.sync_all().await.map_err(|e| lock_failed("sync", &e))?;
        Ok(true)
    }

    /// Overwrites the lock file.
    async fn write_lock_file(&self, lock_info: &LockInfo) -> Result<()> {
        let content = lock_info.to_json()?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.lock_path)
            .await
            .map_err(|e| lock_failed("open", &e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| lock_failed("write", &e))?;
        file.sync_all().await.map_err(|e| lock_failed("sync", &e))
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(lock_failed("delete", &e)),
        }
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<StateDocument>> {
        let content = match fs::read_to_string(&self.state_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.state_path.display(), "No state file");
                return Ok(None);
            }
            Err(e) => {
                return Err(GantryError::State(StateError::backend(format!(
                    "Failed to read state file: {e}"
                ))));
            }
        };

        let state = StateDocument::from_json(&content)?;
        info!(
            path = %self.state_path.display(),
            serial = state.serial,
            resources = state.len(),
            "State loaded"
        );
        Ok(Some(state))
    }

    async fn save(&self, state: &StateDocument) -> Result<()> {
        self.ensure_dir().await?;

        debug!(serial = state.serial, "Saving state to: {}", self.state_path.display());

        let content = state.to_json()?;

        // Write to a temporary file first, then rename for atomicity
        let temp_path = self.state_path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            GantryError::State(StateError::backend(format!(
                "Failed to create temp state file: {e}"
            )))
        })?;

        file.write_all(content.as_bytes()).await.map_err(|e| {
            GantryError::State(StateError::backend(format!("Failed to write state file: {e}")))
        })?;

        file.sync_all().await.map_err(|e| {
            GantryError::State(StateError::backend(format!("Failed to sync state file: {e}")))
        })?;

        // Atomic rename
        fs::rename(&temp_path, &self.state_path).await.map_err(|e| {
            GantryError::State(StateError::backend(format!("Failed to rename state file: {e}")))
        })?;

        debug!("State saved successfully");
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        if self.state_path.exists() {
            info!("Deleting state file: {}", self.state_path.display());
            fs::remove_file(&self.state_path).await.map_err(|e| {
                GantryError::State(StateError::backend(format!("Failed to delete state file: {e}")))
            })?;
        }

        // Also delete lock file
        self.delete_lock_file().await?;

        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let lock_info = LockInfo::for_holder(holder);

        // The second pass runs only after an expired lock was removed.
        for _ in 0..2 {
            if self.create_lock_file(&lock_info).await? {
                info!(
                    lock_id = %lock_info.lock_id,
                    expires_in_secs = LOCK_EXPIRY_SECS,
                    "Acquired state lock"
                );
                return Ok(lock_info);
            }

            if let Some(existing) = self.read_lock_file().await? {
                if let Some(err) = existing.conflict() {
                    return Err(err);
                }
                debug!(holder = %existing.holder, "Expired lock found, taking over");
                self.delete_lock_file().await?;
            }
        }

        Err(GantryError::State(StateError::LockFailed {
            message: format!("{} was recreated while acquiring", self.lock_path.display()),
        }))
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn hold_lock(&self, lock: &LockInfo) -> Result<()> {
        match self.read_lock_file().await? {
            Some(existing) if existing.lock_id == lock.lock_id => {
                self.write_lock_file(lock).await?;
                info!(lock_id = %lock.lock_id, halted = lock.halted.is_some(), "Updated state lock");
                Ok(())
            }
            _ => Err(GantryError::State(StateError::LockFailed {
                message: format!("lock {} is no longer held", lock.lock_id),
            })),
        }
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .read_lock_file()
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

/// Wraps an I/O failure on the lock file.
fn lock_failed(op: &str, e: &std::io::Error) -> GantryError {
    GantryError::State(StateError::LockFailed {
        message: format!("Failed to {op} lock file: {e}"),
    })
}
