//! Durable registry persistence.
//!
//! Writes go to a temp file in the target directory, which is locked,
//! fsynced and renamed over the registry, so readers never see a partial
//! document. [`RegistryStore::transaction`] additionally holds a lock on a
//! sibling `.lock` file across load-modify-save.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs4::FileExt;

use crate::error::{Error, Result};

use super::slot::{Registry, SlotInfo};

/// Returns `~/.devops-ai/registry.json`.
pub fn default_registry_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".devops-ai")
        .join("registry.json")
}

/// Exclusive advisory lock on the registry. Released on drop.
#[derive(Debug)]
pub struct RegistryLock {
    _file: File,
}

/// File-backed registry.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
}

impl Default for RegistryStore {
    fn default() -> Self {
        Self::new(default_registry_path())
    }
}

impl RegistryStore {
    /// Creates a store persisting to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the registry document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parent_dir(&self) -> &Path {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        }
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "registry".into());
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn registry_error(&self, reason: impl ToString) -> Error {
        Error::Registry {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }

    /// Loads the registry.
    ///
    /// A missing or empty file yields an empty registry. Unreadable or
    /// malformed content is logged and also yields an empty registry.
    pub fn load(&self) -> Registry {
        if !self.path.exists() {
            return Registry::new();
        }

        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(path = ?self.path, error = %e, "registry unreadable, starting fresh");
                return Registry::new();
            }
        };
        if text.trim().is_empty() {
            return Registry::new();
        }

        match serde_json::from_str(&text) {
            Ok(registry) => registry,
            Err(e) => {
                tracing::warn!(path = ?self.path, error = %e, "registry file corrupt, starting fresh");
                Registry::new()
            }
        }
    }

    /// Writes the registry atomically.
    ///
    /// On failure the temp file is removed and any previous document is left
    /// untouched.
    pub fn save(&self, registry: &Registry) -> Result<()> {
        let dir = self.parent_dir();
        fs::create_dir_all(dir)?;

        let mut json = serde_json::to_string_pretty(registry)?;
        json.push('\n');

        // Dropping an unpersisted NamedTempFile deletes it.
        let mut tmp = tempfile::Builder::new()
            .prefix(".registry-")
            .suffix(".tmp")
            .tempfile_in(dir)?;
        tmp.as_file()
            .lock_exclusive()
            .map_err(|e| self.registry_error(format!("failed to lock temp file: {}", e)))?;
        tmp.write_all(json.as_bytes())?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;

        tmp.persist(&self.path)
            .map_err(|e| self.registry_error(format!("failed to replace registry: {}", e.error)))?;

        tracing::debug!(path = ?self.path, slots = registry.slots.len(), "registry saved");
        Ok(())
    }

    /// Takes the cross-process registry lock, blocking until it is free.
    pub fn lock(&self) -> Result<RegistryLock> {
        fs::create_dir_all(self.parent_dir())?;
        let path = self.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.lock_exclusive()
            .map_err(|e| self.registry_error(format!("failed to lock {}: {}", path.display(), e)))?;
        Ok(RegistryLock { _file: file })
    }

    /// Runs `f` against the current registry while holding the lock, then saves.
    ///
    /// Nothing is saved if `f` fails.
    pub fn transaction<T>(&self, f: impl FnOnce(&mut Registry) -> Result<T>) -> Result<T> {
        let _lock = self.lock()?;
        let mut registry = self.load();
        let value = f(&mut registry)?;
        self.save(&registry)?;
        Ok(value)
    }

    /// Adds a slot to the registry and persists.
    pub fn claim(&self, registry: &mut Registry, slot: SlotInfo) -> Result<()> {
        tracing::info!(slot = slot.slot_id, project = %slot.project, "claiming slot");
        registry.insert(slot);
        self.save(registry)
    }

    /// Removes a slot from the registry and persists.
    pub fn release(&self, registry: &mut Registry, slot_id: u32) -> Result<()> {
        tracing::info!(slot = slot_id, "releasing slot");
        registry.remove(slot_id);
        self.save(registry)
    }
}
