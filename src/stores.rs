//! Persisted decision stores and the backends they are saved to.
//!
//! A store is a flat `String -> String` map. [`JsonFileStore`] keeps each one
//! as `<dir>/<name>.json`; [`MemoryStore`] keeps them in process.

pub mod ignored;
pub mod shortcuts;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::errors::{Result, UnipackError};

pub use ignored::{IgnoreRule, IgnoredUpdatesDatabase};
pub use shortcuts::{DesktopShortcutsDatabase, ShortcutDecision, ShortcutSnapshot};

pub type StoreMap = BTreeMap<String, String>;

/// Where decision stores are read from and written to.
pub trait StoreBackend: Send + Sync + fmt::Debug {
    /// A store that was never written reads as empty.
    fn read_store(&self, name: &str) -> Result<StoreMap>;

    fn write_store(&self, name: &str, values: &StoreMap) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }
}

impl StoreBackend for JsonFileStore {
    fn read_store(&self, name: &str) -> Result<StoreMap> {
        let path = self.path_for(name);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(StoreMap::new()),
            Err(e) => return Err(UnipackError::store(name, format!("{}: {e}", path.display()))),
        };
        if text.trim().is_empty() {
            return Ok(StoreMap::new());
        }
        serde_json::from_str(&text).map_err(|e| UnipackError::store(name, e.to_string()))
    }

    /// Writes to a temporary file in the same directory, then renames it over
    /// the old file.
    fn write_store(&self, name: &str, values: &StoreMap) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let mut file = NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer_pretty(&mut file, values)
            .map_err(|e| UnipackError::store(name, e.to_string()))?;
        file.write_all(b"\n")?;
        file.flush()?;
        let path = self.path_for(name);
        file.persist(&path)
            .map_err(|e| UnipackError::store(name, e.error.to_string()))?;
        debug!(store = name, path = %path.display(), entries = values.len(), "Store written");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    stores: Mutex<HashMap<String, StoreMap>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreBackend for MemoryStore {
    fn read_store(&self, name: &str) -> Result<StoreMap> {
        Ok(self.stores.lock().get(name).cloned().unwrap_or_default())
    }

    fn write_store(&self, name: &str, values: &StoreMap) -> Result<()> {
        self.stores.lock().insert(name.to_string(), values.clone());
        Ok(())
    }
}

/// A store map held in memory and written through on every change.
///
/// Read failures start from an empty map; write failures are logged and the
/// in-memory state stays authoritative.
#[derive(Debug)]
pub(crate) struct PersistedMap {
    name: &'static str,
    backend: Arc<dyn StoreBackend>,
    values: RwLock<StoreMap>,
}

impl PersistedMap {
    pub fn load(name: &'static str, backend: Arc<dyn StoreBackend>) -> Self {
        let values = backend.read_store(name).unwrap_or_else(|e| {
            warn!(store = name, error = %e, "Could not read store, starting empty");
            StoreMap::new()
        });
        Self {
            name,
            backend,
            values: RwLock::new(values),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    pub fn snapshot(&self) -> StoreMap {
        self.values.read().clone()
    }

    pub fn insert(&self, key: String, value: String) {
        let mut values = self.values.write();
        values.insert(key, value);
        self.persist(&values);
    }

    pub fn remove(&self, key: &str) -> bool {
        let mut values = self.values.write();
        let removed = values.remove(key).is_some();
        if removed {
            self.persist(&values);
        }
        removed
    }

    /// Removes `key` only while it still holds `expected`.
    pub fn remove_if_eq(&self, key: &str, expected: &str) -> bool {
        let mut values = self.values.write();
        if values.get(key).map(String::as_str) != Some(expected) {
            return false;
        }
        values.remove(key);
        self.persist(&values);
        true
    }

    fn persist(&self, values: &StoreMap) {
        if let Err(e) = self.backend.write_store(self.name, values) {
            warn!(store = self.name, error = %e, "Could not persist store");
        }
    }
}
