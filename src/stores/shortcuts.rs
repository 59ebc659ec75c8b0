//! Decisions about desktop shortcuts that installers create.
//!
//! An install snapshots the shortcut directories before it runs; afterwards
//! the new entries are registered. Shortcuts the user already decided to
//! delete are removed right away, the rest wait as `unknown` until someone
//! decides.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::data::constants::DESKTOP_SHORTCUTS_STORE;
use crate::errors::UnipackError;
use crate::stores::{PersistedMap, StoreBackend};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ShortcutDecision {
    Maintain,
    Delete,
    Unknown,
}

impl ShortcutDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShortcutDecision::Maintain => "maintain",
            ShortcutDecision::Delete => "delete",
            ShortcutDecision::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ShortcutDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShortcutDecision {
    type Err = UnipackError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "maintain" => Ok(ShortcutDecision::Maintain),
            "delete" => Ok(ShortcutDecision::Delete),
            "unknown" => Ok(ShortcutDecision::Unknown),
            other => Err(UnipackError::store(
                DESKTOP_SHORTCUTS_STORE,
                format!("invalid decision '{other}'"),
            )),
        }
    }
}

/// Shortcut files present at one point in time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShortcutSnapshot {
    paths: BTreeSet<PathBuf>,
}

impl ShortcutSnapshot {
    pub fn contains(&self, path: &Path) -> bool {
        self.paths.contains(path)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

fn path_key(path: &Path) -> String {
    absolute(path).to_string_lossy().into_owned()
}

#[derive(Debug)]
pub struct DesktopShortcutsDatabase {
    decisions: PersistedMap,
    dirs: Vec<PathBuf>,
    /// Lowercase, without the dot.
    extensions: Vec<String>,
}

impl DesktopShortcutsDatabase {
    pub fn load(backend: Arc<dyn StoreBackend>, dirs: Vec<PathBuf>, extensions: &[String]) -> Self {
        Self {
            decisions: PersistedMap::load(DESKTOP_SHORTCUTS_STORE, backend),
            dirs,
            extensions: extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// `Unknown` when no decision was recorded.
    pub fn resolve(&self, path: &Path) -> ShortcutDecision {
        self.decisions
            .get(&path_key(path))
            .and_then(|value| value.parse().ok())
            .unwrap_or(ShortcutDecision::Unknown)
    }

    pub fn record_decision(&self, path: &Path, decision: ShortcutDecision) {
        let key = path_key(path);
        info!(path = %key, %decision, "Recorded shortcut decision");
        self.decisions.insert(key, decision.to_string());
    }

    /// Forgets the decision for `path`.
    pub fn remove(&self, path: &Path) -> bool {
        let key = path_key(path);
        let removed = self.decisions.remove(&key);
        if removed {
            info!(path = %key, "Forgot shortcut decision");
        }
        removed
    }

    /// Lists the shortcut files currently in the watched directories.
    /// Missing directories contribute nothing.
    pub fn snapshot(&self) -> ShortcutSnapshot {
        let mut paths = BTreeSet::new();
        for dir in &self.dirs {
            let entries = match std::fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) => {
                    debug!(dir = %dir.display(), error = %e, "Skipping shortcut directory");
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_file() && self.is_shortcut(&path) {
                    paths.insert(absolute(&path));
                }
            }
        }
        ShortcutSnapshot { paths }
    }

    fn is_shortcut(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .is_some_and(|ext| self.extensions.iter().any(|e| *e == ext))
    }

    /// Shortcuts present now that were not in `previous`.
    pub fn detect_new(&self, previous: &ShortcutSnapshot) -> Vec<PathBuf> {
        self.snapshot()
            .paths
            .difference(&previous.paths)
            .cloned()
            .collect()
    }

    /// Applies stored decisions to freshly created shortcuts.
    ///
    /// `Delete` removes the file, `Maintain` keeps it, anything undecided is
    /// stored as `Unknown`. Returns the shortcuts that still need a decision.
    pub fn register_new(&self, paths: &[PathBuf]) -> Vec<PathBuf> {
        let mut undecided = Vec::new();
        for path in paths {
            match self.resolve(path) {
                ShortcutDecision::Delete => match std::fs::remove_file(path) {
                    Ok(()) => info!(path = %path.display(), "Deleted shortcut"),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Could not delete shortcut")
                    }
                },
                ShortcutDecision::Maintain => {
                    debug!(path = %path.display(), "Keeping shortcut");
                }
                ShortcutDecision::Unknown => {
                    let key = path_key(path);
                    if self.decisions.get(&key).is_none() {
                        info!(path = %key, "New shortcut awaiting decision");
                        self.decisions.insert(key, ShortcutDecision::Unknown.to_string());
                    }
                    undecided.push(absolute(path));
                }
            }
        }
        undecided
    }

    /// Every shortcut stored as `unknown`.
    pub fn unknown_shortcuts(&self) -> Vec<PathBuf> {
        self.decisions
            .snapshot()
            .into_iter()
            .filter(|(_, value)| value.parse().ok() == Some(ShortcutDecision::Unknown))
            .map(|(key, _)| PathBuf::from(key))
            .collect()
    }
}
