//! Registry of manager sources.
//!
//! Every listing a manager parses refers back to a [`ManagerSource`]. The
//! registry hands out one shared instance per `(manager, name)` so that all
//! packages of the same feed point at the same `Arc`.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::data::ManagerSource;

type SourceId = (String, String);

fn source_id(manager: &str, name: &str) -> SourceId {
    (manager.to_lowercase(), name.to_string())
}

#[derive(Debug, Default)]
pub struct SourceRegistry {
    sources: DashMap<SourceId, Arc<ManagerSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the registered source or registers a new one.
    ///
    /// Concurrent first access constructs exactly one instance. When the
    /// source already exists its original `origin` is kept.
    pub fn get_or_create(&self, name: &str, origin: &str, manager: &str) -> Arc<ManagerSource> {
        let source = self
            .sources
            .entry(source_id(manager, name))
            .or_insert_with(|| {
                debug!(manager, name, origin, "Registering source");
                Arc::new(ManagerSource::new(name, origin, manager))
            });
        Arc::clone(source.value())
    }

    #[must_use]
    pub fn get(&self, manager: &str, name: &str) -> Option<Arc<ManagerSource>> {
        self.sources
            .get(&source_id(manager, name))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// All sources registered for one manager, sorted by name.
    pub fn sources_for(&self, manager: &str) -> Vec<Arc<ManagerSource>> {
        let manager = manager.to_lowercase();
        let mut sources: Vec<_> = self
            .sources
            .iter()
            .filter(|entry| entry.key().0 == manager)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        sources.sort_by(|a, b| a.name.cmp(&b.name));
        sources
    }

    /// Forgets a source, e.g. after the user removed it from the tool.
    /// Packages still holding the old `Arc` keep it alive.
    pub fn remove(&self, manager: &str, name: &str) -> Option<Arc<ManagerSource>> {
        let removed = self.sources.remove(&source_id(manager, name)).map(|(_, s)| s);
        if removed.is_some() {
            trace!(manager, name, "Removed source");
        }
        removed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
