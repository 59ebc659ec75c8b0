//! The authoritative package sets and the catalog that refreshes them.
//!
//! Managers hand out fresh [`Package`] values on every query; a
//! [`PackageLoader`] folds them in by identity so the same package never
//! appears twice. [`PackageCatalog`] owns one loader per listing kind and
//! applies ignored-update rules when the upgradable set is read.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, info};

use crate::data::{Package, PackageKey};
use crate::errors::Result;
use crate::managers::ManagerSet;
use crate::stores::IgnoredUpdatesDatabase;
use crate::traits::PackageManager;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoaderKind {
    Installed,
    Upgradable,
    Search,
}

impl fmt::Display for LoaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoaderKind::Installed => "installed",
            LoaderKind::Upgradable => "upgradable",
            LoaderKind::Search => "search",
        };
        f.write_str(name)
    }
}

/// Read-side selection over a loader.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PackageFilter {
    pub manager: Option<String>,
    /// Case-insensitive substring of id or name.
    pub text: Option<String>,
}

impl PackageFilter {
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn manager(mut self, manager: &str) -> Self {
        self.manager = Some(manager.to_string());
        self
    }

    #[must_use]
    pub fn matching(mut self, text: &str) -> Self {
        self.text = Some(text.to_lowercase());
        self
    }

    pub fn accepts(&self, package: &Package) -> bool {
        if let Some(manager) = &self.manager {
            if !package.manager.eq_ignore_ascii_case(manager) {
                return false;
            }
        }
        match &self.text {
            Some(text) => {
                let text = text.to_lowercase();
                package.id.to_lowercase().contains(&text)
                    || package.name.to_lowercase().contains(&text)
            }
            None => true,
        }
    }
}

/// A concurrently mutable package set keyed by [`PackageKey`].
#[derive(Debug)]
pub struct PackageLoader {
    kind: LoaderKind,
    packages: DashMap<PackageKey, Package>,
}

impl PackageLoader {
    pub fn new(kind: LoaderKind) -> Self {
        Self {
            kind,
            packages: DashMap::new(),
        }
    }

    pub fn kind(&self) -> LoaderKind {
        self.kind
    }

    /// Replaces everything known about `manager` with `fresh`.
    ///
    /// Entries with a matching identity are replaced, new ones added, and
    /// entries the manager no longer reports are dropped.
    pub fn reconcile(&self, manager: &str, fresh: &[Package]) {
        let manager = manager.to_lowercase();
        let mut incoming: Vec<PackageKey> = Vec::with_capacity(fresh.len());
        for package in fresh {
            let key = package.key();
            self.packages.insert(key.clone(), package.clone());
            incoming.push(key);
        }
        incoming.sort();
        let before = self.packages.len();
        self.packages
            .retain(|key, _| key.manager != manager || incoming.binary_search(key).is_ok());
        debug!(
            loader = %self.kind,
            %manager,
            reported = fresh.len(),
            dropped = (before - self.packages.len()),
            "Reconciled packages"
        );
    }

    pub fn upsert(&self, package: Package) {
        self.packages.insert(package.key(), package);
    }

    pub fn remove(&self, key: &PackageKey) -> Option<Package> {
        self.packages.remove(key).map(|(_, package)| package)
    }

    /// Whether any source of `manager` currently holds `id`.
    pub fn contains(&self, manager: &str, id: &str) -> bool {
        self.find(manager, id).is_some()
    }

    pub fn find(&self, manager: &str, id: &str) -> Option<Package> {
        let manager = manager.to_lowercase();
        self.packages
            .iter()
            .find(|entry| entry.key().manager == manager && entry.key().id == id)
            .map(|entry| entry.value().clone())
    }

    /// Matching packages in identity order.
    pub fn get_packages(&self, filter: &PackageFilter) -> Vec<Package> {
        let mut packages: Vec<Package> = self
            .packages
            .iter()
            .filter(|entry| filter.accepts(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        packages.sort_by_key(Package::key);
        packages
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn clear(&self) {
        self.packages.clear();
    }
}

/// Installed and upgradable package sets across every manager.
#[derive(Debug)]
pub struct PackageCatalog {
    managers: ManagerSet,
    installed: PackageLoader,
    upgradable: PackageLoader,
    ignored: Arc<IgnoredUpdatesDatabase>,
}

impl PackageCatalog {
    pub fn new(managers: ManagerSet, ignored: Arc<IgnoredUpdatesDatabase>) -> Self {
        Self {
            managers,
            installed: PackageLoader::new(LoaderKind::Installed),
            upgradable: PackageLoader::new(LoaderKind::Upgradable),
            ignored,
        }
    }

    pub fn managers(&self) -> &ManagerSet {
        &self.managers
    }

    pub fn installed_loader(&self) -> &PackageLoader {
        &self.installed
    }

    pub fn upgradable_loader(&self) -> &PackageLoader {
        &self.upgradable
    }

    async fn refresh_manager(&self, manager: &Arc<dyn PackageManager>) {
        if !manager.is_available().await {
            debug!(manager = manager.name(), "Manager not available, skipping refresh");
            return;
        }
        let (installed, upgradable) =
            tokio::join!(manager.list_installed(), manager.list_upgradable());
        self.installed.reconcile(manager.name(), &installed);
        self.upgradable.reconcile(manager.name(), &upgradable);
    }

    /// Re-queries every available manager concurrently.
    pub async fn refresh_all(&self) {
        join_all(self.managers.iter().map(|m| self.refresh_manager(m))).await;
        info!(
            installed = self.installed.len(),
            upgradable = self.upgradable.len(),
            "Catalog refreshed"
        );
    }

    /// Drops the manager's cached listings and re-queries them. Returns the
    /// installed entry for `id`, if the tool now reports one.
    pub async fn refresh_package(&self, manager: &str, id: &str) -> Result<Option<Package>> {
        let manager = self.managers.get(manager)?;
        manager.invalidate_listings();
        let (installed, upgradable) =
            tokio::join!(manager.list_installed(), manager.list_upgradable());
        self.installed.reconcile(manager.name(), &installed);
        self.upgradable.reconcile(manager.name(), &upgradable);
        Ok(self.installed.find(manager.name(), id))
    }

    pub fn installed(&self, filter: &PackageFilter) -> Vec<Package> {
        self.installed.get_packages(filter)
    }

    /// Upgradable packages whose candidate version is not ignored. Rules are
    /// evaluated at read time, so changes apply without a refresh.
    pub fn upgradable(&self, filter: &PackageFilter) -> Vec<Package> {
        self.upgradable
            .get_packages(filter)
            .into_iter()
            .filter(|package| !self.is_update_ignored(package))
            .collect()
    }

    pub fn is_update_ignored(&self, package: &Package) -> bool {
        let candidate = package.available_version.as_deref().unwrap_or_default();
        self.ignored.is_ignored(&package.manager, &package.id, candidate)
    }

    /// Searches every manager that supports it, deduplicated by identity.
    pub async fn search(&self, query: &str) -> Vec<Package> {
        let searchable: Vec<_> = self
            .managers
            .iter()
            .filter(|m| m.capabilities().search)
            .collect();
        let results = join_all(searchable.iter().map(|m| m.search(query))).await;
        let loader = PackageLoader::new(LoaderKind::Search);
        for packages in results {
            for package in packages.iter() {
                loader.upsert(package.clone());
            }
        }
        loader.get_packages(&PackageFilter::all())
    }
}
