//! The object a host creates once and shuts down at exit.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::configuration::CoreConfig;
use crate::errors::Result;
use crate::loader::PackageCatalog;
use crate::managers::{self, ManagerServices, ManagerSet, BUILTIN_MANAGERS};
use crate::operations::{EngineServices, OperationEngine};
use crate::process::ProcessRunner;
use crate::recycler::TaskRecycler;
use crate::sources::SourceRegistry;
use crate::stores::{DesktopShortcutsDatabase, IgnoredUpdatesDatabase, JsonFileStore, StoreBackend};
use crate::traits::PackageManager;

/// Owns every registry, store and background task of one core instance.
pub struct CoreContext {
    config: CoreConfig,
    services: ManagerServices,
    ignored: Arc<IgnoredUpdatesDatabase>,
    shortcuts: Arc<DesktopShortcutsDatabase>,
    catalog: Arc<PackageCatalog>,
    engine: OperationEngine,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl fmt::Debug for CoreContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreContext")
            .field("managers", &self.catalog.managers().names())
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl CoreContext {
    /// Enabled built-in managers with stores under the configured directory.
    pub fn new(config: CoreConfig) -> Result<Self> {
        let store: Arc<dyn StoreBackend> = Arc::new(JsonFileStore::new(config.store_dir()?));
        Self::with_managers(config, store, |config, services| {
            BUILTIN_MANAGERS
                .iter()
                .filter(|name| config.is_manager_enabled(name))
                .filter_map(|name| managers::builtin(name, config.manager_settings(name), services))
                .collect()
        })
    }

    /// Builds a context around managers produced by `build`, which receives
    /// the shared services so custom adapters join the same recycler.
    pub fn with_managers<F>(
        config: CoreConfig,
        store: Arc<dyn StoreBackend>,
        build: F,
    ) -> Result<Self>
    where
        F: FnOnce(&CoreConfig, &ManagerServices) -> Vec<Arc<dyn PackageManager>>,
    {
        let tasks = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let services = ManagerServices {
            runner: ProcessRunner::default(),
            listings: Arc::new(TaskRecycler::new(tasks.clone(), shutdown.clone())),
            registry: Arc::new(SourceRegistry::new()),
            shutdown: shutdown.clone(),
        };

        let managers = ManagerSet::new(build(&config, &services));
        let ignored = Arc::new(IgnoredUpdatesDatabase::load(Arc::clone(&store)));
        let shortcuts = Arc::new(DesktopShortcutsDatabase::load(
            store,
            config.shortcut_dirs(),
            &config.shortcut_extensions,
        ));
        let catalog = Arc::new(PackageCatalog::new(managers.clone(), Arc::clone(&ignored)));
        let engine = OperationEngine::new(
            config.engine_settings(),
            EngineServices {
                managers: managers.clone(),
                catalog: Arc::clone(&catalog),
                ignored: Arc::clone(&ignored),
                shortcuts: Arc::clone(&shortcuts),
                runner: services.runner.clone(),
                tasks: tasks.clone(),
                shutdown: shutdown.clone(),
            },
        );
        info!(managers = ?managers.names(), "Core context ready");

        Ok(Self {
            config,
            services,
            ignored,
            shortcuts,
            catalog,
            engine,
            tasks,
            shutdown,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn services(&self) -> &ManagerServices {
        &self.services
    }

    pub fn managers(&self) -> &ManagerSet {
        self.catalog.managers()
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.services.registry
    }

    pub fn catalog(&self) -> &Arc<PackageCatalog> {
        &self.catalog
    }

    pub fn engine(&self) -> &OperationEngine {
        &self.engine
    }

    pub fn ignored_updates(&self) -> &Arc<IgnoredUpdatesDatabase> {
        &self.ignored
    }

    pub fn desktop_shortcuts(&self) -> &Arc<DesktopShortcutsDatabase> {
        &self.shortcuts
    }

    /// Cancels running operations, queries and cache evictions, then waits
    /// for every background task to finish.
    pub async fn shutdown(&self) {
        info!("Shutting down core context");
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}
