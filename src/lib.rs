//! unipack - one contract over many package managers
//!
//! unipack drives command-line package managers (winget, scoop, pip, npm)
//! through a single interface. It lists, searches and inspects packages,
//! runs install/update/uninstall operations with bounded automatic
//! retries, and keeps persistent decisions about ignored updates and the
//! desktop shortcuts installers leave behind.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use unipack::{CoreConfig, CoreContext, OperationKind, OperationRequest, PackageFilter};
//! use std::path::Path;
//!
//! # async fn example() -> unipack::Result<()> {
//! let config = CoreConfig::load_from(Path::new("unipack.toml"))?;
//! let context = CoreContext::new(config)?;
//!
//! context.catalog().refresh_all().await;
//! for package in context.catalog().upgradable(&PackageFilter::all()) {
//!     let handle = context
//!         .engine()
//!         .submit(OperationRequest::new(package, OperationKind::Update).automatic())?;
//!     let outcome = handle.wait().await;
//!     println!("{}: {}", handle.package(), outcome.state);
//! }
//!
//! context.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`ProcessRunner`]: spawns tools, streams their output, enforces
//!   timeouts and cancellation
//! - [`TaskRecycler`]: deduplicates concurrent identical queries and keeps
//!   results attachable for a short while
//! - [`SourceRegistry`]: one shared [`ManagerSource`] per `(manager, name)`
//! - [`PackageManager`] / [`CliManager`]: the adapter contract and the
//!   shared CLI implementation behind every built-in manager
//! - [`OperationEngine`]: the queued, retrying operation state machine
//! - [`IgnoredUpdatesDatabase`] and [`DesktopShortcutsDatabase`]: decision
//!   stores persisted through a [`StoreBackend`]
//! - [`PackageCatalog`]: installed and upgradable sets across managers
//!
//! # Error Handling
//!
//! Fallible calls return [`Result<T>`] with [`UnipackError`]. Adapter
//! queries never fail: a missing tool, a failed exit or unparsable output
//! all yield an empty result and a `tracing` warning. Operation failures are
//! reported through [`OperationOutcome`].

pub mod configuration;
pub mod context;
pub mod data;
pub mod errors;
pub mod loader;
pub mod logging;
pub mod managers;
pub mod operations;
pub mod process;
pub mod recycler;
pub mod sources;
pub mod stores;
pub mod traits;

pub use configuration::{CoreConfig, ManagerConfig};
pub use context::CoreContext;
pub use data::{
    InstallOptions, InstallOptionsBuilder, ManagerSource, OperationKind, Package, PackageDetails,
    PackageKey, PackageScope,
};
pub use errors::{Result, UnipackError};
pub use loader::{LoaderKind, PackageCatalog, PackageFilter, PackageLoader};
pub use managers::{CliManager, ManagerServices, ManagerSet, ManagerSettings};
pub use operations::{
    EngineSettings, FailureReason, OperationEngine, OperationEvent, OperationHandle,
    OperationOutcome, OperationRequest, OperationState,
};
pub use process::{CommandSpec, OutputLine, OutputStream, ProcessOutcome, ProcessRunner};
pub use recycler::{CallKey, TaskRecycler};
pub use sources::SourceRegistry;
pub use stores::{
    DesktopShortcutsDatabase, IgnoreRule, IgnoredUpdatesDatabase, JsonFileStore, MemoryStore,
    ShortcutDecision, StoreBackend,
};
pub use traits::{ManagerBackend, ManagerCapabilities, PackageManager, ParsedPackage, QueryKind};
