//! The shared CLI adapter and the built-in manager variants.
//!
//! [`CliManager`] does everything that is the same for every tool: running
//! queries through the [`ProcessRunner`], deduplicating listings through the
//! [`TaskRecycler`], resolving sources, caching details, and turning every
//! query failure into an empty result. The per-tool parts live in the
//! [`ManagerBackend`] implementations of the submodules.

pub mod npm;
pub mod pip;
pub mod scoop;
pub mod winget;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::sync::Cache;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::data::constants::{
    DEFAULT_ELEVATOR, DEFAULT_LISTING_CACHE_SECS, DEFAULT_OPERATION_TIMEOUT_SECS,
    DEFAULT_QUERY_TIMEOUT_SECS, DETAILS_CACHE_CAPACITY, DETAILS_CACHE_TTL,
};
use crate::data::{
    InstallOptions, ManagerSource, OperationKind, Package, PackageDetails, PackageKey,
};
use crate::errors::{Result, UnipackError};
use crate::operations::retry::{self, FailureClass, Remediation};
use crate::process::{CapturedOutput, CommandSpec, OutputLine, ProcessOutcome, ProcessRunner};
use crate::recycler::{CallKey, TaskRecycler};
use crate::sources::SourceRegistry;
use crate::traits::{ManagerBackend, ManagerCapabilities, PackageManager, ParsedPackage, QueryKind};

pub use npm::Npm;
pub use pip::Pip;
pub use scoop::Scoop;
pub use winget::Winget;

/// Names of the variants this crate ships.
pub static BUILTIN_MANAGERS: &[&str] = &["winget", "scoop", "pip", "npm"];

/// Effective per-manager settings after configuration is applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagerSettings {
    /// Overrides the backend's default executable.
    pub executable: Option<String>,
    pub query_timeout: Duration,
    pub operation_timeout: Duration,
    /// How long installed/upgradable listings stay attachable.
    pub listing_cache: Duration,
    pub parallelism: usize,
    /// Command prefix used when an operation runs elevated.
    pub elevator: Vec<String>,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            executable: None,
            query_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
            operation_timeout: Duration::from_secs(DEFAULT_OPERATION_TIMEOUT_SECS),
            listing_cache: Duration::from_secs(DEFAULT_LISTING_CACHE_SECS),
            parallelism: 1,
            elevator: DEFAULT_ELEVATOR.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Services every manager shares, owned by the context.
#[derive(Clone, Debug)]
pub struct ManagerServices {
    pub runner: ProcessRunner,
    pub listings: Arc<TaskRecycler<Vec<Package>>>,
    pub registry: Arc<SourceRegistry>,
    /// Cancels queries still running at shutdown.
    pub shutdown: CancellationToken,
}

impl Default for ManagerServices {
    fn default() -> Self {
        Self {
            runner: ProcessRunner::default(),
            listings: Arc::new(TaskRecycler::default()),
            registry: Arc::new(SourceRegistry::new()),
            shutdown: CancellationToken::new(),
        }
    }
}

/// The part of a [`CliManager`] that query futures own.
struct CliCore<B> {
    backend: B,
    executable: String,
    settings: ManagerSettings,
    runner: ProcessRunner,
    registry: Arc<SourceRegistry>,
    shutdown: CancellationToken,
}

impl<B: ManagerBackend> CliCore<B> {
    fn command(&self, args: Vec<String>) -> CommandSpec {
        let mut spec = CommandSpec::new(self.executable.clone()).args(args);
        for (key, value) in self.backend.environment() {
            spec = spec.env(key, value);
        }
        spec
    }

    /// Runs one query and returns its output if the tool reported success.
    async fn run_query(&self, query: QueryKind, args: Vec<String>) -> Result<CapturedOutput> {
        let spec = self.command(args).timeout(self.settings.query_timeout);
        let output = self.runner.run(&spec, self.shutdown.child_token()).await?;
        match output.outcome {
            ProcessOutcome::Exited(code) if self.backend.query_succeeded(query, code) => Ok(output),
            ProcessOutcome::Exited(code) => Err(UnipackError::command_failed(
                spec.display(),
                format!("exit code {code}"),
            )),
            ProcessOutcome::TimedOut => Err(UnipackError::TimedOut {
                command: spec.display(),
                seconds: self.settings.query_timeout.as_secs(),
            }),
            ProcessOutcome::Cancelled => Err(UnipackError::Cancelled(spec.display())),
        }
    }

    async fn query_packages(&self, query: QueryKind, args: Vec<String>) -> Result<Vec<Package>> {
        let output = self.run_query(query, args).await?;
        let parsed = self.backend.parse_packages(query, &output)?;
        Ok(parsed.into_iter().map(|row| self.to_package(row)).collect())
    }

    fn to_package(&self, row: ParsedPackage) -> Package {
        let (default_name, default_origin) = self.backend.default_source();
        let source = match row.source.as_deref() {
            Some(name) if name != default_name => {
                self.registry.get_or_create(name, "", self.backend.name())
            }
            _ => self
                .registry
                .get_or_create(default_name, default_origin, self.backend.name()),
        };
        Package::new(&row.id, &row.name, source)
            .with_installed_version(row.version)
            .with_available_version(row.available)
    }

    fn unsupported(&self, capability: &'static str) -> UnipackError {
        UnipackError::Unsupported {
            manager: self.backend.name().to_string(),
            capability,
        }
    }
}

/// A [`PackageManager`] driving one CLI tool through a [`ManagerBackend`].
pub struct CliManager<B> {
    core: Arc<CliCore<B>>,
    listings: Arc<TaskRecycler<Vec<Package>>>,
    details: Cache<PackageKey, Arc<PackageDetails>>,
}

impl<B: ManagerBackend> fmt::Debug for CliManager<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CliManager")
            .field("backend", &self.core.backend)
            .field("executable", &self.core.executable)
            .finish_non_exhaustive()
    }
}

impl<B: ManagerBackend> CliManager<B> {
    pub fn new(backend: B, settings: ManagerSettings, services: &ManagerServices) -> Self {
        let executable = settings
            .executable
            .clone()
            .unwrap_or_else(|| backend.default_executable().to_string());
        Self {
            core: Arc::new(CliCore {
                backend,
                executable,
                settings,
                runner: services.runner.clone(),
                registry: Arc::clone(&services.registry),
                shutdown: services.shutdown.clone(),
            }),
            listings: Arc::clone(&services.listings),
            details: Cache::builder()
                .max_capacity(DETAILS_CACHE_CAPACITY)
                .time_to_live(DETAILS_CACHE_TTL)
                .build(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.core.backend
    }

    pub fn executable(&self) -> &str {
        &self.core.executable
    }

    /// Runs a package query through the deduplicator, empty on any failure.
    async fn recycled_listing(
        &self,
        query: QueryKind,
        args: Vec<String>,
        cache_time: Duration,
    ) -> Arc<Vec<Package>> {
        let mut key = CallKey::new(self.name(), query.as_str());
        for arg in &args {
            key = key.arg(arg.clone());
        }
        let core = Arc::clone(&self.core);
        let result = self
            .listings
            .run_or_attach(key, cache_time, move || async move {
                let result = core.query_packages(query, args).await;
                match &result {
                    Ok(packages) => debug!(
                        manager = core.backend.name(),
                        query = query.as_str(),
                        count = packages.len(),
                        "Query finished"
                    ),
                    Err(e) => warn!(
                        manager = core.backend.name(),
                        query = query.as_str(),
                        category = e.category(),
                        error = %e,
                        "Query failed, reporting no packages"
                    ),
                }
                result
            })
            .await;
        result.unwrap_or_else(|_| Arc::new(Vec::new()))
    }
}

#[async_trait]
impl<B: ManagerBackend> PackageManager for CliManager<B> {
    fn name(&self) -> &str {
        self.core.backend.name()
    }

    fn display_name(&self) -> &str {
        self.core.backend.display_name()
    }

    fn capabilities(&self) -> ManagerCapabilities {
        self.core.backend.capabilities()
    }

    async fn is_available(&self) -> bool {
        which::which(&self.core.executable).is_ok()
    }

    async fn search(&self, query: &str) -> Arc<Vec<Package>> {
        let Some(args) = self.core.backend.search_args(query) else {
            debug!(manager = self.name(), "Search not supported");
            return Arc::new(Vec::new());
        };
        self.recycled_listing(QueryKind::Search, args, Duration::ZERO)
            .await
    }

    async fn list_installed(&self) -> Arc<Vec<Package>> {
        let args = self.core.backend.installed_args();
        self.recycled_listing(QueryKind::Installed, args, self.core.settings.listing_cache)
            .await
    }

    async fn list_upgradable(&self) -> Arc<Vec<Package>> {
        let args = self.core.backend.upgradable_args();
        self.recycled_listing(QueryKind::Upgradable, args, self.core.settings.listing_cache)
            .await
    }

    async fn get_details(&self, package: &Package) -> Arc<PackageDetails> {
        let key = package.key();
        if let Some(details) = self.details.get(&key) {
            return details;
        }
        let Some(args) = self.core.backend.details_args(package) else {
            return Arc::new(PackageDetails::identity_only(package));
        };
        let result = match self.core.run_query(QueryKind::Details, args).await {
            Ok(output) => self.core.backend.parse_details(package, &output),
            Err(e) => Err(e),
        };
        match result {
            Ok(mut details) => {
                details.id = package.id.clone();
                details.manager = package.manager.clone();
                let details = Arc::new(details);
                self.details.insert(key, Arc::clone(&details));
                details
            }
            Err(e) => {
                warn!(
                    manager = self.name(),
                    package = %package.id,
                    error = %e,
                    "Details query failed"
                );
                Arc::new(PackageDetails::identity_only(package))
            }
        }
    }

    async fn list_sources(&self) -> Result<Vec<Arc<ManagerSource>>> {
        let core = &self.core;
        let args = match core.backend.sources_args() {
            Some(args) if core.backend.capabilities().sources => args,
            _ => return Err(core.unsupported("sources")),
        };
        let parsed = match core.run_query(QueryKind::Sources, args).await {
            Ok(output) => core.backend.parse_sources(&output),
            Err(e) => Err(e),
        };
        match parsed {
            Ok(pairs) => Ok(pairs
                .iter()
                .map(|(name, origin)| {
                    core.registry.get_or_create(name, origin, core.backend.name())
                })
                .collect()),
            Err(e) => {
                warn!(manager = self.name(), error = %e, "Source listing failed");
                Ok(Vec::new())
            }
        }
    }

    async fn add_source(&self, source: &ManagerSource) -> Result<()> {
        let core = &self.core;
        let args = core
            .backend
            .add_source_args(source)
            .ok_or_else(|| core.unsupported("sources"))?;
        core.run_query(QueryKind::Sources, args).await?;
        info!(manager = self.name(), source = %source.name, "Added source");
        core.registry
            .get_or_create(&source.name, &source.origin, core.backend.name());
        self.invalidate_listings();
        Ok(())
    }

    async fn remove_source(&self, source: &ManagerSource) -> Result<()> {
        let core = &self.core;
        let args = core
            .backend
            .remove_source_args(source)
            .ok_or_else(|| core.unsupported("sources"))?;
        core.run_query(QueryKind::Sources, args).await?;
        info!(manager = self.name(), source = %source.name, "Removed source");
        core.registry.remove(core.backend.name(), &source.name);
        self.invalidate_listings();
        Ok(())
    }

    fn operation_command(
        &self,
        kind: OperationKind,
        package: &Package,
        options: &InstallOptions,
    ) -> Result<CommandSpec> {
        let core = &self.core;
        let capabilities = core.backend.capabilities();
        if options.custom_version.is_some() && !capabilities.custom_version {
            return Err(core.unsupported("custom versions"));
        }
        if options.custom_install_location.is_some() && !capabilities.custom_location {
            return Err(core.unsupported("custom install locations"));
        }
        let args = core.backend.operation_args(kind, package, options);
        let spec = core.command(args);
        Ok(if options.run_elevated {
            spec.elevated(&core.settings.elevator)
        } else {
            spec
        })
    }

    fn is_success(&self, kind: OperationKind, exit_code: i32) -> bool {
        self.core.backend.operation_succeeded(kind, exit_code)
    }

    fn classify_failure(
        &self,
        _kind: OperationKind,
        exit_code: Option<i32>,
        output: &[OutputLine],
    ) -> FailureClass {
        match retry::classify(exit_code, output, self.core.backend.failure_signatures()) {
            FailureClass::Transient(Remediation::SkipIntegrityCheck)
                if !self.capabilities().skip_integrity_check =>
            {
                FailureClass::Permanent
            }
            class => class,
        }
    }

    fn invalidate_listings(&self) {
        self.listings.invalidate_scope(self.name());
    }

    fn operation_timeout(&self) -> Duration {
        self.core.settings.operation_timeout
    }

    fn parallelism(&self) -> usize {
        self.core.settings.parallelism.max(1)
    }
}

/// Builds a built-in variant by name.
pub fn builtin(
    name: &str,
    settings: ManagerSettings,
    services: &ManagerServices,
) -> Option<Arc<dyn PackageManager>> {
    let manager: Arc<dyn PackageManager> = match name.to_lowercase().as_str() {
        "winget" => Arc::new(CliManager::new(Winget, settings, services)),
        "scoop" => Arc::new(CliManager::new(Scoop, settings, services)),
        "pip" => Arc::new(CliManager::new(Pip, settings, services)),
        "npm" => Arc::new(CliManager::new(Npm, settings, services)),
        _ => return None,
    };
    Some(manager)
}

/// The managers a context works with, looked up case-insensitively.
#[derive(Clone, Debug, Default)]
pub struct ManagerSet {
    managers: Vec<Arc<dyn PackageManager>>,
}

impl ManagerSet {
    pub fn new(managers: Vec<Arc<dyn PackageManager>>) -> Self {
        Self { managers }
    }

    pub fn get(&self, name: &str) -> Result<&Arc<dyn PackageManager>> {
        self.managers
            .iter()
            .find(|m| m.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| UnipackError::UnknownManager(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn PackageManager>> {
        self.managers.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.managers.iter().map(|m| m.name()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.managers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }
}

/// A fixed-width table as printed by winget and scoop.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct TextTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl TextTable {
    /// Splits `text` into columns located by the header line and the dashed
    /// separator below it.
    pub fn parse(text: &str, manager: &str) -> Result<Self> {
        let lines: Vec<&str> = text.lines().collect();
        let separator = lines
            .iter()
            .position(|line| is_separator(line))
            .ok_or_else(|| UnipackError::parse(manager, "no table separator found"))?;
        if separator == 0 {
            return Err(UnipackError::parse(manager, "table separator without header"));
        }
        // Progress spinners share the header line on Windows consoles.
        let header = lines[separator - 1].rsplit('\r').next().unwrap_or_default();
        // A dashed separator made of groups marks columns whose header has spaces.
        let ruler = lines[separator].trim_end();
        let starts = if ruler.trim_start().contains(' ') {
            column_starts(ruler)
        } else {
            column_starts(header)
        };
        if starts.is_empty() {
            return Err(UnipackError::parse(manager, "empty table header"));
        }
        let header_chars: Vec<char> = header.chars().collect();
        let headers = split_at(&header_chars, &starts);

        let rows = lines[separator + 1..]
            .iter()
            .filter(|line| !line.trim().is_empty())
            .map(|line| split_at(&line.chars().collect::<Vec<_>>(), &starts))
            .collect();
        Ok(Self { headers, rows })
    }

    /// Whether `text` contains a dashed separator line, i.e. a table at all.
    pub fn is_present(text: &str) -> bool {
        text.lines().any(is_separator)
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h.eq_ignore_ascii_case(name))
    }

    /// The cell of `row` under column `index`; empty when either is missing.
    pub fn cell<'a>(&self, row: &'a [String], index: Option<usize>) -> &'a str {
        index
            .and_then(|i| row.get(i))
            .map(String::as_str)
            .unwrap_or_default()
    }
}

fn is_separator(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.len() >= 3 && trimmed.chars().all(|c| c == '-' || c == ' ')
}

fn column_starts(header: &str) -> Vec<usize> {
    let mut starts = Vec::new();
    let mut previous = ' ';
    for (i, c) in header.chars().enumerate() {
        if c != ' ' && previous == ' ' {
            starts.push(i);
        }
        previous = c;
    }
    starts
}

fn split_at(chars: &[char], starts: &[usize]) -> Vec<String> {
    starts
        .iter()
        .enumerate()
        .map(|(i, &start)| {
            let end = starts.get(i + 1).copied().unwrap_or(chars.len()).min(chars.len());
            let start = start.min(end);
            chars[start..end].iter().collect::<String>().trim().to_string()
        })
        .collect()
}
