//! The contracts every package manager fulfils.
//!
//! [`PackageManager`] is what the loader and the operation engine talk to.
//! [`ManagerBackend`] is the smaller per-tool piece plugged into
//! [`CliManager`](crate::managers::CliManager): argv builders, output parsers
//! and failure signatures, with no I/O of its own.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::data::{InstallOptions, ManagerSource, OperationKind, Package, PackageDetails};
use crate::errors::Result;
use crate::operations::retry::{FailureClass, FailureSignature};
use crate::process::{CapturedOutput, CommandSpec, OutputLine};

/// What a manager can do beyond the mandatory listings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ManagerCapabilities {
    pub search: bool,
    pub details: bool,
    /// Multiple repositories that can be listed, added and removed.
    pub sources: bool,
    pub scope: bool,
    pub custom_version: bool,
    pub custom_location: bool,
    pub skip_integrity_check: bool,
}

#[async_trait]
pub trait PackageManager: Send + Sync + fmt::Debug {
    /// Stable identifier, e.g. `winget`.
    fn name(&self) -> &str;

    fn display_name(&self) -> &str;

    fn capabilities(&self) -> ManagerCapabilities;

    /// Whether the executable can be found.
    async fn is_available(&self) -> bool;

    /// Packages matching `query`. Empty on any failure.
    async fn search(&self, query: &str) -> Arc<Vec<Package>>;

    /// Installed packages. Empty on any failure.
    async fn list_installed(&self) -> Arc<Vec<Package>>;

    /// Installed packages with an update available. Empty on any failure.
    async fn list_upgradable(&self) -> Arc<Vec<Package>>;

    /// Details for `package`, identity-only on any failure.
    async fn get_details(&self, package: &Package) -> Arc<PackageDetails>;

    /// Configured sources. Managers without the sources capability return
    /// `Unsupported`; failing queries return an empty list.
    async fn list_sources(&self) -> Result<Vec<Arc<ManagerSource>>>;

    async fn add_source(&self, source: &ManagerSource) -> Result<()>;

    async fn remove_source(&self, source: &ManagerSource) -> Result<()>;

    /// The full command for an install, update or uninstall, honouring
    /// `options` (elevation included). The engine bounds it by
    /// [`operation_timeout`](Self::operation_timeout).
    fn operation_command(
        &self,
        kind: OperationKind,
        package: &Package,
        options: &InstallOptions,
    ) -> Result<CommandSpec>;

    fn is_success(&self, kind: OperationKind, exit_code: i32) -> bool;

    fn classify_failure(
        &self,
        kind: OperationKind,
        exit_code: Option<i32>,
        output: &[OutputLine],
    ) -> FailureClass;

    /// Drops cached listings so the next query runs the tool again.
    fn invalidate_listings(&self);

    fn operation_timeout(&self) -> Duration;

    /// How many operations of this manager may run at once.
    fn parallelism(&self) -> usize;
}

/// Which query produced a piece of output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Search,
    Installed,
    Upgradable,
    Details,
    Sources,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Search => "search",
            QueryKind::Installed => "installed",
            QueryKind::Upgradable => "upgradable",
            QueryKind::Details => "details",
            QueryKind::Sources => "sources",
        }
    }
}

/// A package row as the tool printed it, before sources are resolved.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedPackage {
    pub id: String,
    pub name: String,
    pub version: Option<String>,
    pub available: Option<String>,
    /// `None` means the manager's default source.
    pub source: Option<String>,
}

impl ParsedPackage {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    #[must_use]
    pub fn available(mut self, available: &str) -> Self {
        self.available = Some(available.to_string());
        self
    }

    #[must_use]
    pub fn source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }
}

/// Per-tool knowledge plugged into the shared CLI adapter.
///
/// Argv builders return arguments only; the executable comes from
/// configuration. `None` from an optional builder means the tool cannot do it.
pub trait ManagerBackend: Send + Sync + fmt::Debug + 'static {
    fn name(&self) -> &str;

    fn display_name(&self) -> &str {
        self.name()
    }

    fn default_executable(&self) -> &str;

    fn capabilities(&self) -> ManagerCapabilities;

    /// `(name, origin)` of the source packages belong to when the tool does
    /// not say.
    fn default_source(&self) -> (&str, &str);

    /// Environment applied to every invocation.
    fn environment(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    fn search_args(&self, _query: &str) -> Option<Vec<String>> {
        None
    }

    fn installed_args(&self) -> Vec<String>;

    fn upgradable_args(&self) -> Vec<String>;

    fn details_args(&self, _package: &Package) -> Option<Vec<String>> {
        None
    }

    fn sources_args(&self) -> Option<Vec<String>> {
        None
    }

    fn add_source_args(&self, _source: &ManagerSource) -> Option<Vec<String>> {
        None
    }

    fn remove_source_args(&self, _source: &ManagerSource) -> Option<Vec<String>> {
        None
    }

    fn operation_args(
        &self,
        kind: OperationKind,
        package: &Package,
        options: &InstallOptions,
    ) -> Vec<String>;

    /// Whether a query exit code still carries usable output.
    fn query_succeeded(&self, _query: QueryKind, exit_code: i32) -> bool {
        exit_code == 0
    }

    fn operation_succeeded(&self, _kind: OperationKind, exit_code: i32) -> bool {
        exit_code == 0
    }

    fn parse_packages(
        &self,
        query: QueryKind,
        output: &CapturedOutput,
    ) -> Result<Vec<ParsedPackage>>;

    fn parse_details(
        &self,
        _package: &Package,
        _output: &CapturedOutput,
    ) -> Result<PackageDetails> {
        Ok(PackageDetails::default())
    }

    /// `(name, origin)` pairs.
    fn parse_sources(&self, _output: &CapturedOutput) -> Result<Vec<(String, String)>> {
        Ok(Vec::new())
    }

    /// Tool-specific transient failure markers, checked before the common ones.
    fn failure_signatures(&self) -> &[FailureSignature] {
        &[]
    }
}
