//! Domain entities shared by every layer: packages, sources, install options.

pub mod constants;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, UnipackError};

/// A named repository or feed a manager can query.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ManagerSource {
    pub name: String,
    /// Where the source lives, usually a URL.
    pub origin: String,
    /// Name of the owning manager.
    pub manager: String,
}

impl ManagerSource {
    pub fn new(name: &str, origin: &str, manager: &str) -> Self {
        Self {
            name: name.to_string(),
            origin: origin.to_string(),
            manager: manager.to_string(),
        }
    }
}

impl fmt::Display for ManagerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.manager, self.name)
    }
}

/// Caching identity of a package: `(manager, source, id)`.
///
/// The manager part is lowercased so `Winget` and `winget` collapse.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageKey {
    pub manager: String,
    pub source: String,
    pub id: String,
}

impl fmt::Display for PackageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.manager, self.source, self.id)
    }
}

/// A package as reported by one manager query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Package {
    pub id: String,
    pub name: String,
    pub installed_version: Option<String>,
    /// Present only when an update exists.
    pub available_version: Option<String>,
    pub manager: String,
    pub source: Arc<ManagerSource>,
}

impl Package {
    pub fn new(id: &str, name: &str, source: Arc<ManagerSource>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            installed_version: None,
            available_version: None,
            manager: source.manager.clone(),
            source,
        }
    }

    #[must_use]
    pub fn with_installed_version(mut self, version: Option<String>) -> Self {
        self.installed_version = version.filter(|v| !v.is_empty());
        self
    }

    #[must_use]
    pub fn with_available_version(mut self, version: Option<String>) -> Self {
        self.available_version = version.filter(|v| !v.is_empty());
        self
    }

    #[must_use]
    pub fn key(&self) -> PackageKey {
        PackageKey {
            manager: self.manager.to_lowercase(),
            source: self.source.name.clone(),
            id: self.id.clone(),
        }
    }

    /// Whether an update is known for this package.
    #[must_use]
    pub fn is_upgradable(&self) -> bool {
        self.available_version.is_some()
    }

    /// Same manager and id, regardless of the source a listing reported.
    #[must_use]
    pub fn same_package(&self, other: &Package) -> bool {
        self.manager.eq_ignore_ascii_case(&other.manager) && self.id == other.id
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.installed_version {
            Some(version) => write!(f, "{} {} ({})", self.id, version, self.manager),
            None => write!(f, "{} ({})", self.id, self.manager),
        }
    }
}

/// Metadata returned by a details query. Fields stay empty when the tool
/// does not report them.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct PackageDetails {
    pub id: String,
    pub manager: String,
    pub description: Option<String>,
    pub publisher: Option<String>,
    pub homepage: Option<String>,
    pub license: Option<String>,
    pub installer_url: Option<String>,
    pub release_notes: Option<String>,
    pub tags: Vec<String>,
}

impl PackageDetails {
    /// Details carrying only identity, returned when the query failed.
    pub fn identity_only(package: &Package) -> Self {
        Self {
            id: package.id.clone(),
            manager: package.manager.clone(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.description.is_none()
            && self.publisher.is_none()
            && self.homepage.is_none()
            && self.license.is_none()
            && self.installer_url.is_none()
            && self.release_notes.is_none()
            && self.tags.is_empty()
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Install,
    Update,
    Uninstall,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Install => "install",
            OperationKind::Update => "update",
            OperationKind::Uninstall => "uninstall",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PackageScope {
    User,
    System,
}

/// Options for one install/update/uninstall request.
///
/// A running operation never mutates its options; a retry derives a new value.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, Builder)]
#[builder(setter(into), default)]
#[serde(default)]
pub struct InstallOptions {
    /// `None` lets the tool pick its default scope.
    pub scope: Option<PackageScope>,
    pub run_elevated: bool,
    pub skip_integrity_check: bool,
    pub custom_install_location: Option<PathBuf>,
    pub custom_version: Option<String>,
    /// Opaque tokens appended to the command line, in order.
    pub extra_arguments: Vec<String>,
}

impl InstallOptions {
    /// Replaces the extra arguments with the words of a shell-style string.
    pub fn with_extra_arguments_str(mut self, arguments: &str) -> Result<Self> {
        self.extra_arguments = shlex::split(arguments).ok_or_else(|| {
            UnipackError::Config(anyhow::anyhow!(
                "Unbalanced quotes in extra arguments: {arguments}"
            ))
        })?;
        Ok(self)
    }
}
