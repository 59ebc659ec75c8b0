//! Core configuration loaded from an optional TOML file and `UNIPACK_*`
//! environment variables.
//!
//! Nested keys use a double underscore in the environment, e.g.
//! `UNIPACK_MANAGERS__WINGET__PARALLELISM=2`. List values are comma separated.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use config::{Config, Environment, File, FileFormat};
use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use validator::Validate;

use crate::data::constants::{
    DEFAULT_ELEVATOR, DEFAULT_LISTING_CACHE_SECS, DEFAULT_MAX_PARALLEL_OPERATIONS,
    DEFAULT_MAX_RETRIES, DEFAULT_OPERATION_TIMEOUT_SECS, DEFAULT_QUERY_TIMEOUT_SECS,
    DEFAULT_SHORTCUT_EXTENSIONS, ENV_PREFIX,
};
use crate::errors::{Result, UnipackError};
use crate::managers::ManagerSettings;
use crate::operations::EngineSettings;

/// Per-manager overrides. Unset values fall back to the global ones.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Validate)]
#[serde(default)]
pub struct ManagerConfig {
    pub enabled: bool,
    pub executable: Option<String>,
    #[validate(range(min = 1))]
    pub operation_timeout_secs: Option<u64>,
    #[validate(range(min = 1))]
    pub query_timeout_secs: Option<u64>,
    /// Operations of this manager that may run at once.
    #[validate(range(min = 1, max = 16))]
    pub parallelism: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            executable: None,
            operation_timeout_secs: None,
            query_timeout_secs: None,
            parallelism: 1,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Validate)]
#[serde(default)]
pub struct CoreConfig {
    #[validate(range(min = 1, max = 64))]
    pub max_parallel_operations: usize,
    #[validate(range(max = 10))]
    pub max_retries: u32,
    #[validate(range(min = 1))]
    pub operation_timeout_secs: u64,
    #[validate(range(min = 1))]
    pub query_timeout_secs: u64,
    pub listing_cache_secs: u64,
    pub verify_after_operation: bool,
    /// Where decision stores live. Defaults to the platform data directory.
    pub store_dir: Option<PathBuf>,
    /// Watched for new shortcuts after installs. Defaults to the desktop.
    pub shortcut_dirs: Option<Vec<PathBuf>>,
    pub shortcut_extensions: Vec<String>,
    /// Command prefix for elevated operations.
    #[validate(length(min = 1))]
    pub elevator: Vec<String>,
    #[validate(nested)]
    pub managers: HashMap<String, ManagerConfig>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_parallel_operations: DEFAULT_MAX_PARALLEL_OPERATIONS,
            max_retries: DEFAULT_MAX_RETRIES,
            operation_timeout_secs: DEFAULT_OPERATION_TIMEOUT_SECS,
            query_timeout_secs: DEFAULT_QUERY_TIMEOUT_SECS,
            listing_cache_secs: DEFAULT_LISTING_CACHE_SECS,
            verify_after_operation: true,
            store_dir: None,
            shortcut_dirs: None,
            shortcut_extensions: DEFAULT_SHORTCUT_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            elevator: DEFAULT_ELEVATOR.iter().map(|s| s.to_string()).collect(),
            managers: HashMap::new(),
        }
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("elevator")
        .with_list_parse_key("shortcut_dirs")
        .with_list_parse_key("shortcut_extensions")
}

impl CoreConfig {
    /// Loads `path` if it exists, then applies environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Loading configuration");
        let settings = Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml).required(false))
            .add_source(environment())
            .build()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
        let config: CoreConfig = settings
            .try_deserialize()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        config.validate()?;
        info!(
            path = %path.display(),
            managers = config.managers.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Parses TOML text without consulting the environment.
    pub fn load_from_str(toml: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .context("Failed to parse configuration")?;
        let config: CoreConfig = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration from the environment alone.
    pub fn from_env() -> Result<Self> {
        let settings = Config::builder()
            .add_source(environment())
            .build()
            .context("Failed to read environment configuration")?;
        let config: CoreConfig = settings.try_deserialize().context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn manager(&self, name: &str) -> Option<&ManagerConfig> {
        self.managers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, config)| config)
    }

    /// Managers without an entry are enabled.
    pub fn is_manager_enabled(&self, name: &str) -> bool {
        self.manager(name).map_or(true, |m| m.enabled)
    }

    pub fn manager_settings(&self, name: &str) -> ManagerSettings {
        let overrides = self.manager(name).cloned().unwrap_or_default();
        ManagerSettings {
            executable: overrides.executable,
            query_timeout: Duration::from_secs(
                overrides.query_timeout_secs.unwrap_or(self.query_timeout_secs),
            ),
            operation_timeout: Duration::from_secs(
                overrides
                    .operation_timeout_secs
                    .unwrap_or(self.operation_timeout_secs),
            ),
            listing_cache: Duration::from_secs(self.listing_cache_secs),
            parallelism: overrides.parallelism,
            elevator: self.elevator.clone(),
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            max_parallel_operations: self.max_parallel_operations,
            max_retries: self.max_retries,
            verify_after_operation: self.verify_after_operation,
        }
    }

    pub fn store_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.store_dir {
            return Ok(dir.clone());
        }
        ProjectDirs::from("", "", "unipack")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .ok_or_else(|| {
                UnipackError::Config(anyhow::anyhow!(
                    "No home directory found; set store_dir explicitly"
                ))
            })
    }

    /// An empty list when no desktop directory can be determined.
    pub fn shortcut_dirs(&self) -> Vec<PathBuf> {
        match &self.shortcut_dirs {
            Some(dirs) => dirs.clone(),
            None => UserDirs::new()
                .and_then(|dirs| dirs.desktop_dir().map(Path::to_path_buf))
                .into_iter()
                .collect(),
        }
    }
}
