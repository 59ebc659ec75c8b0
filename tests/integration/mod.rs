//! Integration test modules for unipack
//!
//! Every test here drives the real process runner against small `sh` scripts
//! standing in for package manager executables, so they only run on unix.

#![cfg(unix)]

pub mod decisions;
pub mod listings;
pub mod operations;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use unipack::errors::{Result, UnipackError};
use unipack::process::CapturedOutput;
use unipack::{
    CliManager, CoreConfig, CoreContext, InstallOptions, ManagerBackend, ManagerCapabilities,
    ManagerSettings, MemoryStore, OperationKind, Package, ParsedPackage, QueryKind,
};

/// A manager whose every command is a shell script.
///
/// Listing scripts print one package per line as `id|name|version|available`
/// with an optional fifth `|source` column. Operation scripts receive
/// `$1 = kind`, `$2 = package id` and `$3 = skip` when integrity checks are
/// disabled.
#[derive(Debug, Clone)]
pub struct ScriptBackend {
    pub name: String,
    pub installed: String,
    pub upgradable: String,
    pub search: String,
    pub operation: String,
    pub capabilities: ManagerCapabilities,
}

impl ScriptBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            installed: "true".to_string(),
            upgradable: "true".to_string(),
            search: "true".to_string(),
            operation: "true".to_string(),
            capabilities: ManagerCapabilities {
                search: true,
                skip_integrity_check: true,
                ..ManagerCapabilities::default()
            },
        }
    }

    pub fn installed(mut self, script: impl Into<String>) -> Self {
        self.installed = script.into();
        self
    }

    pub fn upgradable(mut self, script: impl Into<String>) -> Self {
        self.upgradable = script.into();
        self
    }

    pub fn search(mut self, script: impl Into<String>) -> Self {
        self.search = script.into();
        self
    }

    pub fn operation(mut self, script: impl Into<String>) -> Self {
        self.operation = script.into();
        self
    }

    pub fn capabilities(mut self, capabilities: ManagerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

fn script(body: &str) -> Vec<String> {
    vec!["-c".to_string(), body.to_string()]
}

impl ManagerBackend for ScriptBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_executable(&self) -> &str {
        "sh"
    }

    fn capabilities(&self) -> ManagerCapabilities {
        self.capabilities
    }

    fn default_source(&self) -> (&str, &str) {
        ("script", "file:///scripts")
    }

    fn search_args(&self, query: &str) -> Option<Vec<String>> {
        let mut args = script(&self.search);
        args.extend(["sh".to_string(), query.to_string()]);
        Some(args)
    }

    fn installed_args(&self) -> Vec<String> {
        script(&self.installed)
    }

    fn upgradable_args(&self) -> Vec<String> {
        script(&self.upgradable)
    }

    fn operation_args(
        &self,
        kind: OperationKind,
        package: &Package,
        options: &InstallOptions,
    ) -> Vec<String> {
        let mut args = script(&self.operation);
        args.extend([
            "sh".to_string(),
            kind.as_str().to_string(),
            package.id.clone(),
        ]);
        if options.skip_integrity_check {
            args.push("skip".to_string());
        }
        args
    }

    fn parse_packages(
        &self,
        _query: QueryKind,
        output: &CapturedOutput,
    ) -> Result<Vec<ParsedPackage>> {
        output
            .stdout()
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                let fields: Vec<&str> = line.split('|').collect();
                if fields.len() < 4 {
                    return Err(UnipackError::parse(&self.name, format!("bad row: {line}")));
                }
                let mut package = ParsedPackage::new(fields[0], fields[1]);
                if !fields[2].is_empty() {
                    package = package.version(fields[2]);
                }
                if !fields[3].is_empty() {
                    package = package.available(fields[3]);
                }
                if let Some(source) = fields.get(4) {
                    package = package.source(source);
                }
                Ok(package)
            })
            .collect()
    }
}

/// Settings with an elevator that only marks the environment.
pub fn test_settings() -> ManagerSettings {
    ManagerSettings {
        query_timeout: Duration::from_secs(10),
        operation_timeout: Duration::from_secs(30),
        listing_cache: Duration::from_secs(15),
        elevator: vec!["env".to_string(), "ELEVATED=1".to_string()],
        ..ManagerSettings::default()
    }
}

/// Defaults that never touch the real desktop or data directory.
pub fn test_config() -> CoreConfig {
    CoreConfig {
        shortcut_dirs: Some(Vec::new()),
        verify_after_operation: false,
        ..CoreConfig::default()
    }
}

pub fn context_with(
    backend: ScriptBackend,
    settings: ManagerSettings,
    config: CoreConfig,
) -> CoreContext {
    CoreContext::with_managers(config, Arc::new(MemoryStore::new()), move |_, services| {
        vec![Arc::new(CliManager::new(backend, settings, services))]
    })
    .unwrap()
}

pub fn context(backend: ScriptBackend) -> CoreContext {
    context_with(backend, test_settings(), test_config())
}

/// Quotes a path for embedding in a script.
pub fn sh_path(path: &Path) -> String {
    format!("'{}'", path.display())
}

pub fn count_lines(path: &PathBuf) -> usize {
    std::fs::read_to_string(path)
        .map(|text| text.lines().count())
        .unwrap_or(0)
}

pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}
