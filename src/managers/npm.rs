use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::data::{InstallOptions, OperationKind, Package, PackageDetails};
use crate::errors::{Result, UnipackError};
use crate::process::CapturedOutput;
use crate::traits::{ManagerBackend, ManagerCapabilities, ParsedPackage, QueryKind};

#[derive(Debug, Deserialize)]
struct ListOutput {
    #[serde(default)]
    dependencies: BTreeMap<String, ListedDependency>,
}

#[derive(Debug, Deserialize)]
struct ListedDependency {
    #[serde(default)]
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OutdatedEntry {
    #[serde(default)]
    current: Option<String>,
    latest: String,
}

#[derive(Debug, Deserialize)]
struct SearchEntry {
    name: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Npm;

impl Npm {
    fn json<T: DeserializeOwned>(&self, text: &str) -> Result<T> {
        serde_json::from_str(text).map_err(|e| UnipackError::parse(self.name(), e.to_string()))
    }
}

impl ManagerBackend for Npm {
    fn name(&self) -> &str {
        "npm"
    }

    fn default_executable(&self) -> &str {
        if cfg!(windows) {
            "npm.cmd"
        } else {
            "npm"
        }
    }

    fn capabilities(&self) -> ManagerCapabilities {
        ManagerCapabilities {
            search: true,
            details: true,
            sources: false,
            scope: false,
            custom_version: true,
            custom_location: true,
            skip_integrity_check: false,
        }
    }

    fn default_source(&self) -> (&str, &str) {
        ("npmjs", "https://registry.npmjs.org")
    }

    fn environment(&self) -> Vec<(String, String)> {
        vec![("NO_UPDATE_NOTIFIER".into(), "1".into())]
    }

    fn search_args(&self, query: &str) -> Option<Vec<String>> {
        Some(vec!["search".into(), query.to_string(), "--json".into()])
    }

    fn installed_args(&self) -> Vec<String> {
        vec![
            "list".into(),
            "--global".into(),
            "--depth=0".into(),
            "--json".into(),
        ]
    }

    fn upgradable_args(&self) -> Vec<String> {
        vec!["outdated".into(), "--global".into(), "--json".into()]
    }

    fn details_args(&self, package: &Package) -> Option<Vec<String>> {
        Some(vec!["view".into(), package.id.clone(), "--json".into()])
    }

    fn operation_args(
        &self,
        kind: OperationKind,
        package: &Package,
        options: &InstallOptions,
    ) -> Vec<String> {
        let target = match (&options.custom_version, kind) {
            (Some(version), OperationKind::Install) => format!("{}@{}", package.id, version),
            (None, OperationKind::Update) => format!("{}@latest", package.id),
            (Some(version), OperationKind::Update) => format!("{}@{}", package.id, version),
            _ => package.id.clone(),
        };
        let verb = match kind {
            OperationKind::Install | OperationKind::Update => "install",
            OperationKind::Uninstall => "uninstall",
        };
        let mut args = vec![verb.to_string(), "--global".into(), target];
        if let Some(location) = &options.custom_install_location {
            args.extend(["--prefix".to_string(), location.display().to_string()]);
        }
        args.extend(options.extra_arguments.iter().cloned());
        args
    }

    /// `npm outdated` exits with 1 whenever something is outdated, and
    /// `npm ls` does so on peer or extraneous dependency problems while still
    /// printing the full tree.
    fn query_succeeded(&self, query: QueryKind, exit_code: i32) -> bool {
        match query {
            QueryKind::Upgradable | QueryKind::Installed => matches!(exit_code, 0 | 1),
            _ => exit_code == 0,
        }
    }

    fn parse_packages(
        &self,
        query: QueryKind,
        output: &CapturedOutput,
    ) -> Result<Vec<ParsedPackage>> {
        let stdout = output.stdout();
        let text = stdout.trim();
        match query {
            QueryKind::Upgradable => {
                if text.is_empty() {
                    return Ok(Vec::new());
                }
                let entries: BTreeMap<String, OutdatedEntry> = self.json(text)?;
                Ok(entries
                    .into_iter()
                    .map(|(name, entry)| {
                        let package = ParsedPackage::new(&name, &name).available(&entry.latest);
                        match entry.current {
                            Some(current) => package.version(&current),
                            None => package,
                        }
                    })
                    .collect())
            }
            QueryKind::Search => {
                let entries: Vec<SearchEntry> = self.json(text)?;
                Ok(entries
                    .into_iter()
                    .map(|entry| ParsedPackage::new(&entry.name, &entry.name))
                    .collect())
            }
            _ => {
                let list: ListOutput = self.json(text)?;
                Ok(list
                    .dependencies
                    .into_iter()
                    .map(|(name, dependency)| {
                        let package = ParsedPackage::new(&name, &name);
                        match dependency.version {
                            Some(version) => package.version(&version),
                            None => package,
                        }
                    })
                    .collect())
            }
        }
    }

    fn parse_details(&self, _package: &Package, output: &CapturedOutput) -> Result<PackageDetails> {
        let view: Value = self.json(output.stdout().trim())?;
        let text = |field: &str| view.get(field).and_then(Value::as_str).map(str::to_string);
        let license = match view.get("license") {
            Some(Value::String(license)) => Some(license.clone()),
            Some(Value::Object(license)) => license
                .get("type")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        };
        let publisher = match view.get("author") {
            Some(Value::String(author)) => Some(author.clone()),
            Some(Value::Object(author)) => {
                author.get("name").and_then(Value::as_str).map(str::to_string)
            }
            _ => None,
        };
        Ok(PackageDetails {
            description: text("description"),
            homepage: text("homepage"),
            installer_url: view
                .pointer("/dist/tarball")
                .and_then(Value::as_str)
                .map(str::to_string),
            license,
            publisher,
            tags: view
                .get("keywords")
                .and_then(Value::as_array)
                .map(|keywords| {
                    keywords
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            ..PackageDetails::default()
        })
    }
}
