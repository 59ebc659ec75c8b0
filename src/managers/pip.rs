use serde::Deserialize;

use crate::data::{InstallOptions, OperationKind, Package, PackageDetails, PackageScope};
use crate::errors::{Result, UnipackError};
use crate::process::CapturedOutput;
use crate::traits::{ManagerBackend, ManagerCapabilities, ParsedPackage, QueryKind};

#[derive(Debug, Deserialize)]
struct PipEntry {
    name: String,
    version: String,
    #[serde(default)]
    latest_version: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Pip;

impl ManagerBackend for Pip {
    fn name(&self) -> &str {
        "pip"
    }

    fn default_executable(&self) -> &str {
        "pip"
    }

    fn capabilities(&self) -> ManagerCapabilities {
        ManagerCapabilities {
            search: false,
            details: true,
            sources: false,
            scope: true,
            custom_version: true,
            custom_location: true,
            skip_integrity_check: false,
        }
    }

    fn default_source(&self) -> (&str, &str) {
        ("pypi", "https://pypi.org/simple")
    }

    fn environment(&self) -> Vec<(String, String)> {
        vec![
            ("PIP_DISABLE_PIP_VERSION_CHECK".into(), "1".into()),
            ("PYTHONIOENCODING".into(), "utf-8".into()),
        ]
    }

    fn installed_args(&self) -> Vec<String> {
        vec!["list".into(), "--format".into(), "json".into()]
    }

    fn upgradable_args(&self) -> Vec<String> {
        vec![
            "list".into(),
            "--outdated".into(),
            "--format".into(),
            "json".into(),
        ]
    }

    fn details_args(&self, package: &Package) -> Option<Vec<String>> {
        Some(vec!["show".into(), package.id.clone()])
    }

    fn operation_args(
        &self,
        kind: OperationKind,
        package: &Package,
        options: &InstallOptions,
    ) -> Vec<String> {
        let mut args: Vec<String> = match kind {
            OperationKind::Install => vec!["install".into()],
            OperationKind::Update => vec!["install".into(), "--upgrade".into()],
            OperationKind::Uninstall => vec!["uninstall".into(), "--yes".into()],
        };
        if kind != OperationKind::Uninstall {
            args.push("--no-input".into());
            if options.scope == Some(PackageScope::User) {
                args.push("--user".into());
            }
            if let Some(location) = &options.custom_install_location {
                args.extend(["--target".to_string(), location.display().to_string()]);
            }
        }
        match (&options.custom_version, kind) {
            (Some(version), OperationKind::Install | OperationKind::Update) => {
                args.push(format!("{}=={}", package.id, version))
            }
            _ => args.push(package.id.clone()),
        }
        args.extend(options.extra_arguments.iter().cloned());
        args
    }

    fn parse_packages(
        &self,
        query: QueryKind,
        output: &CapturedOutput,
    ) -> Result<Vec<ParsedPackage>> {
        let entries: Vec<PipEntry> = serde_json::from_str(output.stdout().trim())
            .map_err(|e| UnipackError::parse(self.name(), e.to_string()))?;
        Ok(entries
            .into_iter()
            .map(|entry| {
                let package = ParsedPackage::new(&entry.name, &entry.name).version(&entry.version);
                match (query, entry.latest_version) {
                    (QueryKind::Upgradable, Some(latest)) => package.available(&latest),
                    _ => package,
                }
            })
            .collect())
    }

    fn parse_details(&self, _package: &Package, output: &CapturedOutput) -> Result<PackageDetails> {
        let mut details = PackageDetails::default();
        for line in output.stdout().lines() {
            let Some((key, value)) = line.split_once(": ") else {
                continue;
            };
            let value = value.trim();
            let value = (!value.is_empty() && value != "UNKNOWN").then(|| value.to_string());
            match key {
                "Summary" => details.description = value,
                "Author" => details.publisher = value,
                "Home-page" => details.homepage = value,
                "License" => details.license = value,
                _ => {}
            }
        }
        Ok(details)
    }
}
