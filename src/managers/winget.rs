use crate::data::{
    InstallOptions, ManagerSource, OperationKind, Package, PackageDetails, PackageScope,
};
use crate::errors::Result;
use crate::managers::TextTable;
use crate::operations::retry::{FailureSignature, Remediation};
use crate::process::CapturedOutput;
use crate::traits::{ManagerBackend, ManagerCapabilities, ParsedPackage, QueryKind};

/// `APPINSTALLER_CLI_ERROR_NO_APPLICATIONS_FOUND`, returned by listings with
/// no rows.
const NO_APPLICATIONS_FOUND: i32 = 0x8A15_0014_u32 as i32;
const INSTALLER_HASH_MISMATCH: i32 = 0x8A15_0011_u32 as i32;
const COMMAND_REQUIRES_ADMIN: i32 = 0x8A15_0019_u32 as i32;

static SIGNATURES: &[FailureSignature] = &[
    FailureSignature::ExitCode(INSTALLER_HASH_MISMATCH, Remediation::SkipIntegrityCheck),
    FailureSignature::ExitCode(COMMAND_REQUIRES_ADMIN, Remediation::Elevate),
];

const COMMON_FLAGS: &[&str] = &["--accept-source-agreements", "--disable-interactivity"];

fn with_common(args: &[&str]) -> Vec<String> {
    args.iter()
        .chain(COMMON_FLAGS)
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Winget;

impl ManagerBackend for Winget {
    fn name(&self) -> &str {
        "winget"
    }

    fn display_name(&self) -> &str {
        "WinGet"
    }

    fn default_executable(&self) -> &str {
        "winget"
    }

    fn capabilities(&self) -> ManagerCapabilities {
        ManagerCapabilities {
            search: true,
            details: true,
            sources: true,
            scope: true,
            custom_version: true,
            custom_location: true,
            skip_integrity_check: true,
        }
    }

    fn default_source(&self) -> (&str, &str) {
        ("winget", "https://cdn.winget.microsoft.com/cache")
    }

    fn search_args(&self, query: &str) -> Option<Vec<String>> {
        Some(with_common(&["search", "--query", query]))
    }

    fn installed_args(&self) -> Vec<String> {
        with_common(&["list"])
    }

    fn upgradable_args(&self) -> Vec<String> {
        with_common(&["upgrade"])
    }

    fn details_args(&self, package: &Package) -> Option<Vec<String>> {
        Some(with_common(&[
            "show",
            "--id",
            &package.id,
            "--exact",
            "--source",
            &package.source.name,
        ]))
    }

    fn sources_args(&self) -> Option<Vec<String>> {
        Some(vec!["source".into(), "list".into()])
    }

    fn add_source_args(&self, source: &ManagerSource) -> Option<Vec<String>> {
        Some(with_common(&[
            "source",
            "add",
            "--name",
            &source.name,
            "--arg",
            &source.origin,
        ]))
    }

    fn remove_source_args(&self, source: &ManagerSource) -> Option<Vec<String>> {
        Some(vec![
            "source".into(),
            "remove".into(),
            "--name".into(),
            source.name.clone(),
        ])
    }

    fn operation_args(
        &self,
        kind: OperationKind,
        package: &Package,
        options: &InstallOptions,
    ) -> Vec<String> {
        let verb = match kind {
            OperationKind::Install => "install",
            OperationKind::Update => "upgrade",
            OperationKind::Uninstall => "uninstall",
        };
        let mut args = with_common(&[
            verb,
            "--id",
            &package.id,
            "--exact",
            "--source",
            &package.source.name,
            "--silent",
        ]);
        if kind != OperationKind::Uninstall {
            args.push("--accept-package-agreements".into());
            if let Some(version) = &options.custom_version {
                args.extend(["--version".to_string(), version.clone()]);
            }
            if let Some(location) = &options.custom_install_location {
                args.extend(["--location".to_string(), location.display().to_string()]);
            }
            if options.skip_integrity_check {
                args.push("--ignore-security-hash".into());
            }
        }
        match options.scope {
            Some(PackageScope::User) => args.extend(["--scope".into(), "user".into()]),
            Some(PackageScope::System) => args.extend(["--scope".into(), "machine".into()]),
            None => {}
        }
        args.extend(options.extra_arguments.iter().cloned());
        args
    }

    fn query_succeeded(&self, query: QueryKind, exit_code: i32) -> bool {
        exit_code == 0 || (exit_code == NO_APPLICATIONS_FOUND && query != QueryKind::Details)
    }

    fn parse_packages(
        &self,
        query: QueryKind,
        output: &CapturedOutput,
    ) -> Result<Vec<ParsedPackage>> {
        if output.outcome.exit_code() == Some(NO_APPLICATIONS_FOUND) {
            return Ok(Vec::new());
        }
        let stdout = output.stdout();
        // `winget upgrade` prints nothing but a notice when all is current.
        if query == QueryKind::Upgradable && !stdout.contains("---") {
            return Ok(Vec::new());
        }
        let table = TextTable::parse(&stdout, self.name())?;
        let (name, id, version, available, source) = (
            table.column("Name"),
            table.column("Id"),
            table.column("Version"),
            table.column("Available"),
            table.column("Source"),
        );

        let mut packages = Vec::new();
        for row in &table.rows {
            let package_id = table.cell(row, id);
            let package_version = table.cell(row, version);
            // Footer lines such as "3 upgrades available." have no id column.
            if package_id.is_empty() || package_version.is_empty() {
                continue;
            }
            let mut package = ParsedPackage::new(package_id, table.cell(row, name));
            match query {
                // Search reports the catalog version, not an installed one.
                QueryKind::Search => {}
                _ => package = package.version(package_version),
            }
            let package_available = table.cell(row, available);
            if !package_available.is_empty() {
                package = package.available(package_available);
            }
            let package_source = table.cell(row, source);
            if !package_source.is_empty() {
                package = package.source(package_source);
            }
            packages.push(package);
        }
        Ok(packages)
    }

    fn parse_details(&self, _package: &Package, output: &CapturedOutput) -> Result<PackageDetails> {
        let mut details = PackageDetails::default();
        let mut in_tags = false;
        for line in output.stdout().lines() {
            let indented = line.starts_with(' ');
            let trimmed = line.trim();
            if in_tags && indented && !trimmed.contains(": ") {
                details.tags.push(trimmed.to_string());
                continue;
            }
            in_tags = false;
            let Some((key, value)) = trimmed.split_once(':') else {
                continue;
            };
            let value = value.trim();
            let value = (!value.is_empty()).then(|| value.to_string());
            match key.trim() {
                "Description" => details.description = value,
                "Publisher" => details.publisher = value,
                "Homepage" => details.homepage = value,
                "License" => details.license = value,
                "Installer Url" => details.installer_url = value,
                "Release Notes" => details.release_notes = value,
                "Tags" => in_tags = true,
                _ => {}
            }
        }
        Ok(details)
    }

    fn parse_sources(&self, output: &CapturedOutput) -> Result<Vec<(String, String)>> {
        let table = TextTable::parse(&output.stdout(), self.name())?;
        let (name, argument) = (table.column("Name"), table.column("Argument"));
        Ok(table
            .rows
            .iter()
            .filter(|row| !table.cell(row, name).is_empty())
            .map(|row| {
                (
                    table.cell(row, name).to_string(),
                    table.cell(row, argument).to_string(),
                )
            })
            .collect())
    }

    fn failure_signatures(&self) -> &[FailureSignature] {
        SIGNATURES
    }
}
