use crate::data::{
    InstallOptions, ManagerSource, OperationKind, Package, PackageDetails, PackageScope,
};
use crate::errors::Result;
use crate::managers::TextTable;
use crate::operations::retry::{FailureSignature, Remediation};
use crate::process::CapturedOutput;
use crate::traits::{ManagerBackend, ManagerCapabilities, ParsedPackage, QueryKind};

static SIGNATURES: &[FailureSignature] = &[
    FailureSignature::Text("admin rights", Remediation::Elevate),
    FailureSignature::Text("hash check failed", Remediation::SkipIntegrityCheck),
];

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Scoop;

impl ManagerBackend for Scoop {
    fn name(&self) -> &str {
        "scoop"
    }

    fn display_name(&self) -> &str {
        "Scoop"
    }

    fn default_executable(&self) -> &str {
        "scoop"
    }

    fn capabilities(&self) -> ManagerCapabilities {
        ManagerCapabilities {
            search: true,
            details: true,
            sources: true,
            scope: true,
            custom_version: true,
            custom_location: false,
            skip_integrity_check: true,
        }
    }

    fn default_source(&self) -> (&str, &str) {
        ("main", "https://github.com/ScoopInstaller/Main")
    }

    fn search_args(&self, query: &str) -> Option<Vec<String>> {
        Some(strings(&["search", query]))
    }

    fn installed_args(&self) -> Vec<String> {
        strings(&["list"])
    }

    fn upgradable_args(&self) -> Vec<String> {
        strings(&["status"])
    }

    fn details_args(&self, package: &Package) -> Option<Vec<String>> {
        Some(strings(&["info", &qualified(package)]))
    }

    fn sources_args(&self) -> Option<Vec<String>> {
        Some(strings(&["bucket", "list"]))
    }

    fn add_source_args(&self, source: &ManagerSource) -> Option<Vec<String>> {
        let mut args = strings(&["bucket", "add", &source.name]);
        if !source.origin.is_empty() {
            args.push(source.origin.clone());
        }
        Some(args)
    }

    fn remove_source_args(&self, source: &ManagerSource) -> Option<Vec<String>> {
        Some(strings(&["bucket", "rm", &source.name]))
    }

    fn operation_args(
        &self,
        kind: OperationKind,
        package: &Package,
        options: &InstallOptions,
    ) -> Vec<String> {
        let mut args = match kind {
            OperationKind::Install => {
                let mut target = qualified(package);
                if let Some(version) = &options.custom_version {
                    target = format!("{target}@{version}");
                }
                strings(&["install", &target])
            }
            OperationKind::Update => strings(&["update", &package.id]),
            OperationKind::Uninstall => strings(&["uninstall", &package.id]),
        };
        if options.scope == Some(PackageScope::System) {
            args.push("--global".into());
        }
        if options.skip_integrity_check && kind != OperationKind::Uninstall {
            args.push("--skip-hash-check".into());
        }
        args.extend(options.extra_arguments.iter().cloned());
        args
    }

    fn parse_packages(
        &self,
        query: QueryKind,
        output: &CapturedOutput,
    ) -> Result<Vec<ParsedPackage>> {
        let stdout = output.stdout();
        // A notice replaces the table when there is nothing to list. `status`
        // prints "Scoop is up to date." above its table too, so only a missing
        // table means nothing is outdated.
        let nothing_found = !TextTable::is_present(&stdout)
            && match query {
                QueryKind::Upgradable => true,
                QueryKind::Search => stdout.contains("No matches found"),
                _ => stdout.contains("There aren't any apps installed"),
            };
        if nothing_found {
            return Ok(Vec::new());
        }

        let table = TextTable::parse(&stdout, self.name())?;
        let name = table.column("Name");
        let source = table.column("Source");
        let (version, available) = match query {
            QueryKind::Upgradable => (
                table.column("Installed Version"),
                table.column("Latest Version"),
            ),
            _ => (table.column("Version"), None),
        };

        Ok(table
            .rows
            .iter()
            .filter(|row| !table.cell(row, name).is_empty())
            .map(|row| {
                let app = table.cell(row, name);
                let mut package = ParsedPackage::new(app, app);
                let row_version = table.cell(row, version);
                if query != QueryKind::Search && !row_version.is_empty() {
                    package = package.version(row_version);
                }
                let row_available = table.cell(row, available);
                if !row_available.is_empty() {
                    package = package.available(row_available);
                }
                let row_source = table.cell(row, source);
                if !row_source.is_empty() {
                    package = package.source(row_source);
                }
                package
            })
            .collect())
    }

    fn parse_details(&self, _package: &Package, output: &CapturedOutput) -> Result<PackageDetails> {
        let mut details = PackageDetails::default();
        for line in output.stdout().lines() {
            let Some((key, value)) = line.split_once(" : ") else {
                continue;
            };
            let value = value.trim();
            let value = (!value.is_empty()).then(|| value.to_string());
            match key.trim() {
                "Description" => details.description = value,
                "Website" => details.homepage = value,
                "License" => details.license = value,
                "Manifest" => details.installer_url = value,
                _ => {}
            }
        }
        Ok(details)
    }

    fn parse_sources(&self, output: &CapturedOutput) -> Result<Vec<(String, String)>> {
        let table = TextTable::parse(&output.stdout(), self.name())?;
        let (name, source) = (table.column("Name"), table.column("Source"));
        Ok(table
            .rows
            .iter()
            .filter(|row| !table.cell(row, name).is_empty())
            .map(|row| {
                (
                    table.cell(row, name).to_string(),
                    table.cell(row, source).to_string(),
                )
            })
            .collect())
    }

    fn failure_signatures(&self) -> &[FailureSignature] {
        SIGNATURES
    }
}

/// `bucket/app`, which pins the install to the bucket the listing came from.
fn qualified(package: &Package) -> String {
    if package.source.name.is_empty() {
        package.id.clone()
    } else {
        format!("{}/{}", package.source.name, package.id)
    }
}
