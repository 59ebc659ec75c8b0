//! Listing deduplication, fail-safe adapters and source identity.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use unipack::{ManagerSettings, PackageFilter, PackageManager};

use super::{context, context_with, count_lines, sh_path, test_config, test_settings, ScriptBackend};

#[tokio::test]
async fn test_concurrent_listings_share_one_process() {
    let dir = TempDir::new().unwrap();
    let counter = dir.path().join("runs");
    let backend = ScriptBackend::new("script").installed(format!(
        "echo run >> {}; sleep 2; echo 'git|Git|2.45.0|'",
        sh_path(&counter)
    ));
    let context = context(backend);
    let manager = context.managers().get("script").unwrap().clone();

    let started = Instant::now();
    let (first, second) = tokio::join!(manager.list_installed(), manager.list_installed());
    let elapsed = started.elapsed();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].installed_version.as_deref(), Some("2.45.0"));
    assert_eq!(count_lines(&counter), 1);
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_millis(3500), "took {elapsed:?}");

    // Still attachable within the listing cache time.
    let third = manager.list_installed().await;
    assert!(Arc::ptr_eq(&first, &third));
    assert_eq!(count_lines(&counter), 1);

    context.shutdown().await;
}

#[tokio::test]
async fn test_invalidated_listing_runs_again() {
    let dir = TempDir::new().unwrap();
    let counter = dir.path().join("runs");
    let backend = ScriptBackend::new("script").installed(format!(
        "echo run >> {}; echo 'git|Git|1.0|'",
        sh_path(&counter)
    ));
    let context = context(backend);
    let manager = context.managers().get("script").unwrap().clone();

    manager.list_installed().await;
    manager.invalidate_listings();
    manager.list_installed().await;
    assert_eq!(count_lines(&counter), 2);

    context.shutdown().await;
}

#[tokio::test]
async fn test_missing_executable_yields_empty_listings() {
    let settings = ManagerSettings {
        executable: Some("/nonexistent/unipack-tool".to_string()),
        ..test_settings()
    };
    let context = context_with(ScriptBackend::new("script"), settings, test_config());
    let manager = context.managers().get("script").unwrap().clone();

    assert!(!manager.is_available().await);
    assert!(manager.list_installed().await.is_empty());
    assert!(manager.list_upgradable().await.is_empty());
    assert!(manager.search("git").await.is_empty());

    context.shutdown().await;
}

#[tokio::test]
async fn test_failed_exit_yields_empty_listing() {
    let backend = ScriptBackend::new("script").installed("echo 'git|Git|1.0|'; exit 3");
    let context = context(backend);
    let manager = context.managers().get("script").unwrap().clone();
    assert!(manager.list_installed().await.is_empty());
    context.shutdown().await;
}

#[tokio::test]
async fn test_unparsable_output_yields_empty_listing() {
    let backend = ScriptBackend::new("script").installed("echo 'this is not a table'");
    let context = context(backend);
    let manager = context.managers().get("script").unwrap().clone();
    assert!(manager.list_installed().await.is_empty());
    context.shutdown().await;
}

#[tokio::test]
async fn test_packages_share_registered_sources() {
    let backend = ScriptBackend::new("script")
        .installed("echo 'a|A|1.0||extras'; echo 'b|B|1.0||extras'; echo 'c|C|1.0|'")
        .upgradable("echo 'a|A|1.0|2.0|extras'");
    let context = context(backend);
    let manager = context.managers().get("script").unwrap().clone();

    let installed = manager.list_installed().await;
    let upgradable = manager.list_upgradable().await;

    assert!(Arc::ptr_eq(&installed[0].source, &installed[1].source));
    assert!(Arc::ptr_eq(&installed[0].source, &upgradable[0].source));
    assert_eq!(installed[2].source.name, "script");
    assert_eq!(installed[2].source.origin, "file:///scripts");
    assert_eq!(context.registry().sources_for("script").len(), 2);

    context.shutdown().await;
}

#[tokio::test]
async fn test_catalog_refresh_and_search() {
    let backend = ScriptBackend::new("script")
        .installed("echo 'git|Git|2.44.0|'; echo 'curl|curl|8.0|'")
        .upgradable("echo 'git|Git|2.44.0|2.45.0'")
        .search("echo \"$1|Match for $1||\"");
    let context = context(backend);
    let catalog = context.catalog();

    catalog.refresh_all().await;
    assert_eq!(catalog.installed(&PackageFilter::all()).len(), 2);
    assert_eq!(
        catalog.installed(&PackageFilter::all().matching("CUR"))[0].id,
        "curl"
    );
    let upgradable = catalog.upgradable(&PackageFilter::all());
    assert_eq!(upgradable.len(), 1);
    assert_eq!(upgradable[0].available_version.as_deref(), Some("2.45.0"));

    let found = catalog.search("ripgrep").await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].name, "Match for ripgrep");

    context.shutdown().await;
}

#[tokio::test]
async fn test_npm_listing_survives_dependency_problems() {
    use std::os::unix::fs::PermissionsExt;
    use unipack::managers::Npm;
    use unipack::{CliManager, CoreContext, MemoryStore};

    let dir = TempDir::new().unwrap();
    let executable = dir.path().join("npm");
    std::fs::write(
        &executable,
        "#!/bin/sh\n\
         echo '{\"name\": \"lib\", \"problems\": [\"extraneous: left-pad\"],'\n\
         echo ' \"dependencies\": {\"typescript\": {\"version\": \"5.4.5\"}}}'\n\
         exit 1\n",
    )
    .unwrap();
    std::fs::set_permissions(&executable, std::fs::Permissions::from_mode(0o755)).unwrap();

    let settings = ManagerSettings {
        executable: Some(executable.display().to_string()),
        ..test_settings()
    };
    let context =
        CoreContext::with_managers(test_config(), Arc::new(MemoryStore::new()), move |_, services| {
            vec![Arc::new(CliManager::new(Npm, settings, services))]
        })
        .unwrap();
    let npm = context.managers().get("npm").unwrap().clone();

    let installed = npm.list_installed().await;
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].id, "typescript");
    assert_eq!(installed[0].installed_version.as_deref(), Some("5.4.5"));

    context.shutdown().await;
}
