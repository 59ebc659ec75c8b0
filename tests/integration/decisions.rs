//! Ignored updates and shortcut decisions as seen through a context.

use std::sync::Arc;

use tempfile::TempDir;
use unipack::{
    CoreConfig, CoreContext, IgnoreRule, JsonFileStore, OperationKind, OperationRequest,
    OperationState, PackageFilter, ShortcutDecision,
};

use super::{context, test_config, ScriptBackend};

fn upgradable_backend() -> ScriptBackend {
    ScriptBackend::new("script")
        .installed("echo 'app|App|1.0|'; echo 'other|Other|1.0|'")
        .upgradable("echo 'app|App|1.0|2.0'; echo 'other|Other|1.0|1.1'")
}

#[tokio::test]
async fn test_wildcard_rule_hides_update() {
    let context = context(upgradable_backend());
    let catalog = context.catalog();
    catalog.refresh_all().await;
    assert_eq!(catalog.upgradable(&PackageFilter::all()).len(), 2);

    context
        .ignored_updates()
        .add("Script", "app", IgnoreRule::AllVersions);
    let visible: Vec<_> = catalog
        .upgradable(&PackageFilter::all())
        .into_iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(visible, vec!["other"]);

    context.ignored_updates().remove("script", "app");
    assert_eq!(catalog.upgradable(&PackageFilter::all()).len(), 2);

    context.shutdown().await;
}

#[tokio::test]
async fn test_version_rule_only_hides_that_version() {
    let context = context(upgradable_backend());
    let catalog = context.catalog();
    catalog.refresh_all().await;

    context
        .ignored_updates()
        .add("script", "app", IgnoreRule::Version("2.0".to_string()));
    context
        .ignored_updates()
        .add("script", "other", IgnoreRule::Version("1.0.9".to_string()));
    let visible: Vec<_> = catalog
        .upgradable(&PackageFilter::all())
        .into_iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(visible, vec!["other"]);

    context.shutdown().await;
}

#[tokio::test]
async fn test_automatic_update_of_ignored_package_is_blocked() {
    let context = context(upgradable_backend());
    let catalog = context.catalog();
    catalog.refresh_all().await;
    context
        .ignored_updates()
        .add("script", "app", IgnoreRule::AllVersions);

    let app = catalog.upgradable_loader().find("script", "app").unwrap();
    let err = context
        .engine()
        .submit(OperationRequest::new(app.clone(), OperationKind::Update).automatic())
        .unwrap_err();
    assert_eq!(err.category(), "blocked");

    // A user-initiated update is still allowed.
    let outcome = context
        .engine()
        .submit(OperationRequest::new(app, OperationKind::Update))
        .unwrap()
        .wait()
        .await;
    assert_eq!(outcome.state, OperationState::Succeeded);

    context.shutdown().await;
}

#[tokio::test]
async fn test_decisions_persist_across_contexts() {
    let data = TempDir::new().unwrap();
    let desktop = TempDir::new().unwrap();
    let shortcut = desktop.path().join("Tool.lnk");
    let config = CoreConfig {
        store_dir: Some(data.path().to_path_buf()),
        shortcut_dirs: Some(vec![desktop.path().to_path_buf()]),
        ..test_config()
    };

    let first = CoreContext::new(config.clone()).unwrap();
    first
        .ignored_updates()
        .add("winget", "Git.Git", IgnoreRule::Version("2.45.0".to_string()));
    first
        .desktop_shortcuts()
        .record_decision(&shortcut, ShortcutDecision::Maintain);
    first.shutdown().await;

    let store = JsonFileStore::new(data.path());
    assert!(store.path_for("ignored_updates").exists());
    assert!(store.path_for("desktop_shortcuts").exists());

    let second = CoreContext::with_managers(config, Arc::new(store), |_, _| Vec::new()).unwrap();
    assert!(second.ignored_updates().is_ignored("WinGet", "Git.Git", "2.45.0"));
    assert!(!second.ignored_updates().is_ignored("winget", "Git.Git", "2.46.0"));
    assert_eq!(
        second.desktop_shortcuts().resolve(&shortcut),
        ShortcutDecision::Maintain
    );
    second.shutdown().await;
}
