//! Operation lifecycle: retries, cancellation, timeouts and side effects.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use unipack::process::OutputStream;
use unipack::{
    CoreConfig, FailureReason, InstallOptions, ManagerCapabilities, ManagerSettings,
    ManagerSource, OperationEvent, OperationKind, OperationRequest, OperationState, Package,
    ShortcutDecision,
};

use super::{
    context, context_with, sh_path, test_config, test_settings, wait_until, ScriptBackend,
};

fn package(id: &str) -> Package {
    let source = Arc::new(ManagerSource::new("script", "file:///scripts", "script"));
    Package::new(id, id, source)
}

fn install(id: &str) -> OperationRequest {
    OperationRequest::new(package(id), OperationKind::Install)
}

#[tokio::test]
async fn test_elevation_retry_then_success() {
    let dir = TempDir::new().unwrap();
    let state = dir.path().join("installed");
    let backend = ScriptBackend::new("script")
        .installed(format!(
            "if [ -f {state} ]; then echo 'tool|Tool|1.0|'; fi",
            state = sh_path(&state)
        ))
        .operation(format!(
            "if [ \"$ELEVATED\" = 1 ]; then touch {state}; echo installed; \
             else echo 'Installer requires elevation' >&2; exit 1; fi",
            state = sh_path(&state)
        ));
    let config = CoreConfig {
        verify_after_operation: true,
        ..test_config()
    };
    let context = context_with(backend, test_settings(), config);

    let handle = context.engine().submit(install("tool")).unwrap();
    let outcome = handle.wait().await;

    assert_eq!(outcome.state, OperationState::Succeeded, "{outcome:?}");
    assert_eq!(outcome.retries, 1);
    assert_eq!(outcome.exit_code, Some(0));
    assert!(handle.options().run_elevated);

    let texts: Vec<_> = outcome.log.iter().map(|l| l.text.as_str()).collect();
    assert_eq!(texts, vec!["Installer requires elevation", "installed"]);
    assert_eq!(outcome.log[0].stream, OutputStream::Stderr);

    assert!(context.catalog().installed_loader().contains("script", "tool"));
    assert!(wait_until(|| context.engine().active_operations().is_empty()).await);

    context.shutdown().await;
}

#[tokio::test]
async fn test_integrity_retry_passes_skip_flag() {
    let backend = ScriptBackend::new("script").operation(
        "if [ \"$3\" = skip ]; then echo ok; else echo 'Installer hash mismatch'; exit 2; fi",
    );
    let context = context(backend);

    let outcome = context.engine().submit(install("tool")).unwrap().wait().await;
    assert_eq!(outcome.state, OperationState::Succeeded);
    assert_eq!(outcome.retries, 1);

    context.shutdown().await;
}

#[tokio::test]
async fn test_integrity_retry_needs_capability() {
    let backend = ScriptBackend::new("script")
        .capabilities(ManagerCapabilities::default())
        .operation("echo 'Installer hash mismatch'; exit 2");
    let context = context(backend);

    let outcome = context.engine().submit(install("tool")).unwrap().wait().await;
    assert_eq!(outcome.state, OperationState::Failed);
    assert_eq!(outcome.reason, Some(FailureReason::ExitCode(2)));
    assert_eq!(outcome.retries, 0);

    context.shutdown().await;
}

#[tokio::test]
async fn test_remediation_is_applied_once() {
    let backend =
        ScriptBackend::new("script").operation("echo 'requires elevation' >&2; exit 1");
    let context = context(backend);

    let outcome = context.engine().submit(install("tool")).unwrap().wait().await;
    assert_eq!(outcome.state, OperationState::Failed);
    assert_eq!(outcome.reason, Some(FailureReason::ExitCode(1)));
    assert_eq!(outcome.retries, 1);
    assert_eq!(outcome.log.len(), 2);

    context.shutdown().await;
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let backend =
        ScriptBackend::new("script").operation("echo 'requires elevation' >&2; exit 1");
    let config = CoreConfig {
        max_retries: 0,
        ..test_config()
    };
    let context = context_with(backend, test_settings(), config);

    let outcome = context.engine().submit(install("tool")).unwrap().wait().await;
    assert_eq!(outcome.state, OperationState::Failed);
    assert_eq!(outcome.reason, Some(FailureReason::RetriesExhausted { exit_code: 1 }));
    assert_eq!(outcome.retries, 0);
    assert_eq!(outcome.log.len(), 1);

    context.shutdown().await;
}

#[tokio::test]
async fn test_cancel_kills_running_process() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("finished");
    let backend = ScriptBackend::new("script").operation(format!(
        "echo started; sleep 2; touch {}",
        sh_path(&marker)
    ));
    let context = context(backend);

    let handle = context.engine().submit(install("tool")).unwrap();
    assert!(wait_until(|| !handle.log().is_empty()).await);
    assert_eq!(handle.state(), OperationState::Running);

    let cancelled_at = Instant::now();
    handle.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .unwrap();
    assert_eq!(outcome.state, OperationState::Cancelled);
    // The script's `sleep` is killed with it, so no drain grace is spent.
    assert!(cancelled_at.elapsed() < Duration::from_millis(1500));
    assert_eq!(outcome.log[0].text, "started");

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(!marker.exists());

    context.shutdown().await;
}

#[tokio::test]
async fn test_cancel_while_queued() {
    let backend = ScriptBackend::new("script").operation("sleep 30");
    let context = context(backend);
    let engine = context.engine();

    let running = engine.submit(install("first")).unwrap();
    let queued = engine.submit(install("second")).unwrap();
    assert!(wait_until(|| running.state() == OperationState::Running).await);
    assert_eq!(queued.state(), OperationState::Queued);

    assert!(engine.cancel(queued.id()));
    assert_eq!(queued.state(), OperationState::Cancelled);
    assert!(queued.log().is_empty());

    running.cancel();
    assert_eq!(running.wait().await.state, OperationState::Cancelled);
    assert!(wait_until(|| engine.active_operations().is_empty()).await);

    context.shutdown().await;
}

#[tokio::test]
async fn test_same_manager_runs_in_submission_order() {
    let dir = TempDir::new().unwrap();
    let order = dir.path().join("order");
    let backend = ScriptBackend::new("script").operation(format!(
        "echo \"$2\" >> {}; sleep 0.1",
        sh_path(&order)
    ));
    let config = CoreConfig {
        max_parallel_operations: 4,
        ..test_config()
    };
    let context = context_with(backend, test_settings(), config);

    let handles: Vec<_> = ["a", "b", "c", "d"]
        .into_iter()
        .map(|id| context.engine().submit(install(id)).unwrap())
        .collect();
    for handle in &handles {
        assert_eq!(handle.wait().await.state, OperationState::Succeeded);
    }

    let ran = std::fs::read_to_string(&order).unwrap();
    assert_eq!(ran.lines().collect::<Vec<_>>(), vec!["a", "b", "c", "d"]);

    context.shutdown().await;
}

#[tokio::test]
async fn test_timeout_fails_operation() {
    let settings = ManagerSettings {
        operation_timeout: Duration::from_secs(1),
        ..test_settings()
    };
    let backend = ScriptBackend::new("script").operation("sleep 10");
    let context = context_with(backend, settings, test_config());

    let started = Instant::now();
    let outcome = context.engine().submit(install("tool")).unwrap().wait().await;
    assert_eq!(outcome.state, OperationState::Failed);
    assert_eq!(outcome.reason, Some(FailureReason::TimedOut { seconds: 1 }));
    assert!(started.elapsed() < Duration::from_secs(5));

    context.shutdown().await;
}

#[tokio::test]
async fn test_launch_failure() {
    let settings = ManagerSettings {
        executable: Some("/nonexistent/unipack-tool".to_string()),
        ..test_settings()
    };
    let context = context_with(ScriptBackend::new("script"), settings, test_config());

    let outcome = context.engine().submit(install("tool")).unwrap().wait().await;
    assert_eq!(outcome.state, OperationState::Failed);
    assert!(matches!(outcome.reason, Some(FailureReason::LaunchFailure(_))));

    context.shutdown().await;
}

#[tokio::test]
async fn test_post_check_contradiction_fails() {
    let config = CoreConfig {
        verify_after_operation: true,
        ..test_config()
    };
    // Reports success but never shows up as installed.
    let backend = ScriptBackend::new("script").operation("echo done");
    let context = context_with(backend, test_settings(), config);

    let outcome = context.engine().submit(install("ghost")).unwrap().wait().await;
    assert_eq!(outcome.state, OperationState::Failed);
    assert_eq!(outcome.reason, Some(FailureReason::PostCheckFailed));

    let outcome = context
        .engine()
        .submit(OperationRequest::new(package("ghost"), OperationKind::Uninstall))
        .unwrap()
        .wait()
        .await;
    assert_eq!(outcome.state, OperationState::Succeeded);

    context.shutdown().await;
}

#[tokio::test]
async fn test_unsupported_options_are_rejected() {
    let context = context(ScriptBackend::new("script"));
    let options = InstallOptions {
        custom_version: Some("1.2.3".to_string()),
        ..InstallOptions::default()
    };

    let outcome = context
        .engine()
        .submit(install("tool").with_options(options))
        .unwrap()
        .wait()
        .await;
    assert_eq!(outcome.state, OperationState::Failed);
    assert!(matches!(outcome.reason, Some(FailureReason::Rejected(_))));

    context.shutdown().await;
}

#[tokio::test]
async fn test_unknown_manager_is_refused() {
    let context = context(ScriptBackend::new("script"));
    let source = Arc::new(ManagerSource::new("main", "", "brew"));
    let err = context
        .engine()
        .submit(OperationRequest::new(
            Package::new("wget", "wget", source),
            OperationKind::Install,
        ))
        .unwrap_err();
    assert_eq!(err.category(), "unknown_manager");
    context.shutdown().await;
}

#[tokio::test]
async fn test_events_stream_output_and_transitions() {
    let backend = ScriptBackend::new("script").operation("sleep 0.5; echo done");
    let context = context(backend);

    let handle = context.engine().submit(install("tool")).unwrap();
    let mut events = handle.subscribe();

    let mut output = Vec::new();
    loop {
        match events.recv().await.unwrap() {
            OperationEvent::Output(line) => output.push(line.text),
            OperationEvent::StateChanged { to, .. } if to.is_terminal() => {
                assert_eq!(to, OperationState::Succeeded);
                break;
            }
            OperationEvent::StateChanged { .. } => {}
        }
    }
    assert_eq!(output, vec!["done"]);

    context.shutdown().await;
}

#[tokio::test]
async fn test_install_registers_new_shortcuts() {
    let desktop = TempDir::new().unwrap();
    let decided = desktop.path().join("Unwanted.lnk");
    let backend = ScriptBackend::new("script").operation(format!(
        "touch {dir}/'New App.lnk' {dir}/Unwanted.lnk {dir}/readme.txt",
        dir = sh_path(desktop.path())
    ));
    let config = CoreConfig {
        shortcut_dirs: Some(vec![desktop.path().to_path_buf()]),
        ..test_config()
    };
    let context = context_with(backend, test_settings(), config);
    let shortcuts = context.desktop_shortcuts();
    shortcuts.record_decision(&decided, ShortcutDecision::Delete);

    let outcome = context.engine().submit(install("app")).unwrap().wait().await;
    assert_eq!(outcome.state, OperationState::Succeeded);

    let names: Vec<_> = outcome
        .new_shortcuts
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["New App.lnk"]);
    assert!(!decided.exists());
    assert_eq!(
        shortcuts.resolve(&desktop.path().join("New App.lnk")),
        ShortcutDecision::Unknown
    );

    context.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_cancels_running_operations() {
    let backend = ScriptBackend::new("script").operation("echo started; sleep 30");
    let context = context(backend);

    let handle = context.engine().submit(install("tool")).unwrap();
    assert!(wait_until(|| !handle.log().is_empty()).await);

    tokio::time::timeout(Duration::from_secs(5), context.shutdown())
        .await
        .unwrap();
    assert_eq!(handle.state(), OperationState::Cancelled);
    assert!(context.engine().submit(install("late")).is_err());
}
