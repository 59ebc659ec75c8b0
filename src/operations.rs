//! Install, update and uninstall operations and the engine that runs them.
//!
//! ```text
//!             submit
//!               │
//!               ▼
//!           ┌────────┐  cancel   ┌───────────┐
//!           │ Queued │──────────►│ Cancelled │◄─────────────┐
//!           └────────┘           └───────────┘              │
//!               │ per-manager FIFO + global slot             │ cancel
//!               ▼                                            │
//!           ┌─────────┐ known transient failure ┌──────────┐ │
//!           │ Running │────────────────────────►│ Retrying │─┘
//!           └─────────┘◄────────────────────────└──────────┘
//!             │     │        adjusted options
//!   exit ok + │     │ exit failed / timeout /
//!  post-check ▼     ▼ post-check contradicts
//!     ┌───────────┐ ┌────────┐
//!     │ Succeeded │ │ Failed │
//!     └───────────┘ └────────┘
//! ```
//!
//! Each manager has one dispatcher task that pops its queue in submission
//! order and waits for a manager slot and a global slot before starting the
//! operation. Operations of different managers interleave freely.

pub mod retry;

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use derive_builder::Builder;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::data::constants::{
    DEFAULT_MAX_PARALLEL_OPERATIONS, DEFAULT_MAX_RETRIES, OPERATION_EVENT_CAPACITY,
};
use crate::data::{InstallOptions, OperationKind, Package};
use crate::errors::{Result, UnipackError};
use crate::loader::PackageCatalog;
use crate::managers::ManagerSet;
use crate::process::{CommandSpec, OutputLine, ProcessOutcome, ProcessRunner};
use crate::stores::{DesktopShortcutsDatabase, IgnoredUpdatesDatabase, ShortcutSnapshot};
use crate::traits::PackageManager;

use self::retry::{GiveUp, RetryDecision, RetryPolicy};

pub type OperationId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationState {
    Queued,
    Running,
    Retrying,
    Succeeded,
    Failed,
    Cancelled,
}

impl OperationState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Succeeded | OperationState::Failed | OperationState::Cancelled
        )
    }

    #[must_use]
    pub fn can_transition_to(&self, next: OperationState) -> bool {
        use OperationState::*;
        matches!(
            (self, next),
            (Queued, Running | Cancelled)
                | (Running, Succeeded | Failed | Retrying | Cancelled)
                | (Retrying, Running | Failed | Cancelled)
        )
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationState::Queued => "queued",
            OperationState::Running => "running",
            OperationState::Retrying => "retrying",
            OperationState::Succeeded => "succeeded",
            OperationState::Failed => "failed",
            OperationState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Why an operation ended in `Failed`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureReason {
    LaunchFailure(String),
    TimedOut { seconds: u64 },
    /// Failed exit code with no applicable remediation.
    ExitCode(i32),
    RetriesExhausted { exit_code: i32 },
    /// The tool reported success but the package listing disagrees.
    PostCheckFailed,
    /// The manager could not build a command for these options.
    Rejected(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::LaunchFailure(e) => write!(f, "launch failure: {e}"),
            FailureReason::TimedOut { seconds } => write!(f, "timed out after {seconds}s"),
            FailureReason::ExitCode(code) => write!(f, "exit code {code}"),
            FailureReason::RetriesExhausted { exit_code } => {
                write!(f, "retries exhausted, last exit code {exit_code}")
            }
            FailureReason::PostCheckFailed => f.write_str("post-operation check failed"),
            FailureReason::Rejected(e) => write!(f, "rejected: {e}"),
        }
    }
}

/// Final record of a terminal operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationOutcome {
    pub state: OperationState,
    pub reason: Option<FailureReason>,
    pub exit_code: Option<i32>,
    pub retries: u32,
    pub log: Vec<OutputLine>,
    /// Shortcuts an install created that still need a decision.
    pub new_shortcuts: Vec<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperationEvent {
    Output(OutputLine),
    StateChanged {
        from: OperationState,
        to: OperationState,
    },
}

#[derive(Clone, Debug)]
pub struct OperationRequest {
    pub package: Package,
    pub kind: OperationKind,
    pub options: InstallOptions,
    /// Started by automation rather than a user; ignored updates are refused.
    pub automatic: bool,
}

impl OperationRequest {
    pub fn new(package: Package, kind: OperationKind) -> Self {
        Self {
            package,
            kind,
            options: InstallOptions::default(),
            automatic: false,
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: InstallOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn automatic(mut self) -> Self {
        self.automatic = true;
        self
    }
}

struct Operation {
    id: OperationId,
    package: Package,
    kind: OperationKind,
    options: Mutex<InstallOptions>,
    state: watch::Sender<OperationState>,
    events: broadcast::Sender<OperationEvent>,
    log: Mutex<Vec<OutputLine>>,
    cancel: CancellationToken,
    retries: AtomicU32,
    outcome: OnceLock<OperationOutcome>,
}

impl Operation {
    fn state(&self) -> OperationState {
        *self.state.borrow()
    }

    fn emit_transition(&self, from: OperationState, to: OperationState) {
        info!(
            operation = self.id,
            package = %self.package.id,
            manager = %self.package.manager,
            kind = %self.kind,
            %from,
            %to,
            "Operation state changed"
        );
        let _ = self.events.send(OperationEvent::StateChanged { from, to });
    }

    /// Moves to a non-terminal state.
    fn transition(&self, next: OperationState) -> bool {
        let mut from = None;
        self.state.send_if_modified(|current| {
            if !current.can_transition_to(next) {
                return false;
            }
            from = Some(*current);
            *current = next;
            true
        });
        match from {
            Some(from) => {
                self.emit_transition(from, next);
                true
            }
            None => {
                debug!(
                    operation = self.id,
                    to = %next,
                    current = %self.state(),
                    "Transition rejected"
                );
                false
            }
        }
    }

    /// Moves to a terminal state, recording the outcome before any waiter
    /// can observe it. `only_from` restricts the states this may happen from.
    fn finish(
        &self,
        state: OperationState,
        reason: Option<FailureReason>,
        exit_code: Option<i32>,
        new_shortcuts: Vec<PathBuf>,
        only_from: Option<OperationState>,
    ) -> bool {
        let mut from = None;
        self.state.send_if_modified(|current| {
            if only_from.is_some_and(|required| required != *current)
                || !current.can_transition_to(state)
            {
                return false;
            }
            let _ = self.outcome.set(OperationOutcome {
                state,
                reason,
                exit_code,
                retries: self.retries.load(Ordering::SeqCst),
                log: self.log.lock().clone(),
                new_shortcuts,
            });
            from = Some(*current);
            *current = state;
            true
        });
        match from {
            Some(from) => {
                self.emit_transition(from, state);
                true
            }
            None => false,
        }
    }

    fn fail(&self, reason: FailureReason, exit_code: Option<i32>) {
        warn!(operation = self.id, package = %self.package.id, %reason, "Operation failed");
        self.finish(OperationState::Failed, Some(reason), exit_code, Vec::new(), None);
    }

    fn finish_cancelled(&self) {
        self.finish(OperationState::Cancelled, None, None, Vec::new(), None);
    }

    fn push_line(&self, line: OutputLine) {
        self.log.lock().push(line.clone());
        let _ = self.events.send(OperationEvent::Output(line));
    }

    fn lines_since(&self, start: usize) -> Vec<OutputLine> {
        self.log.lock().get(start..).map(<[_]>::to_vec).unwrap_or_default()
    }
}

/// The caller's view of a submitted operation.
#[derive(Clone)]
pub struct OperationHandle {
    op: Arc<Operation>,
}

impl fmt::Debug for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationHandle")
            .field("id", &self.op.id)
            .field("package", &self.op.package.id)
            .field("kind", &self.op.kind)
            .field("state", &self.op.state())
            .finish()
    }
}

impl OperationHandle {
    pub fn id(&self) -> OperationId {
        self.op.id
    }

    pub fn package(&self) -> &Package {
        &self.op.package
    }

    pub fn kind(&self) -> OperationKind {
        self.op.kind
    }

    pub fn state(&self) -> OperationState {
        self.op.state()
    }

    /// Options of the current or last attempt.
    pub fn options(&self) -> InstallOptions {
        self.op.options.lock().clone()
    }

    pub fn retries(&self) -> u32 {
        self.op.retries.load(Ordering::SeqCst)
    }

    /// Every output line captured so far, across attempts.
    pub fn log(&self) -> Vec<OutputLine> {
        self.op.log.lock().clone()
    }

    /// Live output and state changes from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.op.events.subscribe()
    }

    /// Watch channel over the state, for callers that only need transitions.
    pub fn watch_state(&self) -> watch::Receiver<OperationState> {
        self.op.state.subscribe()
    }

    /// Requests cancellation. A queued operation is cancelled at once; a
    /// running one once its process has been killed.
    pub fn cancel(&self) {
        info!(operation = self.op.id, "Cancellation requested");
        self.op.cancel.cancel();
        self.op.finish(
            OperationState::Cancelled,
            None,
            None,
            Vec::new(),
            Some(OperationState::Queued),
        );
    }

    pub fn outcome(&self) -> Option<OperationOutcome> {
        self.op.outcome.get().cloned()
    }

    /// Waits for the operation to reach a terminal state.
    pub async fn wait(&self) -> OperationOutcome {
        let mut state = self.op.state.subscribe();
        let _ = state.wait_for(OperationState::is_terminal).await;
        self.outcome().unwrap_or_else(|| OperationOutcome {
            state: self.state(),
            reason: None,
            exit_code: None,
            retries: self.retries(),
            log: self.log(),
            new_shortcuts: Vec::new(),
        })
    }
}

/// Engine tunables.
#[derive(Clone, Debug, PartialEq, Eq, Builder)]
#[builder(default)]
pub struct EngineSettings {
    /// External processes running at once across all managers.
    pub max_parallel_operations: usize,
    pub max_retries: u32,
    /// Fail operations whose result the installed listing contradicts.
    pub verify_after_operation: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_parallel_operations: DEFAULT_MAX_PARALLEL_OPERATIONS,
            max_retries: DEFAULT_MAX_RETRIES,
            verify_after_operation: true,
        }
    }
}

/// What the engine works against, owned by the context.
#[derive(Clone, Debug)]
pub struct EngineServices {
    pub managers: ManagerSet,
    pub catalog: Arc<PackageCatalog>,
    pub ignored: Arc<IgnoredUpdatesDatabase>,
    pub shortcuts: Arc<DesktopShortcutsDatabase>,
    pub runner: ProcessRunner,
    pub tasks: TaskTracker,
    pub shutdown: CancellationToken,
}

struct EngineInner {
    services: EngineServices,
    policy: RetryPolicy,
    verify: bool,
    global_slots: Arc<Semaphore>,
    queues: DashMap<String, mpsc::UnboundedSender<Arc<Operation>>>,
    active: DashMap<OperationId, Arc<Operation>>,
    next_id: AtomicU64,
}

/// Queues, runs and retries operations.
#[derive(Clone)]
pub struct OperationEngine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for OperationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationEngine")
            .field("active", &self.inner.active.len())
            .field("available_slots", &self.inner.global_slots.available_permits())
            .finish_non_exhaustive()
    }
}

impl OperationEngine {
    pub fn new(settings: EngineSettings, services: EngineServices) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                services,
                policy: RetryPolicy::new(settings.max_retries),
                verify: settings.verify_after_operation,
                global_slots: Arc::new(Semaphore::new(settings.max_parallel_operations.max(1))),
                queues: DashMap::new(),
                active: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Queues an operation.
    ///
    /// Fails with `Blocked` when an automatic update targets an ignored
    /// version, and with `UnknownManager` when no manager owns the package.
    pub fn submit(&self, request: OperationRequest) -> Result<OperationHandle> {
        let inner = &self.inner;
        if inner.services.shutdown.is_cancelled() {
            return Err(UnipackError::Concurrency("engine is shut down".to_string()));
        }
        let manager = Arc::clone(inner.services.managers.get(&request.package.manager)?);

        if request.automatic && request.kind == OperationKind::Update {
            let candidate = request
                .options
                .custom_version
                .as_deref()
                .or(request.package.available_version.as_deref())
                .unwrap_or_default();
            let package = &request.package;
            if inner.services.ignored.is_ignored(&package.manager, &package.id, candidate) {
                info!(
                    package = %package.id,
                    manager = %package.manager,
                    candidate,
                    "Automatic update blocked by ignore rule"
                );
                return Err(UnipackError::Blocked(format!(
                    "updates of {} are ignored",
                    package.key()
                )));
            }
        }

        let (state, _) = watch::channel(OperationState::Queued);
        let (events, _) = broadcast::channel(OPERATION_EVENT_CAPACITY);
        let op = Arc::new(Operation {
            id: inner.next_id.fetch_add(1, Ordering::Relaxed),
            package: request.package,
            kind: request.kind,
            options: Mutex::new(request.options),
            state,
            events,
            log: Mutex::new(Vec::new()),
            cancel: inner.services.shutdown.child_token(),
            retries: AtomicU32::new(0),
            outcome: OnceLock::new(),
        });
        info!(
            operation = op.id,
            package = %op.package.id,
            manager = manager.name(),
            kind = %op.kind,
            "Operation queued"
        );

        inner.active.insert(op.id, Arc::clone(&op));
        self.spawn_reaper(&op);

        let queue = inner
            .queues
            .entry(manager.name().to_lowercase())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                inner
                    .services
                    .tasks
                    .spawn(dispatch(Arc::clone(inner), Arc::clone(&manager), rx));
                tx
            })
            .clone();
        if queue.send(Arc::clone(&op)).is_err() {
            // The dispatcher only stops at shutdown.
            op.finish_cancelled();
        }

        Ok(OperationHandle { op })
    }

    /// Removes the operation from the active set once it is terminal.
    fn spawn_reaper(&self, op: &Arc<Operation>) {
        let inner = Arc::clone(&self.inner);
        let id = op.id;
        let mut state = op.state.subscribe();
        self.inner.services.tasks.spawn(async move {
            let _ = state.wait_for(OperationState::is_terminal).await;
            inner.active.remove(&id);
            debug!(operation = id, "Operation retired");
        });
    }

    pub fn cancel(&self, id: OperationId) -> bool {
        match self.handle(id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn handle(&self, id: OperationId) -> Option<OperationHandle> {
        self.inner.active.get(&id).map(|op| OperationHandle {
            op: Arc::clone(op.value()),
        })
    }

    /// Non-terminal operations in submission order.
    pub fn active_operations(&self) -> Vec<OperationHandle> {
        let mut handles: Vec<_> = self
            .inner
            .active
            .iter()
            .filter(|op| !op.state().is_terminal())
            .map(|op| OperationHandle {
                op: Arc::clone(op.value()),
            })
            .collect();
        handles.sort_by_key(OperationHandle::id);
        handles
    }
}

/// Pops one manager's queue in order and starts operations as slots free up.
async fn dispatch(
    inner: Arc<EngineInner>,
    manager: Arc<dyn PackageManager>,
    mut queue: mpsc::UnboundedReceiver<Arc<Operation>>,
) {
    let manager_slots = Arc::new(Semaphore::new(manager.parallelism()));
    let shutdown = inner.services.shutdown.clone();
    debug!(manager = manager.name(), "Dispatcher started");

    loop {
        let op = tokio::select! {
            _ = shutdown.cancelled() => break,
            op = queue.recv() => match op {
                Some(op) => op,
                None => break,
            },
        };
        if op.state().is_terminal() {
            continue;
        }
        let Some(manager_permit) = acquire(&manager_slots, &op).await else {
            continue;
        };
        let Some(global_permit) = acquire(&inner.global_slots, &op).await else {
            continue;
        };
        let runner = Arc::clone(&inner);
        let manager = Arc::clone(&manager);
        inner.services.tasks.spawn(async move {
            let _slots = (manager_permit, global_permit);
            runner.execute(manager, op).await;
        });
    }

    queue.close();
    while let Ok(op) = queue.try_recv() {
        op.cancel.cancel();
        op.finish_cancelled();
    }
    debug!(manager = manager.name(), "Dispatcher stopped");
}

/// Waits for a slot unless the operation is cancelled first.
async fn acquire(slots: &Arc<Semaphore>, op: &Operation) -> Option<OwnedSemaphorePermit> {
    tokio::select! {
        permit = Arc::clone(slots).acquire_owned() => match permit {
            Ok(permit) => Some(permit),
            Err(_) => {
                op.finish_cancelled();
                None
            }
        },
        _ = op.cancel.cancelled() => {
            op.finish_cancelled();
            None
        }
    }
}

enum Attempt {
    Finished,
    Succeeded(i32),
}

impl EngineInner {
    async fn execute(&self, manager: Arc<dyn PackageManager>, op: Arc<Operation>) {
        let before = (op.kind == OperationKind::Install)
            .then(|| self.services.shortcuts.snapshot());

        let exit_code = match self.attempts(manager.as_ref(), &op).await {
            Attempt::Finished => return,
            Attempt::Succeeded(code) => code,
        };

        let refreshed = self
            .services
            .catalog
            .refresh_package(manager.name(), &op.package.id)
            .await;
        if self.verify {
            let present = matches!(refreshed, Ok(Some(_)));
            let expected = op.kind != OperationKind::Uninstall;
            if present != expected {
                op.fail(FailureReason::PostCheckFailed, Some(exit_code));
                return;
            }
        }

        let new_shortcuts = match before {
            Some(snapshot) => self.capture_shortcuts(&snapshot),
            None => Vec::new(),
        };

        if op.cancel.is_cancelled() {
            op.finish_cancelled();
            return;
        }
        op.finish(
            OperationState::Succeeded,
            None,
            Some(exit_code),
            new_shortcuts,
            None,
        );
    }

    /// Runs attempts until one succeeds or the operation is settled.
    async fn attempts(&self, manager: &dyn PackageManager, op: &Operation) -> Attempt {
        loop {
            if op.cancel.is_cancelled() || !op.transition(OperationState::Running) {
                op.finish_cancelled();
                return Attempt::Finished;
            }

            let options = op.options.lock().clone();
            let timeout = manager.operation_timeout();
            let spec = match manager.operation_command(op.kind, &op.package, &options) {
                Ok(spec) => spec.timeout(timeout),
                Err(e) => {
                    op.fail(FailureReason::Rejected(e.to_string()), None);
                    return Attempt::Finished;
                }
            };
            info!(operation = op.id, command = %spec.display(), "Running operation");

            let start = op.log.lock().len();
            let outcome = match self.run(&spec, op).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    op.fail(FailureReason::LaunchFailure(e.to_string()), None);
                    return Attempt::Finished;
                }
            };

            let code = match outcome {
                ProcessOutcome::Cancelled => {
                    op.finish_cancelled();
                    return Attempt::Finished;
                }
                ProcessOutcome::TimedOut => {
                    let seconds = timeout.as_secs();
                    op.fail(FailureReason::TimedOut { seconds }, None);
                    return Attempt::Finished;
                }
                ProcessOutcome::Exited(code) if manager.is_success(op.kind, code) => {
                    return Attempt::Succeeded(code);
                }
                ProcessOutcome::Exited(code) => code,
            };

            let class = manager.classify_failure(op.kind, Some(code), &op.lines_since(start));
            let retries = op.retries.load(Ordering::SeqCst);
            match self.policy.decide(class, &options, retries) {
                RetryDecision::Retry {
                    remediation,
                    options,
                } => {
                    *op.options.lock() = options;
                    op.retries.fetch_add(1, Ordering::SeqCst);
                    info!(operation = op.id, %remediation, exit_code = code, "Retrying operation");
                    op.transition(OperationState::Retrying);
                }
                RetryDecision::GiveUp(GiveUp::Exhausted) => {
                    op.fail(FailureReason::RetriesExhausted { exit_code: code }, Some(code));
                    return Attempt::Finished;
                }
                RetryDecision::GiveUp(reason) => {
                    debug!(operation = op.id, ?reason, "No retry");
                    op.fail(FailureReason::ExitCode(code), Some(code));
                    return Attempt::Finished;
                }
            }
        }
    }

    /// Streams the process output into the operation log.
    async fn run(&self, spec: &CommandSpec, op: &Operation) -> Result<ProcessOutcome> {
        let mut running = self
            .services
            .runner
            .spawn(spec, op.cancel.child_token())?;
        while let Some(line) = running.next_line().await {
            op.push_line(line);
        }
        running.wait().await
    }

    fn capture_shortcuts(&self, before: &ShortcutSnapshot) -> Vec<PathBuf> {
        let shortcuts = &self.services.shortcuts;
        let created = shortcuts.detect_new(before);
        if created.is_empty() {
            return Vec::new();
        }
        shortcuts.register_new(&created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use OperationState::*;

    #[rstest]
    #[case(Queued, Running, true)]
    #[case(Queued, Cancelled, true)]
    #[case(Queued, Succeeded, false)]
    #[case(Running, Retrying, true)]
    #[case(Running, Succeeded, true)]
    #[case(Retrying, Running, true)]
    #[case(Retrying, Succeeded, false)]
    #[case(Succeeded, Running, false)]
    #[case(Failed, Retrying, false)]
    #[case(Cancelled, Succeeded, false)]
    fn test_transitions(
        #[case] from: OperationState,
        #[case] to: OperationState,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn test_terminal_states() {
        assert!(Succeeded.is_terminal());
        assert!(Failed.is_terminal());
        assert!(Cancelled.is_terminal());
        assert!(!Retrying.is_terminal());
    }

    #[test]
    fn test_failure_reason_display() {
        assert_eq!(
            FailureReason::TimedOut { seconds: 30 }.to_string(),
            "timed out after 30s"
        );
        assert_eq!(
            FailureReason::RetriesExhausted { exit_code: 5 }.to_string(),
            "retries exhausted, last exit code 5"
        );
    }

    #[test]
    fn test_engine_settings_builder() {
        let settings = EngineSettingsBuilder::default()
            .max_retries(5)
            .build()
            .unwrap();
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.max_parallel_operations, DEFAULT_MAX_PARALLEL_OPERATIONS);
        assert!(settings.verify_after_operation);
    }
}
