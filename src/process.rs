//! External process execution with live output and cooperative cancellation.
//!
//! # Examples
//!
//! ```rust,no_run
//! use unipack::process::{CommandSpec, ProcessRunner};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> unipack::Result<()> {
//! let runner = ProcessRunner::default();
//! let spec = CommandSpec::new("winget").args(["list", "--accept-source-agreements"]);
//! let mut running = runner.spawn(&spec, CancellationToken::new())?;
//! while let Some(line) = running.next_line().await {
//!     println!("{}", line.text);
//! }
//! let outcome = running.wait().await?;
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use shell_escape::escape;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::data::constants::KILL_DRAIN_GRACE;
use crate::errors::{Result, UnipackError};

/// A fully described process invocation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Wraps this command in an elevation helper such as `sudo -n` or `gsudo`.
    ///
    /// An empty elevator leaves the command unchanged.
    #[must_use]
    pub fn elevated(self, elevator: &[String]) -> Self {
        let Some((helper, helper_args)) = elevator.split_first() else {
            return self;
        };
        let mut args: Vec<String> = helper_args.to_vec();
        args.push(self.program);
        args.extend(self.args);
        Self {
            program: helper.clone(),
            args,
            ..self
        }
    }

    /// Shell-escaped rendering for logs and operation output.
    #[must_use]
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|part| escape(part.as_str().into()).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of captured output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

impl OutputLine {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            text: text.into(),
        }
    }
}

/// How a process ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Normal exit. Signal terminations report `-1`.
    Exited(i32),
    Cancelled,
    TimedOut,
}

impl ProcessOutcome {
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessOutcome::Exited(code) => Some(*code),
            _ => None,
        }
    }
}

/// Every line a process printed plus its outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturedOutput {
    pub lines: Vec<OutputLine>,
    pub outcome: ProcessOutcome,
}

impl CapturedOutput {
    /// Stdout lines joined with newlines.
    #[must_use]
    pub fn stdout(&self) -> String {
        self.text_of(OutputStream::Stdout)
    }

    #[must_use]
    pub fn stderr(&self) -> String {
        self.text_of(OutputStream::Stderr)
    }

    fn text_of(&self, stream: OutputStream) -> String {
        self.lines
            .iter()
            .filter(|line| line.stream == stream)
            .map(|line| line.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Spawns external commands.
#[derive(Clone, Debug)]
pub struct ProcessRunner {
    drain_grace: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(KILL_DRAIN_GRACE)
    }
}

impl ProcessRunner {
    pub fn new(drain_grace: Duration) -> Self {
        Self { drain_grace }
    }

    /// Starts `spec`. Output lines stream through the returned handle while
    /// the process runs; `cancel` kills it.
    pub fn spawn(&self, spec: &CommandSpec, cancel: CancellationToken) -> Result<RunningProcess> {
        debug!(command = %spec.display(), "Spawning process");

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }
        // Installers the tool launches join its group and die with it.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| {
            warn!(program = %spec.program, error = %source, "Process launch failed");
            UnipackError::LaunchFailure {
                program: spec.program.clone(),
                source,
            }
        })?;

        let pid = child.id();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(
                stdout,
                OutputStream::Stdout,
                tx.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(
                stderr,
                OutputStream::Stderr,
                tx.clone(),
            )));
        }
        drop(tx);

        let completion = tokio::spawn(supervise(
            child,
            readers,
            cancel,
            spec.timeout,
            self.drain_grace,
            spec.display(),
        ));

        Ok(RunningProcess {
            pid,
            lines: rx,
            completion,
        })
    }

    /// Runs `spec` to completion and gathers its output.
    pub async fn run(
        &self,
        spec: &CommandSpec,
        cancel: CancellationToken,
    ) -> Result<CapturedOutput> {
        self.spawn(spec, cancel)?.collect().await
    }
}

/// A process started by [`ProcessRunner::spawn`].
#[derive(Debug)]
pub struct RunningProcess {
    pid: Option<u32>,
    lines: mpsc::UnboundedReceiver<OutputLine>,
    completion: JoinHandle<ProcessOutcome>,
}

impl RunningProcess {
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The next output line, or `None` once both streams are closed.
    pub async fn next_line(&mut self) -> Option<OutputLine> {
        self.lines.recv().await
    }

    /// Waits for the process to end. Lines not yet read are discarded.
    pub async fn wait(self) -> Result<ProcessOutcome> {
        Ok(self.completion.await?)
    }

    pub async fn collect(mut self) -> Result<CapturedOutput> {
        let mut lines = Vec::new();
        while let Some(line) = self.lines.recv().await {
            lines.push(line);
        }
        let outcome = self.completion.await?;
        Ok(CapturedOutput { lines, outcome })
    }
}

async fn forward_lines<R>(reader: R, stream: OutputStream, tx: mpsc::UnboundedSender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let text = text.trim_end_matches(['\n', '\r']).to_string();
                trace!(?stream, "{}", text);
                // Keep reading after the receiver is gone so the pipe never fills up.
                let _ = tx.send(OutputLine { stream, text });
            }
            Err(e) => {
                debug!(?stream, error = %e, "Output stream closed with error");
                break;
            }
        }
    }
}

async fn supervise(
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    timeout: Option<Duration>,
    drain_grace: Duration,
    command: String,
) -> ProcessOutcome {
    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    let interrupted = tokio::select! {
        status = child.wait() => Ok(status),
        _ = cancel.cancelled() => Err(ProcessOutcome::Cancelled),
        _ = deadline => Err(ProcessOutcome::TimedOut),
    };

    let outcome = match interrupted {
        Ok(Ok(status)) => ProcessOutcome::Exited(status.code().unwrap_or(-1)),
        Ok(Err(e)) => {
            warn!(%command, error = %e, "Failed to wait for process");
            ProcessOutcome::Exited(-1)
        }
        Err(outcome) => {
            if outcome == ProcessOutcome::TimedOut {
                warn!(%command, "Process timed out, killing it");
            } else {
                debug!(%command, "Cancellation requested, killing process");
            }
            terminate(&mut child, &command).await;
            outcome
        }
    };

    drain_readers(readers, drain_grace).await;
    debug!(%command, ?outcome, "Process finished");
    outcome
}

async fn terminate(child: &mut Child, command: &str) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        kill_group(pid, command);
    }
    if let Err(e) = child.start_kill() {
        debug!(%command, error = %e, "Kill failed, process probably exited");
    }
    if let Err(e) = child.wait().await {
        warn!(%command, error = %e, "Failed to reap killed process");
    }
}

#[cfg(unix)]
fn kill_group(pid: u32, command: &str) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: killpg only sends a signal; the group id is the unreaped child's pid.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
        debug!(
            %command,
            error = %std::io::Error::last_os_error(),
            "Killing process group failed"
        );
    }
}

// A grandchild can inherit the pipes and keep them open after the child died.
async fn drain_readers(readers: Vec<JoinHandle<()>>, grace: Duration) {
    let aborts: Vec<_> = readers.iter().map(JoinHandle::abort_handle).collect();
    let joined = futures::future::join_all(readers);
    if tokio::time::timeout(grace, joined).await.is_err() {
        debug!("Output readers still open after grace period, aborting");
        for handle in aborts {
            handle.abort();
        }
    }
}
