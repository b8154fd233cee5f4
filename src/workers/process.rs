//! Subprocess executor backend.
//!
//! Each unit runs in its own child process. The unit's file path is written to the child's stdin as a single line,
//! stdout lines are decoded as envelope messages, and anything that is not an envelope (plus all of stderr) is
//! forwarded as console output.
//!
//! On unix the child leads its own process group. Control signals go to the whole group, so anything the worker
//! spawned (the test command and its children) goes down with it.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use proctor_core::{EnvelopeError, WorkerMessage};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::executor::{
    ExecutorControl, ExecutorError, ExecutorEvent, ExecutorHandle, ExecutorId, ExitKind, IsolatedExecutor, WorkUnit,
};
use super::harness::{TEST_COMMAND_ENV, TEST_TIMEOUT_ENV};
use crate::config::{Backend, Config};

#[derive(Debug, Clone, Copy)]
enum ControlSignal {
    Terminate,
    Kill,
}

struct ProcessControl {
    tx: mpsc::UnboundedSender<ControlSignal>,
}

impl ExecutorControl for ProcessControl {
    fn terminate(&self) {
        let _ = self.tx.send(ControlSignal::Terminate);
    }

    fn kill(&self) {
        let _ = self.tx.send(ControlSignal::Kill);
    }
}

#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: PathBuf,
    args: Vec<String>,
    cwd: PathBuf,
    test_command: Vec<String>,
    /// How long to wait for output readers after the child exits.
    drain_timeout: Duration,
}

impl ProcessExecutor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: PathBuf::from("."),
            test_command: Vec::new(),
            drain_timeout: Duration::from_secs(1),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            program: config.executor.resolve_program(),
            args: config.executor.args.clone(),
            cwd: config.root_dir.clone(),
            test_command: config.executor.test_command.clone(),
            drain_timeout: config.executor.termination_grace(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn with_test_command(mut self, command: Vec<String>) -> Self {
        self.test_command = command;
        self
    }
}

impl IsolatedExecutor for ProcessExecutor {
    fn backend(&self) -> Backend {
        Backend::Process
    }

    fn spawn(&self, unit: &WorkUnit) -> Result<ExecutorHandle, ExecutorError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .current_dir(&self.cwd)
            .env(TEST_TIMEOUT_ENV, unit.timeout.as_millis().to_string())
            .env(TEST_COMMAND_ENV, serde_json::to_string(&self.test_command).unwrap_or_default())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| ExecutorError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();
        let stdin = child.stdin.take().ok_or(ExecutorError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(ExecutorError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(ExecutorError::MissingPipe("stderr"))?;

        let (event_tx, events) = mpsc::unbounded_channel();
        let (exit_tx, exit) = oneshot::channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let readers = [
            tokio::spawn(forward_lines(stdout, event_tx.clone(), true)),
            tokio::spawn(forward_lines(stderr, event_tx, false)),
        ];
        tokio::spawn(supervise(
            child,
            stdin,
            unit.file.clone(),
            readers,
            control_rx,
            exit_tx,
            self.drain_timeout,
        ));

        tracing::debug!(pid, file = %unit.file, "spawned worker process");
        Ok(ExecutorHandle {
            id: ExecutorId::Pid(pid),
            events,
            exit,
            control: Box::new(ProcessControl { tx: control_tx }),
        })
    }
}

/// Own the child until it exits: hand it the unit, apply control signals, then report the exit after output drains.
async fn supervise(
    mut child: Child,
    mut stdin: ChildStdin,
    file: String,
    readers: [JoinHandle<()>; 2],
    mut control: mpsc::UnboundedReceiver<ControlSignal>,
    exit_tx: oneshot::Sender<ExitKind>,
    drain_timeout: Duration,
) {
    if let Err(err) = write_unit(&mut stdin, &file).await {
        tracing::debug!(%file, error = %err, "worker closed stdin before receiving its unit");
    }
    drop(stdin);

    let group = child.id();
    let mut control_open = true;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            signal = control.recv(), if control_open => match signal {
                Some(signal) => signal_group(&mut child, signal),
                None => {
                    control_open = false;
                    signal_group(&mut child, ControlSignal::Kill);
                }
            },
        }
    };
    if let Some(pgid) = group {
        reap_stragglers(pgid);
    }

    for reader in readers {
        let _ = tokio::time::timeout(drain_timeout, reader).await;
    }
    let _ = exit_tx.send(exit_kind(status));
}

async fn write_unit(stdin: &mut ChildStdin, file: &str) -> std::io::Result<()> {
    stdin.write_all(file.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<ExecutorEvent>, decode: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let event = if decode {
            match WorkerMessage::parse_line(&line) {
                Ok(message) => ExecutorEvent::Message(message),
                Err(EnvelopeError::NotJson) => ExecutorEvent::Console(line),
                Err(err @ EnvelopeError::Malformed(_)) => {
                    tracing::debug!(error = %err, "keeping malformed envelope line as console output");
                    ExecutorEvent::Console(line)
                }
            }
        } else {
            ExecutorEvent::Console(line)
        };
        // Keep draining after the receiver is gone so the child never blocks on a full pipe.
        let _ = tx.send(event);
    }
}

/// Signal the child's process group, falling back to the child alone once it has been reaped.
#[cfg(unix)]
fn signal_group(child: &mut Child, signal: ControlSignal) {
    let Some(pid) = child.id() else {
        let _ = child.start_kill();
        return;
    };
    let signo = match signal {
        ControlSignal::Terminate => libc::SIGTERM,
        ControlSignal::Kill => libc::SIGKILL,
    };
    if !kill_group(pid, signo) {
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _signal: ControlSignal) {
    let _ = child.start_kill();
}

/// SIGKILL whatever is left in the group after the leader exits. A pgid cannot be reused while any member lives.
#[cfg(unix)]
fn reap_stragglers(pgid: u32) {
    if kill_group(pgid, libc::SIGKILL) {
        tracing::debug!(pgid, "killed processes left behind by worker");
    }
}

#[cfg(not(unix))]
fn reap_stragglers(_pgid: u32) {}

/// `true` if at least one group member was signalled.
#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_group(pgid: u32, signo: libc::c_int) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return false;
    };
    // SAFETY: `kill(2)` has no memory-safety preconditions. The group was created by `process_group(0)` at spawn, so
    // its id is the leader's pid.
    unsafe { libc::kill(-pgid, signo) == 0 }
}

fn exit_kind(status: std::io::Result<ExitStatus>) -> ExitKind {
    let Ok(status) = status else {
        return ExitKind::Unknown;
    };
    if let Some(code) = status.code() {
        return ExitKind::Code(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitKind::Signal(signal);
        }
    }
    ExitKind::Unknown
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proctor_core::Severity;

    fn sh(script: &str) -> ProcessExecutor {
        ProcessExecutor::new("sh").with_args(["-c", script])
    }

    fn unit() -> WorkUnit {
        WorkUnit::new("core", "a.test.ts", Duration::from_secs(5))
    }

    async fn collect(mut handle: ExecutorHandle) -> (Vec<ExecutorEvent>, ExitKind) {
        let exit = (&mut handle.exit).await.unwrap();
        let mut events = Vec::new();
        while let Ok(event) = handle.events.try_recv() {
            events.push(event);
        }
        (events, exit)
    }

    #[tokio::test]
    async fn test_reads_unit_from_stdin_and_decodes_result() {
        let executor = sh(r#"read f; echo "hello from $f"; printf '{"file":"%s","type":"runtime","severity":"info","message":"ok"}\n' "$f""#);
        let (events, exit) = collect(executor.spawn(&unit()).unwrap()).await;

        assert_eq!(exit, ExitKind::Code(0));
        assert_eq!(events[0], ExecutorEvent::Console("hello from a.test.ts".to_string()));
        let ExecutorEvent::Message(WorkerMessage::Result(result)) = &events[1] else {
            panic!("expected a result, got {events:?}");
        };
        assert_eq!(result.file, "a.test.ts");
        assert_eq!(result.severity, Severity::Info);
    }

    #[tokio::test]
    async fn test_stderr_is_console_output() {
        let (events, exit) = collect(sh("echo oops >&2; exit 3").spawn(&unit()).unwrap()).await;
        assert_eq!(exit, ExitKind::Code(3));
        assert_eq!(events, vec![ExecutorEvent::Console("oops".to_string())]);
    }

    #[tokio::test]
    async fn test_kill_reports_signal() {
        let handle = sh("sleep 30").spawn(&unit()).unwrap();
        handle.control.kill();
        let (_, exit) = collect(handle).await;
        assert_eq!(exit, ExitKind::Signal(libc::SIGKILL));
    }

    #[tokio::test]
    async fn test_terminate_sends_sigterm() {
        let handle = sh("sleep 30").spawn(&unit()).unwrap();
        handle.control.terminate();
        let (_, exit) = collect(handle).await;
        assert_eq!(exit, ExitKind::Signal(libc::SIGTERM));
    }

    #[tokio::test]
    async fn test_kill_reaches_grandchildren() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("survived");
        let script = format!("(sleep 1; touch {}) & wait", marker.display());
        let handle = sh(&script).spawn(&unit()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.control.kill();
        let (_, exit) = collect(handle).await;
        assert_eq!(exit, ExitKind::Signal(libc::SIGKILL));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_background_children_do_not_outlive_worker() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("survived");
        let script = format!("(sleep 1; touch {}) > /dev/null 2>&1 & exit 0", marker.display());
        let (_, exit) = collect(sh(&script).spawn(&unit()).unwrap()).await;
        assert_eq!(exit, ExitKind::Code(0));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let err = ProcessExecutor::new("/definitely/not/a/program").spawn(&unit()).unwrap_err();
        assert!(matches!(err, ExecutorError::Spawn { .. }));
    }
}
