//! The isolated-executor boundary.
//!
//! An [`IsolatedExecutor`] turns one [`WorkUnit`] into a running execution context and hands back an
//! [`ExecutorHandle`]: a stream of [`ExecutorEvent`]s, a one-shot exit notification and a control surface for
//! termination. Two backends exist and are selected by configuration:
//! - [`ProcessExecutor`](super::process::ProcessExecutor): one child process per unit. A crash in the test cannot
//!   take the orchestrator down, and memory is sampled per process.
//! - [`ThreadExecutor`](super::thread::ThreadExecutor): one OS thread per unit. Panics are caught, but the thread
//!   shares the host heap and cannot be forcibly stopped.
//!
//! ## Notes
//!
//! - Backends must deliver every event produced before exit *before* the exit notification fires, so the lifecycle
//!   can tell "sent a result, then exited" apart from "exited without a result".

use std::fmt;
use std::time::Duration;

use proctor_core::WorkerMessage;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::Backend;
use crate::state::WorkUnitKey;

/// The `(group, file)` pair dispatched to one executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    pub group: String,
    pub file: String,
    pub timeout: Duration,
}

impl WorkUnit {
    pub fn new(group: impl Into<String>, file: impl Into<String>, timeout: Duration) -> Self {
        Self {
            group: group.into(),
            file: file.into(),
            timeout,
        }
    }

    pub fn key(&self) -> WorkUnitKey {
        WorkUnitKey::new(&self.group, &self.file)
    }
}

/// Identity of a running executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutorId {
    Pid(u32),
    Thread(u64),
}

impl ExecutorId {
    pub fn pid(self) -> Option<u32> {
        match self {
            ExecutorId::Pid(pid) => Some(pid),
            ExecutorId::Thread(_) => None,
        }
    }
}

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorId::Pid(pid) => write!(f, "pid:{pid}"),
            ExecutorId::Thread(id) => write!(f, "thread:{id}"),
        }
    }
}

/// Something the executor produced while running.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorEvent {
    Message(WorkerMessage),
    /// A line of output that is not an envelope message.
    Console(String),
}

/// How an executor ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitKind {
    Code(i32),
    Signal(i32),
    Panicked(String),
    /// The backend could not observe the exit status.
    Unknown,
}

impl ExitKind {
    pub fn is_clean(&self) -> bool {
        matches!(self, ExitKind::Code(0))
    }
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitKind::Code(code) => write!(f, "exited with code {code}"),
            ExitKind::Signal(signal) => write!(f, "killed by signal {signal}"),
            ExitKind::Panicked(message) => write!(f, "panicked: {message}"),
            ExitKind::Unknown => f.write_str("exited with unknown status"),
        }
    }
}

/// Termination surface of a running executor.
pub trait ExecutorControl: Send + Sync {
    /// Ask the executor to stop (SIGTERM for processes).
    fn terminate(&self);
    /// Stop the executor immediately (SIGKILL for processes).
    fn kill(&self);
}

pub struct ExecutorHandle {
    pub id: ExecutorId,
    pub events: mpsc::UnboundedReceiver<ExecutorEvent>,
    pub exit: oneshot::Receiver<ExitKind>,
    pub control: Box<dyn ExecutorControl>,
}

impl fmt::Debug for ExecutorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorHandle").field("id", &self.id).finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker process has no {0} pipe")]
    MissingPipe(&'static str),

    #[error("failed to start worker thread: {0}")]
    Thread(#[source] std::io::Error),
}

/// Spawn isolated execution contexts for work units.
pub trait IsolatedExecutor: Send + Sync {
    fn backend(&self) -> Backend;

    /// Start executing `unit`. Must be called from within a tokio runtime.
    fn spawn(&self, unit: &WorkUnit) -> Result<ExecutorHandle, ExecutorError>;
}
