//! Thread executor backend.
//!
//! Each unit runs on a dedicated OS thread inside the orchestrator process. Panics are caught and reported as an
//! [`ExitKind::Panicked`] exit.
//!
//! ## Notes
//!
//! - Threads cannot be killed. `terminate`/`kill` only detach the thread: the lifecycle still produces its
//!   synthesized result, and whatever the thread sends afterwards is ignored.
//! - Memory is shared with the host, so per-worker memory ceilings only apply to values the work function reports.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use proctor_core::{WorkResult, WorkerMessage};
use tokio::sync::{mpsc, oneshot};

use super::executor::{
    ExecutorControl, ExecutorError, ExecutorEvent, ExecutorHandle, ExecutorId, ExitKind, IsolatedExecutor, WorkUnit,
};
use super::harness::TestCommand;
use crate::config::{Backend, Config};

/// The work run on each thread.
pub type WorkFn = Arc<dyn Fn(&WorkUnit) -> WorkResult + Send + Sync>;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

struct DetachControl;

impl ExecutorControl for DetachControl {
    fn terminate(&self) {}

    fn kill(&self) {}
}

#[derive(Clone)]
pub struct ThreadExecutor {
    work: WorkFn,
}

impl std::fmt::Debug for ThreadExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadExecutor").finish_non_exhaustive()
    }
}

impl ThreadExecutor {
    pub fn new(work: WorkFn) -> Self {
        Self { work }
    }

    /// Run the configured test command on worker threads.
    pub fn from_config(config: &Config) -> Self {
        let command = TestCommand::new(config.executor.test_command.clone()).with_cwd(&config.root_dir);
        Self::new(command.into_work_fn())
    }
}

impl IsolatedExecutor for ThreadExecutor {
    fn backend(&self) -> Backend {
        Backend::Thread
    }

    fn spawn(&self, unit: &WorkUnit) -> Result<ExecutorHandle, ExecutorError> {
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        let (event_tx, events) = mpsc::unbounded_channel();
        let (exit_tx, exit) = oneshot::channel();
        let work = Arc::clone(&self.work);
        let unit = unit.clone();

        std::thread::Builder::new()
            .name(format!("proctor-worker-{id}"))
            .spawn(move || {
                let exit_kind = match catch_unwind(AssertUnwindSafe(|| work(&unit))) {
                    Ok(result) => {
                        let _ = event_tx.send(ExecutorEvent::Message(WorkerMessage::Result(result)));
                        ExitKind::Code(0)
                    }
                    Err(payload) => ExitKind::Panicked(panic_message(payload.as_ref())),
                };
                // Events are sent before the exit so the lifecycle sees the result first.
                drop(event_tx);
                let _ = exit_tx.send(exit_kind);
            })
            .map_err(ExecutorError::Thread)?;

        Ok(ExecutorHandle {
            id: ExecutorId::Thread(id),
            events,
            exit,
            control: Box::new(DetachControl),
        })
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_result_precedes_exit() {
        let executor = ThreadExecutor::new(Arc::new(|unit: &WorkUnit| WorkResult::passed(&unit.file, "ok")));
        let mut handle = executor.spawn(&WorkUnit::new("g", "a.test.ts", Duration::from_secs(1))).unwrap();

        assert_eq!((&mut handle.exit).await.unwrap(), ExitKind::Code(0));
        let event = handle.events.try_recv().unwrap();
        assert!(matches!(event, ExecutorEvent::Message(WorkerMessage::Result(r)) if r.file == "a.test.ts"));
    }

    #[tokio::test]
    async fn test_panic_is_reported_as_exit() {
        let executor = ThreadExecutor::new(Arc::new(|_: &WorkUnit| -> WorkResult { panic!("boom") }));
        let mut handle = executor.spawn(&WorkUnit::new("g", "a.test.ts", Duration::from_secs(1))).unwrap();

        assert_eq!((&mut handle.exit).await.unwrap(), ExitKind::Panicked("boom".to_string()));
        assert!(handle.events.try_recv().is_err());
    }

    #[test]
    fn test_thread_ids_are_unique() {
        let executor = ThreadExecutor::new(Arc::new(|unit: &WorkUnit| WorkResult::passed(&unit.file, "ok")));
        let unit = WorkUnit::new("g", "a", Duration::from_secs(1));
        assert_ne!(executor.spawn(&unit).unwrap().id, executor.spawn(&unit).unwrap().id);
    }
}
