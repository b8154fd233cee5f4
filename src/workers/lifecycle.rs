//! One executor, one unit, one result.
//!
//! [`run_lifecycle`] spawns an isolated executor for a [`WorkUnit`] and races every way the run can end:
//! - the executor sends its result (`Completed`),
//! - the executor exits without one (`Crashed`, code `ERR_WORKER_EXIT`),
//! - the per-unit timeout fires (`TimedOut`, code `ERR_TIMEOUT`),
//! - the pool interrupts it for a budget breach, the group deadline or shutdown (`Failed`),
//! - or it never starts (`Failed`, code `ERR_WORKER`).
//!
//! A [`ResolutionGuard`] latches the first of these. Everything that arrives later is counted as suppressed and
//! otherwise ignored, so exactly one [`WorkResult`] comes out per unit. Cleanup runs on every path, including the
//! happy one: the executor is given the termination grace period to exit on its own and is then killed.

use std::time::{Duration, Instant};

use proctor_core::{LifecycleState, WorkResult, WorkerMessage, codes};
use tokio::sync::{mpsc, oneshot, watch};

use super::executor::{ExecutorEvent, ExecutorHandle, ExecutorId, ExitKind, IsolatedExecutor, WorkUnit};
use crate::state::WorkUnitKey;

const MIB: u64 = 1024 * 1024;

/// Latch for the first terminal signal of a lifecycle.
#[derive(Debug, Default)]
pub struct ResolutionGuard {
    resolved: Option<LifecycleState>,
    suppressed: u32,
}

impl ResolutionGuard {
    /// Try to resolve to `state`.
    ///
    /// ## Returns
    /// - `true` for the first call only. Later calls are counted as suppressed.
    pub fn resolve(&mut self, state: LifecycleState) -> bool {
        debug_assert!(state.is_terminal(), "resolving to non-terminal {state:?}");
        if self.resolved.is_some() {
            self.suppressed += 1;
            return false;
        }
        self.resolved = Some(state);
        true
    }

    pub fn state(&self) -> Option<LifecycleState> {
        self.resolved
    }

    pub fn suppressed(&self) -> u32 {
        self.suppressed
    }
}

/// A resource budget a running worker exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreachKind {
    Memory { observed: u64, limit: u64 },
    Inactivity { idle: Duration },
}

impl BreachKind {
    fn to_result(self, file: &str) -> WorkResult {
        match self {
            BreachKind::Memory { observed, limit } => WorkResult::error(
                file,
                format!("Memory limit exceeded: {}MB > {}MB", observed / MIB, limit / MIB),
            )
            .with_code(codes::ERR_MEMORY_LIMIT),
            BreachKind::Inactivity { idle } => WorkResult::error(
                file,
                format!("Test timed out after {}ms without activity", idle.as_millis()),
            )
            .with_code(codes::ERR_TIMEOUT),
        }
    }
}

/// Why the pool stopped a lifecycle early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interrupt {
    Shutdown,
    Breach(BreachKind),
    GroupDeadline { group: String, budget: Duration },
}

/// Progress reports from a lifecycle to its pool.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Spawned { key: WorkUnitKey, id: ExecutorId },
    Metrics { key: WorkUnitKey, memory: u64, cpu: f64 },
    Activity { key: WorkUnitKey },
}

/// Channels connecting one lifecycle to its pool.
#[derive(Debug)]
pub struct LifecycleContext {
    pub events: mpsc::UnboundedSender<LifecycleEvent>,
    pub interrupts: mpsc::Receiver<Interrupt>,
    pub shutdown: watch::Receiver<bool>,
    pub grace: Duration,
}

/// The terminal outcome of one lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub unit: WorkUnit,
    pub state: LifecycleState,
    pub result: WorkResult,
    pub breach: Option<BreachKind>,
    /// Terminal signals that arrived after the first one.
    pub suppressed: u32,
    pub executor: Option<ExecutorId>,
}

/// How to tear the executor down once the outcome is known.
enum Cleanup {
    /// Let it exit on its own within the grace period, then kill.
    Graceful,
    /// SIGTERM, grace period, then kill.
    Terminate,
    Kill,
}

enum Resolution {
    Reported(WorkResult),
    Exited(ExitKind),
    TimedOut,
    Interrupted(Interrupt),
}

/// Drive one unit through its lifecycle. Never fails: every failure mode becomes the outcome's result.
#[tracing::instrument(skip_all, fields(group = %unit.group, file = %unit.file))]
pub async fn run_lifecycle(executor: &dyn IsolatedExecutor, unit: WorkUnit, mut ctx: LifecycleContext) -> Outcome {
    let started = Instant::now();
    let key = unit.key();
    let mut guard = ResolutionGuard::default();

    if *ctx.shutdown.borrow() {
        guard.resolve(LifecycleState::Failed);
        let result = cancelled(&unit.file);
        return finish(unit, guard, result, None, None, Vec::new(), started);
    }

    let ExecutorHandle {
        id,
        mut events,
        mut exit,
        control,
    } = match executor.spawn(&unit) {
        Ok(handle) => handle,
        Err(err) => {
            tracing::warn!(error = %err, "failed to start worker");
            guard.resolve(LifecycleState::Failed);
            let result =
                WorkResult::error(&unit.file, format!("Failed to start worker: {err}")).with_code(codes::ERR_WORKER);
            return finish(unit, guard, result, None, None, Vec::new(), started);
        }
    };
    let _ = ctx.events.send(LifecycleEvent::Spawned { key: key.clone(), id });
    tracing::debug!(executor = %id, "worker running");

    let deadline = tokio::time::Instant::now() + unit.timeout;
    let mut console = Vec::new();
    let mut exit_status: Option<ExitKind> = None;
    let mut events_open = true;
    let mut interrupts_open = true;
    let mut shutdown_open = true;

    let resolution = loop {
        tokio::select! {
            biased;
            event = events.recv(), if events_open => match event {
                Some(event) => {
                    if let Some(result) = absorb(event, &key, &ctx.events, &mut console) {
                        break Resolution::Reported(result);
                    }
                }
                None => events_open = false,
            },
            status = &mut exit, if exit_status.is_none() => {
                let status = status.unwrap_or(ExitKind::Unknown);
                exit_status = Some(status.clone());
                // Backends deliver output before the exit notification; pick up anything still queued.
                let mut reported = None;
                while let Ok(event) = events.try_recv() {
                    if let Some(result) = absorb(event, &key, &ctx.events, &mut console) {
                        reported = Some(result);
                        break;
                    }
                }
                break match reported {
                    Some(result) => Resolution::Reported(result),
                    None => Resolution::Exited(status),
                };
            },
            _ = tokio::time::sleep_until(deadline) => break Resolution::TimedOut,
            interrupt = ctx.interrupts.recv(), if interrupts_open => match interrupt {
                Some(interrupt) => break Resolution::Interrupted(interrupt),
                None => interrupts_open = false,
            },
            changed = ctx.shutdown.changed(), if shutdown_open => {
                if changed.is_err() {
                    shutdown_open = false;
                } else if *ctx.shutdown.borrow() {
                    break Resolution::Interrupted(Interrupt::Shutdown);
                }
            },
        }
    };

    let timeout_ms = unit.timeout.as_millis();
    let mut breach = None;
    let (state, result, cleanup) = match resolution {
        Resolution::Reported(result) => (LifecycleState::Completed, result, Cleanup::Graceful),
        Resolution::Exited(status) => (
            LifecycleState::Crashed,
            WorkResult::error(&unit.file, format!("Worker {status} before sending a result"))
                .with_code(codes::ERR_WORKER_EXIT),
            Cleanup::Graceful,
        ),
        Resolution::TimedOut => (
            LifecycleState::TimedOut,
            WorkResult::error(&unit.file, format!("Test timed out after {timeout_ms}ms")).with_code(codes::ERR_TIMEOUT),
            Cleanup::Kill,
        ),
        Resolution::Interrupted(Interrupt::Breach(kind)) => {
            breach = Some(kind);
            (LifecycleState::Failed, kind.to_result(&unit.file), Cleanup::Kill)
        }
        Resolution::Interrupted(Interrupt::GroupDeadline { group, budget }) => (
            LifecycleState::Failed,
            WorkResult::error(&unit.file, format!("Group {group} timed out after {}ms", budget.as_millis()))
                .with_code(codes::ERR_GROUP_TIMEOUT),
            Cleanup::Kill,
        ),
        Resolution::Interrupted(Interrupt::Shutdown) => (LifecycleState::Failed, cancelled(&unit.file), Cleanup::Terminate),
    };
    guard.resolve(state);

    // ---- cleanup: runs on every path ----
    match cleanup {
        Cleanup::Graceful => {
            if !wait_exit(&mut exit, &mut exit_status, ctx.grace).await {
                control.kill();
            }
        }
        Cleanup::Terminate => {
            control.terminate();
            if !wait_exit(&mut exit, &mut exit_status, ctx.grace).await {
                control.kill();
            }
        }
        Cleanup::Kill => control.kill(),
    }
    if !wait_exit(&mut exit, &mut exit_status, ctx.grace).await {
        tracing::warn!(executor = %id, "worker did not exit after kill; abandoning it");
    }
    while let Ok(event) = events.try_recv() {
        if absorb(event, &key, &ctx.events, &mut console).is_some() {
            guard.resolve(LifecycleState::Completed);
        }
    }
    if guard.suppressed() > 0 {
        tracing::debug!(suppressed = guard.suppressed(), "ignored late terminal signals");
    }

    finish(unit, guard, result, breach, Some(id), console, started)
}

fn cancelled(file: &str) -> WorkResult {
    WorkResult::error(file, "Run cancelled before the test finished").with_code(codes::ERR_CANCELLED)
}

/// Fold one executor event into the lifecycle; returns the result if the event carried one.
fn absorb(
    event: ExecutorEvent,
    key: &WorkUnitKey,
    pool: &mpsc::UnboundedSender<LifecycleEvent>,
    console: &mut Vec<String>,
) -> Option<WorkResult> {
    match event {
        ExecutorEvent::Message(WorkerMessage::Result(result)) => Some(result),
        ExecutorEvent::Message(WorkerMessage::Metrics { memory, cpu }) => {
            let _ = pool.send(LifecycleEvent::Metrics {
                key: key.clone(),
                memory,
                cpu,
            });
            None
        }
        ExecutorEvent::Console(line) => {
            console.push(line);
            let _ = pool.send(LifecycleEvent::Activity { key: key.clone() });
            None
        }
    }
}

/// Wait up to `within` for the exit notification, unless it was already observed.
async fn wait_exit(exit: &mut oneshot::Receiver<ExitKind>, observed: &mut Option<ExitKind>, within: Duration) -> bool {
    if observed.is_some() {
        return true;
    }
    match tokio::time::timeout(within, exit).await {
        Ok(status) => {
            *observed = Some(status.unwrap_or(ExitKind::Unknown));
            true
        }
        Err(_) => false,
    }
}

fn finish(
    unit: WorkUnit,
    guard: ResolutionGuard,
    mut result: WorkResult,
    breach: Option<BreachKind>,
    executor: Option<ExecutorId>,
    console: Vec<String>,
    started: Instant,
) -> Outcome {
    if result.file.is_empty() {
        result.file = unit.file.clone();
    }
    if result.duration_ms.is_none() {
        result = result.with_duration_ms(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX));
    }
    if result.console_output.is_none() {
        result = result.with_console_output(console);
    }
    Outcome {
        state: guard.state().unwrap_or(LifecycleState::Failed),
        suppressed: guard.suppressed(),
        unit,
        result,
        breach,
        executor,
    }
}
