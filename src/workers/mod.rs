//! Isolated execution of work units.
//!
//! Layering, bottom up:
//! - [`executor`]: the [`IsolatedExecutor`] seam and its event/exit protocol.
//! - [`process`] and [`thread`]: the two backends.
//! - [`harness`]: what runs *inside* an executor: the configured test command for one file.
//! - [`lifecycle`]: one unit from spawn to exactly one result, with cleanup on every path.
//! - [`metrics`]: per-worker resource samples.
//! - [`pool`]: bounded batches of lifecycles, health checks and stop handling.

pub mod executor;
pub mod harness;
pub mod lifecycle;
pub mod metrics;
pub mod pool;
pub mod process;
pub mod thread;

pub use executor::{ExecutorError, ExecutorEvent, ExecutorHandle, ExecutorId, ExitKind, IsolatedExecutor, WorkUnit};
pub use harness::TestCommand;
pub use lifecycle::{BreachKind, Interrupt, LifecycleContext, LifecycleEvent, Outcome, ResolutionGuard, run_lifecycle};
pub use metrics::{PoolMetrics, WorkerHandle, WorkerMetricsManager};
pub use pool::{PoolError, PoolOptions, StopHandle, WorkerPool};
pub use process::ProcessExecutor;
pub use thread::{ThreadExecutor, WorkFn};

use std::sync::Arc;

use crate::config::{Backend, Config};

/// Build the executor backend selected by `executor.backend`.
pub fn executor_for(config: &Config) -> Arc<dyn IsolatedExecutor> {
    match config.executor.backend {
        Backend::Process => Arc::new(ProcessExecutor::from_config(config)),
        Backend::Thread => Arc::new(ThreadExecutor::from_config(config)),
    }
}
