//! Provide the shared, pure vocabulary of the proctor test orchestrator.
//!
//! This crate is intentionally small and dependency-light. It contains the types that both sides of the executor
//! boundary agree on:
//! - the orchestrator uses them to schedule, classify and persist work, and
//! - executor implementations (the `proctor-worker` binary or any third-party worker) use them to report results.
//!
//! ## Notes
//!
//! - This is a “vocabulary” crate: **no IO**, no async runtime, no global state.
//! - The JSON shape of [`WorkResult`] and [`WorkerMessage`] is a wire contract. Changing a field name or an enum
//!   spelling here breaks every executor in the wild; the guardrail tests in `tests/` pin the format.

pub mod category;
pub mod codes;
pub mod conventions;
pub mod envelope;
pub mod result;
pub mod status;

pub use category::{CategorySeverity, ErrorCategory};
pub use conventions::{TestCategory, TestType};
pub use envelope::{EnvelopeError, WorkerMessage};
pub use result::{ResultKind, Severity, WorkResult};
pub use status::{LifecycleState, WorkerStatus};
