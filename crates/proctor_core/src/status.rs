//! Worker status and lifecycle states.

use serde::{Deserialize, Serialize};

/// Coarse status of a worker handle as reported in metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Starting,
    Running,
    Completed,
    Failed,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Starting => "starting",
            WorkerStatus::Running => "running",
            WorkerStatus::Completed => "completed",
            WorkerStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one worker lifecycle.
///
/// `Starting -> Running -> {Completed | Failed | TimedOut | Crashed}`; the last four are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleState {
    Starting,
    Running,
    Completed,
    Failed,
    TimedOut,
    Crashed,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, LifecycleState::Starting | LifecycleState::Running)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        match self {
            LifecycleState::Starting => next == LifecycleState::Running || next == LifecycleState::Failed,
            LifecycleState::Running => next.is_terminal(),
            _ => false,
        }
    }

    /// Collapse into the status reported by worker metrics.
    pub fn worker_status(self) -> WorkerStatus {
        match self {
            LifecycleState::Starting => WorkerStatus::Starting,
            LifecycleState::Running => WorkerStatus::Running,
            LifecycleState::Completed => WorkerStatus::Completed,
            LifecycleState::Failed | LifecycleState::TimedOut | LifecycleState::Crashed => WorkerStatus::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_have_no_outgoing_transitions() {
        let all = [
            LifecycleState::Starting,
            LifecycleState::Running,
            LifecycleState::Completed,
            LifecycleState::Failed,
            LifecycleState::TimedOut,
            LifecycleState::Crashed,
        ];
        for from in all.iter().copied().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to), "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn test_spawn_failure_skips_running() {
        assert!(LifecycleState::Starting.can_transition_to(LifecycleState::Failed));
        assert!(!LifecycleState::Starting.can_transition_to(LifecycleState::Completed));
    }

    #[test]
    fn test_worker_status_collapse() {
        assert_eq!(LifecycleState::TimedOut.worker_status(), WorkerStatus::Failed);
        assert_eq!(LifecycleState::Completed.worker_status(), WorkerStatus::Completed);
    }
}
