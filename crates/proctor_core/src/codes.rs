//! Result codes attached to synthesized or executor-reported failures.
//!
//! ## Notes
//! - Codes are part of the wire contract and are matched by string; never rename an existing code.

/// The executor did not answer within the per-unit timeout.
pub const ERR_TIMEOUT: &str = "ERR_TIMEOUT";
/// The executor exited before sending a result.
pub const ERR_WORKER_EXIT: &str = "ERR_WORKER_EXIT";
/// The executor failed to spawn or hit a transport error.
pub const ERR_WORKER: &str = "ERR_WORKER";
/// The unit was still unfinished when its group's time budget ran out.
pub const ERR_GROUP_TIMEOUT: &str = "ERR_GROUP_TIMEOUT";
/// The test file exposed nothing runnable.
pub const ERR_NO_TEST: &str = "ERR_NO_TEST";
/// The test itself failed.
pub const ERR_TEST_FAILED: &str = "ERR_TEST_FAILED";
/// The executor exceeded the per-worker memory ceiling.
pub const ERR_MEMORY_LIMIT: &str = "ERR_MEMORY_LIMIT";
/// The run was stopped before the unit could finish.
pub const ERR_CANCELLED: &str = "ERR_CANCELLED";

/// Every known code, in declaration order.
pub const ALL: &[&str] = &[
    ERR_TIMEOUT,
    ERR_WORKER_EXIT,
    ERR_WORKER,
    ERR_GROUP_TIMEOUT,
    ERR_NO_TEST,
    ERR_TEST_FAILED,
    ERR_MEMORY_LIMIT,
    ERR_CANCELLED,
];

/// Whether `code` was synthesized by the orchestrator rather than reported by a test.
pub fn is_orchestrator_code(code: &str) -> bool {
    matches!(
        code,
        ERR_TIMEOUT | ERR_WORKER_EXIT | ERR_WORKER | ERR_GROUP_TIMEOUT | ERR_MEMORY_LIMIT | ERR_CANCELLED
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for code in ALL {
            assert!(seen.insert(*code), "duplicate code {code}");
        }
    }

    #[test]
    fn test_test_codes_are_not_orchestrator_codes() {
        assert!(!is_orchestrator_code(ERR_TEST_FAILED));
        assert!(!is_orchestrator_code(ERR_NO_TEST));
        assert!(is_orchestrator_code(ERR_TIMEOUT));
    }
}
