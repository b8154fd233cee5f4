//! Canned recovery guidance per error category.

use proctor_core::{CategorySeverity, ErrorCategory};

const MODULE_STEPS: &[&str] = &[
    "Check module installation",
    "Verify package.json dependencies",
    "Run package manager install",
    "Clear package manager cache",
];

const NETWORK_STEPS: &[&str] = &[
    "Check network connectivity",
    "Verify endpoint availability",
    "Check authentication tokens",
    "Retry with exponential backoff",
];

const RUNTIME_STEPS: &[&str] = &[
    "Check error stack trace",
    "Verify component state",
    "Restart affected components",
    "Clear application cache",
];

const BUILD_STEPS: &[&str] = &[
    "Check build configuration",
    "Clear build cache",
    "Verify dependencies",
    "Rebuild project",
];

const DEFAULT_STEPS: &[&str] = &["Analyze error details", "Check component state", "Verify system health"];

pub fn steps_for(category: ErrorCategory) -> &'static [&'static str] {
    match category {
        ErrorCategory::Module => MODULE_STEPS,
        ErrorCategory::Network => NETWORK_STEPS,
        ErrorCategory::Runtime => RUNTIME_STEPS,
        ErrorCategory::Build => BUILD_STEPS,
        _ => DEFAULT_STEPS,
    }
}

pub fn base_minutes(severity: CategorySeverity) -> u64 {
    match severity {
        CategorySeverity::Low => 5,
        CategorySeverity::Medium => 15,
        CategorySeverity::High => 30,
        CategorySeverity::Critical => 60,
    }
}

/// `base_minutes(severity) * ceil(affected / 2)`.
pub fn estimate_minutes(severity: CategorySeverity, affected: usize) -> u64 {
    base_minutes(severity) * (affected as u64).div_ceil(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_rounds_affected_up() {
        assert_eq!(estimate_minutes(CategorySeverity::Low, 1), 5);
        assert_eq!(estimate_minutes(CategorySeverity::Low, 2), 5);
        assert_eq!(estimate_minutes(CategorySeverity::Critical, 7), 240);
        assert_eq!(estimate_minutes(CategorySeverity::High, 0), 0);
    }

    #[test]
    fn test_unlisted_categories_get_default_steps() {
        assert_eq!(steps_for(ErrorCategory::Timeout), DEFAULT_STEPS);
        assert_eq!(steps_for(ErrorCategory::Build)[3], "Rebuild project");
    }
}
