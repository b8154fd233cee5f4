//! Error categories understood by the error bus, and their fixed severity table.
//!
//! This module is registry-first: each category has exactly one canonical spelling, one default severity and one
//! impact summary. Consumers should match on [`ErrorCategory`] and never on raw strings.
//!
//! ## Examples
//! ```rust
//! use proctor_core::{CategorySeverity, ErrorCategory};
//!
//! assert_eq!(ErrorCategory::Runtime.severity(), CategorySeverity::Critical);
//! assert_eq!(ErrorCategory::from_str("module"), Some(ErrorCategory::Module));
//! ```

use serde::{Deserialize, Serialize};

/// Severity attached to error-bus events and impact metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CategorySeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl CategorySeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            CategorySeverity::Low => "low",
            CategorySeverity::Medium => "medium",
            CategorySeverity::High => "high",
            CategorySeverity::Critical => "critical",
        }
    }

    /// Whether this severity should trigger out-of-band work such as an immediate backup.
    pub fn is_high_or_critical(self) -> bool {
        self >= CategorySeverity::High
    }
}

impl std::fmt::Display for CategorySeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error taxonomy. Categories describe where a failure came from, not its Rust type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Build,
    Runtime,
    Network,
    Console,
    Process,
    Memory,
    Timeout,
    Assertion,
    Validation,
    System,
    Module,
    Uncaught,
    Internal,
}

impl ErrorCategory {
    /// All categories in declaration order.
    pub const ALL: [ErrorCategory; 13] = [
        ErrorCategory::Build,
        ErrorCategory::Runtime,
        ErrorCategory::Network,
        ErrorCategory::Console,
        ErrorCategory::Process,
        ErrorCategory::Memory,
        ErrorCategory::Timeout,
        ErrorCategory::Assertion,
        ErrorCategory::Validation,
        ErrorCategory::System,
        ErrorCategory::Module,
        ErrorCategory::Uncaught,
        ErrorCategory::Internal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Build => "build",
            ErrorCategory::Runtime => "runtime",
            ErrorCategory::Network => "network",
            ErrorCategory::Console => "console",
            ErrorCategory::Process => "process",
            ErrorCategory::Memory => "memory",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Assertion => "assertion",
            ErrorCategory::Validation => "validation",
            ErrorCategory::System => "system",
            ErrorCategory::Module => "module",
            ErrorCategory::Uncaught => "uncaught",
            ErrorCategory::Internal => "internal",
        }
    }

    /// Parse the canonical lowercase spelling.
    ///
    /// ## Returns
    /// - `None` for unknown spellings; no aliases are accepted.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }

    /// The fixed severity table.
    ///
    /// ## Notes
    /// - runtime and build are critical, network and module are high, console is medium, everything else is low.
    pub fn severity(self) -> CategorySeverity {
        match self {
            ErrorCategory::Runtime | ErrorCategory::Build => CategorySeverity::Critical,
            ErrorCategory::Network | ErrorCategory::Module => CategorySeverity::High,
            ErrorCategory::Console => CategorySeverity::Medium,
            _ => CategorySeverity::Low,
        }
    }

    /// One-line description of what a failure in this category means for the run.
    pub fn impact_summary(self) -> &'static str {
        match self {
            ErrorCategory::Runtime => "Application execution halted",
            ErrorCategory::Build => "Build process failed",
            ErrorCategory::Network => "Network communication disrupted",
            ErrorCategory::Module => "Module functionality unavailable",
            ErrorCategory::Console => "Console error detected",
            ErrorCategory::Process => "Worker process misbehaved",
            ErrorCategory::Memory => "Memory ceiling exceeded",
            ErrorCategory::Timeout => "Time budget exceeded",
            ErrorCategory::Assertion => "Test assertion failed",
            ErrorCategory::Validation => "Validation rule violated",
            ErrorCategory::System => "Host system operation failed",
            ErrorCategory::Uncaught => "Orchestrator control loop aborted",
            ErrorCategory::Internal => "Error handling itself failed",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
