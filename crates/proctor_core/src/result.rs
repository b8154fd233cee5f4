//! Define the terminal result of one dispatched unit of work.
//!
//! A [`WorkResult`] is produced exactly once per dispatched `(group, file)` pair, either by the executor itself or
//! synthesized by the orchestrator when the executor times out, crashes or fails to start.
//!
//! ## Examples
//! ```rust
//! use proctor_core::{ResultKind, Severity, WorkResult, codes};
//!
//! let result = WorkResult::error("tests/a.test.ts", "Worker timed out").with_code(codes::ERR_TIMEOUT);
//! assert_eq!(result.kind, ResultKind::Runtime);
//! assert!(result.is_failure());
//! ```

use serde::{Deserialize, Serialize};

/// Classify what produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    Runtime,
    Structure,
    Validation,
    #[serde(rename = "type")]
    Type,
}

impl ResultKind {
    /// Return the canonical wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            ResultKind::Runtime => "runtime",
            ResultKind::Structure => "structure",
            ResultKind::Validation => "validation",
            ResultKind::Type => "type",
        }
    }
}

impl std::fmt::Display for ResultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a single result.
///
/// ## Notes
/// - Only [`Severity::Error`] counts as a failure for exit codes and summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The one terminal result for a dispatched work unit.
///
/// ## Notes
/// - Serialized field names are camelCase (`durationMs`, `consoleOutput`) and `kind` is spelled `type` on the wire.
/// - Optional fields are omitted when absent, never written as `null`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkResult {
    pub file: String,
    #[serde(rename = "type")]
    pub kind: ResultKind,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console_output: Option<Vec<String>>,
}

impl WorkResult {
    /// Create a result with the given kind, severity and message and no optional fields.
    pub fn new(file: impl Into<String>, kind: ResultKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            kind,
            severity,
            message: message.into(),
            code: None,
            stack: None,
            line: None,
            column: None,
            duration_ms: None,
            console_output: None,
        }
    }

    /// A passing runtime result.
    pub fn passed(file: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(file, ResultKind::Runtime, Severity::Info, message)
    }

    /// A failing runtime result.
    pub fn error(file: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(file, ResultKind::Runtime, Severity::Error, message)
    }

    pub fn with_kind(mut self, kind: ResultKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_location(mut self, line: u32, column: u32) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Attach captured console lines; an empty capture is stored as absent.
    pub fn with_console_output(mut self, lines: Vec<String>) -> Self {
        self.console_output = if lines.is_empty() { None } else { Some(lines) };
        self
    }

    /// Whether this result fails the run.
    pub fn is_failure(&self) -> bool {
        self.severity == Severity::Error
    }

    /// Serialize to the single-line JSON form sent across the executor boundary.
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes;

    #[test]
    fn test_optional_fields_are_omitted() {
        let json = WorkResult::passed("a.test.ts", "ok").to_wire().unwrap();
        assert_eq!(json, r#"{"file":"a.test.ts","type":"runtime","severity":"info","message":"ok"}"#);
    }

    #[test]
    fn test_camel_case_field_names() {
        let json = WorkResult::error("a.test.ts", "boom")
            .with_code(codes::ERR_TEST_FAILED)
            .with_duration_ms(12)
            .with_console_output(vec!["hello".to_string()])
            .to_wire()
            .unwrap();
        assert!(json.contains(r#""durationMs":12"#));
        assert!(json.contains(r#""consoleOutput":["hello"]"#));
        assert!(json.contains(r#""code":"ERR_TEST_FAILED""#));
    }

    #[test]
    fn test_empty_console_output_is_absent() {
        let result = WorkResult::passed("a", "ok").with_console_output(Vec::new());
        assert_eq!(result.console_output, None);
    }

    #[test]
    fn test_type_kind_spelling() {
        let result = WorkResult::error("a", "bad").with_kind(ResultKind::Type);
        let json = result.to_wire().unwrap();
        assert!(json.contains(r#""type":"type""#));
    }

    #[test]
    fn test_only_error_severity_fails() {
        assert!(!WorkResult::passed("a", "ok").is_failure());
        assert!(!WorkResult::new("a", ResultKind::Validation, Severity::Warning, "meh").is_failure());
        assert!(WorkResult::error("a", "bad").is_failure());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Error > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }
}
