//! Error events and the reports they are built from.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use proctor_core::{CategorySeverity, ErrorCategory, WorkResult};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use super::impact::ImpactMetrics;

/// Context key naming the component an error belongs to.
pub const COMPONENT_KEY: &str = "component";

static PAREN_FRAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\((.*?):(\d+):(\d+)\)").expect("INVARIANT: constant frame regex compiles"));
static BARE_FRAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"at\s+([^\s()]+):(\d+):(\d+)").expect("INVARIANT: constant frame regex compiles"));
static PANIC_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"panicked at ([^\s:]+):(\d+):(\d+)").expect("INVARIANT: constant panic regex compiles")
});

/// Best-effort origin of an error, parsed from a stack trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    pub fn new(file: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }

    /// Parse the first frame of a stack trace.
    ///
    /// The first line is the error message and is skipped; the first later line containing `(<file>:<line>:<col>)`
    /// or `at <file>:<line>:<col>` wins. Rust panic headers (`panicked at <file>:<line>:<col>`) are accepted on any
    /// line as a fallback.
    pub fn from_stack(stack: &str) -> Option<Self> {
        stack
            .lines()
            .skip(1)
            .find_map(|line| capture(&PAREN_FRAME, line).or_else(|| capture(&BARE_FRAME, line)))
            .or_else(|| stack.lines().find_map(|line| capture(&PANIC_FRAME, line)))
    }
}

fn capture(regex: &Regex, line: &str) -> Option<SourceLocation> {
    let caps = regex.captures(line)?;
    Some(SourceLocation {
        file: caps.get(1)?.as_str().to_string(),
        line: caps.get(2)?.as_str().parse().ok()?,
        column: caps.get(3)?.as_str().parse().ok()?,
    })
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// What a publisher hands to the bus.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorReport {
    pub message: String,
    pub stack: Option<String>,
    /// Overrides stack parsing when the publisher already knows the location.
    pub source: Option<SourceLocation>,
    pub context: BTreeMap<String, Value>,
}

impl ErrorReport {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    /// Build from a Rust error; the source chain becomes the stack.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut stack = err.to_string();
        let mut cause = err.source();
        while let Some(inner) = cause {
            stack.push_str("\ncaused by: ");
            stack.push_str(&inner.to_string());
            cause = inner.source();
        }
        let report = Self::new(err.to_string());
        if stack.contains('\n') { report.with_stack(stack) } else { report }
    }

    /// Build from a failing work result; the file becomes the component.
    pub fn from_result(result: &WorkResult) -> Self {
        let mut report = Self::new(result.message.clone())
            .with_component(result.file.clone())
            .with_context("file", result.file.clone());
        if let Some(code) = &result.code {
            report = report.with_context("code", code.clone());
        }
        if let Some(stack) = &result.stack {
            report = report.with_stack(stack.clone());
        }
        if let (Some(line), Some(column)) = (result.line, result.column) {
            report.source = Some(SourceLocation::new(result.file.clone(), line, column));
        }
        report
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_source(mut self, source: SourceLocation) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_component(self, component: impl Into<String>) -> Self {
        self.with_context(COMPONENT_KEY, component.into())
    }
}

/// One tracked error, as stored in the bus history and delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub id: u64,
    pub category: ErrorCategory,
    pub severity: CategorySeverity,
    pub message: String,
    pub source: Option<SourceLocation>,
    pub timestamp: u64,
    pub context: BTreeMap<String, Value>,
    pub stack: Option<String>,
    pub impact_summary: &'static str,
    pub impact: Option<ImpactMetrics>,
}

impl ErrorEvent {
    pub(crate) fn from_report(id: u64, category: ErrorCategory, report: ErrorReport, timestamp: u64) -> Self {
        let source = report
            .source
            .or_else(|| report.stack.as_deref().and_then(SourceLocation::from_stack));
        Self {
            id,
            category,
            severity: category.severity(),
            message: report.message,
            source,
            timestamp,
            context: report.context,
            stack: report.stack,
            impact_summary: category.impact_summary(),
            impact: None,
        }
    }

    /// The component this error is attributed to: the `component` context entry, else the source file.
    pub fn component(&self) -> String {
        self.context
            .get(COMPONENT_KEY)
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.source.as_ref().map(|s| s.file.clone()))
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parenthesised_frame() {
        let stack = "Error: boom\n    at Object.run (/app/tests/a.test.ts:12:7)\n    at next (/app/x.js:1:1)";
        assert_eq!(
            SourceLocation::from_stack(stack),
            Some(SourceLocation::new("/app/tests/a.test.ts", 12, 7))
        );
    }

    #[test]
    fn test_bare_frame() {
        let stack = "TypeError: x is undefined\n    at /app/src/index.js:3:14";
        assert_eq!(SourceLocation::from_stack(stack), Some(SourceLocation::new("/app/src/index.js", 3, 14)));
    }

    #[test]
    fn test_message_line_is_not_a_frame() {
        assert_eq!(SourceLocation::from_stack("failed at (a.ts:1:2)"), None);
    }

    #[test]
    fn test_rust_panic_header() {
        let stack = "thread 'main' panicked at src/lib.rs:10:5:\nboom";
        assert_eq!(SourceLocation::from_stack(stack), Some(SourceLocation::new("src/lib.rs", 10, 5)));
    }

    #[test]
    fn test_component_falls_back_to_source_then_unknown() {
        let event = ErrorEvent::from_report(
            1,
            ErrorCategory::Runtime,
            ErrorReport::new("x").with_stack("x\n at b.ts:1:1"),
            0,
        );
        assert_eq!(event.component(), "b.ts");
        let event = ErrorEvent::from_report(2, ErrorCategory::Runtime, ErrorReport::new("x"), 0);
        assert_eq!(event.component(), "unknown");
        let event = ErrorEvent::from_report(3, ErrorCategory::Runtime, ErrorReport::new("x").with_component("B"), 0);
        assert_eq!(event.component(), "B");
    }

    #[test]
    fn test_report_from_result() {
        let result = WorkResult::error("tests/a.test.ts", "boom")
            .with_code("ERR_TEST_FAILED")
            .with_location(3, 4);
        let report = ErrorReport::from_result(&result);
        assert_eq!(report.source, Some(SourceLocation::new("tests/a.test.ts", 3, 4)));
        assert_eq!(report.context["code"], "ERR_TEST_FAILED");
    }

    #[test]
    fn test_report_from_error_chain() {
        let io = std::io::Error::other("disk gone");
        let report = ErrorReport::from_error(&io);
        assert_eq!(report.message, "disk gone");
        assert_eq!(report.stack, None);
    }
}
