//! Console output for test runs.
//!
//! Progress is printed as results arrive (`.`/`F`, or one line per file with `--verbose`). Failure blocks and the
//! summary line are printed once the run completes, so they are never interleaved with progress.

use std::time::Duration;

use proctor_core::WorkResult;

use crate::collect::TestGroup;
use crate::runner::{RunReport, TestReporter};

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

/// Longest failure message shown in a failure block.
pub const MAX_MESSAGE_LEN: usize = 100;

/// Default console reporter.
#[derive(Debug, Default)]
pub struct ConsoleReporter {
    pub verbose: bool,
    color: bool,
    dots: usize,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            color: true,
            dots: 0,
        }
    }

    pub fn with_color(mut self, color: bool) -> Self {
        self.color = color;
        self
    }

    fn paint(&self, color: &str, text: &str) -> String {
        if self.color { format!("{color}{text}{RESET}") } else { text.to_string() }
    }
}

impl TestReporter for ConsoleReporter {
    fn on_collection_complete(&mut self, file_count: usize, group_count: usize) {
        if file_count == 0 {
            eprintln!("No test files found");
            return;
        }
        eprintln!(
            "{}",
            self.paint(BOLD, &format!("collected {file_count} file(s) in {group_count} group(s)"))
        );
    }

    fn on_group_start(&mut self, group: &TestGroup) {
        if self.verbose {
            eprintln!("{}", self.paint(BOLD, &format!("[{}]", group.name)));
        }
    }

    fn on_test_complete(&mut self, result: &WorkResult) {
        let duration = result.duration_ms.unwrap_or(0);
        if self.verbose {
            let status = if result.is_failure() {
                self.paint(RED, "FAILED")
            } else {
                self.paint(GREEN, "PASSED")
            };
            eprintln!("{} ... {status} ({duration}ms)", result.file);
        } else {
            let mark = if result.is_failure() { self.paint(RED, "F") } else { self.paint(GREEN, ".") };
            eprint!("{mark}");
            self.dots += 1;
        }
    }

    fn on_run_complete(&mut self, report: &RunReport) {
        if self.dots > 0 {
            eprintln!();
        }

        let failures: Vec<&WorkResult> = report.failures().collect();
        for failure in &failures {
            eprintln!();
            for (i, line) in render_failure(failure).lines().enumerate() {
                if i == 0 {
                    eprintln!("{}", self.paint(RED, line));
                } else {
                    eprintln!("{line}");
                }
            }
        }
        if !failures.is_empty() {
            eprintln!();
            eprintln!("{}", self.paint(RED, &format!("❌ {} test(s) failed", failures.len())));
        }
        if report.cancelled {
            eprintln!("{}", self.paint(YELLOW, "run cancelled"));
        }

        let summary = &report.summary;
        let mut parts = Vec::new();
        if summary.passed_files > 0 || summary.failed_files == 0 {
            parts.push(self.paint(GREEN, &format!("{} passed", summary.passed_files)));
        }
        if summary.failed_files > 0 {
            parts.push(self.paint(RED, &format!("{} failed", summary.failed_files)));
        }
        eprintln!(
            "{}",
            summary_line(&parts, Duration::from_millis(summary.duration_ms))
        );
    }
}

fn summary_line(parts: &[String], duration: Duration) -> String {
    format!("====== {} in {:.2}s ======", parts.join(", "), duration.as_secs_f64())
}

/// First line of `message`, without a leading `Error: `/`AssertionError: `, truncated to [`MAX_MESSAGE_LEN`].
pub fn format_failure_message(message: &str) -> String {
    let first = message.lines().next().unwrap_or("").trim();
    let stripped = ["AssertionError: ", "Error: "]
        .iter()
        .find_map(|prefix| first.strip_prefix(prefix))
        .unwrap_or(first);
    if stripped.chars().count() > MAX_MESSAGE_LEN {
        let cut: String = stripped.chars().take(MAX_MESSAGE_LEN - 3).collect();
        format!("{cut}...")
    } else {
        stripped.to_string()
    }
}

/// Uncolored failure block for one result.
pub fn render_failure(result: &WorkResult) -> String {
    let mut out = format!(
        "{} {}: {}",
        result.kind.as_str().to_uppercase(),
        result.file,
        format_failure_message(&result.message)
    );
    if let Some(code) = &result.code {
        out.push_str(&format!("\n  code: {code}"));
    }
    if let Some(frame) = result.stack.as_deref().and_then(first_frame) {
        out.push_str(&format!("\n  {frame}"));
    }
    out
}

/// First stack line that looks like a frame, falling back to the first non-empty line after the message.
fn first_frame(stack: &str) -> Option<&str> {
    let mut lines = stack.lines().map(str::trim).filter(|l| !l.is_empty());
    let first = lines.next()?;
    if first.starts_with("at ") {
        return Some(first);
    }
    let rest: Vec<&str> = lines.collect();
    rest.iter().find(|l| l.starts_with("at ")).or(rest.first()).copied().or(Some(first))
}
