//! Run one test file and turn its outcome into a [`WorkResult`].
//!
//! This is the executor-side half of the dispatch contract. The `proctor-worker` binary wraps it for the process
//! backend and the thread backend calls it directly.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};

use proctor_core::{WorkResult, codes};

use super::executor::WorkUnit;
use super::thread::WorkFn;
use crate::errors::SourceLocation;

/// Environment variable carrying the unit's timeout in milliseconds.
pub const TEST_TIMEOUT_ENV: &str = "TEST_TIMEOUT";
/// Environment variable carrying the per-file test command as a JSON string array.
pub const TEST_COMMAND_ENV: &str = "PROCTOR_TEST_COMMAND";
/// Placeholder replaced with the test file path in a test command.
pub const FILE_PLACEHOLDER: &str = "{file}";

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const SAMPLE_INTERVAL: Duration = Duration::from_millis(250);
/// How long to wait for the output pipes after the command exits.
const OUTPUT_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestCommand {
    argv: Vec<String>,
    cwd: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl TestCommand {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            cwd: None,
            timeout: None,
        }
    }

    /// Read the command from [`TEST_COMMAND_ENV`] and the timeout from [`TEST_TIMEOUT_ENV`]. A missing or
    /// unparseable command runs files directly; a missing, zero or unparseable timeout means none.
    pub fn from_env() -> Self {
        let argv = std::env::var(TEST_COMMAND_ENV)
            .ok()
            .and_then(|raw| serde_json::from_str::<Vec<String>>(&raw).ok())
            .unwrap_or_default();
        let command = Self::new(argv);
        match std::env::var(TEST_TIMEOUT_ENV).ok().and_then(|raw| parse_timeout(&raw)) {
            Some(timeout) => command.with_timeout(timeout),
            None => command,
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Kill the command once it has run this long.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Expand the command for one file. Without a placeholder the file is appended.
    pub fn argv_for(&self, file: &str) -> Vec<String> {
        if self.argv.is_empty() {
            return vec![file.to_string()];
        }
        if self.argv.iter().any(|arg| arg.contains(FILE_PLACEHOLDER)) {
            self.argv.iter().map(|arg| arg.replace(FILE_PLACEHOLDER, file)).collect()
        } else {
            let mut argv = self.argv.clone();
            argv.push(file.to_string());
            argv
        }
    }

    fn resolve(&self, file: &str) -> PathBuf {
        match &self.cwd {
            Some(cwd) => cwd.join(file),
            None => PathBuf::from(file),
        }
    }

    /// Run the command for `file` to completion, or until the timeout.
    pub fn run(&self, file: &str) -> WorkResult {
        self.execute(file, self.timeout, |_| {})
    }

    /// Like [`run`](Self::run), calling `on_sample` with the command's pid periodically while it is running.
    pub fn run_monitored(&self, file: &str, on_sample: impl FnMut(u32)) -> WorkResult {
        self.execute(file, self.timeout, on_sample)
    }

    fn execute(&self, file: &str, timeout: Option<Duration>, mut on_sample: impl FnMut(u32)) -> WorkResult {
        let start = Instant::now();
        if !self.resolve(file).exists() {
            return WorkResult::error(file, format!("Test file not found: {file}")).with_code(codes::ERR_NO_TEST);
        }

        let argv = self.argv_for(file);
        let (program, args) = match argv.split_first() {
            Some(split) => split,
            None => return WorkResult::error(file, "Empty test command").with_code(codes::ERR_NO_TEST),
        };
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                return WorkResult::error(file, format!("Failed to run test command `{program}`: {err}"))
                    .with_code(codes::ERR_WORKER)
                    .with_duration_ms(elapsed_ms(start));
            }
        };
        let stdout = read_pipe(child.stdout.take());
        let stderr = read_pipe(child.stderr.take());

        let mut next_sample = start;
        let finished = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Finished::Exited(status),
                Ok(None) => {}
                Err(err) => {
                    let _ = child.kill();
                    break Finished::Lost(err);
                }
            }
            if timeout.is_some_and(|timeout| start.elapsed() >= timeout) {
                let _ = child.kill();
                let _ = child.wait();
                break Finished::TimedOut;
            }
            if Instant::now() >= next_sample {
                on_sample(child.id());
                next_sample += SAMPLE_INTERVAL;
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        let stdout = String::from_utf8_lossy(&stdout.recv_timeout(OUTPUT_GRACE).unwrap_or_default()).into_owned();
        let stderr = String::from_utf8_lossy(&stderr.recv_timeout(OUTPUT_GRACE).unwrap_or_default()).into_owned();
        let console: Vec<String> = stdout
            .lines()
            .chain(stderr.lines())
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect();
        let duration = elapsed_ms(start);

        let status = match finished {
            Finished::Exited(status) => status,
            Finished::TimedOut => {
                let timeout_ms = timeout.map_or(0, |t| t.as_millis());
                return WorkResult::error(file, format!("Test timed out after {timeout_ms}ms"))
                    .with_code(codes::ERR_TIMEOUT)
                    .with_duration_ms(duration)
                    .with_console_output(console);
            }
            Finished::Lost(err) => {
                return WorkResult::error(file, format!("Lost track of test command `{program}`: {err}"))
                    .with_code(codes::ERR_WORKER)
                    .with_duration_ms(duration)
                    .with_console_output(console);
            }
        };

        if status.success() {
            return WorkResult::passed(file, "Test passed")
                .with_duration_ms(duration)
                .with_console_output(console);
        }

        let message =
            failure_message(&stdout, &stderr).unwrap_or_else(|| format!("Test command {}", describe_status(status)));
        let mut result = WorkResult::error(file, message.clone())
            .with_code(codes::ERR_TEST_FAILED)
            .with_duration_ms(duration)
            .with_console_output(console);
        if let Some(stack) = stack_trace(&message, &stderr, &stdout) {
            if let Some(location) = SourceLocation::from_stack(&stack) {
                result = result.with_location(location.line, location.column);
            }
            result = result.with_stack(stack);
        }
        result
    }

    /// Wrap this command as a thread-backend work function. Each unit's own timeout applies.
    pub fn into_work_fn(self) -> WorkFn {
        Arc::new(move |unit: &WorkUnit| self.execute(&unit.file, Some(unit.timeout), |_| {}))
    }
}

enum Finished {
    Exited(ExitStatus),
    TimedOut,
    Lost(std::io::Error),
}

/// Drain a pipe on its own thread so a chatty command never blocks on a full buffer.
fn read_pipe<R: Read + Send + 'static>(pipe: Option<R>) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    if let Some(mut pipe) = pipe {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            let _ = tx.send(buf);
        });
    }
    rx
}

fn parse_timeout(raw: &str) -> Option<Duration> {
    raw.trim()
        .parse::<u64>()
        .ok()
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn describe_status(status: std::process::ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exited with code {code}"),
        None => "was terminated by a signal".to_string(),
    }
}

/// First line that looks like an error, searching stderr before stdout.
fn failure_message(stdout: &str, stderr: &str) -> Option<String> {
    let looks_like_error = |line: &&str| {
        line.contains("Error")
            || line.contains("error:")
            || line.contains("assert")
            || line.contains("panicked at")
            || line.contains("FAIL")
    };
    stderr
        .lines()
        .chain(stdout.lines())
        .map(str::trim)
        .find(looks_like_error)
        .or_else(|| stderr.lines().map(str::trim).rfind(|line| !line.is_empty()))
        .map(str::to_string)
}

/// Message line followed by every `at ...` frame, or `None` when no frames were printed.
fn stack_trace(message: &str, stderr: &str, stdout: &str) -> Option<String> {
    let frames: Vec<&str> = stderr
        .lines()
        .chain(stdout.lines())
        .filter(|line| line.trim_start().starts_with("at "))
        .collect();
    if frames.is_empty() {
        return None;
    }
    let mut stack = message.to_string();
    for frame in frames {
        stack.push('\n');
        stack.push_str(frame);
    }
    Some(stack)
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proctor_core::Severity;
    use std::path::Path;

    fn script(dir: &Path, name: &str, body: &str) -> String {
        std::fs::write(dir.join(name), body).unwrap();
        name.to_string()
    }

    #[test]
    fn test_argv_expansion() {
        let cmd = TestCommand::new(vec!["node".into(), "--test".into(), "{file}".into()]);
        assert_eq!(cmd.argv_for("a.test.js"), vec!["node", "--test", "a.test.js"]);

        let cmd = TestCommand::new(vec!["npx".into(), "jest".into()]);
        assert_eq!(cmd.argv_for("a.test.js"), vec!["npx", "jest", "a.test.js"]);

        assert_eq!(TestCommand::default().argv_for("a.sh"), vec!["a.sh"]);
    }

    #[test]
    fn test_passing_command_captures_console() {
        let dir = tempfile::tempdir().unwrap();
        let file = script(dir.path(), "ok.test.sh", "echo hi\n");
        let result = TestCommand::new(vec!["sh".into()]).with_cwd(dir.path()).run(&file);
        assert_eq!(result.severity, Severity::Info);
        assert_eq!(result.console_output, Some(vec!["hi".to_string()]));
        assert!(result.duration_ms.is_some());
    }

    #[test]
    fn test_failing_command_extracts_message_and_location() {
        let dir = tempfile::tempdir().unwrap();
        let file = script(
            dir.path(),
            "bad.test.sh",
            "echo 'AssertionError: expected 1 to equal 2' >&2\necho '    at run (tests/bad.test.ts:4:11)' >&2\nexit 1\n",
        );
        let result = TestCommand::new(vec!["sh".into()]).with_cwd(dir.path()).run(&file);
        assert_eq!(result.code.as_deref(), Some(codes::ERR_TEST_FAILED));
        assert_eq!(result.message, "AssertionError: expected 1 to equal 2");
        assert_eq!((result.line, result.column), (Some(4), Some(11)));
        assert!(result.stack.unwrap().contains("tests/bad.test.ts:4:11"));
    }

    #[test]
    fn test_missing_file_is_no_test() {
        let dir = tempfile::tempdir().unwrap();
        let result = TestCommand::new(vec!["sh".into()]).with_cwd(dir.path()).run("nope.test.sh");
        assert_eq!(result.code.as_deref(), Some(codes::ERR_NO_TEST));
    }

    #[test]
    fn test_unrunnable_program_is_worker_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = script(dir.path(), "x.test.sh", "");
        let result = TestCommand::new(vec!["/no/such/runner".into()]).with_cwd(dir.path()).run(&file);
        assert_eq!(result.code.as_deref(), Some(codes::ERR_WORKER));
    }

    #[test]
    fn test_timeout_kills_command() {
        let dir = tempfile::tempdir().unwrap();
        let file = script(dir.path(), "hang.test.sh", "echo started\nexec sleep 5\n");
        let start = Instant::now();
        let result = TestCommand::new(vec!["sh".into()])
            .with_cwd(dir.path())
            .with_timeout(Duration::from_millis(200))
            .run(&file);
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(result.code.as_deref(), Some(codes::ERR_TIMEOUT));
        assert_eq!(result.message, "Test timed out after 200ms");
        assert_eq!(result.console_output, Some(vec!["started".to_string()]));
    }

    #[test]
    fn test_work_fn_applies_unit_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let file = script(dir.path(), "hang.test.sh", "exec sleep 5\n");
        let work = TestCommand::new(vec!["sh".into()]).with_cwd(dir.path()).into_work_fn();
        let result = work(&WorkUnit::new("core", file, Duration::from_millis(100)));
        assert_eq!(result.code.as_deref(), Some(codes::ERR_TIMEOUT));
    }

    #[test]
    fn test_monitor_sees_running_command() {
        let dir = tempfile::tempdir().unwrap();
        let file = script(dir.path(), "slow.test.sh", "sleep 0.4\n");
        let mut pids = Vec::new();
        let result = TestCommand::new(vec!["sh".into()])
            .with_cwd(dir.path())
            .run_monitored(&file, |pid| pids.push(pid));
        assert_eq!(result.severity, Severity::Info);
        assert!(pids.len() >= 2, "expected repeated samples, got {pids:?}");
        assert!(pids.iter().all(|pid| *pid == pids[0]));
    }

    #[test]
    fn test_parse_timeout() {
        assert_eq!(parse_timeout("1500"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_timeout(" 20 "), Some(Duration::from_millis(20)));
        assert_eq!(parse_timeout("0"), None);
        assert_eq!(parse_timeout("soon"), None);
    }

    #[test]
    fn test_silent_failure_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let file = script(dir.path(), "quiet.test.sh", "exit 7\n");
        let result = TestCommand::new(vec!["sh".into()]).with_cwd(dir.path()).run(&file);
        assert_eq!(result.message, "Test command exited with code 7");
    }
}
