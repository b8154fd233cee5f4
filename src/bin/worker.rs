//! `proctor-worker`: the default subprocess executor.
//!
//! Reads one test file path from stdin, runs the configured test command for it, and writes envelope lines to stdout:
//! metrics samples while the command runs, then exactly one result. Samples cover this process and everything it
//! spawned. The command is killed once `TEST_TIMEOUT` milliseconds have passed.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use std::io::{BufRead, Write};
use std::process::ExitCode;

use proctor::workers::TestCommand;
use proctor::workers::metrics::sample_tree_rss;
use proctor_core::{WorkResult, WorkerMessage, codes};

fn main() -> ExitCode {
    let mut line = String::new();
    if let Err(err) = std::io::stdin().lock().read_line(&mut line) {
        eprintln!("proctor-worker: failed to read work unit: {err}");
        return ExitCode::FAILURE;
    }
    let file = line.trim();

    let result = if file.is_empty() {
        WorkResult::error("", "Worker received an empty work unit").with_code(codes::ERR_NO_TEST)
    } else {
        let own_pid = std::process::id();
        TestCommand::from_env().run_monitored(file, |_| {
            if let Some(memory) = sample_tree_rss(own_pid) {
                emit(&WorkerMessage::Metrics { memory, cpu: 0.0 });
            }
        })
    };

    if emit(&WorkerMessage::Result(result)) { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

/// Write one envelope line; `false` if stdout is gone.
fn emit(message: &WorkerMessage) -> bool {
    let line = match message.to_line() {
        Ok(line) => line,
        Err(err) => {
            eprintln!("proctor-worker: failed to encode message: {err}");
            return false;
        }
    };
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{line}").and_then(|()| stdout.flush()).is_ok()
}
