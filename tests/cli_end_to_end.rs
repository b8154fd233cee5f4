//! Drive the `proctor` binary against a scratch project, with `proctor-worker` as the executor.
#![cfg(unix)]

use std::path::Path;
use std::process::{Command, Output};

fn project() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let config = serde_json::json!({
        "testPattern": r"\.test\.sh$",
        "parallelization": { "maxWorkers": 2, "testTimeoutMs": 10000 },
        "executor": {
            "program": env!("CARGO_BIN_EXE_proctor-worker"),
            "testCommand": ["sh", "{file}"]
        }
    });
    std::fs::write(dir.path().join(".proctorrc.json"), config.to_string()).unwrap();
    write(dir.path(), "tests/good/ok.test.sh", "echo fine\nexit 0\n");
    write(dir.path(), "tests/good/also_ok.test.sh", "exit 0\n");
    write(dir.path(), "tests/bad/broken.test.sh", "echo 'Error: nope' >&2\nexit 1\n");
    dir
}

fn write(root: &Path, relative: &str, body: &str) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, body).unwrap();
}

fn proctor(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_proctor"))
        .arg("--root")
        .arg(root)
        .args(args)
        .output()
        .unwrap()
}

#[test]
fn failing_file_exits_one_and_prints_failure_block() {
    let dir = project();
    let output = proctor(dir.path(), &[]);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert_eq!(output.status.code(), Some(1), "stderr: {stderr}");
    assert!(stderr.contains("tests/bad/broken.test.sh: nope"), "stderr: {stderr}");
    assert!(stderr.contains("ERR_TEST_FAILED"));
    assert!(stderr.contains("1 test(s) failed"));
    assert!(stderr.contains("2 passed"));

    let state = dir.path().join("project-state");
    assert!(state.join("structure.json").is_file());
    let history: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(state.join("history.json")).unwrap()).unwrap();
    assert_eq!(history.as_array().unwrap().len(), 3);
}

#[test]
fn scoped_passing_run_exits_zero() {
    let dir = project();
    let output = proctor(dir.path(), &["--path", "tests/good"]);
    assert_eq!(output.status.code(), Some(0), "stderr: {}", String::from_utf8_lossy(&output.stderr));
}

#[test]
fn backup_and_restore_commands() {
    let dir = project();
    proctor(dir.path(), &["--path", "tests/good"]);

    let backup = proctor(dir.path(), &["backup"]);
    assert_eq!(backup.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&backup.stdout).contains("Backed up structure.json"));

    let restore = proctor(dir.path(), &["restore", "structure.json"]);
    assert_eq!(restore.status.code(), Some(0));

    let unknown = proctor(dir.path(), &["restore", "nope.json"]);
    assert_eq!(unknown.status.code(), Some(1));
}

#[test]
fn broken_config_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(".proctorrc.json"), "{ not json").unwrap();
    let output = proctor(dir.path(), &[]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("proctor::config::parse"));
}
