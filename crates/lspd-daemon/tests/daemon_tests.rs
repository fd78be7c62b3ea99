//! End-to-end tests against the `lspd` binary: each test works in its own
//! temp directory so the cwd-hashed socket/PID files never collide, and each
//! test tears its daemon down via `stop` when it's done with it.

use serde_json::Value;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

fn binary_path() -> PathBuf {
    let mut path = std::env::current_exe()
        .expect("failed to get current exe")
        .parent()
        .expect("failed to get parent directory")
        .to_path_buf();
    if path.ends_with("deps") {
        path.pop();
    }
    path.join("lspd")
}

fn run(dir: &std::path::Path, args: &[&str]) -> Value {
    let output = Command::new(binary_path())
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to execute lspd");
    serde_json::from_slice(&output.stdout)
        .unwrap_or_else(|_| panic!("non-JSON output: {}", String::from_utf8_lossy(&output.stdout)))
}

fn stop(dir: &std::path::Path) {
    run(dir, &["stop"]);
    // give the daemon a moment to actually exit before the temp dir is dropped
    std::thread::sleep(Duration::from_millis(200));
}

#[test]
fn status_reports_no_servers_for_a_fresh_workspace() {
    let temp_dir = tempfile::tempdir().expect("failed to create temp dir");

    let response = run(temp_dir.path(), &["status"]);
    assert_eq!(response["success"], Value::Bool(true));
    assert!(response["result"]
        .as_str()
        .unwrap()
        .contains("No language servers running"));

    stop(temp_dir.path());
}

#[test]
fn pwd_reports_the_directory_the_daemon_was_started_in() {
    let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
    let canonical = temp_dir.path().canonicalize().expect("canonicalize");

    let response = run(temp_dir.path(), &["pwd"]);
    assert_eq!(response["success"], Value::Bool(true));
    let reported = PathBuf::from(response["result"].as_str().unwrap());
    assert_eq!(reported.canonicalize().unwrap(), canonical);

    stop(temp_dir.path());
}

#[test]
fn logs_reports_a_path_to_an_existing_file() {
    let temp_dir = tempfile::tempdir().expect("failed to create temp dir");

    let response = run(temp_dir.path(), &["logs"]);
    assert_eq!(response["success"], Value::Bool(true));
    let log_path = PathBuf::from(response["result"].as_str().unwrap());
    assert!(log_path.is_file());

    stop(temp_dir.path());
}

#[test]
fn diagnostics_fails_cleanly_for_a_missing_file() {
    let temp_dir = tempfile::tempdir().expect("failed to create temp dir");

    let response = run(temp_dir.path(), &["diagnostics", "does-not-exist.rs"]);
    assert_eq!(response["success"], Value::Bool(false));
    assert!(response["error"]
        .as_str()
        .unwrap()
        .contains("does not exist"));

    stop(temp_dir.path());
}

#[test]
fn hover_fails_cleanly_for_a_missing_file() {
    let temp_dir = tempfile::tempdir().expect("failed to create temp dir");

    let response = run(temp_dir.path(), &["hover", "does-not-exist.rs", "foo"]);
    assert_eq!(response["success"], Value::Bool(false));

    stop(temp_dir.path());
}

#[test]
fn start_reports_detected_servers_for_an_empty_directory() {
    let temp_dir = tempfile::tempdir().expect("failed to create temp dir");

    let response = run(temp_dir.path(), &["start"]);
    assert_eq!(response["success"], Value::Bool(true));
    assert!(response["result"]
        .as_str()
        .unwrap()
        .contains("No applicable language servers detected"));

    stop(temp_dir.path());
}

#[test]
fn a_second_invocation_reuses_the_same_daemon() {
    let temp_dir = tempfile::tempdir().expect("failed to create temp dir");

    let first = run(temp_dir.path(), &["pwd"]);
    let second = run(temp_dir.path(), &["pwd"]);
    assert_eq!(first["result"], second["result"]);

    stop(temp_dir.path());
}

#[test]
fn unknown_command_fails_without_touching_the_daemon() {
    let temp_dir = tempfile::tempdir().expect("failed to create temp dir");

    let response = run(temp_dir.path(), &["frobnicate"]);
    assert_eq!(response["success"], Value::Bool(false));

    stop(temp_dir.path());
}
