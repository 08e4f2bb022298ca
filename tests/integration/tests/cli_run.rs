//! CLI binary integration tests.
//!
//! These tests exercise the compiled `runbound` binary to verify command
//! routing, exit code mapping, and limit resolution.

use runbound_integration_tests::runbound_bin;
use std::io::Write;
use std::process::Command;
use std::time::{Duration, Instant};

fn runbound_cmd() -> Command {
    Command::new(runbound_bin())
}

#[test]
fn test_cli_version() {
    let output = runbound_cmd()
        .arg("version")
        .output()
        .expect("failed to run runbound");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("runbound"), "unexpected output: {}", stdout);
}

#[test]
fn test_cli_help_lists_commands() {
    let output = runbound_cmd()
        .arg("--help")
        .output()
        .expect("failed to run runbound");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["run", "limits", "version"] {
        assert!(stdout.contains(command), "help is missing {}", command);
    }
}

#[test]
fn test_cli_unknown_command_fails() {
    let output = runbound_cmd()
        .arg("nonexistent")
        .output()
        .expect("failed to run runbound");
    assert!(!output.status.success());
}

#[test]
fn test_cli_run_passes_exit_code_through() {
    let status = runbound_cmd()
        .args(["run", "--wall", "5", "--", "sh", "-c", "exit 3"])
        .status()
        .expect("failed to run runbound");
    assert_eq!(status.code(), Some(3));

    let status = runbound_cmd()
        .args(["run", "--", "true"])
        .status()
        .expect("failed to run runbound");
    assert_eq!(status.code(), Some(0));
}

#[test]
fn test_cli_run_forwards_output() {
    let output = runbound_cmd()
        .args(["run", "--", "echo", "bounded"])
        .output()
        .expect("failed to run runbound");
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "bounded");
}

#[test]
fn test_cli_run_timeout_exit_code() {
    let started = Instant::now();
    let output = runbound_cmd()
        .args(["run", "--wall", "1", "--grace", "1", "--", "sleep", "10"])
        .output()
        .expect("failed to run runbound");
    assert_eq!(output.status.code(), Some(124));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_cli_run_cpu_breach_is_aborted() {
    let output = runbound_cmd()
        .args(["run", "--json", "--cpu", "1", "--wall", "20", "--"])
        .args(["sh", "-c", "while :; do :; done"])
        .output()
        .expect("failed to run runbound");
    assert_eq!(output.status.code(), Some(125));

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["outcome"], "aborted");
    assert_eq!(json["value"], "cpu_time");
}

#[test]
fn test_cli_run_json_outcome() {
    let output = runbound_cmd()
        .args(["run", "--json", "--wall", "1", "--", "sleep", "10"])
        .output()
        .expect("failed to run runbound");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let json: serde_json::Value = serde_json::from_str(stdout.trim()).expect("JSON outcome");
    assert_eq!(json["outcome"], "timed_out");
}

#[test]
fn test_cli_limits_merges_file_and_flags() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "{{ memory_bytes: 50000000, cpu_seconds: 9 }}").unwrap();

    let output = runbound_cmd()
        .arg("limits")
        .arg("--limits")
        .arg(file.path())
        .args(["--cpu", "2"])
        .output()
        .expect("failed to run runbound");
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["memory_bytes"], 50_000_000);
    assert_eq!(json["cpu_seconds"], 2);
}

#[test]
fn test_cli_limits_rejects_zero() {
    let output = runbound_cmd()
        .args(["limits", "--wall", "0"])
        .output()
        .expect("failed to run runbound");
    assert!(!output.status.success());
}
