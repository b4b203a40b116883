//! Integration tests for the `nkudo-agent` binary.
//!
//! These exercise the CLI as a subprocess, verifying exit codes and
//! output. No control plane is required — network-facing checks point at a
//! closed port and are expected to fail cleanly.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;
use std::process::Command;

fn agent_bin() -> String {
    let path = env!("CARGO_BIN_EXE_nkudo-agent");
    assert!(
        Path::new(path).exists(),
        "nkudo-agent binary not found at {path}"
    );
    path.to_owned()
}

/// Run the agent with args and return (`exit_code`, stdout, stderr).
fn run(args: &[&str], state_dir: &Path) -> (i32, String, String) {
    let output = Command::new(agent_bin())
        .args(args)
        .env("NKUDO_SERVER", "http://127.0.0.1:19999") // closed port
        .env("NKUDO_STATE_DIR", state_dir)
        .env("NKUDO_PKI_DIR", state_dir.join("pki"))
        .env("NKUDO_RUNTIME_DIR", state_dir.join("runtime"))
        .env_remove("NKUDO_STATE_KEY")
        .output()
        .expect("failed to execute nkudo-agent");

    let code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (code, stdout, stderr)
}

#[test]
fn version_flag_exits_zero() {
    let dir = tempfile::tempdir().unwrap();
    let (code, stdout, _) = run(&["--version"], dir.path());
    assert_eq!(code, 0);
    assert!(stdout.contains("nkudo-agent"));
}

#[test]
fn help_lists_subcommands() {
    let dir = tempfile::tempdir().unwrap();
    let (code, stdout, _) = run(&["--help"], dir.path());
    assert_eq!(code, 0);
    for subcommand in ["enroll", "run", "check"] {
        assert!(stdout.contains(subcommand), "help should list {subcommand}");
    }
}

#[test]
fn check_emits_csv_and_fails_without_server() {
    let dir = tempfile::tempdir().unwrap();
    let (code, stdout, _) = run(&["check"], dir.path());
    // The server is unreachable and PKI material is missing: exit 1.
    assert_eq!(code, 1);
    assert!(stdout.starts_with("check,ok,detail"));
    assert!(stdout.contains("state_dir_writable,true"));
    assert!(stdout.contains("server_reachable,false"));
    assert!(stdout.contains("pki_material,false"));
}

#[test]
fn enroll_against_dead_server_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let (code, _, stderr) = run(
        &["enroll", "--token", "net_deadbeef", "--hostname", "test-host"],
        dir.path(),
    );
    assert_eq!(code, 1);
    assert!(!stderr.is_empty(), "failure should be explained on stderr");
}

#[test]
fn run_without_enrollment_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let (code, _, stderr) = run(&["run"], dir.path());
    assert_eq!(code, 1);
    assert!(stderr.contains("not enrolled"));
}

#[test]
fn bad_state_key_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let output = Command::new(agent_bin())
        .args(["check"])
        .env("NKUDO_SERVER", "http://127.0.0.1:19999")
        .env("NKUDO_STATE_DIR", dir.path())
        .env("NKUDO_PKI_DIR", dir.path().join("pki"))
        .env("NKUDO_RUNTIME_DIR", dir.path().join("runtime"))
        .env("NKUDO_STATE_KEY", "way-too-short")
        .output()
        .unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(output.status.code(), Some(1));
    assert!(stdout.contains("state_key,false"));
}
