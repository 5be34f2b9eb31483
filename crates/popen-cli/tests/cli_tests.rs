//! End-to-end tests for the `popen` binary, driven through popen-core itself.

#![cfg(unix)]

use popen_core::{Captured, EnvMap, IoBinding, Popen};
use std::time::Duration;

fn run_cli(args: &[&str]) -> (i32, Captured) {
    let env: EnvMap = [("RUST_LOG", "warn"), ("PATH", "/usr/bin:/bin")]
        .into_iter()
        .collect();
    let mut popen =
        Popen::new(std::iter::once(env!("CARGO_BIN_EXE_popen")).chain(args.iter().copied()));
    popen
        .stdout(IoBinding::pipe())
        .stderr(IoBinding::pipe())
        .env(env);
    popen.start().unwrap();
    let captured = popen
        .communicate(None, Some(Duration::from_secs(30)))
        .unwrap();
    (popen.returncode().unwrap(), captured)
}

#[test]
fn test_forwards_captured_stdout() {
    let (code, captured) = run_cli(&["--stdout", "pipe", "--", "echo", "hello"]);
    assert_eq!(code, 0);
    assert_eq!(captured.stdout_text().as_deref(), Some("hello\n"));
}

#[test]
fn test_exit_code_passthrough() {
    let (code, _) = run_cli(&["--", "sh", "-c", "exit 5"]);
    assert_eq!(code, 5);
}

#[test]
fn test_signal_exit_status() {
    let (code, _) = run_cli(&["--", "sh", "-c", "kill -9 $$"]);
    assert_eq!(code, 128 + 9);
}

#[test]
fn test_input_reaches_child() {
    let (code, captured) = run_cli(&["--input", "piped data", "--", "cat"]);
    assert_eq!(code, 0);
    assert_eq!(captured.stdout_text().as_deref(), Some("piped data"));
}

#[test]
fn test_shell_mode() {
    let (code, captured) = run_cli(&["--shell", "--stdout", "pipe", "--", "echo a && echo b"]);
    assert_eq!(code, 0);
    assert_eq!(captured.stdout_text().as_deref(), Some("a\nb\n"));
}

#[test]
fn test_timeout_kills_child() {
    let (code, captured) = run_cli(&["--timeout-ms", "200", "--", "sleep", "30"]);
    assert_eq!(code, 124);
    assert!(captured.stderr_text().unwrap().contains("Timed out"));
}

#[test]
fn test_profile_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let profile = dir.path().join("profile.json");
    std::fs::write(
        &profile,
        r#"{
            "args": ["sh", "-c", "echo $GREETING; echo oops >&2"],
            "env": {"GREETING": "from profile"},
            "stdout": "pipe",
            "stderr": "stdout"
        }"#,
    )
    .unwrap();

    let (code, captured) = run_cli(&["--profile", profile.to_str().unwrap()]);
    assert_eq!(code, 0);
    assert_eq!(
        captured.stdout_text().as_deref(),
        Some("from profile\noops\n")
    );
}

#[test]
fn test_flags_override_profile() {
    let dir = tempfile::TempDir::new().unwrap();
    let profile = dir.path().join("profile.json");
    std::fs::write(&profile, r#"{"args": ["echo", "profile"], "stdout": "pipe"}"#).unwrap();

    let (code, captured) = run_cli(&[
        "--profile",
        profile.to_str().unwrap(),
        "--",
        "echo",
        "flags",
    ]);
    assert_eq!(code, 0);
    assert_eq!(captured.stdout_text().as_deref(), Some("flags\n"));
}

#[test]
fn test_stdout_to_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let out = dir.path().join("out.txt");
    let (code, _) = run_cli(&["--stdout", out.to_str().unwrap(), "--", "echo", "to file"]);
    assert_eq!(code, 0);
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "to file\n");
}

#[test]
fn test_start_failure_reported() {
    let (code, captured) = run_cli(&["--", "/nonexistent/program"]);
    assert_eq!(code, 1);
    assert!(captured.stderr_text().unwrap().contains("Failed to start process"));
}
