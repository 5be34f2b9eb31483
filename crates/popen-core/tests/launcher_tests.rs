//! End-to-end tests that launch real children.
//!
//! These run `/bin/sh` and a few coreutils, so they are Unix-only.

#![cfg(unix)]

use popen_core::{signal, EnvMap, IoBinding, LaunchConfig, LaunchState, Popen, PopenError, Stream};
use std::fs;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use tempfile::{NamedTempFile, TempDir};

/// `sh -c script` with stdout piped.
fn sh(script: &str) -> Popen {
    let mut popen = Popen::new(["/bin/sh", "-c", script]);
    popen.stdout(IoBinding::pipe());
    popen
}

fn read_stdout(popen: &mut Popen) -> String {
    let mut out = String::new();
    popen
        .stdout_stream()
        .expect("stdout should be piped")
        .read_to_string(&mut out)
        .unwrap();
    out
}

// ========================================
// Scenarios
// ========================================

#[test]
fn test_echo_hello_through_pipe() {
    let mut popen = Popen::new(["echo", "hello"]);
    popen.stdout(IoBinding::pipe()).text(true);
    popen.start().unwrap();

    assert!(popen.pid().is_some());
    assert_eq!(read_stdout(&mut popen), "hello\n");
    assert_eq!(popen.wait(None).unwrap(), Some(0));
    assert_eq!(popen.returncode(), Some(0));
    assert_eq!(popen.state(), LaunchState::Exited);
}

#[test]
fn test_text_mode_applies_to_stream_accessor() {
    let mut popen = sh(r"printf 'a\r\nb\rc\n'");
    popen.text(true);
    popen.start().unwrap();
    assert_eq!(read_stdout(&mut popen), "a\nb\nc\n");
    assert_eq!(popen.wait(None).unwrap(), Some(0));
}

#[test]
fn test_binary_mode_stream_keeps_carriage_returns() {
    let mut popen = sh(r"printf 'a\r\n'");
    popen.start().unwrap();
    let mut out = Vec::new();
    popen.take_stdout().unwrap().read_to_end(&mut out).unwrap();
    assert_eq!(out, b"a\r\n");
}

#[test]
fn test_nonexistent_executable_fails_start() {
    let mut popen = Popen::new(["/nonexistent/definitely/not/here"]);
    popen.stdout(IoBinding::pipe()).stderr(IoBinding::pipe());

    let err = popen.start().unwrap_err();
    assert!(!err.to_string().is_empty());
    assert_eq!(err.api(), Some("execve"));
    assert_eq!(err.os_code(), Some(libc::ENOENT));
    assert_eq!(popen.pid(), None);
    assert_eq!(popen.state(), LaunchState::Failed);
    assert_eq!(popen.error_code(), Some(&err));
}

#[test]
fn test_program_not_on_path() {
    let mut popen = Popen::new(["popen-test-no-such-program"]);
    let err = popen.start().unwrap_err();
    assert_eq!(err.os_code(), Some(libc::ENOENT));
}

#[test]
fn test_kill_reports_sentinel() {
    let mut popen = Popen::new(["sleep", "30"]);
    popen.start().unwrap();

    popen.kill().unwrap();
    assert_eq!(popen.wait(Some(Duration::from_secs(10))).unwrap(), Some(-9));
    assert_eq!(popen.returncode(), Some(-9));
}

// ========================================
// Lifecycle properties
// ========================================

#[test]
fn test_exit_status_captured_once() {
    let mut popen = Popen::new(["/bin/sh", "-c", "exit 3"]);
    popen.start().unwrap();

    let mut observed = None;
    for _ in 0..500 {
        if let Some(code) = popen.poll().unwrap() {
            observed = Some(code);
            break;
        }
        assert_eq!(popen.returncode(), None);
        std::thread::sleep(Duration::from_millis(10));
    }

    assert_eq!(observed, Some(3));
    assert_eq!(popen.wait(None).unwrap(), Some(3));
    assert_eq!(popen.poll().unwrap(), Some(3));
    assert_eq!(popen.returncode(), Some(3));
}

#[test]
fn test_wait_timeout_has_no_side_effects() {
    let mut popen = Popen::new(["sleep", "30"]);
    popen.start().unwrap();

    assert_eq!(popen.wait(Some(Duration::from_millis(50))).unwrap(), None);
    assert_eq!(popen.returncode(), None);
    assert_eq!(popen.state(), LaunchState::Running);
    popen.kill().unwrap();
    assert_eq!(popen.wait(None).unwrap(), Some(-9));
}

#[test]
fn test_start_is_idempotent() {
    let mut popen = Popen::new(["true"]);
    popen.start().unwrap();
    let pid = popen.pid();

    popen.start().unwrap();
    assert_eq!(popen.pid(), pid);
    assert_eq!(popen.wait(None).unwrap(), Some(0));
}

#[test]
fn test_failed_start_is_sticky() {
    let mut popen = Popen::new(["/nonexistent/program"]);
    let first = popen.start().unwrap_err();
    let second = popen.start().unwrap_err();
    assert_eq!(first, second);
    assert_eq!(popen.pid(), None);
}

#[test]
fn test_stdout_merge_marker() {
    let mut popen = sh("echo out; echo err 1>&2");
    popen.stderr(IoBinding::stdout());
    popen.start().unwrap();

    let captured = popen.communicate(None, None).unwrap();
    assert_eq!(captured.stdout_text().unwrap(), "out\nerr\n");
    assert_eq!(captured.stderr, None);

    for stream in [Stream::Stdin, Stream::Stdout] {
        let config = LaunchConfig::new(["true"]).with_stream(stream, IoBinding::stdout());
        let mut popen = Popen::from_config(config);
        let err = popen.start().unwrap_err();
        assert!(matches!(err, PopenError::InvalidArgument { .. }));
    }
}

#[test]
fn test_arguments_round_trip() {
    let mut popen = Popen::new([
        "/bin/sh",
        "-c",
        r#"for a in "$@"; do printf '[%s]\n' "$a"; done"#,
        "sh",
        "a b",
        "c\"d",
        "",
    ]);
    popen.stdout(IoBinding::pipe());
    popen.start().unwrap();

    assert_eq!(read_stdout(&mut popen), "[a b]\n[c\"d]\n[]\n");
    assert_eq!(popen.wait(None).unwrap(), Some(0));
}

#[test]
fn test_executable_overrides_program() {
    let mut popen = Popen::new(["custom-argv0", "-c", "echo $0"]);
    popen.executable("/bin/sh").stdout(IoBinding::pipe());
    popen.start().unwrap();
    assert_eq!(read_stdout(&mut popen), "custom-argv0\n");
}

#[test]
fn test_setters_after_start_are_ignored() {
    let mut popen = Popen::new(["true"]);
    popen.start().unwrap();
    popen.args(["false"]).cwd("/nonexistent");
    assert_eq!(popen.get_args(), ["true"]);
    assert_eq!(popen.config().cwd, None);
    assert_eq!(popen.wait(None).unwrap(), Some(0));
}

#[test]
fn test_lifecycle_calls_after_exit_are_noops() {
    let mut popen = Popen::new(["true"]);
    popen.start().unwrap();
    assert_eq!(popen.wait(None).unwrap(), Some(0));

    popen.kill().unwrap();
    popen.terminate().unwrap();
    popen.send_signal(signal::SIGUSR1).unwrap();
    assert_eq!(popen.returncode(), Some(0));
}

// ========================================
// Redirection
// ========================================

#[test]
fn test_stdout_to_file() {
    let out = NamedTempFile::new().unwrap();
    let mut popen = Popen::new(["echo", "to a file"]);
    popen.stdout(out.reopen().unwrap());
    popen.start().unwrap();
    assert_eq!(popen.wait(None).unwrap(), Some(0));
    assert!(popen.stdout_stream().is_none());

    assert_eq!(fs::read_to_string(out.path()).unwrap(), "to a file\n");
}

#[test]
fn test_raw_descriptor_binding_is_not_closed() {
    let out = NamedTempFile::new().unwrap();
    let file = out.reopen().unwrap();

    let mut popen = Popen::new(["echo", "raw"]);
    popen.stdout(IoBinding::Descriptor(file.as_raw_fd()));
    popen.start().unwrap();
    assert_eq!(popen.wait(None).unwrap(), Some(0));
    drop(popen);

    // Still ours to use.
    let mut file = file;
    writeln!(file, "after").unwrap();
    assert_eq!(fs::read_to_string(out.path()).unwrap(), "raw\nafter\n");
}

#[test]
fn test_devnull_stdin_reads_empty() {
    let mut popen = Popen::new(["cat"]);
    popen.stdin(IoBinding::devnull()).stdout(IoBinding::pipe());
    popen.start().unwrap();
    assert_eq!(read_stdout(&mut popen), "");
    assert_eq!(popen.wait(None).unwrap(), Some(0));
}

#[test]
fn test_devnull_output_discards() {
    let mut popen = sh("echo hidden; echo also 1>&2");
    popen.stdout(IoBinding::devnull()).stderr(IoBinding::devnull());
    popen.start().unwrap();
    assert!(popen.stdout_stream().is_none());
    assert_eq!(popen.wait(None).unwrap(), Some(0));
}

#[test]
fn test_stdin_pipe_streaming() {
    let mut popen = Popen::new(["cat"]);
    popen.stdin(IoBinding::pipe()).stdout(IoBinding::pipe());
    popen.start().unwrap();

    let mut stdin = popen.take_stdin().unwrap();
    stdin.write_all(b"streamed\n").unwrap();
    drop(stdin);

    assert_eq!(read_stdout(&mut popen), "streamed\n");
    assert_eq!(popen.wait(None).unwrap(), Some(0));
}

#[cfg(target_os = "linux")]
#[test]
fn test_pipesize_accepted() {
    let mut popen = sh("echo sized");
    popen.pipesize(1 << 16);
    popen.start().unwrap();
    assert_eq!(read_stdout(&mut popen), "sized\n");
}

// ========================================
// Environment and working directory
// ========================================

#[test]
fn test_env_replaces_parent_environment() {
    let mut env = EnvMap::new();
    env.insert("POPEN_TEST_VALUE", "from env");
    let mut popen = sh("echo \"$POPEN_TEST_VALUE|${HOME:-unset}\"");
    popen.env(env);
    popen.start().unwrap();
    assert_eq!(read_stdout(&mut popen), "from env|unset\n");
}

#[test]
fn test_empty_env_inherits_parent() {
    let mut popen = sh("echo ${PATH:+inherited}");
    popen.start().unwrap();
    assert_eq!(read_stdout(&mut popen), "inherited\n");
}

#[test]
fn test_child_path_used_for_lookup() {
    let dir = TempDir::new().unwrap();
    let script = dir.path().join("popen-hello");
    fs::write(&script, "#!/bin/sh\necho found via child PATH\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    let mut env = EnvMap::new();
    env.insert("PATH", dir.path().to_string_lossy());
    let mut popen = Popen::new(["popen-hello"]);
    popen.env(env).stdout(IoBinding::pipe());
    popen.start().unwrap();
    assert_eq!(read_stdout(&mut popen), "found via child PATH\n");
}

#[test]
fn test_cwd() {
    let dir = TempDir::new().unwrap();
    let mut popen = sh("pwd -P");
    popen.cwd(dir.path());
    popen.start().unwrap();

    let expected = fs::canonicalize(dir.path()).unwrap();
    assert_eq!(read_stdout(&mut popen).trim_end(), expected.to_str().unwrap());
}

#[test]
fn test_missing_cwd_reports_chdir() {
    let mut popen = Popen::new(["true"]);
    popen.cwd("/nonexistent/popen/cwd");
    let err = popen.start().unwrap_err();
    assert_eq!(err.api(), Some("chdir"));
    assert_eq!(err.os_code(), Some(libc::ENOENT));
}

// ========================================
// communicate
// ========================================

#[test]
fn test_communicate_with_input() {
    let mut popen = Popen::new(["cat"]);
    popen
        .stdin(IoBinding::pipe())
        .stdout(IoBinding::pipe())
        .stderr(IoBinding::pipe());
    popen.start().unwrap();

    let captured = popen.communicate(Some(b"ping"), None).unwrap();
    assert_eq!(captured.stdout.as_deref(), Some(&b"ping"[..]));
    assert_eq!(captured.stderr.as_deref(), Some(&b""[..]));
    assert_eq!(popen.returncode(), Some(0));
}

#[test]
fn test_communicate_large_output_does_not_deadlock() {
    let mut popen = sh("head -c 1000000 /dev/zero; head -c 1000000 /dev/zero 1>&2");
    popen.stderr(IoBinding::pipe());
    popen.start().unwrap();

    let captured = popen.communicate(None, Some(Duration::from_secs(30))).unwrap();
    assert_eq!(captured.stdout.map(|d| d.len()), Some(1_000_000));
    assert_eq!(captured.stderr.map(|d| d.len()), Some(1_000_000));
}

#[test]
fn test_communicate_repeats_cached_result() {
    let mut popen = sh("echo once");
    popen.stdin(IoBinding::pipe());
    popen.start().unwrap();

    let first = popen.communicate(None, None).unwrap();
    let second = popen.communicate(None, None).unwrap();
    assert_eq!(first, second);

    let err = popen.communicate(Some(b"late"), None).unwrap_err();
    assert!(matches!(err, PopenError::InvalidArgument { .. }));
}

#[test]
fn test_communicate_input_needs_stdin_pipe() {
    let mut popen = sh("true");
    popen.start().unwrap();
    let err = popen.communicate(Some(b"data"), None).unwrap_err();
    assert!(matches!(err, PopenError::InvalidArgument { .. }));
}

#[test]
fn test_communicate_timeout_then_resume() {
    let mut popen = sh("echo started; exec sleep 30");
    popen.start().unwrap();

    let err = popen
        .communicate(None, Some(Duration::from_millis(200)))
        .unwrap_err();
    assert_eq!(err, PopenError::Timeout(Duration::from_millis(200)));
    assert_eq!(popen.returncode(), None);

    popen.kill().unwrap();
    let captured = popen.communicate(None, Some(Duration::from_secs(10))).unwrap();
    assert_eq!(captured.stdout_text().unwrap(), "started\n");
    assert_eq!(popen.returncode(), Some(-9));
}

#[test]
fn test_text_mode_normalizes_newlines() {
    let mut popen = sh(r"printf 'a\r\nb\rc\n'");
    popen.text(true);
    popen.start().unwrap();

    let captured = popen.communicate(None, None).unwrap();
    assert_eq!(captured.stdout_text().unwrap(), "a\nb\nc\n");
}

#[test]
fn test_binary_mode_keeps_bytes() {
    let mut popen = sh(r"printf 'a\r\n'");
    popen.start().unwrap();

    let captured = popen.communicate(None, None).unwrap();
    assert_eq!(captured.stdout.as_deref(), Some(&b"a\r\n"[..]));
}

// ========================================
// Signals
// ========================================

#[test]
fn test_terminate_sends_sigterm() {
    let mut popen = Popen::new(["sleep", "30"]);
    popen.start().unwrap();
    popen.terminate().unwrap();
    assert_eq!(popen.wait(None).unwrap(), Some(-signal::SIGTERM));
}

#[test]
fn test_send_signal() {
    let mut popen = Popen::new(["sleep", "30"]);
    popen.start().unwrap();
    popen.send_signal(signal::SIGUSR1).unwrap();
    assert_eq!(popen.wait(None).unwrap(), Some(-signal::SIGUSR1));
}

#[test]
fn test_unknown_signal_not_supported() {
    let mut popen = Popen::new(["sleep", "30"]);
    popen.start().unwrap();
    let err = popen.send_signal(4242).unwrap_err();
    assert!(matches!(err, PopenError::NotSupported { .. }));
    assert_eq!(popen.error_code(), Some(&err));
    assert_eq!(popen.returncode(), None);
}

#[test]
fn test_drop_kills_running_child() {
    let mut popen = Popen::new(["sleep", "30"]);
    popen.start().unwrap();
    let pid = popen.pid().unwrap() as libc::pid_t;
    drop(popen);

    // Killed and reaped: the pid no longer exists.
    let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None);
    assert_eq!(alive, Err(nix::errno::Errno::ESRCH));
}

#[test]
fn test_close_keeps_returncode() {
    let mut popen = Popen::new(["sleep", "30"]);
    popen.stdout(IoBinding::pipe());
    popen.start().unwrap();

    popen.close().unwrap();
    assert_eq!(popen.returncode(), Some(-9));
    assert!(popen.stdout_stream().is_none());
    popen.close().unwrap();
}

// ========================================
// Shell mode
// ========================================

#[test]
fn test_shell_mode() {
    let mut popen = Popen::new(["echo $((1 + 2))"]);
    popen.shell(true).stdout(IoBinding::pipe());
    popen.start().unwrap();
    assert_eq!(read_stdout(&mut popen), "3\n");
}

#[test]
fn test_shell_mode_joins_arguments() {
    let mut popen = Popen::new(["echo", "a", "b"]);
    popen.shell(true).stdout(IoBinding::pipe());
    popen.start().unwrap();
    assert_eq!(read_stdout(&mut popen), "a b\n");
}

#[test]
fn test_shell_mode_quotes_extra_arguments() {
    let mut popen = Popen::new(["printf '%s|'", "a  b", "it's", ""]);
    popen.shell(true).stdout(IoBinding::pipe());
    popen.start().unwrap();
    assert_eq!(read_stdout(&mut popen), "a  b|it's||");
}

#[test]
fn test_shell_with_custom_interpreter() {
    let mut popen = Popen::new(["exit 7"]);
    popen.shell(true).executable("/bin/sh");
    popen.start().unwrap();
    assert_eq!(popen.wait(None).unwrap(), Some(7));
}

// ========================================
// POSIX options
// ========================================

#[test]
fn test_process_group() {
    let mut popen = Popen::new(["sleep", "30"]);
    popen.process_group(0);
    popen.start().unwrap();

    let pid = nix::unistd::Pid::from_raw(popen.pid().unwrap() as libc::pid_t);
    assert_eq!(nix::unistd::getpgid(Some(pid)).unwrap(), pid);
}

#[test]
fn test_start_new_session() {
    let mut popen = Popen::new(["sleep", "30"]);
    popen.start_new_session(true);
    popen.start().unwrap();

    let pid = nix::unistd::Pid::from_raw(popen.pid().unwrap() as libc::pid_t);
    assert_eq!(nix::unistd::getsid(Some(pid)).unwrap(), pid);
}

#[test]
fn test_umask() {
    let mut popen = sh("umask");
    popen.umask(0o027);
    popen.start().unwrap();
    assert_eq!(read_stdout(&mut popen).trim_end(), "0027");
}

#[test]
fn test_pass_fds_keeps_descriptor() {
    let file = tempfile::tempfile().unwrap();
    let fd = file.as_raw_fd();
    let check = format!("test -e /dev/fd/{}", fd);

    let mut closed = Popen::new(["/bin/sh", "-c", check.as_str()]);
    closed.start().unwrap();
    assert_ne!(closed.wait(None).unwrap(), Some(0));

    let mut passed = Popen::new(["/bin/sh", "-c", check.as_str()]);
    passed.close_fds(false).pass_fds([fd]);
    passed.start().unwrap();
    assert_eq!(passed.wait(None).unwrap(), Some(0));
    assert!(passed.config().unix.pass_fds.contains(&fd));
}

#[test]
#[allow(unsafe_code)]
fn test_pre_exec_failure_is_reported() {
    let mut popen = Popen::new(["true"]);
    // SAFETY: the hook only builds an io::Error from a code, which does not allocate.
    unsafe {
        popen.pre_exec(|| Err(std::io::Error::from_raw_os_error(libc::EPERM)));
    }
    let err = popen.start().unwrap_err();
    assert_eq!(err.api(), Some("pre_exec"));
    assert_eq!(err.os_code(), Some(libc::EPERM));
}

#[test]
#[allow(unsafe_code)]
fn test_pre_exec_runs_in_child() {
    let mut popen = sh("echo $PPID-ok");
    // SAFETY: setsid is async-signal-safe.
    unsafe {
        popen.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    popen.start().unwrap();
    assert!(read_stdout(&mut popen).ends_with("-ok\n"));
    assert_eq!(popen.wait(None).unwrap(), Some(0));
}
