//! A child of a parent whose stdout is closed still gets a valid stdout.
//!
//! Closes this process's descriptor 1, so it lives in its own test binary
//! with a single test.

#![cfg(target_os = "linux")]
#![allow(unsafe_code)]

use popen_core::{IoBinding, Popen};
use std::time::Duration;

#[test]
fn test_child_stdout_valid_when_parent_stdout_closed() {
    let mut popen = Popen::new([
        "/bin/sh",
        "-c",
        "if [ -e /proc/self/fd/1 ]; then echo open >&2; else echo closed >&2; fi",
    ]);
    popen.stdin(IoBinding::pipe()).stderr(IoBinding::pipe());

    // SAFETY: plain descriptor juggling on this process's own stdout; it is
    // restored before any assertion can print.
    let saved = unsafe { libc::dup(libc::STDOUT_FILENO) };
    assert!(saved >= 0);
    unsafe { libc::close(libc::STDOUT_FILENO) };

    let result = popen
        .start()
        .and_then(|()| popen.communicate(None, Some(Duration::from_secs(10))));

    // SAFETY: as above.
    unsafe {
        libc::dup2(saved, libc::STDOUT_FILENO);
        libc::close(saved);
    }

    let captured = result.unwrap();
    assert_eq!(captured.stderr_text().as_deref(), Some("open\n"));
    assert_eq!(popen.returncode(), Some(0));
}
