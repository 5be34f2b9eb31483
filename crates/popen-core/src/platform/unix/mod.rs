//! POSIX launcher: pipes and descriptors, fork/exec, waitpid/kill.

// Descriptor plumbing and fork/exec are raw libc calls; each block carries a SAFETY note.
#![allow(unsafe_code)]

mod process;
mod spawn;
mod stdio;

pub(crate) use process::UnixProcess;

use crate::error::{PopenError, Result};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Create a close-on-exec pipe, returning `(read, write)`.
///
/// `size` is applied with `F_SETPIPE_SZ` on Linux and ignored elsewhere.
pub(super) fn pipe(size: Option<usize>) -> Result<(OwnedFd, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [-1, -1];

    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "illumos"
    ))]
    {
        // SAFETY: `fds` is a valid two-element array for pipe2 to fill.
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } == -1 {
            return Err(PopenError::last_os_error("pipe2"));
        }
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "illumos"
    )))]
    {
        // SAFETY: `fds` is a valid two-element array for pipe to fill.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
            return Err(PopenError::last_os_error("pipe"));
        }
    }

    // SAFETY: pipe just returned two fresh descriptors that nothing else owns.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "illumos"
    )))]
    {
        set_cloexec(read.as_raw_fd(), true)?;
        set_cloexec(write.as_raw_fd(), true)?;
    }

    #[cfg(target_os = "linux")]
    if let Some(size) = size {
        let size = libc::c_int::try_from(size)
            .map_err(|_| PopenError::invalid_argument(format!("pipe size {} too large", size)))?;
        // SAFETY: F_SETPIPE_SZ on a descriptor we own.
        if unsafe { libc::fcntl(write.as_raw_fd(), libc::F_SETPIPE_SZ, size) } == -1 {
            return Err(PopenError::last_os_error("fcntl(F_SETPIPE_SZ)"));
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = size;

    Ok((read, write))
}

/// Set or clear `FD_CLOEXEC`. Only needed where `pipe2` is unavailable.
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "illumos"
)))]
fn set_cloexec(fd: RawFd, cloexec: bool) -> Result<()> {
    // SAFETY: F_GETFD/F_SETFD only touch descriptor flags.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags == -1 {
            return Err(PopenError::last_os_error("fcntl(F_GETFD)"));
        }
        let new = if cloexec {
            flags | libc::FD_CLOEXEC
        } else {
            flags & !libc::FD_CLOEXEC
        };
        if new != flags && libc::fcntl(fd, libc::F_SETFD, new) == -1 {
            return Err(PopenError::last_os_error("fcntl(F_SETFD)"));
        }
    }
    Ok(())
}

/// True when `fd` refers to an open descriptor.
pub(super) fn is_open(fd: RawFd) -> bool {
    // SAFETY: F_GETFD on an arbitrary number is harmless; EBADF means closed.
    unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
}
