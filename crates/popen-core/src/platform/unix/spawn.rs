//! fork/exec with an error channel back to the parent.
//!
//! Everything the child needs is prepared before `fork()`: argv, envp, the
//! list of executable candidates, the descriptor plan. Between fork and exec
//! the child only makes raw, async-signal-safe libc calls. If any step fails
//! it writes `(stage, errno)` to a close-on-exec pipe and exits with
//! [`LauncherConfig::EXEC_FAILURE_EXIT_CODE`]; a successful exec closes the
//! pipe, which the parent reads as an empty message.

use super::process::UnixProcess;
use super::{pipe, stdio};
use crate::config::LauncherConfig;
use crate::error::{PopenError, Result};
use crate::platform::paths::{default_shell, exec_candidates};
use crate::process::{marshal, LaunchConfig, ParentStreams, PreExecHook};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult, Pid};
use std::ffi::CString;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;
use tracing::{debug, info, warn};

/// Step of the child setup that failed, sent over the error pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum Stage {
    Dup = 1,
    Chdir,
    Signal,
    Setsid,
    Setpgid,
    Setgroups,
    Setgid,
    Setuid,
    PreExec,
    Inherit,
    Exec,
}

impl Stage {
    const ALL: [Stage; 11] = [
        Stage::Dup,
        Stage::Chdir,
        Stage::Signal,
        Stage::Setsid,
        Stage::Setpgid,
        Stage::Setgroups,
        Stage::Setgid,
        Stage::Setuid,
        Stage::PreExec,
        Stage::Inherit,
        Stage::Exec,
    ];

    fn from_wire(value: u32) -> Option<Stage> {
        Stage::ALL.into_iter().find(|s| *s as u32 == value)
    }

    fn api(self) -> &'static str {
        match self {
            Stage::Dup => "dup2",
            Stage::Chdir => "chdir",
            Stage::Signal => "signal",
            Stage::Setsid => "setsid",
            Stage::Setpgid => "setpgid",
            Stage::Setgroups => "setgroups",
            Stage::Setgid => "setgid",
            Stage::Setuid => "setuid",
            Stage::PreExec => "pre_exec",
            Stage::Inherit => "fcntl",
            Stage::Exec => "execve",
        }
    }
}

/// Owned C strings plus the pointer arrays exec needs.
struct CStringArray {
    _items: Vec<CString>,
    ptrs: Vec<*const libc::c_char>,
}

impl CStringArray {
    fn new<I, S>(items: I, what: &str) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<Vec<u8>>,
    {
        let items = items
            .into_iter()
            .map(|s| cstring(s, what))
            .collect::<Result<Vec<_>>>()?;
        let mut ptrs: Vec<_> = items.iter().map(|s| s.as_ptr()).collect();
        ptrs.push(ptr::null());
        Ok(Self {
            _items: items,
            ptrs,
        })
    }

    fn as_ptr(&self) -> *const *const libc::c_char {
        self.ptrs.as_ptr()
    }
}

fn cstring(value: impl Into<Vec<u8>>, what: &str) -> Result<CString> {
    CString::new(value)
        .map_err(|_| PopenError::invalid_argument(format!("{} contains a NUL byte", what)))
}

fn path_cstring(path: &Path, what: &str) -> Result<CString> {
    cstring(path.as_os_str().as_bytes(), what)
}

/// Everything the child does between fork and exec, fully allocated up front.
struct ExecPlan {
    candidates: Vec<CString>,
    argv: CStringArray,
    envp: Option<CStringArray>,
    cwd: Option<CString>,
    stdio: [Option<RawFd>; 3],
    umask: Option<libc::mode_t>,
    restore_signals: bool,
    start_new_session: bool,
    process_group: Option<libc::pid_t>,
    extra_groups: Option<Vec<libc::gid_t>>,
    group: Option<libc::gid_t>,
    user: Option<libc::uid_t>,
    close_fds: bool,
    /// Sorted descriptors to keep open when closing the rest.
    keep_fds: Vec<RawFd>,
    pass_fds: Vec<RawFd>,
}

pub(super) fn spawn(config: &mut LaunchConfig) -> Result<(UnixProcess, ParentStreams)> {
    // Configuration checks first: nothing is allocated if these fail.
    config.stdio.validate()?;
    let shell = if config.shell {
        Some(match &config.executable {
            Some(interpreter) => interpreter.clone(),
            None => default_shell()?,
        })
    } else {
        None
    };
    let executable = if shell.is_some() {
        None
    } else {
        config.executable.as_deref()
    };
    let command = marshal::posix_command(executable, &config.args, shell.as_deref())?;
    let env = marshal::env_entries(&config.env)?;

    let path_var = config
        .env
        .get("PATH")
        .map(str::to_owned)
        .or_else(|| std::env::var("PATH").ok());
    let candidates = exec_candidates(&command.program, path_var.as_deref())
        .iter()
        .map(|p| path_cstring(p, "executable path"))
        .collect::<Result<Vec<_>>>()?;

    let options = &config.unix;
    let mut close_fds = config.close_fds;
    if !options.pass_fds.is_empty() && !close_fds {
        warn!("pass_fds overrides close_fds=false; closing all other descriptors");
        close_fds = true;
    }

    let mut plan = ExecPlan {
        candidates,
        argv: CStringArray::new(command.argv.iter().map(String::as_str), "argument")?,
        envp: env
            .map(|entries| CStringArray::new(entries, "environment entry"))
            .transpose()?,
        cwd: config
            .cwd
            .as_deref()
            .map(|dir| path_cstring(dir, "working directory"))
            .transpose()?,
        stdio: [None; 3],
        umask: options.umask.map(|m| m as libc::mode_t),
        restore_signals: options.restore_signals,
        start_new_session: options.start_new_session,
        process_group: options.process_group,
        extra_groups: options.extra_groups.clone(),
        group: options.group,
        user: options.user,
        close_fds,
        keep_fds: Vec::new(),
        pass_fds: options.pass_fds.clone(),
    };

    debug!(
        "Spawning {:?} with {} candidate path(s)",
        command.argv,
        plan.candidates.len()
    );

    // From here on, handles exist; each early return closes them on drop.
    let resolved = stdio::resolve(&config.stdio, config.pipesize)?;
    plan.stdio = stdio::child_fds(&resolved);

    let (err_read, err_write) = pipe(None)?;
    plan.keep_fds = plan
        .pass_fds
        .iter()
        .copied()
        .chain(std::iter::once(err_write.as_raw_fd()))
        .filter(|fd| *fd > libc::STDERR_FILENO)
        .collect();
    plan.keep_fds.sort_unstable();
    plan.keep_fds.dedup();

    let hook = config.unix.pre_exec.as_mut();

    // SAFETY: the child branch only calls `exec_child`, which uses raw libc
    // calls on memory prepared above and never returns.
    let pid = match unsafe { fork() } {
        Ok(ForkResult::Child) => unsafe { exec_child(&plan, hook, err_write.as_raw_fd()) },
        Ok(ForkResult::Parent { child }) => child,
        Err(errno) => {
            return Err(PopenError::Os {
                api: "fork",
                code: errno as i32,
            })
        }
    };
    drop(err_write);

    match read_exec_status(File::from(err_read)) {
        Ok(None) => {}
        Ok(Some((stage, code))) => {
            reap(pid);
            debug!("Child {} failed in {}: errno {}", pid, stage.api(), code);
            return Err(PopenError::Os {
                api: stage.api(),
                code,
            });
        }
        Err(err) => {
            let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL);
            reap(pid);
            return Err(err);
        }
    }

    let streams = stdio::into_parent_streams(resolved);
    info!("Started process {} ({})", pid, command.program.display());
    Ok((UnixProcess::new(pid), streams))
}

/// Read the child's setup report: `None` once exec succeeded.
fn read_exec_status(mut pipe: File) -> Result<Option<(Stage, i32)>> {
    let mut buf = [0u8; 8];
    let mut filled = 0;
    while filled < buf.len() {
        match pipe.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(PopenError::from_io("read", e)),
        }
    }

    match filled {
        0 => Ok(None),
        8 => {
            let stage = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
            let code = i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
            let stage = Stage::from_wire(stage).ok_or(PopenError::Unknown)?;
            Ok(Some((stage, code)))
        }
        n => Err(PopenError::Io {
            message: format!("short read of {} bytes from exec status pipe", n),
            code: None,
        }),
    }
}

/// Collect a child that is known to be exiting.
fn reap(pid: Pid) {
    loop {
        match waitpid(pid, None) {
            Err(nix::errno::Errno::EINTR) => continue,
            _ => break,
        }
    }
}

fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL)
}

/// Report a failed setup step to the parent and exit.
///
/// # Safety
///
/// Must only be called in the forked child.
unsafe fn fail(err_fd: RawFd, stage: Stage, code: i32) -> ! {
    let mut msg = [0u8; 8];
    msg[..4].copy_from_slice(&(stage as u32).to_be_bytes());
    msg[4..].copy_from_slice(&code.to_be_bytes());
    let mut written = 0;
    while written < msg.len() {
        // SAFETY: writing from a stack buffer to our own pipe.
        let n = unsafe {
            libc::write(
                err_fd,
                msg[written..].as_ptr().cast(),
                msg.len() - written,
            )
        };
        if n > 0 {
            written += n as usize;
        } else if n == -1 && errno() == libc::EINTR {
            continue;
        } else {
            break;
        }
    }
    // SAFETY: _exit skips atexit handlers and stdio buffers inherited from the parent.
    unsafe { libc::_exit(LauncherConfig::EXEC_FAILURE_EXIT_CODE) }
}

/// Child side of the fork. Never returns.
///
/// # Safety
///
/// Must only be called in the forked child. Performs no allocation.
unsafe fn exec_child(plan: &ExecPlan, hook: Option<&mut PreExecHook>, err_fd: RawFd) -> ! {
    // SAFETY: every call below is async-signal-safe and works on memory that
    // was fully prepared before fork.
    unsafe {
        // A source descriptor may sit on a lower target number that an
        // earlier dup2 would overwrite; move those out of the way first.
        let mut fds = plan.stdio;
        for (target, slot) in fds.iter_mut().enumerate() {
            if let Some(fd) = *slot {
                if fd <= libc::STDERR_FILENO && fd != target as RawFd {
                    let moved = libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, libc::STDERR_FILENO + 1);
                    if moved == -1 {
                        fail(err_fd, Stage::Dup, errno());
                    }
                    *slot = Some(moved);
                }
            }
        }

        for (target, slot) in fds.iter().enumerate() {
            let Some(fd) = *slot else { continue };
            let target = target as RawFd;
            if fd == target {
                // dup2 onto itself keeps CLOEXEC; clear it by hand.
                let flags = libc::fcntl(fd, libc::F_GETFD);
                if flags == -1 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) == -1 {
                    fail(err_fd, Stage::Dup, errno());
                }
                continue;
            }
            while libc::dup2(fd, target) == -1 {
                let code = errno();
                if code != libc::EINTR {
                    fail(err_fd, Stage::Dup, code);
                }
            }
        }

        if let Some(cwd) = &plan.cwd {
            if libc::chdir(cwd.as_ptr()) == -1 {
                fail(err_fd, Stage::Chdir, errno());
            }
        }

        if let Some(mask) = plan.umask {
            libc::umask(mask);
        }

        if plan.restore_signals {
            for sig in [libc::SIGPIPE, libc::SIGXFSZ] {
                if libc::signal(sig, libc::SIG_DFL) == libc::SIG_ERR {
                    fail(err_fd, Stage::Signal, errno());
                }
            }
        }

        if plan.start_new_session && libc::setsid() == -1 {
            fail(err_fd, Stage::Setsid, errno());
        }

        if let Some(pgid) = plan.process_group {
            if libc::setpgid(0, pgid) == -1 {
                fail(err_fd, Stage::Setpgid, errno());
            }
        }

        if let Some(groups) = &plan.extra_groups {
            if libc::setgroups(groups.len() as _, groups.as_ptr()) == -1 {
                fail(err_fd, Stage::Setgroups, errno());
            }
        }

        if let Some(gid) = plan.group {
            if libc::setgid(gid) == -1 {
                fail(err_fd, Stage::Setgid, errno());
            }
        }

        if let Some(uid) = plan.user {
            if libc::setuid(uid) == -1 {
                fail(err_fd, Stage::Setuid, errno());
            }
        }

        if let Some(hook) = hook {
            if let Err(err) = hook() {
                fail(err_fd, Stage::PreExec, err.raw_os_error().unwrap_or(libc::EINVAL));
            }
        }

        if plan.close_fds {
            close_descriptors(&plan.keep_fds);
        }
        for &fd in &plan.pass_fds {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            if flags == -1 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) == -1 {
                fail(err_fd, Stage::Inherit, errno());
            }
        }

        // Remember the first failure that is not "no such file", as execvp does.
        let mut saved = 0;
        let mut last = libc::ENOENT;
        for candidate in &plan.candidates {
            match &plan.envp {
                Some(envp) => libc::execve(candidate.as_ptr(), plan.argv.as_ptr(), envp.as_ptr()),
                None => libc::execv(candidate.as_ptr(), plan.argv.as_ptr()),
            };
            last = errno();
            if saved == 0 && last != libc::ENOENT && last != libc::ENOTDIR {
                saved = last;
            }
        }
        fail(err_fd, Stage::Exec, if saved != 0 { saved } else { last })
    }
}

/// Close every descriptor above stderr except `keep` (sorted).
///
/// # Safety
///
/// Must only be called in the forked child.
unsafe fn close_descriptors(keep: &[RawFd]) {
    #[cfg(target_os = "linux")]
    {
        let mut first = libc::STDERR_FILENO + 1;
        let mut ok = true;
        for &fd in keep {
            if fd > first {
                // SAFETY: close_range only closes descriptors in the child.
                ok &= unsafe {
                    libc::syscall(
                        libc::SYS_close_range,
                        first as libc::c_uint,
                        (fd - 1) as libc::c_uint,
                        0,
                    )
                } == 0;
            }
            first = fd + 1;
        }
        // SAFETY: as above.
        ok &= unsafe {
            libc::syscall(
                libc::SYS_close_range,
                first as libc::c_uint,
                libc::c_uint::MAX,
                0,
            )
        } == 0;
        if ok {
            return;
        }
    }

    // SAFETY: sysconf has no preconditions.
    let max = match unsafe { libc::sysconf(libc::_SC_OPEN_MAX) } {
        n if n > 0 => n.min(65_536) as RawFd,
        _ => 4096,
    };
    for fd in (libc::STDERR_FILENO + 1)..max {
        if keep.binary_search(&fd).is_err() {
            // SAFETY: closing a descriptor number in the child; EBADF is harmless.
            unsafe { libc::close(fd) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_wire_values_round_trip() {
        for stage in Stage::ALL {
            assert_eq!(Stage::from_wire(stage as u32), Some(stage));
        }
        assert_eq!(Stage::from_wire(0), None);
        assert_eq!(Stage::Exec.api(), "execve");
    }

    #[test]
    fn test_exec_status_empty_pipe_means_success() {
        let (read, write) = pipe(None).unwrap();
        drop(write);
        assert_eq!(read_exec_status(File::from(read)).unwrap(), None);
    }

    #[test]
    fn test_exec_status_decodes_report() {
        use std::io::Write;

        let (read, write) = pipe(None).unwrap();
        let mut writer = File::from(write);
        writer.write_all(&(Stage::Chdir as u32).to_be_bytes()).unwrap();
        writer.write_all(&libc::ENOENT.to_be_bytes()).unwrap();
        drop(writer);

        let report = read_exec_status(File::from(read)).unwrap();
        assert_eq!(report, Some((Stage::Chdir, libc::ENOENT)));
    }

    #[test]
    fn test_cstring_array_is_null_terminated() {
        let array = CStringArray::new(["a", "bc"], "argument").unwrap();
        assert_eq!(array.ptrs.len(), 3);
        assert!(array.ptrs[2].is_null());
        assert!(CStringArray::new(["a\0b"], "argument").is_err());
    }
}
