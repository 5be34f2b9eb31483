use super::spawn;
use crate::config::LauncherConfig;
use crate::error::{PopenError, Result};
use crate::platform::PlatformProcess;
use crate::process::{LaunchConfig, ParentStreams};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::time::{Duration, Instant};
use tracing::debug;

/// A child started with fork/exec.
#[derive(Debug)]
pub(crate) struct UnixProcess {
    pid: Pid,
}

impl UnixProcess {
    pub(super) fn new(pid: Pid) -> Self {
        Self { pid }
    }
}

/// Map a wait status to a return code; `None` while the child is still running.
fn returncode(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, signal, _) => Some(-(signal as i32)),
        _ => None,
    }
}

impl PlatformProcess for UnixProcess {
    fn spawn(config: &mut LaunchConfig) -> Result<(Self, ParentStreams)> {
        spawn::spawn(config)
    }

    fn id(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    fn try_wait(&mut self) -> Result<Option<i32>> {
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::EINTR) => Ok(None),
            Ok(status) => Ok(returncode(status)),
            // Already collected elsewhere, e.g. with SIGCHLD ignored.
            Err(Errno::ECHILD) => {
                debug!("Process {} was reaped elsewhere", self.pid);
                Ok(Some(0))
            }
            Err(errno) => Err(PopenError::Os {
                api: "waitpid",
                code: errno as i32,
            }),
        }
    }

    fn wait_timeout(&mut self, timeout: Option<Duration>) -> Result<Option<i32>> {
        let Some(timeout) = timeout else {
            loop {
                match waitpid(self.pid, None) {
                    Ok(status) => {
                        if let Some(code) = returncode(status) {
                            return Ok(Some(code));
                        }
                    }
                    Err(Errno::EINTR) => continue,
                    Err(Errno::ECHILD) => return Ok(Some(0)),
                    Err(errno) => {
                        return Err(PopenError::Os {
                            api: "waitpid",
                            code: errno as i32,
                        })
                    }
                }
            }
        };

        // No waitpid variant takes a timeout; poll with a growing interval.
        let deadline = Instant::now() + timeout;
        let mut delay = LauncherConfig::WAIT_POLL_INITIAL;
        loop {
            if let Some(code) = self.try_wait()? {
                return Ok(Some(code));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(delay.min(deadline - now));
            delay = (delay * 2).min(LauncherConfig::WAIT_POLL_MAX);
        }
    }

    fn send_signal(&mut self, signal: i32) -> Result<()> {
        let signal = Signal::try_from(signal)
            .map_err(|_| PopenError::not_supported(format!("unknown signal {}", signal)))?;
        match kill(self.pid, signal) {
            // The child exited between our last wait and now.
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(PopenError::Os {
                api: "kill",
                code: errno as i32,
            }),
        }
    }

    fn terminate(&mut self) -> Result<()> {
        self.send_signal(libc::SIGTERM)
    }

    fn kill(&mut self) -> Result<()> {
        self.send_signal(libc::SIGKILL)
    }

    fn release(&mut self) {}
}
