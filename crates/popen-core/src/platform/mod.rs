//! Platform abstraction layer.
//!
//! All `#[cfg]` blocks for OS-specific behavior live in this module. Each
//! supported platform family provides one complete implementation of
//! [`PlatformProcess`]; the launcher façade only ever talks to the
//! implementation selected at build time through [`Process`].
//!
//! # Architecture
//!
//! - `handles` - Ownership ledger for handles allocated during one start
//! - `paths` - Default shell, null device, executable search
//! - `unix` - fork/exec launcher (Linux, macOS, BSDs)
//! - `windows` - `CreateProcessW` launcher
//!
//! # Supported Platforms
//!
//! - **Linux**: Full support
//! - **macOS**: Full support (no pipe size control)
//! - **Windows**: Full support

pub(crate) mod handles;
pub mod paths;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub(crate) use unix::UnixProcess as Process;
#[cfg(windows)]
pub(crate) use windows::WindowsProcess as Process;

pub use paths::{default_shell, null_device};

use crate::error::Result;
use crate::process::{LaunchConfig, ParentStreams};
use std::time::Duration;

/// Capabilities one platform must provide for a single child process.
///
/// Return codes are already mapped to the launcher's conventions: the exit
/// code, `-N` for death by signal N on POSIX, and
/// `LauncherConfig::KILLED_RETURNCODE` for a child we force-killed on Windows.
pub(crate) trait PlatformProcess: Sized {
    /// Resolve stdio, marshal the command, and create the child.
    ///
    /// On error every handle allocated by this call has been closed.
    fn spawn(config: &mut LaunchConfig) -> Result<(Self, ParentStreams)>;

    fn id(&self) -> u32;

    /// Non-blocking exit check.
    fn try_wait(&mut self) -> Result<Option<i32>>;

    /// Block until exit or until `timeout` elapses (`None` waits forever).
    fn wait_timeout(&mut self, timeout: Option<Duration>) -> Result<Option<i32>>;

    fn send_signal(&mut self, signal: i32) -> Result<()>;

    /// Ask the child to shut down cooperatively.
    fn terminate(&mut self) -> Result<()>;

    /// Forcefully end the child.
    fn kill(&mut self) -> Result<()>;

    /// Drop OS resources tied to the process once its exit has been observed.
    fn release(&mut self);
}

/// Signal numbers accepted by `Popen::send_signal`.
pub mod signal {
    #[cfg(unix)]
    pub use libc::{SIGHUP, SIGINT, SIGKILL, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2};

    /// Console control event delivered with `GenerateConsoleCtrlEvent`.
    #[cfg(windows)]
    pub const CTRL_C_EVENT: i32 = 0;
    #[cfg(windows)]
    pub const CTRL_BREAK_EVENT: i32 = 1;
    /// Mapped to `terminate()`.
    #[cfg(windows)]
    pub const SIGTERM: i32 = 15;
}

/// Returns the platform family the launcher was built for.
pub fn platform_family() -> &'static str {
    if cfg!(windows) {
        "windows"
    } else if cfg!(unix) {
        "unix"
    } else {
        "unknown"
    }
}
