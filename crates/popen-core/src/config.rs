//! Centralized configuration for the launcher.
//!
//! Constants shared by the platform layers and the lifecycle controller.

use std::time::Duration;

/// Launcher-wide constants.
pub struct LauncherConfig;

impl LauncherConfig {
    /// Exit code used by a forked child that fails before `exec`.
    pub const EXEC_FAILURE_EXIT_CODE: i32 = 255;

    /// Return code reported for a child that was forcefully killed.
    ///
    /// Matches `-SIGKILL` on POSIX; Windows remaps to the same value.
    pub const KILLED_RETURNCODE: i32 = -9;

    /// Exit code passed to `TerminateProcess` by `kill()`.
    pub const WINDOWS_KILL_EXIT_CODE: u32 = 1;

    // Timed wait backoff
    pub const WAIT_POLL_INITIAL: Duration = Duration::from_millis(1);
    pub const WAIT_POLL_MAX: Duration = Duration::from_millis(50);
}

/// Shell and search-path configuration.
pub struct ShellConfig;

impl ShellConfig {
    pub const POSIX_SHELL: &'static str = "/bin/sh";
    pub const POSIX_SHELL_FLAG: &'static str = "-c";
    pub const FALLBACK_PATH: &'static str = "/bin:/usr/bin";

    pub const COMSPEC_VAR: &'static str = "COMSPEC";
    pub const SYSTEM_ROOT_VAR: &'static str = "SystemRoot";
    pub const WINDOWS_SHELL_FLAG: &'static str = "/c";
}
