//! The `Popen` process handle.
//!
//! # Example
//!
//! ```rust,no_run
//! use popen_core::{IoBinding, Popen};
//!
//! let mut child = Popen::new(["echo", "hello"]);
//! child.stdout(IoBinding::pipe()).text(true);
//! child.start()?;
//! let captured = child.communicate(None, None)?;
//! assert_eq!(captured.stdout_text().as_deref(), Some("hello\n"));
//! assert_eq!(child.returncode(), Some(0));
//! # Ok::<(), popen_core::PopenError>(())
//! ```

use super::binding::{IoBinding, Stream};
use super::communicate::{Captured, Communication, Deadline};
use super::env::EnvMap;
use super::options::LaunchConfig;
use super::streams::{ChildStderr, ChildStdin, ChildStdout, ParentStreams};
use crate::error::{PopenError, Result};
use crate::platform::{PlatformProcess, Process};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Coarse lifecycle of a [`Popen`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    /// Not started yet; setters take effect.
    Configured,
    /// `start()` failed. Terminal.
    Failed,
    /// The child exists and no exit has been observed.
    Running,
    /// The child's return code has been captured. Terminal.
    Exited,
}

#[derive(Debug)]
enum Lifecycle {
    Configured,
    Failed(PopenError),
    Started(ChildProcess),
}

/// A created child and everything the parent holds for it.
#[derive(Debug)]
struct ChildProcess {
    process: Process,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    returncode: Option<i32>,
    communication: Option<Communication>,
    captured: Option<Captured>,
}

impl ChildProcess {
    fn new(process: Process, streams: ParentStreams, text: bool) -> Self {
        Self {
            process,
            stdin: streams.stdin.map(ChildStdin::new),
            stdout: streams.stdout.map(|file| ChildStdout::new(file, text)),
            stderr: streams.stderr.map(|file| ChildStderr::new(file, text)),
            returncode: None,
            communication: None,
            captured: None,
        }
    }

    /// Record the exit exactly once and drop the OS process reference.
    fn finish(&mut self, code: i32) -> i32 {
        if self.returncode.is_none() {
            debug!("Process {} exited with {}", self.process.id(), code);
            self.returncode = Some(code);
            self.process.release();
        }
        code
    }

    fn poll(&mut self) -> Result<Option<i32>> {
        if let Some(code) = self.returncode {
            return Ok(Some(code));
        }
        Ok(self.process.try_wait()?.map(|code| self.finish(code)))
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<i32>> {
        if let Some(code) = self.returncode {
            return Ok(Some(code));
        }
        Ok(self
            .process
            .wait_timeout(timeout)?
            .map(|code| self.finish(code)))
    }

    /// Run `action` against a child that has not exited yet.
    ///
    /// Polls first so a signal is never sent to a pid that was already reaped.
    fn signal_with(&mut self, action: impl FnOnce(&mut Process) -> Result<()>) -> Result<()> {
        if self.poll()?.is_some() {
            return Ok(());
        }
        action(&mut self.process)
    }

    fn communicate(&mut self, input: Option<&[u8]>, timeout: Option<Duration>) -> Result<Captured> {
        let has_input = input.is_some_and(|data| !data.is_empty());

        if let Some(captured) = &self.captured {
            if has_input {
                return Err(PopenError::invalid_argument(
                    "cannot send input after communication has finished",
                ));
            }
            return Ok(captured.clone());
        }

        if has_input && self.communication.is_some() {
            return Err(PopenError::invalid_argument(
                "cannot send input after communication has started",
            ));
        }

        let deadline = timeout.map(Deadline::after);
        let mut comm = match self.communication.take() {
            Some(comm) => comm,
            None => {
                if has_input && self.stdin.is_none() {
                    return Err(PopenError::invalid_argument(
                        "communicate input requires stdin bound to PIPE",
                    ));
                }
                Communication::begin(
                    &mut self.stdin,
                    &mut self.stdout,
                    &mut self.stderr,
                    input.map(<[u8]>::to_vec),
                )?
            }
        };

        if let Err(err) = comm.drain(deadline) {
            self.communication = Some(comm);
            return Err(err);
        }

        let exited = match self.wait(deadline.map(|d| d.remaining())) {
            Ok(code) => code,
            Err(err) => {
                self.communication = Some(comm);
                return Err(err);
            }
        };
        if exited.is_none() {
            self.communication = Some(comm);
            return Err(deadline.map_or(PopenError::Unknown, |d| d.elapsed_error()));
        }

        let captured = comm.into_captured();
        self.captured = Some(captured.clone());
        Ok(captured)
    }

    /// Kill and reap a live child, then close the parent-side streams.
    fn shutdown(&mut self) -> Result<()> {
        if self.poll()?.is_none() {
            warn!("Killing still-running process {}", self.process.id());
            self.process.kill()?;
            self.wait(None)?;
        }
        self.stdin = None;
        self.stdout = None;
        self.stderr = None;
        self.communication = None;
        Ok(())
    }
}

/// A child process launcher in the style of Python's `subprocess.Popen`.
///
/// Configure with the chaining setters, then call [`Popen::start`]. Setters
/// called after `start()` are ignored with a warning. Lifecycle calls return
/// success without touching the OS once the return code is known.
///
/// Dropping a `Popen` whose child is still running kills and reaps it.
#[derive(Debug)]
pub struct Popen {
    config: LaunchConfig,
    state: Lifecycle,
    last_error: Option<PopenError>,
}

impl Popen {
    /// Create an unstarted handle for the given argument vector.
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_config(LaunchConfig::new(args))
    }

    /// Create an unstarted handle from a prepared config.
    pub fn from_config(config: LaunchConfig) -> Self {
        Self {
            config,
            state: Lifecycle::Configured,
            last_error: None,
        }
    }

    fn configure(&mut self, setting: &str, apply: impl FnOnce(&mut LaunchConfig)) -> &mut Self {
        if matches!(self.state, Lifecycle::Configured) {
            apply(&mut self.config);
        } else {
            warn!("Ignoring {} change: process already started", setting);
        }
        self
    }

    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.last_error = Some(err.clone());
        }
        result
    }

    fn child_mut(&mut self) -> Result<&mut ChildProcess> {
        match &mut self.state {
            Lifecycle::Started(child) => Ok(child),
            _ => Err(PopenError::NotStarted),
        }
    }

    fn child(&self) -> Option<&ChildProcess> {
        match &self.state {
            Lifecycle::Started(child) => Some(child),
            _ => None,
        }
    }

    // ========================================
    // Configuration
    // ========================================

    pub fn executable(&mut self, path: impl AsRef<Path>) -> &mut Self {
        let path = path.as_ref().to_path_buf();
        self.configure("executable", |c| c.executable = Some(path))
    }

    /// Replace the argument vector (`args[0]` included).
    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        self.configure("args", |c| c.args = args)
    }

    pub fn shell(&mut self, shell: bool) -> &mut Self {
        self.configure("shell", |c| c.shell = shell)
    }

    pub fn cwd(&mut self, path: impl AsRef<Path>) -> &mut Self {
        let path = path.as_ref().to_path_buf();
        self.configure("cwd", |c| c.cwd = Some(path))
    }

    /// Replace the child environment. An empty map inherits the parent's.
    pub fn env(&mut self, env: impl Into<EnvMap>) -> &mut Self {
        let env = env.into();
        self.configure("env", |c| c.env = env)
    }

    pub fn stdin(&mut self, binding: impl Into<IoBinding>) -> &mut Self {
        let binding = binding.into();
        self.configure("stdin", |c| c.stdio.set(Stream::Stdin, binding))
    }

    pub fn stdout(&mut self, binding: impl Into<IoBinding>) -> &mut Self {
        let binding = binding.into();
        self.configure("stdout", |c| c.stdio.set(Stream::Stdout, binding))
    }

    pub fn stderr(&mut self, binding: impl Into<IoBinding>) -> &mut Self {
        let binding = binding.into();
        self.configure("stderr", |c| c.stdio.set(Stream::Stderr, binding))
    }

    pub fn text(&mut self, text: bool) -> &mut Self {
        self.configure("text", |c| c.text = text)
    }

    pub fn close_fds(&mut self, close_fds: bool) -> &mut Self {
        self.configure("close_fds", |c| c.close_fds = close_fds)
    }

    pub fn pipesize(&mut self, size: usize) -> &mut Self {
        self.configure("pipesize", |c| c.pipesize = Some(size))
    }

    // ========================================
    // Introspection
    // ========================================

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    pub fn get_executable(&self) -> Option<&Path> {
        self.config.executable.as_deref()
    }

    pub fn get_args(&self) -> &[String] {
        &self.config.args
    }

    pub fn state(&self) -> LaunchState {
        match &self.state {
            Lifecycle::Configured => LaunchState::Configured,
            Lifecycle::Failed(_) => LaunchState::Failed,
            Lifecycle::Started(child) if child.returncode.is_some() => LaunchState::Exited,
            Lifecycle::Started(_) => LaunchState::Running,
        }
    }

    /// Process id, once started.
    pub fn pid(&self) -> Option<u32> {
        self.child().map(|child| child.process.id())
    }

    /// Return code, once an exit has been observed.
    pub fn returncode(&self) -> Option<i32> {
        self.child().and_then(|child| child.returncode)
    }

    /// Most recent error from any operation on this handle.
    pub fn error_code(&self) -> Option<&PopenError> {
        self.last_error.as_ref()
    }

    pub fn stdin_stream(&mut self) -> Option<&mut ChildStdin> {
        self.child_mut().ok()?.stdin.as_mut()
    }

    pub fn stdout_stream(&mut self) -> Option<&mut ChildStdout> {
        self.child_mut().ok()?.stdout.as_mut()
    }

    pub fn stderr_stream(&mut self) -> Option<&mut ChildStderr> {
        self.child_mut().ok()?.stderr.as_mut()
    }

    /// Move the stdin pipe out, e.g. to feed it from another thread.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child_mut().ok()?.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child_mut().ok()?.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child_mut().ok()?.stderr.take()
    }

    // ========================================
    // Lifecycle
    // ========================================

    /// Create the child process.
    ///
    /// Calling `start()` again returns the first outcome without launching
    /// anything: `Ok` after a success, a clone of the same error after a failure.
    pub fn start(&mut self) -> Result<()> {
        match &self.state {
            Lifecycle::Started(_) => return Ok(()),
            Lifecycle::Failed(err) => return Err(err.clone()),
            Lifecycle::Configured => {}
        }

        match Process::spawn(&mut self.config) {
            Ok((process, streams)) => {
                let child = ChildProcess::new(process, streams, self.config.text);
                self.state = Lifecycle::Started(child);
                Ok(())
            }
            Err(err) => {
                error!(
                    "Failed to start {}: {}",
                    self.config.program().unwrap_or("<none>"),
                    err
                );
                self.last_error = Some(err.clone());
                self.state = Lifecycle::Failed(err.clone());
                Err(err)
            }
        }
    }

    /// Check for exit without blocking. Returns the return code once exited.
    pub fn poll(&mut self) -> Result<Option<i32>> {
        let result = self.child_mut().and_then(ChildProcess::poll);
        self.record(result)
    }

    /// Block until exit, or until `timeout` elapses (`None` waits forever).
    ///
    /// Returns `Ok(None)` on timeout with no other effect.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<i32>> {
        let result = self.child_mut().and_then(|child| child.wait(timeout));
        self.record(result)
    }

    /// Send input, read stdout/stderr to end of file, and wait for exit.
    ///
    /// On timeout this returns [`PopenError::Timeout`] and keeps the reader
    /// threads running; call again (without input) to resume. Once complete,
    /// later calls return the same [`Captured`] data.
    pub fn communicate(
        &mut self,
        input: Option<&[u8]>,
        timeout: Option<Duration>,
    ) -> Result<Captured> {
        let result = self
            .child_mut()
            .and_then(|child| child.communicate(input, timeout));
        self.record(result)
    }

    /// Deliver `signal` to the child. See [`crate::platform::signal`].
    pub fn send_signal(&mut self, signal: i32) -> Result<()> {
        let result = self
            .child_mut()
            .and_then(|child| child.signal_with(|p| p.send_signal(signal)));
        self.record(result)
    }

    /// Ask the child to exit (SIGTERM, or WM_CLOSE to its windows).
    pub fn terminate(&mut self) -> Result<()> {
        let result = self
            .child_mut()
            .and_then(|child| child.signal_with(|p| p.terminate()));
        self.record(result)
    }

    /// Forcefully end the child (SIGKILL, or TerminateProcess).
    pub fn kill(&mut self) -> Result<()> {
        let result = self
            .child_mut()
            .and_then(|child| child.signal_with(|p| p.kill()));
        self.record(result)
    }

    /// Kill and reap a running child, then close all parent-side streams.
    ///
    /// The return code stays readable afterwards.
    pub fn close(&mut self) -> Result<()> {
        let result = match &mut self.state {
            Lifecycle::Started(child) => child.shutdown(),
            _ => Ok(()),
        };
        self.record(result)
    }
}

impl Drop for Popen {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("Failed to clean up child process: {}", err);
        }
    }
}

impl From<LaunchConfig> for Popen {
    fn from(config: LaunchConfig) -> Self {
        Self::from_config(config)
    }
}

// Unix-only settings
#[cfg(unix)]
impl Popen {
    /// Put the child in process group `pgid` (`0` makes it a group leader).
    pub fn process_group(&mut self, pgid: i32) -> &mut Self {
        self.configure("process_group", |c| c.unix.process_group = Some(pgid))
    }

    pub fn start_new_session(&mut self, enabled: bool) -> &mut Self {
        self.configure("start_new_session", |c| c.unix.start_new_session = enabled)
    }

    pub fn restore_signals(&mut self, enabled: bool) -> &mut Self {
        self.configure("restore_signals", |c| c.unix.restore_signals = enabled)
    }

    pub fn user(&mut self, uid: u32) -> &mut Self {
        self.configure("user", |c| c.unix.user = Some(uid))
    }

    pub fn group(&mut self, gid: u32) -> &mut Self {
        self.configure("group", |c| c.unix.group = Some(gid))
    }

    pub fn extra_groups(&mut self, gids: impl IntoIterator<Item = u32>) -> &mut Self {
        let gids: Vec<u32> = gids.into_iter().collect();
        self.configure("extra_groups", |c| c.unix.extra_groups = Some(gids))
    }

    pub fn umask(&mut self, mask: u32) -> &mut Self {
        self.configure("umask", |c| c.unix.umask = Some(mask))
    }

    /// Keep these descriptors open in the child. Forces `close_fds`.
    pub fn pass_fds(&mut self, fds: impl IntoIterator<Item = std::os::fd::RawFd>) -> &mut Self {
        let fds: Vec<_> = fds.into_iter().collect();
        self.configure("pass_fds", |c| c.unix.pass_fds = fds)
    }

    /// Run `hook` in the child between fork and exec.
    ///
    /// # Safety
    ///
    /// See [`super::UnixOptions::set_pre_exec`].
    #[allow(unsafe_code)]
    pub unsafe fn pre_exec<F>(&mut self, hook: F) -> &mut Self
    where
        F: FnMut() -> std::io::Result<()> + Send + Sync + 'static,
    {
        // SAFETY: forwarded to the caller.
        self.configure("pre_exec", |c| unsafe { c.unix.set_pre_exec(Box::new(hook)) })
    }
}

// Windows-only settings
#[cfg(windows)]
impl Popen {
    /// Extra `CreateProcessW` creation flags.
    pub fn creation_flags(&mut self, flags: u32) -> &mut Self {
        self.configure("creation_flags", |c| c.windows.creation_flags = flags)
    }

    pub fn startup_info(&mut self, info: super::StartupInfo) -> &mut Self {
        self.configure("startup_info", |c| c.windows.startup_info = info)
    }
}
