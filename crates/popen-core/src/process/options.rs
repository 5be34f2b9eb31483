//! Launch configuration.

use super::binding::{IoBinding, StdioBindings, Stream};
use super::env::EnvMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Everything needed to start one child process.
#[derive(Debug)]
pub struct LaunchConfig {
    /// Program to run. When unset, `args[0]` is the program.
    /// With `shell`, this names the interpreter instead.
    pub executable: Option<PathBuf>,
    /// Full argument vector, `args[0]` included.
    pub args: Vec<String>,
    /// Run the command through the platform shell.
    pub shell: bool,
    /// Working directory of the child.
    pub cwd: Option<PathBuf>,
    /// Child environment. Empty means inherit the parent's.
    pub env: EnvMap,
    /// Standard stream wiring.
    pub stdio: StdioBindings,
    /// Normalise newlines in captured output.
    pub text: bool,
    /// Close descriptors/handles the child was not explicitly given.
    pub close_fds: bool,
    /// Requested pipe buffer size in bytes, where the platform supports it.
    pub pipesize: Option<usize>,
    #[cfg(unix)]
    pub unix: UnixOptions,
    #[cfg(windows)]
    pub windows: WindowsOptions,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            executable: None,
            args: Vec::new(),
            shell: false,
            cwd: None,
            env: EnvMap::new(),
            stdio: StdioBindings::default(),
            text: false,
            close_fds: true,
            pipesize: None,
            #[cfg(unix)]
            unix: UnixOptions::default(),
            #[cfg(windows)]
            windows: WindowsOptions::default(),
        }
    }
}

impl LaunchConfig {
    /// Create a config for the given argument vector.
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Set the program path.
    pub fn with_executable(mut self, path: impl AsRef<Path>) -> Self {
        self.executable = Some(path.as_ref().to_path_buf());
        self
    }

    /// Add an argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_shell(mut self, shell: bool) -> Self {
        self.shell = shell;
        self
    }

    /// Set the working directory.
    pub fn with_cwd(mut self, path: impl AsRef<Path>) -> Self {
        self.cwd = Some(path.as_ref().to_path_buf());
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key, value);
        self
    }

    /// Bind one standard stream.
    pub fn with_stream(mut self, stream: Stream, binding: IoBinding) -> Self {
        self.stdio.set(stream, binding);
        self
    }

    pub fn with_text(mut self, text: bool) -> Self {
        self.text = text;
        self
    }

    pub fn with_close_fds(mut self, close_fds: bool) -> Self {
        self.close_fds = close_fds;
        self
    }

    /// The program the OS is asked to run, before shell wrapping.
    pub fn program(&self) -> Option<&str> {
        match &self.executable {
            Some(path) => path.to_str(),
            None => self.args.first().map(String::as_str),
        }
    }
}

#[cfg(unix)]
pub use unix_options::*;

#[cfg(unix)]
mod unix_options {
    use super::*;
    use std::io;
    use std::os::fd::RawFd;

    /// Hook run in the child between fork and exec.
    pub type PreExecHook = Box<dyn FnMut() -> io::Result<()> + Send + Sync>;

    /// POSIX-only launch settings.
    pub struct UnixOptions {
        /// `setpgid(0, pgid)` in the child; `Some(0)` makes a new group.
        pub process_group: Option<i32>,
        /// `setsid()` in the child.
        pub start_new_session: bool,
        /// Reset SIGPIPE and SIGXFSZ to their default dispositions.
        pub restore_signals: bool,
        pub user: Option<u32>,
        pub group: Option<u32>,
        pub extra_groups: Option<Vec<u32>>,
        pub umask: Option<u32>,
        /// Descriptors kept open in the child even with `close_fds`.
        pub pass_fds: Vec<RawFd>,
        pub(crate) pre_exec: Option<PreExecHook>,
    }

    impl Default for UnixOptions {
        fn default() -> Self {
            Self {
                process_group: None,
                start_new_session: false,
                restore_signals: true,
                user: None,
                group: None,
                extra_groups: None,
                umask: None,
                pass_fds: Vec::new(),
                pre_exec: None,
            }
        }
    }

    impl UnixOptions {
        /// Install a hook that runs in the forked child right before exec.
        ///
        /// # Safety
        ///
        /// The hook runs in a copy of a possibly multi-threaded process, so it
        /// must only perform async-signal-safe operations: no allocation, no
        /// locks, no logging.
        #[allow(unsafe_code)]
        pub unsafe fn set_pre_exec(&mut self, hook: PreExecHook) {
            self.pre_exec = Some(hook);
        }
    }

    impl fmt::Debug for UnixOptions {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("UnixOptions")
                .field("process_group", &self.process_group)
                .field("start_new_session", &self.start_new_session)
                .field("restore_signals", &self.restore_signals)
                .field("user", &self.user)
                .field("group", &self.group)
                .field("extra_groups", &self.extra_groups)
                .field("umask", &self.umask)
                .field("pass_fds", &self.pass_fds)
                .field("pre_exec", &self.pre_exec.is_some())
                .finish()
        }
    }
}

#[cfg(windows)]
pub use windows_options::*;

#[cfg(windows)]
mod windows_options {
    use std::os::windows::io::RawHandle;

    /// Windows-only launch settings.
    #[derive(Debug, Default)]
    pub struct WindowsOptions {
        /// Extra `CreateProcessW` creation flags.
        pub creation_flags: u32,
        pub startup_info: StartupInfo,
    }

    /// Subset of `STARTUPINFOW` exposed to callers.
    #[derive(Debug, Default)]
    pub struct StartupInfo {
        /// Extra `STARTF_*` flags.
        pub flags: u32,
        /// `wShowWindow` value; sets `STARTF_USESHOWWINDOW` when present.
        pub show_window: Option<u16>,
        /// Additional handles the child may inherit. They must already be inheritable.
        pub handle_list: Vec<RawHandle>,
    }
}
