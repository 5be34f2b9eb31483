//! Popen Core - a child-process launcher modeled on Python's `subprocess.Popen`.
//!
//! This crate starts a child process with redirected standard streams, a
//! marshaled command line and environment, and tracks it until exit. It never
//! leaks a pipe or handle on a failed start, and a running child is killed and
//! reaped when its [`Popen`] is dropped.
//!
//! # Example
//!
//! ```rust,no_run
//! use popen_core::{IoBinding, Popen};
//! use std::io::Read;
//!
//! fn main() -> popen_core::Result<()> {
//!     let mut child = Popen::new(["echo", "hello"]);
//!     child.stdout(IoBinding::pipe()).text(true);
//!     child.start()?;
//!
//!     let mut out = String::new();
//!     if let Some(stdout) = child.stdout_stream() {
//!         stdout.read_to_string(&mut out)?;
//!     }
//!     child.wait(None)?;
//!     println!("{} -> {:?}", out.trim(), child.returncode());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod platform;
pub mod process;

// Re-export commonly used types
pub use config::LauncherConfig;
pub use error::{PopenError, Result};
pub use platform::signal;
pub use process::{
    list2cmdline, quote_arg, sh_quote, Builtin, Captured, ChildStderr, ChildStdin, ChildStdout,
    EnvMap, IoBinding, LaunchConfig, LaunchState, Popen, StdioBindings, Stream,
};
#[cfg(unix)]
pub use process::{PreExecHook, UnixOptions};
#[cfg(windows)]
pub use process::{StartupInfo, WindowsOptions};
