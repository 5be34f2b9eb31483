//! Process launching: configuration, marshaling, and the `Popen` handle.
//!
//! # Architecture
//!
//! - `binding` - Standard stream bindings (`IoBinding`, `Stream`)
//! - `env` - Ordered environment mapping
//! - `options` - `LaunchConfig` and the per-platform option structs
//! - `marshal` - Command line and environment block construction
//! - `streams` - Parent-side pipe ends
//! - `communicate` - Threaded capture-all I/O
//! - `launcher` - The `Popen` façade and lifecycle controller

mod binding;
mod communicate;
mod env;
mod launcher;
pub mod marshal;
mod options;
mod streams;

pub use binding::{Builtin, IoBinding, RawDescriptor, StdioBindings, Stream};
pub use communicate::Captured;
pub use env::EnvMap;
pub use launcher::{LaunchState, Popen};
pub use marshal::{list2cmdline, quote_arg, sh_quote};
pub use options::LaunchConfig;
#[cfg(unix)]
pub use options::{PreExecHook, UnixOptions};
#[cfg(windows)]
pub use options::{StartupInfo, WindowsOptions};
pub use streams::{ChildStderr, ChildStdin, ChildStdout};

pub(crate) use streams::ParentStreams;
