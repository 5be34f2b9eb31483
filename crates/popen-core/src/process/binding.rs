//! Standard stream bindings.
//!
//! An [`IoBinding`] only records intent. It is turned into native handles by
//! the platform resolver during `start()`.

use crate::error::{PopenError, Result};
use std::fmt;
use std::fs::File;

#[cfg(unix)]
pub use std::os::fd::RawFd as RawDescriptor;
#[cfg(windows)]
pub use std::os::windows::io::RawHandle as RawDescriptor;

/// The three standard streams of a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Stdin,
    Stdout,
    Stderr,
}

impl Stream {
    pub const ALL: [Stream; 3] = [Stream::Stdin, Stream::Stdout, Stream::Stderr];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::Stdin => "stdin",
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }

    /// True when the parent reads this stream (stdout, stderr).
    pub fn parent_reads(&self) -> bool {
        !matches!(self, Stream::Stdin)
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Stream::Stdin => 0,
            Stream::Stdout => 1,
            Stream::Stderr => 2,
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Well-known redirection targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    /// A fresh pipe; the parent keeps the other end as a stream.
    Pipe,
    /// The platform null device.
    DevNull,
    /// Merge into the child's stdout. Only valid for stderr.
    Stdout,
}

/// How one standard stream of the child is wired.
#[derive(Default)]
pub enum IoBinding {
    /// Reuse the parent's own stream.
    #[default]
    Inherit,
    Builtin(Builtin),
    /// A caller-owned descriptor; the launcher never closes it.
    Descriptor(RawDescriptor),
    /// A caller-supplied file; the launcher duplicates or borrows it, never closes it.
    File(File),
}

impl IoBinding {
    pub fn pipe() -> Self {
        IoBinding::Builtin(Builtin::Pipe)
    }

    pub fn devnull() -> Self {
        IoBinding::Builtin(Builtin::DevNull)
    }

    pub fn stdout() -> Self {
        IoBinding::Builtin(Builtin::Stdout)
    }

    pub fn is_pipe(&self) -> bool {
        matches!(self, IoBinding::Builtin(Builtin::Pipe))
    }

    /// Check that this binding is legal for `stream`.
    ///
    /// Runs before any handle is allocated.
    pub(crate) fn validate(&self, stream: Stream) -> Result<()> {
        if matches!(self, IoBinding::Builtin(Builtin::Stdout)) && stream != Stream::Stderr {
            return Err(PopenError::invalid_argument(format!(
                "STDOUT can only be used for stderr, not {}",
                stream
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for IoBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoBinding::Inherit => f.write_str("Inherit"),
            IoBinding::Builtin(b) => write!(f, "{:?}", b),
            IoBinding::Descriptor(d) => write!(f, "Descriptor({:?})", d),
            IoBinding::File(file) => write!(f, "File({:?})", file),
        }
    }
}

impl From<Builtin> for IoBinding {
    fn from(builtin: Builtin) -> Self {
        IoBinding::Builtin(builtin)
    }
}

impl From<File> for IoBinding {
    fn from(file: File) -> Self {
        IoBinding::File(file)
    }
}

/// Bindings for all three streams, indexed by [`Stream`].
#[derive(Debug, Default)]
pub struct StdioBindings {
    pub stdin: IoBinding,
    pub stdout: IoBinding,
    pub stderr: IoBinding,
}

impl StdioBindings {
    pub fn get(&self, stream: Stream) -> &IoBinding {
        match stream {
            Stream::Stdin => &self.stdin,
            Stream::Stdout => &self.stdout,
            Stream::Stderr => &self.stderr,
        }
    }

    pub(crate) fn set(&mut self, stream: Stream, binding: IoBinding) {
        match stream {
            Stream::Stdin => self.stdin = binding,
            Stream::Stdout => self.stdout = binding,
            Stream::Stderr => self.stderr = binding,
        }
    }

    /// Validate all three bindings; the first offending stream wins.
    pub(crate) fn validate(&self) -> Result<()> {
        for stream in Stream::ALL {
            self.get(stream).validate(stream)?;
        }
        Ok(())
    }
}
