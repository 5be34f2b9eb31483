//! Turn [`StdioBindings`] into descriptors for the child.

use super::{is_open, pipe};
use crate::error::{PopenError, Result};
use crate::platform::handles::{ChildEnd, HandleSet, ResolvedStdio, Slot};
use crate::platform::paths::null_device;
use crate::process::{Builtin, IoBinding, ParentStreams, StdioBindings, Stream};
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use tracing::debug;

pub(super) type UnixStdio = ResolvedStdio<OwnedFd, RawFd>;

/// Allocate pipes and open the null device as the bindings require.
///
/// Bindings are validated before the first allocation. On error, everything
/// allocated so far is closed when the partial set is dropped.
pub(super) fn resolve(bindings: &StdioBindings, pipesize: Option<usize>) -> Result<UnixStdio> {
    // Taken before anything is allocated: a new pipe may land on a closed 0-2.
    let parent_open = Stream::ALL.map(|stream| is_open(stream.index() as RawFd));
    resolve_with(bindings, pipesize, parent_open)
}

fn resolve_with(
    bindings: &StdioBindings,
    pipesize: Option<usize>,
    parent_open: [bool; 3],
) -> Result<UnixStdio> {
    bindings.validate()?;

    let mut handles = HandleSet::new();
    let mut ends = [ChildEnd::Inherit; 3];
    for stream in Stream::ALL {
        let binding = bindings.get(stream);
        ends[stream.index()] = match binding {
            IoBinding::Inherit => inherit(stream, parent_open[stream.index()], &mut handles)?,
            _ => resolve_one(stream, binding, pipesize, &mut handles)?,
        };
    }
    Ok(ResolvedStdio { handles, ends })
}

fn resolve_one(
    stream: Stream,
    binding: &IoBinding,
    pipesize: Option<usize>,
    handles: &mut HandleSet<OwnedFd>,
) -> Result<ChildEnd<RawFd>> {
    match binding {
        IoBinding::Inherit => Ok(ChildEnd::Inherit),
        IoBinding::Builtin(Builtin::Pipe) => {
            let (read, write) = pipe(pipesize)?;
            let (parent, child) = if stream.parent_reads() {
                (read, write)
            } else {
                (write, read)
            };
            handles.insert(Slot::child(stream), child);
            handles.insert(Slot::parent(stream), parent);
            Ok(ChildEnd::Owned(Slot::child(stream)))
        }
        IoBinding::Builtin(Builtin::DevNull) => {
            if !handles.contains(Slot::DevNull) {
                handles.insert(Slot::DevNull, open_null()?);
            }
            Ok(ChildEnd::Owned(Slot::DevNull))
        }
        IoBinding::Builtin(Builtin::Stdout) => Ok(ChildEnd::SameAsStdout),
        IoBinding::Descriptor(fd) => {
            if !is_open(*fd) {
                return Err(PopenError::last_os_error("fcntl"));
            }
            Ok(ChildEnd::Borrowed(*fd))
        }
        IoBinding::File(file) => Ok(ChildEnd::Borrowed(file.as_raw_fd())),
    }
}

/// Keep the parent's stream, or substitute a dead pipe when the parent has none.
///
/// The child then sees end-of-file on stdin, or a broken pipe on output,
/// instead of whatever file the OS would hand out at that number.
fn inherit(
    stream: Stream,
    parent_open: bool,
    handles: &mut HandleSet<OwnedFd>,
) -> Result<ChildEnd<RawFd>> {
    if parent_open {
        return Ok(ChildEnd::Inherit);
    }

    debug!("Parent {} is closed; giving the child a detached pipe", stream);
    let (read, write) = pipe(None)?;
    let child = if stream.parent_reads() {
        drop(read);
        write
    } else {
        drop(write);
        read
    };
    handles.insert(Slot::child(stream), child);
    Ok(ChildEnd::Owned(Slot::child(stream)))
}

fn open_null() -> Result<OwnedFd> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(null_device())
        .map(OwnedFd::from)
        .map_err(|e| PopenError::from_io("open", e))
}

/// Descriptor each child stream should be wired to, `None` for inherit.
pub(super) fn child_fds(stdio: &UnixStdio) -> [Option<RawFd>; 3] {
    let raw = |end: ChildEnd<RawFd>| match end {
        ChildEnd::Inherit | ChildEnd::SameAsStdout => None,
        ChildEnd::Owned(slot) => stdio.handles.get(slot).map(AsRawFd::as_raw_fd),
        ChildEnd::Borrowed(fd) => Some(fd),
    };

    let stdin = raw(stdio.end(Stream::Stdin));
    let stdout = raw(stdio.end(Stream::Stdout));
    let stderr = match stdio.end(Stream::Stderr) {
        ChildEnd::SameAsStdout => Some(stdout.unwrap_or(libc::STDOUT_FILENO)),
        end => raw(end),
    };
    [stdin, stdout, stderr]
}

/// Move the parent-side pipe ends out of the set; the rest closes on drop.
pub(super) fn into_parent_streams(mut stdio: UnixStdio) -> ParentStreams {
    let mut take = |stream| stdio.handles.take(Slot::parent(stream)).map(File::from);
    ParentStreams {
        stdin: take(Stream::Stdin),
        stdout: take(Stream::Stdout),
        stderr: take(Stream::Stderr),
    }
}
