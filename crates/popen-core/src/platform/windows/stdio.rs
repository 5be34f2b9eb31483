//! Turn [`StdioBindings`] into inheritable handles for the child.

use super::{duplicate_inheritable, owned, pipe, set_inheritable, to_wide};
use crate::error::{PopenError, Result};
use crate::platform::handles::{ChildEnd, HandleSet, ResolvedStdio, Slot};
use crate::platform::paths::null_device;
use crate::process::{Builtin, IoBinding, ParentStreams, StdioBindings, Stream};
use std::fs::File;
use std::os::windows::io::{AsRawHandle, OwnedHandle, RawHandle};
use std::ptr;
use tracing::debug;
use windows_sys::Win32::Foundation::{
    GENERIC_READ, GENERIC_WRITE, HANDLE, INVALID_HANDLE_VALUE, TRUE,
};
use windows_sys::Win32::Security::SECURITY_ATTRIBUTES;
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FILE_ATTRIBUTE_NORMAL, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::Console::{
    GetStdHandle, STD_ERROR_HANDLE, STD_INPUT_HANDLE, STD_OUTPUT_HANDLE,
};

pub(super) type WindowsStdio = ResolvedStdio<OwnedHandle, RawHandle>;

/// Allocate the child's three standard handles.
///
/// Every child end is an inheritable handle held in the set, so all three
/// can be passed with `STARTF_USESTDHANDLES`. Caller handles are duplicated,
/// never adopted.
pub(super) fn resolve(bindings: &StdioBindings, pipesize: Option<usize>) -> Result<WindowsStdio> {
    bindings.validate()?;

    let mut handles = HandleSet::new();
    let mut ends = [ChildEnd::Inherit; 3];
    for stream in Stream::ALL {
        ends[stream.index()] = resolve_one(stream, bindings.get(stream), pipesize, &mut handles)?;
    }
    Ok(ResolvedStdio { handles, ends })
}

fn resolve_one(
    stream: Stream,
    binding: &IoBinding,
    pipesize: Option<usize>,
    handles: &mut HandleSet<OwnedHandle>,
) -> Result<ChildEnd<RawHandle>> {
    let child = match binding {
        IoBinding::Inherit => inherit(stream)?,
        IoBinding::Builtin(Builtin::Pipe) => {
            let (read, write) = pipe(pipesize)?;
            let (parent, child) = if stream.parent_reads() {
                (read, write)
            } else {
                (write, read)
            };
            set_inheritable(&child)?;
            handles.insert(Slot::child(stream), child);
            handles.insert(Slot::parent(stream), parent);
            return Ok(ChildEnd::Owned(Slot::child(stream)));
        }
        IoBinding::Builtin(Builtin::DevNull) => {
            if !handles.contains(Slot::DevNull) {
                handles.insert(Slot::DevNull, open_null()?);
            }
            return Ok(ChildEnd::Owned(Slot::DevNull));
        }
        IoBinding::Builtin(Builtin::Stdout) => return Ok(ChildEnd::SameAsStdout),
        IoBinding::Descriptor(handle) => duplicate_inheritable(*handle as HANDLE)?,
        IoBinding::File(file) => duplicate_inheritable(file.as_raw_handle() as HANDLE)?,
    };
    handles.insert(Slot::child(stream), child);
    Ok(ChildEnd::Owned(Slot::child(stream)))
}

fn std_handle(stream: Stream) -> HANDLE {
    let which = match stream {
        Stream::Stdin => STD_INPUT_HANDLE,
        Stream::Stdout => STD_OUTPUT_HANDLE,
        Stream::Stderr => STD_ERROR_HANDLE,
    };
    // SAFETY: GetStdHandle has no preconditions.
    unsafe { GetStdHandle(which) }
}

/// Duplicate the parent's standard handle, or hand out a dead pipe end when
/// the parent has none (e.g. a GUI process).
fn inherit(stream: Stream) -> Result<OwnedHandle> {
    let parent = std_handle(stream);
    if !parent.is_null() && parent != INVALID_HANDLE_VALUE {
        return duplicate_inheritable(parent);
    }

    debug!("Parent has no {} handle; giving the child a detached pipe", stream);
    let (read, write) = pipe(None)?;
    let child = if stream.parent_reads() {
        drop(read);
        write
    } else {
        drop(write);
        read
    };
    set_inheritable(&child)?;
    Ok(child)
}

fn open_null() -> Result<OwnedHandle> {
    let path = to_wide(null_device().as_os_str(), "null device path")?;
    let attributes = SECURITY_ATTRIBUTES {
        nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: ptr::null_mut(),
        bInheritHandle: TRUE,
    };
    // SAFETY: `path` is NUL-terminated and `attributes` outlives the call.
    let handle = unsafe {
        CreateFileW(
            path.as_ptr(),
            GENERIC_READ | GENERIC_WRITE,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            &attributes,
            OPEN_EXISTING,
            FILE_ATTRIBUTE_NORMAL,
            ptr::null_mut(),
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        return Err(PopenError::last_os_error("CreateFileW"));
    }
    // SAFETY: CreateFileW returned a fresh handle.
    Ok(unsafe { owned(handle) })
}

/// Raw child handles for stdin, stdout, stderr.
pub(super) fn child_handles(stdio: &WindowsStdio) -> [HANDLE; 3] {
    let raw = |end: ChildEnd<RawHandle>| match end {
        ChildEnd::Owned(slot) => stdio
            .handles
            .get(slot)
            .map_or(ptr::null_mut(), |h| h.as_raw_handle() as HANDLE),
        ChildEnd::Borrowed(handle) => handle as HANDLE,
        ChildEnd::Inherit | ChildEnd::SameAsStdout => ptr::null_mut(),
    };

    let stdin = raw(stdio.end(Stream::Stdin));
    let stdout = raw(stdio.end(Stream::Stdout));
    let stderr = match stdio.end(Stream::Stderr) {
        ChildEnd::SameAsStdout => stdout,
        end => raw(end),
    };
    [stdin, stdout, stderr]
}

/// Move the parent-side pipe ends out of the set; the rest closes on drop.
pub(super) fn into_parent_streams(mut stdio: WindowsStdio) -> ParentStreams {
    let mut take = |stream| stdio.handles.take(Slot::parent(stream)).map(File::from);
    ParentStreams {
        stdin: take(Stream::Stdin),
        stdout: take(Stream::Stdout),
        stderr: take(Stream::Stderr),
    }
}
