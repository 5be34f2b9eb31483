//! Windows launcher: anonymous pipes, CreateProcessW, process-handle waits.

// Win32 calls go through windows-sys; each block carries a SAFETY note.
#![allow(unsafe_code)]

mod process;
mod spawn;
mod stdio;

pub(crate) use process::WindowsProcess;

use crate::error::{PopenError, Result};
use std::ffi::OsStr;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{FromRawHandle, OwnedHandle, RawHandle};
use std::ptr;
use windows_sys::Win32::Foundation::{
    DuplicateHandle, SetHandleInformation, DUPLICATE_SAME_ACCESS, HANDLE, HANDLE_FLAG_INHERIT,
};
use windows_sys::Win32::System::Pipes::CreatePipe;
use windows_sys::Win32::System::Threading::GetCurrentProcess;

/// Take ownership of a handle returned by a Win32 call.
///
/// # Safety
///
/// `handle` must be valid and owned by nobody else.
pub(super) unsafe fn owned(handle: HANDLE) -> OwnedHandle {
    // SAFETY: guaranteed by the caller.
    unsafe { OwnedHandle::from_raw_handle(handle as RawHandle) }
}

/// Create an anonymous pipe with non-inheritable ends, returning `(read, write)`.
pub(super) fn pipe(size: Option<usize>) -> Result<(OwnedHandle, OwnedHandle)> {
    let size = match size {
        Some(size) => u32::try_from(size)
            .map_err(|_| PopenError::invalid_argument(format!("pipe size {} too large", size)))?,
        None => 0,
    };
    let mut read: HANDLE = ptr::null_mut();
    let mut write: HANDLE = ptr::null_mut();
    // SAFETY: both out-pointers are valid; null attributes means not inheritable.
    if unsafe { CreatePipe(&mut read, &mut write, ptr::null(), size) } == 0 {
        return Err(PopenError::last_os_error("CreatePipe"));
    }
    // SAFETY: CreatePipe returned two fresh handles.
    Ok(unsafe { (owned(read), owned(write)) })
}

/// Mark a handle we own as inheritable.
pub(super) fn set_inheritable(handle: &OwnedHandle) -> Result<()> {
    use std::os::windows::io::AsRawHandle;
    // SAFETY: only the inherit flag of a live handle is changed.
    let ok = unsafe {
        SetHandleInformation(
            handle.as_raw_handle() as HANDLE,
            HANDLE_FLAG_INHERIT,
            HANDLE_FLAG_INHERIT,
        )
    };
    if ok == 0 {
        return Err(PopenError::last_os_error("SetHandleInformation"));
    }
    Ok(())
}

/// Inheritable duplicate of a handle we do not own.
pub(super) fn duplicate_inheritable(handle: HANDLE) -> Result<OwnedHandle> {
    let mut dup: HANDLE = ptr::null_mut();
    // SAFETY: duplicates within the current process; `dup` receives a new handle.
    let ok = unsafe {
        let current = GetCurrentProcess();
        DuplicateHandle(current, handle, current, &mut dup, 0, 1, DUPLICATE_SAME_ACCESS)
    };
    if ok == 0 {
        return Err(PopenError::last_os_error("DuplicateHandle"));
    }
    // SAFETY: DuplicateHandle returned a fresh handle.
    Ok(unsafe { owned(dup) })
}

/// NUL-terminated UTF-16, rejecting interior NULs.
pub(super) fn to_wide(value: &OsStr, what: &str) -> Result<Vec<u16>> {
    let mut wide: Vec<u16> = value.encode_wide().collect();
    if wide.contains(&0) {
        return Err(PopenError::invalid_argument(format!(
            "{} contains a NUL character",
            what
        )));
    }
    wide.push(0);
    Ok(wide)
}
