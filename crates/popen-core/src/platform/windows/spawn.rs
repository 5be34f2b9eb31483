//! CreateProcessW with an explicit inheritance allow-list.

use super::process::WindowsProcess;
use super::{owned, stdio, to_wide};
use crate::error::{PopenError, Result};
use crate::platform::paths::default_shell;
use crate::process::{marshal, LaunchConfig, ParentStreams};
use std::ffi::{c_void, OsStr};
use std::mem;
use std::ptr;
use tracing::{debug, info};
use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, TRUE};
use windows_sys::Win32::System::Threading::{
    CreateProcessW, DeleteProcThreadAttributeList, InitializeProcThreadAttributeList,
    UpdateProcThreadAttribute, CREATE_UNICODE_ENVIRONMENT, EXTENDED_STARTUPINFO_PRESENT,
    LPPROC_THREAD_ATTRIBUTE_LIST, PROCESS_INFORMATION, PROC_THREAD_ATTRIBUTE_HANDLE_LIST,
    STARTF_USESHOWWINDOW, STARTF_USESTDHANDLES, STARTUPINFOEXW, STARTUPINFOW,
};

/// A one-entry `PROC_THREAD_ATTRIBUTE_LIST` carrying the handle allow-list.
///
/// The list points into `handles`, so both live together until
/// `CreateProcessW` has returned.
struct HandleAllowList {
    buffer: Vec<usize>,
    handles: Vec<HANDLE>,
}

impl HandleAllowList {
    fn new(handles: Vec<HANDLE>) -> Result<Self> {
        let mut size = 0usize;
        // SAFETY: size query with a null list; expected to fail with
        // ERROR_INSUFFICIENT_BUFFER after filling `size`.
        unsafe { InitializeProcThreadAttributeList(ptr::null_mut(), 1, 0, &mut size) };
        if size == 0 {
            return Err(PopenError::last_os_error("InitializeProcThreadAttributeList"));
        }

        let words = size.div_ceil(mem::size_of::<usize>());
        let mut list = Self {
            buffer: vec![0usize; words],
            handles,
        };
        // SAFETY: `buffer` holds at least `size` bytes, pointer-aligned.
        if unsafe { InitializeProcThreadAttributeList(list.as_ptr(), 1, 0, &mut size) } == 0 {
            // Not initialized: skip DeleteProcThreadAttributeList in Drop.
            let err = PopenError::last_os_error("InitializeProcThreadAttributeList");
            list.buffer.clear();
            return Err(err);
        }

        // SAFETY: the value pointer stays valid while `list` is alive.
        let ok = unsafe {
            UpdateProcThreadAttribute(
                list.as_ptr(),
                0,
                PROC_THREAD_ATTRIBUTE_HANDLE_LIST as usize,
                list.handles.as_ptr() as *const c_void,
                list.handles.len() * mem::size_of::<HANDLE>(),
                ptr::null_mut(),
                ptr::null(),
            )
        };
        if ok == 0 {
            return Err(PopenError::last_os_error("UpdateProcThreadAttribute"));
        }
        Ok(list)
    }

    fn as_ptr(&mut self) -> LPPROC_THREAD_ATTRIBUTE_LIST {
        self.buffer.as_mut_ptr() as LPPROC_THREAD_ATTRIBUTE_LIST
    }
}

impl Drop for HandleAllowList {
    fn drop(&mut self) {
        if !self.buffer.is_empty() {
            // SAFETY: the list was initialized in `new`.
            unsafe { DeleteProcThreadAttributeList(self.as_ptr()) };
        }
    }
}

pub(super) fn spawn(config: &mut LaunchConfig) -> Result<(WindowsProcess, ParentStreams)> {
    // Configuration checks first: nothing is allocated if these fail.
    config.stdio.validate()?;
    let shell = if config.shell {
        Some(match &config.executable {
            Some(interpreter) => interpreter.clone(),
            None => default_shell()?,
        })
    } else {
        None
    };
    let executable = if shell.is_some() {
        None
    } else {
        config.executable.as_deref()
    };
    let command = marshal::windows_command(executable, &config.args, shell.as_deref())?;
    let env_block = marshal::env_block_wide(&config.env)?;

    let application = command
        .application
        .as_deref()
        .map(|app| to_wide(app.as_os_str(), "executable path"))
        .transpose()?;
    let mut command_line = to_wide(OsStr::new(&command.command_line), "command line")?;
    let cwd = config
        .cwd
        .as_deref()
        .map(|dir| to_wide(dir.as_os_str(), "working directory"))
        .transpose()?;

    debug!("Spawning command line {}", command.command_line);

    // From here on, handles exist; each early return closes them on drop.
    let resolved = stdio::resolve(&config.stdio, config.pipesize)?;
    let [stdin, stdout, stderr] = stdio::child_handles(&resolved);

    let options = &config.windows;
    let mut flags = options.creation_flags;
    if env_block.is_some() {
        flags |= CREATE_UNICODE_ENVIRONMENT;
    }

    // SAFETY: STARTUPINFOEXW is plain data; all-zero is its documented initial state.
    let mut startup: STARTUPINFOEXW = unsafe { mem::zeroed() };
    startup.StartupInfo.dwFlags = STARTF_USESTDHANDLES | options.startup_info.flags;
    if let Some(show) = options.startup_info.show_window {
        startup.StartupInfo.dwFlags |= STARTF_USESHOWWINDOW;
        startup.StartupInfo.wShowWindow = show;
    }
    startup.StartupInfo.hStdInput = stdin;
    startup.StartupInfo.hStdOutput = stdout;
    startup.StartupInfo.hStdError = stderr;

    // Restrict inheritance to the std handles plus the caller's extras.
    let mut allow_list = if config.close_fds {
        let mut handles: Vec<HANDLE> = Vec::with_capacity(3 + options.startup_info.handle_list.len());
        for handle in [stdin, stdout, stderr]
            .into_iter()
            .chain(options.startup_info.handle_list.iter().map(|h| *h as HANDLE))
        {
            if !handle.is_null() && !handles.contains(&handle) {
                handles.push(handle);
            }
        }
        Some(HandleAllowList::new(handles)?)
    } else {
        None
    };
    if let Some(list) = allow_list.as_mut() {
        startup.lpAttributeList = list.as_ptr();
        startup.StartupInfo.cb = mem::size_of::<STARTUPINFOEXW>() as u32;
        flags |= EXTENDED_STARTUPINFO_PRESENT;
    } else {
        startup.StartupInfo.cb = mem::size_of::<STARTUPINFOW>() as u32;
    }

    // SAFETY: PROCESS_INFORMATION is plain data filled by CreateProcessW.
    let mut process_info: PROCESS_INFORMATION = unsafe { mem::zeroed() };
    // SAFETY: every pointer refers to a NUL-terminated buffer or struct that
    // outlives the call; `command_line` is mutable as CreateProcessW requires.
    let ok = unsafe {
        CreateProcessW(
            application.as_ref().map_or(ptr::null(), |a| a.as_ptr()),
            command_line.as_mut_ptr(),
            ptr::null(),
            ptr::null(),
            TRUE,
            flags,
            env_block
                .as_ref()
                .map_or(ptr::null(), |block| block.as_ptr() as *const c_void),
            cwd.as_ref().map_or(ptr::null(), |dir| dir.as_ptr()),
            &startup.StartupInfo,
            &mut process_info,
        )
    };
    if ok == 0 {
        // Captured before any cleanup call can overwrite the thread's last error.
        return Err(PopenError::last_os_error("CreateProcessW"));
    }
    drop(allow_list);

    // SAFETY: the primary thread handle is ours and unused.
    unsafe { CloseHandle(process_info.hThread) };
    // SAFETY: CreateProcessW returned a fresh process handle.
    let handle = unsafe { owned(process_info.hProcess) };

    let streams = stdio::into_parent_streams(resolved);
    info!("Started process {} ({})", process_info.dwProcessId, command.command_line);
    Ok((
        WindowsProcess::new(handle, process_info.dwProcessId, config.windows.creation_flags),
        streams,
    ))
}
