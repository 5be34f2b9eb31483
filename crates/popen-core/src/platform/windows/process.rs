use super::spawn;
use crate::config::LauncherConfig;
use crate::error::{PopenError, Result};
use crate::platform::{signal, PlatformProcess};
use crate::process::{LaunchConfig, ParentStreams};
use std::os::windows::io::{AsRawHandle, OwnedHandle};
use std::time::Duration;
use tracing::debug;
use windows_sys::Win32::Foundation::{
    BOOL, ERROR_ACCESS_DENIED, HANDLE, HWND, LPARAM, TRUE, WAIT_FAILED, WAIT_OBJECT_0,
    WAIT_TIMEOUT,
};
use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
use windows_sys::Win32::System::Threading::{
    GetExitCodeProcess, TerminateProcess, WaitForSingleObject, CREATE_NEW_PROCESS_GROUP, INFINITE,
};
use windows_sys::Win32::UI::WindowsAndMessaging::{
    EnumWindows, GetWindowThreadProcessId, PostMessageW, WM_CLOSE,
};

/// Exit code reported by `GetExitCodeProcess` while a process runs.
const STILL_ACTIVE: u32 = 259;

/// A child started with CreateProcessW.
#[derive(Debug)]
pub(crate) struct WindowsProcess {
    handle: Option<OwnedHandle>,
    pid: u32,
    creation_flags: u32,
    /// Set once we called TerminateProcess, so its exit code maps to the kill sentinel.
    killed: bool,
    exit_code: Option<i32>,
}

impl WindowsProcess {
    pub(super) fn new(handle: OwnedHandle, pid: u32, creation_flags: u32) -> Self {
        Self {
            handle: Some(handle),
            pid,
            creation_flags,
            killed: false,
            exit_code: None,
        }
    }

    fn raw(&self) -> Result<HANDLE> {
        self.handle
            .as_ref()
            .map(|h| h.as_raw_handle() as HANDLE)
            .ok_or(PopenError::NotStarted)
    }

    /// Wait on the process handle for up to `millis`.
    fn wait_millis(&mut self, millis: u32) -> Result<Option<i32>> {
        if let Some(code) = self.exit_code {
            return Ok(Some(code));
        }
        let handle = self.raw()?;
        // SAFETY: `handle` is a live process handle we own.
        match unsafe { WaitForSingleObject(handle, millis) } {
            WAIT_OBJECT_0 => {}
            WAIT_TIMEOUT => return Ok(None),
            WAIT_FAILED => return Err(PopenError::last_os_error("WaitForSingleObject")),
            other => {
                debug!("Unexpected wait result {} for process {}", other, self.pid);
                return Err(PopenError::Unknown);
            }
        }

        let mut code: u32 = 0;
        // SAFETY: `code` is a valid out-pointer.
        if unsafe { GetExitCodeProcess(handle, &mut code) } == 0 {
            return Err(PopenError::last_os_error("GetExitCodeProcess"));
        }
        let code = if self.killed && code == LauncherConfig::WINDOWS_KILL_EXIT_CODE {
            LauncherConfig::KILLED_RETURNCODE
        } else {
            code as i32
        };
        self.exit_code = Some(code);
        Ok(Some(code))
    }
}

struct CloseRequest {
    pid: u32,
    posted: usize,
}

unsafe extern "system" fn post_close(hwnd: HWND, lparam: LPARAM) -> BOOL {
    // SAFETY: `lparam` is the `CloseRequest` passed to EnumWindows, alive for the whole enumeration.
    let request = unsafe { &mut *(lparam as *mut CloseRequest) };
    let mut owner: u32 = 0;
    // SAFETY: `hwnd` comes from EnumWindows; `owner` is a valid out-pointer.
    unsafe { GetWindowThreadProcessId(hwnd, &mut owner) };
    // SAFETY: posting a message to a window handle from EnumWindows.
    if owner == request.pid && unsafe { PostMessageW(hwnd, WM_CLOSE, 0, 0) } != 0 {
        request.posted += 1;
    }
    TRUE
}

impl PlatformProcess for WindowsProcess {
    fn spawn(config: &mut LaunchConfig) -> Result<(Self, ParentStreams)> {
        spawn::spawn(config)
    }

    fn id(&self) -> u32 {
        self.pid
    }

    fn try_wait(&mut self) -> Result<Option<i32>> {
        self.wait_millis(0)
    }

    fn wait_timeout(&mut self, timeout: Option<Duration>) -> Result<Option<i32>> {
        let millis = match timeout {
            None => INFINITE,
            // INFINITE is u32::MAX; stay one below it for finite waits.
            Some(timeout) => u32::try_from(timeout.as_millis())
                .map_or(INFINITE - 1, |ms| ms.min(INFINITE - 1)),
        };
        self.wait_millis(millis)
    }

    fn send_signal(&mut self, sig: i32) -> Result<()> {
        match sig {
            signal::SIGTERM => self.terminate(),
            signal::CTRL_C_EVENT | signal::CTRL_BREAK_EVENT => {
                if self.creation_flags & CREATE_NEW_PROCESS_GROUP == 0 {
                    debug!(
                        "Process {} is not a process group leader; console event goes to its group",
                        self.pid
                    );
                }
                // SAFETY: GenerateConsoleCtrlEvent takes plain integers.
                if unsafe { GenerateConsoleCtrlEvent(sig as u32, self.pid) } == 0 {
                    return Err(PopenError::last_os_error("GenerateConsoleCtrlEvent"));
                }
                Ok(())
            }
            other => Err(PopenError::not_supported(format!(
                "signal {} (only CTRL_C_EVENT, CTRL_BREAK_EVENT and SIGTERM)",
                other
            ))),
        }
    }

    fn terminate(&mut self) -> Result<()> {
        let mut request = CloseRequest {
            pid: self.pid,
            posted: 0,
        };
        // SAFETY: `request` outlives the synchronous enumeration.
        let ok = unsafe { EnumWindows(Some(post_close), &mut request as *mut CloseRequest as LPARAM) };
        if ok == 0 {
            return Err(PopenError::last_os_error("EnumWindows"));
        }
        debug!(
            "Posted WM_CLOSE to {} window(s) of process {}",
            request.posted, self.pid
        );
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        let handle = self.raw()?;
        // SAFETY: `handle` is a live process handle with terminate access.
        if unsafe { TerminateProcess(handle, LauncherConfig::WINDOWS_KILL_EXIT_CODE) } == 0 {
            let err = PopenError::last_os_error("TerminateProcess");
            // Access is denied once the process has already exited.
            if err.os_code() == Some(ERROR_ACCESS_DENIED as i32) {
                let mut code: u32 = 0;
                // SAFETY: `code` is a valid out-pointer.
                let exited = unsafe { GetExitCodeProcess(handle, &mut code) } != 0
                    && code != STILL_ACTIVE;
                if exited {
                    return Ok(());
                }
            }
            return Err(err);
        }
        self.killed = true;
        Ok(())
    }

    fn release(&mut self) {
        self.handle = None;
    }
}
