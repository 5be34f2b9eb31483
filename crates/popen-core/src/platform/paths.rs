//! Platform-specific path utilities.
//!
//! This module locates:
//! - The default command interpreter used for `shell` launches
//! - The null device
//! - Candidate executables for a program name (POSIX exec search)

use crate::config::ShellConfig;
use crate::error::{PopenError, Result};
use std::path::{Path, PathBuf};

/// Get the path of the platform null device.
///
/// # Platform Behavior
/// - **Linux/macOS**: `/dev/null`
/// - **Windows**: `\\.\NUL`
pub fn null_device() -> &'static Path {
    #[cfg(unix)]
    {
        Path::new("/dev/null")
    }
    #[cfg(windows)]
    {
        Path::new(r"\\.\NUL")
    }
}

/// Locate the default command interpreter.
///
/// # Platform Behavior
/// - **Linux/macOS**: `/bin/sh`, which must exist
/// - **Windows**: `%COMSPEC%`, else `%SystemRoot%\System32\cmd.exe`
pub fn default_shell() -> Result<PathBuf> {
    #[cfg(unix)]
    {
        let shell = Path::new(ShellConfig::POSIX_SHELL);
        if shell.exists() {
            Ok(shell.to_path_buf())
        } else {
            Err(PopenError::NotFound {
                message: format!("no shell found at {}", shell.display()),
            })
        }
    }

    #[cfg(windows)]
    {
        windows_shell_from(|name| std::env::var(name).ok())
    }
}

/// Resolve the Windows interpreter from an environment lookup.
///
/// Kept free of the real environment so the fallback chain is testable.
#[cfg_attr(unix, allow(dead_code))]
pub(crate) fn windows_shell_from(lookup: impl Fn(&str) -> Option<String>) -> Result<PathBuf> {
    if let Some(comspec) = lookup(ShellConfig::COMSPEC_VAR).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(comspec));
    }
    if let Some(root) = lookup(ShellConfig::SYSTEM_ROOT_VAR).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(format!(r"{}\System32\cmd.exe", root)));
    }
    Err(PopenError::NotFound {
        message: format!(
            "no shell found: neither {} nor {} is set",
            ShellConfig::COMSPEC_VAR,
            ShellConfig::SYSTEM_ROOT_VAR
        ),
    })
}

/// List the paths `exec` should try for `program`, in order.
///
/// A program containing `/` is used as given. Otherwise each entry of
/// `path_var` (colon separated, falling back to a minimal default) is joined
/// with the program name. An empty entry means the current directory.
#[cfg_attr(windows, allow(dead_code))]
pub(crate) fn exec_candidates(program: &Path, path_var: Option<&str>) -> Vec<PathBuf> {
    if program.to_string_lossy().contains('/') {
        return vec![program.to_path_buf()];
    }
    path_var
        .unwrap_or(ShellConfig::FALLBACK_PATH)
        .split(':')
        .map(|dir| {
            if dir.is_empty() {
                PathBuf::from(".").join(program)
            } else {
                Path::new(dir).join(program)
            }
        })
        .collect()
}
