//! Error types for the process launcher.
//!
//! Every launcher operation reports failure through [`PopenError`]. The type is
//! `Clone` so a failed `start()` can hand back the identical error on every
//! later call, and so `Popen::error_code()` can keep a copy of the most recent
//! failure without borrowing from the operation that produced it.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the launcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PopenError {
    // OS API failures
    #[error("{api} failed: {}", os_error_text(.code))]
    Os {
        /// Name of the failing OS call (e.g. `pipe`, `CreateProcessW`, `execve`).
        api: &'static str,
        /// Raw OS error code (`errno` or `GetLastError()`).
        code: i32,
    },

    // Configuration / validation errors
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Not supported: {message}")]
    NotSupported { message: String },

    // Lifecycle errors
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Process has not been started")]
    NotStarted,

    // Generic errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        /// Raw OS error code, when the underlying error carried one.
        code: Option<i32>,
    },

    #[error("Unknown error")]
    Unknown,
}

/// Result type alias for launcher operations.
pub type Result<T> = std::result::Result<T, PopenError>;

fn os_error_text(code: &i32) -> String {
    io::Error::from_raw_os_error(*code).to_string()
}

impl From<io::Error> for PopenError {
    fn from(err: io::Error) -> Self {
        PopenError::Io {
            message: err.to_string(),
            code: err.raw_os_error(),
        }
    }
}

impl PopenError {
    /// Capture the calling thread's last OS error for `api`.
    pub fn last_os_error(api: &'static str) -> Self {
        Self::from_io(api, io::Error::last_os_error())
    }

    /// Attach an API name to an I/O error.
    ///
    /// Errors that carry no OS code fall back to the generic [`PopenError::Io`].
    pub fn from_io(api: &'static str, err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) => PopenError::Os { api, code },
            None => PopenError::Io {
                message: format!("{}: {}", api, err),
                code: None,
            },
        }
    }

    /// Create an invalid-argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        PopenError::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a not-supported error.
    pub fn not_supported(message: impl Into<String>) -> Self {
        PopenError::NotSupported {
            message: message.into(),
        }
    }

    /// Name of the failing OS API, if this is an OS failure.
    pub fn api(&self) -> Option<&'static str> {
        match self {
            PopenError::Os { api, .. } => Some(api),
            _ => None,
        }
    }

    /// Raw OS error code, if one is known.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            PopenError::Os { code, .. } => Some(*code),
            PopenError::Io { code, .. } => *code,
            _ => None,
        }
    }

    /// True for errors detected before any OS resource was allocated.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            PopenError::InvalidArgument { .. } | PopenError::NotFound { .. }
        )
    }
}
