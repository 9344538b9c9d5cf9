//! Error types for the control plane
//!
//! Every fallible operation in the crate returns [`Result`]. The request
//! layer sitting above the core only needs [`Error::kind`] to pick a status
//! code; the variants themselves keep the raw text reported by the tool or
//! channel that failed.

use std::time::Duration;

use thiserror::Error;

/// Coarse classification used by callers that map failures to transport codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    PreconditionFailed,
    PermissionDenied,
    Protocol,
    Timeout,
    Unavailable,
    Internal,
}

/// Errors raised by the VM control plane
#[derive(Error, Debug)]
pub enum Error {
    /// A VM, bridge, tap, snapshot or file does not exist
    #[error("{what} not found: {name}")]
    NotFound { what: &'static str, name: String },

    /// The object already exists or is already running
    #[error("conflict: {0}")]
    Conflict(String),

    /// A required binary, device or resource is missing
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Caller supplied a value that cannot be used (bad name, bad netmask, ...)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Malformed or error-bearing reply on the console or QMP channel
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// Transient OS-level failure (socket refused, process not resolvable)
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Command issued on a QMP channel that is not in the ready state
    #[error("control channel is not connected")]
    NotConnected,

    /// The QMP channel closed while the command was pending
    #[error("control channel disconnected")]
    Disconnected,

    /// A host tool exited non-zero; `stderr` is passed through untouched
    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            what,
            name: name.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Classify this error for the request layer
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::PreconditionFailed(_) | Error::InvalidInput(_) => ErrorKind::PreconditionFailed,
            Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Unavailable(_)
            | Error::NotConnected
            | Error::Disconnected
            | Error::CommandFailed { .. } => ErrorKind::Unavailable,
            Error::Config(_) | Error::Io(_) | Error::Json(_) => ErrorKind::Internal,
        }
    }
}

/// Convenience alias used throughout the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;
