//! Common error types for multinet requests and protocol backends

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for caller-facing operations
pub type Result<T> = std::result::Result<T, MultinetError>;

/// Result type for backend operations
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Call-level errors.
///
/// Only argument and setup problems surface here. Failures that concern a
/// single entry are reported inside the response instead.
#[derive(Debug, Error)]
pub enum MultinetError {
    /// Malformed entry, out-of-range PPM user, unknown grouping, ...
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// The dispatch thread is gone (shut down or failed to start)
    #[error("Dispatch loop unavailable: {0}")]
    DispatcherUnavailable(String),
}

impl MultinetError {
    /// Shorthand used by the parsers
    pub fn invalid(msg: impl Into<String>) -> Self {
        MultinetError::InvalidArgument(msg.into())
    }

    /// Unified error kind; `None` for setup failures that concern no entry
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            MultinetError::InvalidArgument(_) => Some(ErrorKind::InvalidArgument),
            MultinetError::Config(_) | MultinetError::DispatcherUnavailable(_) => None,
        }
    }
}

/// Errors returned by protocol backends
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    /// Backend (or the device server behind it) is unreachable
    #[error("Connection failure: {0}")]
    Connection(String),

    /// Timeout waiting for the backend
    #[error("Backend timed out")]
    Timeout,

    /// The backend reported a device/parameter level failure
    #[error("Device error (status {status}): {message}")]
    Device {
        /// Native status code reported by the backend
        status: i32,
        /// Human-readable error message
        message: String,
    },

    /// Capability not implemented by this backend
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Backend refused the request as malformed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BackendError {
    /// Map onto the unified error taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::Connection(_) | BackendError::Timeout => ErrorKind::ConnectionFailure,
            BackendError::Device { .. }
            | BackendError::NotSupported(_)
            | BackendError::InvalidRequest(_)
            | BackendError::Internal(_) => ErrorKind::DeviceError,
        }
    }

    /// Native backend status code, when the backend supplied one
    pub fn status(&self) -> Option<i32> {
        match self {
            BackendError::Device { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Unified error taxonomy shared by every backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed entry or out-of-range PPM user; raised at call time
    InvalidArgument,
    /// Backend unreachable or timed out
    ConnectionFailure,
    /// Device/parameter level failure reported by the backend
    DeviceError,
    /// User callback returned an error or panicked
    CallbackFailure,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::ConnectionFailure => "connection_failure",
            ErrorKind::DeviceError => "device_error",
            ErrorKind::CallbackFailure => "callback_failure",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_connection_failures() {
        assert_eq!(
            BackendError::Connection("refused".into()).kind(),
            ErrorKind::ConnectionFailure
        );
        assert_eq!(BackendError::Timeout.kind(), ErrorKind::ConnectionFailure);
    }

    #[test]
    fn only_argument_errors_have_a_kind() {
        assert_eq!(
            MultinetError::invalid("ppm user 9").kind(),
            Some(ErrorKind::InvalidArgument)
        );
        assert_eq!(MultinetError::Config("no routes".into()).kind(), None);
        assert_eq!(
            MultinetError::DispatcherUnavailable("stopped".into()).kind(),
            None
        );
    }

    #[test]
    fn device_errors_keep_status() {
        let err = BackendError::Device {
            status: 17,
            message: "no such name".into(),
        };
        assert_eq!(err.kind(), ErrorKind::DeviceError);
        assert_eq!(err.status(), Some(17));
        assert_eq!(BackendError::NotSupported("get_meta".into()).status(), None);
    }
}
