// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the camera stack
//!
//! Every synchronous operation returns [`HalResult`]. Failures of requests
//! that were already queued are never reported through this type; they
//! surface as a cancelled request completion instead.

use std::fmt;

/// Result type alias using HalError
pub type HalResult<T> = Result<T, HalError>;

/// Main error type of the camera stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HalError {
    /// Configuration rejected before reaching the hardware
    Configuration(String),
    /// Operation not allowed in the current camera state
    State(String),
    /// Hardware lock, buffer pool or device already in use or exhausted
    Resource(String),
    /// Kernel or device I/O failure, `errno` is negative
    DeviceIo { errno: i32, context: String },
    /// Unexpected event or message from a device or the algorithm worker
    Protocol(String),
    /// Malformed request or argument
    InvalidRequest(String),
    /// Camera was removed from the system
    Disconnected(String),
    /// Unknown camera, stream or control
    NotFound(String),
    /// Settings file could not be read or parsed
    Settings(String),
}

impl HalError {
    /// Build a device error from a positive or negative errno value
    pub fn device(errno: i32, context: impl Into<String>) -> Self {
        HalError::DeviceIo {
            errno: -errno.abs(),
            context: context.into(),
        }
    }

    /// Capture the calling thread's last OS error as a device error
    pub fn last_os_error(context: impl Into<String>) -> Self {
        let err = std::io::Error::last_os_error();
        HalError::device(err.raw_os_error().unwrap_or(libc::EIO), context)
    }

    /// Negative errno carried by device errors
    pub fn errno(&self) -> Option<i32> {
        match self {
            HalError::DeviceIo { errno, .. } => Some(*errno),
            _ => None,
        }
    }

    pub fn is_state(&self) -> bool {
        matches!(self, HalError::State(_))
    }
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HalError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            HalError::State(msg) => write!(f, "Invalid state: {}", msg),
            HalError::Resource(msg) => write!(f, "Resource unavailable: {}", msg),
            HalError::DeviceIo { errno, context } => write!(
                f,
                "Device I/O error: {} ({})",
                context,
                std::io::Error::from_raw_os_error(-errno)
            ),
            HalError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            HalError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            HalError::Disconnected(id) => write!(f, "Camera {} disconnected", id),
            HalError::NotFound(msg) => write!(f, "Not found: {}", msg),
            HalError::Settings(msg) => write!(f, "Settings error: {}", msg),
        }
    }
}

impl std::error::Error for HalError {}

impl From<std::io::Error> for HalError {
    fn from(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(errno) => HalError::device(errno, err.to_string()),
            None => HalError::Settings(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for HalError {
    fn from(err: serde_json::Error) -> Self {
        HalError::Settings(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_errno_is_negative() {
        assert_eq!(HalError::device(libc::EBUSY, "x").errno(), Some(-libc::EBUSY));
        assert_eq!(HalError::device(-libc::EINVAL, "x").errno(), Some(-libc::EINVAL));
        assert_eq!(HalError::State("x".into()).errno(), None);
    }

    #[test]
    fn test_io_error_conversion() {
        let err: HalError = std::io::Error::from_raw_os_error(libc::ENODEV).into();
        assert_eq!(err.errno(), Some(-libc::ENODEV));

        let err: HalError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert!(matches!(err, HalError::Settings(_)));
    }
}
