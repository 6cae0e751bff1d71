//! Error types for the render session core.
//!
//! Device-level failures never travel through the [`Device`](crate::device::Device)
//! trait as `Err`; they are recorded as sticky messages on the device. This
//! type covers the fallible constructors and I/O edges around it.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for render session operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Backend not compiled in, or hardware / native library missing
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Kernel compile or link failure
    #[error("Failed loading render kernel: {0}")]
    KernelLoad(String),

    /// Runtime device error (native API failure during a task)
    #[error("Device error: {0}")]
    Device(String),

    /// Allocation exceeded the device memory budget
    #[error("Out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    /// Parameters rejected by validation
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// Config file does not exist
    #[error("Config not found: {0}")]
    ConfigNotFound(PathBuf),

    /// Socket level failure talking to a render server
    #[error("Network error: {0}")]
    Network(String),

    /// Malformed or unexpected message on the wire
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (config or wire) error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Image encoding failure while writing output
    #[cfg(feature = "output")]
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an "other" error from a string.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Create an invalid parameters error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidParams(msg.into())
    }

    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

/// Result type alias for render session operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::KernelLoad("syntax error".into());
        assert!(e.to_string().contains("render kernel"));
        assert!(e.to_string().contains("syntax error"));

        let e = Error::OutOfMemory { requested: 4096, available: 1024 };
        assert!(e.to_string().contains("4096"));
        assert!(e.to_string().contains("1024"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<u32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
