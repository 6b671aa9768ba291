#![forbid(unsafe_code)]
//! Error types for OmStore.
//!
//! Defines `OmError` and a `Result<T>` alias used throughout the workspace.

use thiserror::Error;

/// Unified error type for all OmStore operations.
#[derive(Debug, Error)]
pub enum OmError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device {dev} is not an OmStore formatted device")]
    NotFormatted { dev: String },

    #[error("device {dev} carries system uuid {found}, expected {expected}")]
    UuidMismatch {
        dev: String,
        expected: String,
        found: String,
    },

    #[error("incompatible on-disk layout: {detail}")]
    IncompatibleLayout { detail: String },

    #[error("I/O failure on device {dev}: {source}")]
    DeviceIo {
        dev: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no space left")]
    SpaceFull,

    #[error("invalid blk id: {detail}")]
    InvalidBlkId { detail: String },

    #[error("not found")]
    NotFound,

    #[error("corrupt header: {detail}")]
    CorruptHeader { detail: String },

    /// Internal restart signal. Consumed inside the btree; never crosses an
    /// API boundary.
    #[error("operation must retry from the root")]
    Retry,

    #[error("operation cancelled")]
    Cancelled,
}

impl OmError {
    /// Wrap a raw I/O error with the device path it occurred on.
    #[must_use]
    pub fn device_io(dev: impl Into<String>, source: std::io::Error) -> Self {
        Self::DeviceIo {
            dev: dev.into(),
            source,
        }
    }
}

/// Result alias using `OmError`.
pub type Result<T> = std::result::Result<T, OmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_io_carries_path() {
        let err = OmError::device_io("/dev/test0", std::io::Error::other("boom"));
        let msg = err.to_string();
        assert!(msg.contains("/dev/test0"));
        assert!(msg.contains("boom"));
    }

    #[test]
    fn io_error_converts() {
        fn fails() -> Result<()> {
            Err(std::io::Error::other("nope"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(OmError::Io(_))));
    }
}
