#![forbid(unsafe_code)]
//! Error types for CirrusFS.
//!
//! Defines `CfsError` and a `Result<T>` alias used throughout the workspace.
//! Includes errno mappings for the POSIX-facing surface of the pipeline.

use thiserror::Error;

/// Unified error type for all CirrusFS pipeline operations.
#[derive(Debug, Error)]
pub enum CfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("block allocation failed: {0}")]
    Allocation(String),

    #[error("block pool exhausted")]
    PoolExhausted,

    #[error("downstream read failed: {0}")]
    Downstream(String),

    #[error("invalid state: {0}")]
    State(&'static str),

    #[error("end of file")]
    EndOfFile,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation not supported by component {0}")]
    Unsupported(&'static str),
}

impl CfsError {
    /// Convert this error into a POSIX errno suitable for FUSE replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::InvalidConfig(_) | Self::Unsupported(_) => libc::EINVAL,
            Self::Allocation(_) | Self::PoolExhausted => libc::ENOMEM,
            Self::Downstream(_) | Self::State(_) => libc::EIO,
            Self::EndOfFile => libc::ENODATA,
            Self::NotFound(_) => libc::ENOENT,
        }
    }

    /// True when this error marks the normal end of a file, not a failure.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::EndOfFile)
    }
}

/// Result alias using `CfsError`.
pub type Result<T> = std::result::Result<T, CfsError>;
