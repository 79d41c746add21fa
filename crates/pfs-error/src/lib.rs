#![forbid(unsafe_code)]
//! Error types for the PFS builder.
//!
//! Defines `PfsError` and a `Result<T>` alias used throughout the workspace.
//! Every error is fatal to the build in progress; there are no retry paths.

use thiserror::Error;

/// Unified error type for all PFS build operations.
#[derive(Debug, Error)]
pub enum PfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid filesystem tree: {0}")]
    InvalidTree(String),

    #[error("configuration mismatch: {0}")]
    ConfigMismatch(String),

    #[error("layout overflow: {0}")]
    LayoutOverflow(String),

    #[error("invalid on-disk format: {0}")]
    Format(String),
}

impl From<pfs_types::ParseError> for PfsError {
    fn from(err: pfs_types::ParseError) -> Self {
        Self::Format(err.to_string())
    }
}

/// Result alias using `PfsError`.
pub type Result<T> = std::result::Result<T, PfsError>;
