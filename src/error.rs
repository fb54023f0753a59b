//! Error types for image operations.
//!
//! Every failure carries the diagnostic string of the layer that produced it, unchanged, so a
//! caller can print it directly.  The variant only records which stage of the operation failed.

use std::io;

/// Result type alias for image operations.
pub type Result<T> = std::result::Result<T, ImageError>;

/// Errors returned by [`crate::Image`] operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImageError {
    /// The archive could not be opened or its format was not recognized.
    #[error("{0}")]
    Open(String),

    /// Reading an entry header or entry data failed.
    #[error("{0}")]
    Read(String),

    /// The disk writer rejected a header, a data block, an entry finish or the final close.
    #[error("{0}")]
    Write(String),

    /// The archive does not have the shape the operation requires.
    #[error("{0}")]
    Structure(String),
}

impl ImageError {
    pub(crate) fn open(err: io::Error) -> Self {
        Self::Open(err.to_string())
    }

    pub(crate) fn read(err: io::Error) -> Self {
        Self::Read(err.to_string())
    }

    pub(crate) fn write(err: io::Error) -> Self {
        Self::Write(err.to_string())
    }

    /// The diagnostic message, without the variant.
    pub fn message(&self) -> &str {
        match self {
            Self::Open(msg) | Self::Read(msg) | Self::Write(msg) | Self::Structure(msg) => msg,
        }
    }
}
