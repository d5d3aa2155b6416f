//! Error types for the compact codec.

use thiserror::Error;

/// Compact codec error type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Ran out of input while decoding.
    #[error("unexpected end of input")]
    UnexpectedEnd,

    /// Structurally invalid input.
    #[error("malformed {0}")]
    Malformed(&'static str),

    /// A length field exceeds its sanity bound.
    #[error("oversized {what}: {len}")]
    Oversized { what: &'static str, len: usize },

    /// The stream was produced by a codec version this build does not speak.
    #[error("unsupported codec version {0}")]
    UnsupportedCodecVersion(u8),

    /// A compressed transaction could not be reinflated.
    #[error("transaction decompression failed: {0}")]
    DecompressionFailed(&'static str),
}

/// Result type for compact codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;
