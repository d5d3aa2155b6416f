//! Error types for FEC operations.

use thiserror::Error;

/// FEC error type.
#[derive(Debug, Error)]
pub enum FecError {
    /// A chunk slot or chunk index outside the valid range was requested.
    #[error("chunk index {index} out of range (max {max})")]
    IndexOutOfRange { index: usize, max: usize },

    /// An encoder slot outside the configured output range was requested.
    #[error("encoder slot {slot} out of range ({slots} slots)")]
    SlotOutOfRange { slot: usize, slots: usize },

    /// The object is too small or too large to encode.
    #[error("invalid object size: {0}")]
    InvalidObjectSize(usize),

    /// The MDS id space has no room for recovery chunks at this chunk count.
    #[error("no recovery id space for {0} chunks")]
    NoRecoveryCapacity(usize),

    /// Decoded data was requested before the decoder completed.
    #[error("decode not ready: {received} of {needed} chunks")]
    DecodeNotReady { received: usize, needed: usize },

    /// The fountain codec rejected its input.
    #[error("fountain codec failure: {0}")]
    CodecFailure(String),

    /// Memory mapping the backing file failed.
    #[error("mmap failed on {path}: {source}")]
    MmapFailed {
        path: String,
        source: std::io::Error,
    },

    /// A filesystem operation on the backing file failed.
    #[error("file operation failed on {path}: {source}")]
    FileSystemFailed {
        path: String,
        source: std::io::Error,
    },
}

/// Result type for FEC operations.
pub type Result<T> = std::result::Result<T, FecError>;
