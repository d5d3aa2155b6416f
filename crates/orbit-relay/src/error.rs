//! Error types for the relay.

use thiserror::Error;

/// Relay error type.
#[derive(Debug, Error)]
pub enum RelayError {
    /// I/O error on a socket or file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from the FEC layer.
    #[error("fec: {0}")]
    Fec(#[from] orbit_fec::FecError),

    /// Error from the compact codec.
    #[error("codec: {0}")]
    Codec(#[from] orbit_compact::CodecError),

    /// The packet authenticator did not verify. Dropped silently.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// Structurally invalid message.
    #[error("malformed message: {0}")]
    MalformedMessage(&'static str),

    /// The peer requires a protocol version newer than ours.
    #[error("peer requires protocol version {peer_min}, we speak {ours}")]
    ProtocolVersionTooLow { peer_min: u32, ours: u32 },

    /// A configuration option failed to parse. Fatal at startup.
    #[error("bad -{option} value: {reason}")]
    Config {
        option: &'static str,
        reason: String,
    },

    /// The component is shutting down.
    #[error("shutting down")]
    Shutdown,
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
