//! # orbit-compact
//!
//! Compact block and transaction codec for the orbit relay.
//!
//! Blocks relayed over a one-way lossy link cannot rely on request/response
//! recovery, so the payload itself is squeezed as hard as possible before
//! FEC coding:
//!
//! - **Transactions** are compressed bit-exactly: recognised spending-script
//!   templates are stripped down to their signatures and keys, sequence
//!   numbers and locktimes use short codes, and output scripts/amounts use
//!   compact forms. Unrecognised data passes through verbatim, so
//!   `decompress(compress(tx)) == tx` always holds.
//! - **Blocks** split into a header object (80-byte header, short txids and
//!   a compressed-length table) and a body object (the compressed
//!   transactions). A receiver regenerates body bytes for transactions it
//!   already holds and only needs FEC chunks for the remainder.
//!
//! The stream is tagged with a [`CodecVersion`] so the format can evolve;
//! version 1 differs from version 0 only in the numeric-amount sentinel.

pub mod amount;
pub mod block;
mod error;
pub mod script;
pub mod scriptsig;
pub mod ser;
pub mod tx;
pub mod tx_codec;

pub use block::{
    assemble_block, build_coded_body, short_id, short_id_keys, Block, BlockAssembler, BlockHeader,
    CompactBlockHeader, ShortId, SHORT_ID_LEN,
};
pub use error::{CodecError, Result};
pub use scriptsig::ScriptSigTemplate;
pub use tx::{double_sha256, OutPoint, Transaction, TxIn, TxOut};
pub use tx_codec::{
    compress_transaction, compressed_tx_bytes, decompress_transaction, decompress_tx_bytes,
};

/// Version tag of the compression format.
///
/// Carried out of band (in the compact block header and in chunk messages),
/// never inside the per-transaction stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecVersion {
    /// Legacy stream with the colliding amount sentinel.
    V0,
    /// Current stream; the numeric-amount sentinel is shifted up by one.
    V1,
}

/// The version new streams are produced with.
pub const DEFAULT_CODEC_VERSION: CodecVersion = CodecVersion::V1;

impl CodecVersion {
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::V0),
            1 => Ok(Self::V1),
            other => Err(CodecError::UnsupportedCodecVersion(other)),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Self::V0 => 0,
            Self::V1 => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_version_bytes() {
        assert_eq!(CodecVersion::from_byte(0).unwrap(), CodecVersion::V0);
        assert_eq!(CodecVersion::from_byte(1).unwrap(), CodecVersion::V1);
        assert!(matches!(
            CodecVersion::from_byte(9),
            Err(CodecError::UnsupportedCodecVersion(9))
        ));
        assert_eq!(DEFAULT_CODEC_VERSION.to_byte(), 1);
    }
}
