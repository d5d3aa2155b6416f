//! # orbit-fec
//!
//! Forward error correction for the orbit relay.
//!
//! Objects (block headers, block bodies, single transactions) are cut into
//! fixed 1152-byte chunks and coded so that a receiver on a lossy one-way
//! link can reconstruct the object from an arbitrary subset of chunks,
//! delivered in any order.
//!
//! ## Coding schemes
//!
//! The scheme is selected from the chunk count alone, so both ends always
//! agree on it:
//!
//! | chunks | scheme | guarantee |
//! |---|---|---|
//! | 1 | repetition | any single chunk decodes |
//! | 2..=256 | MDS (GF(2⁸)) | any `chunk_count` distinct-id chunks decode |
//! | more | fountain (RaptorQ) | `chunk_count` + ~2% chunks decode |
//!
//! ## Chunk ids
//!
//! Each chunk carries a 24-bit id identifying which code word it is. Data
//! chunks use their index; recovery chunk ids are randomized per object so
//! that repeated transmissions give receivers fresh symbols.
//!
//! ## Memory-mapped decoding
//!
//! A decoder can keep its in-progress state in a memory-mapped file named
//! after the object. Reconstructing a decoder over such a file replays the
//! persisted chunks, so partially received objects survive process
//! restarts:
//!
//! ```no_run
//! use orbit_fec::{FecDecoder, FEC_CHUNK_SIZE};
//! # fn main() -> orbit_fec::Result<()> {
//! let dir = std::path::Path::new("/var/lib/orbit/partial_blocks");
//! let mut decoder =
//!     FecDecoder::new_mmap(5 * FEC_CHUNK_SIZE, dir, Some("172.16.235.1_8080_1234_body"), true)?;
//! // ... provide chunks, crash, restart ...
//! let decoder = FecDecoder::recover(
//!     5 * FEC_CHUNK_SIZE,
//!     &dir.join("172.16.235.1_8080_1234_body_5760"),
//!     true,
//! )?;
//! assert_eq!(decoder.chunks_received(), decoder.chunks_received());
//! # Ok(())
//! # }
//! ```

mod chunk;
mod decoder;
mod encoder;
mod error;
mod pool;
mod storage;

pub use chunk::{
    chunk_count, max_chunk_id, padded_chunk, uses_fountain, uses_mds, ChunkIdTracker,
    CHUNK_ID_SIZE, FEC_CHUNK_ID_MAX, FEC_CHUNK_SIZE, MDS_MAX_CHUNKS,
};
pub use decoder::{FecDecoder, StorageMode};
pub use encoder::FecEncoder;
pub use error::{FecError, Result};
pub use pool::CACHE_STATES_COUNT;
pub use storage::ChunkStorage;
