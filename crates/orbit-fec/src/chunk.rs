//! Chunk constants and per-object chunk-id bookkeeping.
//!
//! Every FEC object is cut into fixed 1152-byte chunks; the last chunk is
//! zero-padded. Chunk ids live in a 24-bit namespace per object. The coding
//! scheme is a pure function of the chunk count:
//!
//! - 1 chunk: repetition (any single received chunk decodes)
//! - 2..=256 chunks: MDS over GF(2^8), 8-bit ids
//! - more: fountain code, ids drawn from `[chunk_count, 2^24)`

use std::collections::HashSet;

/// Size of a single FEC chunk in bytes. Every over-the-wire payload carries
/// exactly one chunk.
pub const FEC_CHUNK_SIZE: usize = 1152;

/// On-disk size of a stored chunk id.
pub const CHUNK_ID_SIZE: usize = 4;

/// Upper bound of the 24-bit chunk-id namespace.
pub const FEC_CHUNK_ID_MAX: u32 = (1 << 24) - 1;

/// Largest chunk count handled by the MDS scheme; beyond this the fountain
/// scheme takes over.
pub const MDS_MAX_CHUNKS: usize = 256;

/// Number of chunks needed to carry `obj_size` bytes.
pub fn chunk_count(obj_size: usize) -> usize {
    obj_size.div_ceil(FEC_CHUNK_SIZE)
}

/// Whether objects of this chunk count use the MDS scheme.
pub fn uses_mds(chunks: usize) -> bool {
    (2..=MDS_MAX_CHUNKS).contains(&chunks)
}

/// Whether objects of this chunk count use the fountain scheme.
pub fn uses_fountain(chunks: usize) -> bool {
    chunks > MDS_MAX_CHUNKS
}

/// Largest chunk id a decoder for this chunk count accepts.
pub fn max_chunk_id(chunks: usize) -> u32 {
    if uses_mds(chunks) {
        0xff
    } else {
        FEC_CHUNK_ID_MAX
    }
}

/// Copies `data` into a fresh chunk, zero-padding to [`FEC_CHUNK_SIZE`].
pub fn padded_chunk(data: &[u8]) -> Vec<u8> {
    debug_assert!(data.len() <= FEC_CHUNK_SIZE);
    let mut chunk = vec![0u8; FEC_CHUNK_SIZE];
    chunk[..data.len()].copy_from_slice(data);
    chunk
}

/// Tracks which chunk ids have already been presented to a decoder.
///
/// Data ids (below the chunk count) are tracked in a bitmap. Recovery ids are
/// tracked in a bounded set: for the MDS scheme the bitmap covers the whole
/// 8-bit space, while the fountain scheme keeps the most recent `chunk_count`
/// recovery ids, which is enough to suppress the duplicates the codec cannot
/// tolerate.
#[derive(Debug, Default)]
pub struct ChunkIdTracker {
    data_seen: Vec<u64>,
    data_bits: usize,
    recovery_seen: HashSet<u32>,
    recovery_order: Vec<u32>,
    recovery_cap: usize,
}

impl ChunkIdTracker {
    pub fn new(chunks: usize) -> Self {
        let data_bits = if uses_mds(chunks) { 256 } else { chunks };
        Self {
            data_seen: vec![0u64; data_bits.div_ceil(64).max(1)],
            data_bits,
            recovery_seen: HashSet::new(),
            recovery_order: Vec::new(),
            recovery_cap: chunks.max(1),
        }
    }

    /// Returns true if `id` was already presented; otherwise marks it seen.
    pub fn check_and_mark(&mut self, id: u32) -> bool {
        if (id as usize) < self.data_bits {
            let (word, bit) = (id as usize / 64, id as usize % 64);
            let present = self.data_seen[word] & (1 << bit) != 0;
            self.data_seen[word] |= 1 << bit;
            present
        } else {
            if self.recovery_seen.contains(&id) {
                return true;
            }
            if self.recovery_order.len() == self.recovery_cap {
                let evicted = self.recovery_order.remove(0);
                self.recovery_seen.remove(&evicted);
            }
            self.recovery_seen.insert(id);
            self.recovery_order.push(id);
            false
        }
    }

    /// Returns true if `id` has been presented before.
    pub fn contains(&self, id: u32) -> bool {
        if (id as usize) < self.data_bits {
            let (word, bit) = (id as usize / 64, id as usize % 64);
            self.data_seen[word] & (1 << bit) != 0
        } else {
            self.recovery_seen.contains(&id)
        }
    }
}
