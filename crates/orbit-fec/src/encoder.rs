//! FEC chunk encoder.
//!
//! Depending on how many chunks the object spans, one of three schemes is
//! used:
//!
//! 1. Repetition coding when the object fits in a single chunk
//! 2. An MDS code over GF(2^8) for up to [`MDS_MAX_CHUNKS`] chunks
//! 3. A RaptorQ fountain code beyond that
//!
//! The MDS code always recovers N original chunks from any N coded chunks,
//! but its 8-bit id space limits it to short objects. The fountain code has
//! no practical length limit but needs roughly N + 0.02·N chunks.
//!
//! The encoder produces *recovery* chunks; callers emit the original data
//! chunks directly (id = chunk index). Each output slot gets a chunk id: for
//! the fountain scheme the id is random so that receivers see fresh symbols
//! on every pass, for the MDS scheme it is the slot plus a random per-object
//! offset, and for repetition coding it equals the slot.

use rand::Rng;
use raptorq::{ObjectTransmissionInformation, SourceBlockEncoder};
use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::chunk::{
    chunk_count, padded_chunk, uses_fountain, uses_mds, FEC_CHUNK_ID_MAX, FEC_CHUNK_SIZE,
    MDS_MAX_CHUNKS,
};
use crate::decoder::FecDecoder;
use crate::error::{FecError, Result};
use crate::pool;

enum EncoderScheme {
    Repetition,
    Mds {
        rs: Option<ReedSolomon>,
        parity: Option<Vec<Vec<u8>>>,
        start_idx: Option<u32>,
    },
    Fountain {
        block: Box<SourceBlockEncoder>,
    },
}

/// Produces FEC recovery chunks for one object.
pub struct FecEncoder {
    data: Vec<u8>,
    chunk_count: usize,
    slots: Vec<Option<(Vec<u8>, u32)>>,
    scheme: EncoderScheme,
}

impl FecEncoder {
    /// Creates an encoder over `data` with `n_slots` output slots.
    pub fn new(data: Vec<u8>, n_slots: usize) -> Result<Self> {
        if data.is_empty() {
            return Err(FecError::InvalidObjectSize(0));
        }
        let chunks = chunk_count(data.len());

        let scheme = if uses_mds(chunks) {
            let recovery_count = (MDS_MAX_CHUNKS - 1).saturating_sub(chunks);
            let rs = if recovery_count > 0 {
                Some(
                    ReedSolomon::new(chunks, recovery_count)
                        .map_err(|e| FecError::CodecFailure(e.to_string()))?,
                )
            } else {
                None
            };
            EncoderScheme::Mds {
                rs,
                parity: None,
                start_idx: None,
            }
        } else if uses_fountain(chunks) {
            let config = ObjectTransmissionInformation::with_defaults(
                data.len() as u64,
                FEC_CHUNK_SIZE as u16,
            );
            let mut padded = data.clone();
            padded.resize(chunks * FEC_CHUNK_SIZE, 0);
            let plan = pool::acquire_plan(chunks as u16);
            let block = SourceBlockEncoder::with_encoding_plan(0, &config, &padded, &plan);
            pool::release_plan(chunks as u16, plan);
            EncoderScheme::Fountain {
                block: Box::new(block),
            }
        } else {
            EncoderScheme::Repetition
        };

        Ok(Self {
            data,
            chunk_count: chunks,
            slots: vec![None; n_slots],
            scheme,
        })
    }

    /// Builds an encoder from a completed decoder, avoiding a second copy of
    /// the object through the application.
    pub fn from_decoder(mut decoder: FecDecoder, n_slots: usize) -> Result<Self> {
        let data = decoder.decoded_data()?;
        Self::new(data, n_slots)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn obj_size(&self) -> usize {
        self.data.len()
    }

    /// The original object's bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns the zero-padded data chunk at `index` with its chunk id.
    pub fn data_chunk(&self, index: usize) -> Result<(Vec<u8>, u32)> {
        if index >= self.chunk_count {
            return Err(FecError::IndexOutOfRange {
                index,
                max: self.chunk_count,
            });
        }
        let start = index * FEC_CHUNK_SIZE;
        let end = (start + FEC_CHUNK_SIZE).min(self.data.len());
        Ok((padded_chunk(&self.data[start..end]), index as u32))
    }

    /// Builds the recovery chunk for `slot`.
    ///
    /// Without `overwrite` the call is idempotent: an already-built chunk is
    /// returned unchanged. With `overwrite` the chunk is regenerated, which
    /// only produces a different chunk under the fountain scheme (the other
    /// schemes derive the chunk deterministically from the slot).
    pub fn build_chunk(&mut self, slot: usize, overwrite: bool) -> Result<(&[u8], u32)> {
        if slot >= self.slots.len() {
            return Err(FecError::SlotOutOfRange {
                slot,
                slots: self.slots.len(),
            });
        }
        if !overwrite && self.slots[slot].is_some() {
            let (chunk, id) = self.slots[slot].as_ref().unwrap();
            return Ok((chunk, *id));
        }

        let built = match &mut self.scheme {
            EncoderScheme::Repetition => (padded_chunk(&self.data), slot as u32),
            EncoderScheme::Mds {
                rs,
                parity,
                start_idx,
            } => {
                let rs = rs
                    .as_ref()
                    .ok_or(FecError::NoRecoveryCapacity(self.chunk_count))?;
                let recovery_count = MDS_MAX_CHUNKS - 1 - self.chunk_count; // rs exists, so > 0
                let start =
                    *start_idx.get_or_insert_with(|| rand::thread_rng().gen_range(0..0xff));
                let offset = (start as usize + slot) % recovery_count;
                let chunk_id = (self.chunk_count + offset) as u32;

                if overwrite {
                    if let Some((chunk, id)) = &self.slots[slot] {
                        if *id == chunk_id {
                            let chunk = chunk.clone();
                            self.slots[slot] = Some((chunk, chunk_id));
                            let (chunk, id) = self.slots[slot].as_ref().unwrap();
                            return Ok((chunk, *id));
                        }
                    }
                }

                if parity.is_none() {
                    let mut shards: Vec<Vec<u8>> = (0..self.chunk_count)
                        .map(|i| {
                            let start = i * FEC_CHUNK_SIZE;
                            let end = (start + FEC_CHUNK_SIZE).min(self.data.len());
                            padded_chunk(&self.data[start..end])
                        })
                        .collect();
                    shards.extend((0..recovery_count).map(|_| vec![0u8; FEC_CHUNK_SIZE]));
                    rs.encode(&mut shards)
                        .map_err(|e| FecError::CodecFailure(e.to_string()))?;
                    *parity = Some(shards.split_off(self.chunk_count));
                }
                let chunk = parity.as_ref().unwrap()[offset].clone();
                (chunk, chunk_id)
            }
            EncoderScheme::Fountain { block } => {
                let margin = self.chunk_count as u32 + 256;
                let repair_idx = rand::thread_rng().gen_range(0..FEC_CHUNK_ID_MAX - margin);
                let packet = block
                    .repair_packets(repair_idx, 1)
                    .into_iter()
                    .next()
                    .ok_or_else(|| FecError::CodecFailure("no repair packet".into()))?;
                let chunk_id = packet.payload_id().encoding_symbol_id();
                let mut chunk = packet.data().to_vec();
                chunk.resize(FEC_CHUNK_SIZE, 0);
                (chunk, chunk_id)
            }
        };

        self.slots[slot] = Some(built);
        let (chunk, id) = self.slots[slot].as_ref().unwrap();
        Ok((chunk, *id))
    }

    /// Builds every output slot in order. Stops at the first failure.
    pub fn prefill_chunks(&mut self) -> Result<()> {
        for slot in 0..self.slots.len() {
            self.build_chunk(slot, false)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for FecEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FecEncoder")
            .field("obj_size", &self.data.len())
            .field("chunk_count", &self.chunk_count)
            .field("slots", &self.slots.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn random_data(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    #[test]
    fn test_repetition_chunk_equals_padded_data() {
        let data = random_data(10);
        let mut enc = FecEncoder::new(data.clone(), 3).unwrap();
        for slot in 0..3 {
            let (chunk, id) = enc.build_chunk(slot, false).unwrap();
            assert_eq!(id, slot as u32);
            assert_eq!(&chunk[..10], &data[..]);
            assert!(chunk[10..].iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_build_chunk_invalid_slot() {
        let data = random_data(5 * FEC_CHUNK_SIZE);
        let mut enc = FecEncoder::new(data, 8).unwrap();
        assert!(enc.build_chunk(7, false).is_ok());
        assert!(matches!(
            enc.build_chunk(8, false),
            Err(FecError::SlotOutOfRange { .. })
        ));
    }

    #[test]
    fn test_build_chunk_idempotent_without_overwrite() {
        let data = random_data((MDS_MAX_CHUNKS + 10) * FEC_CHUNK_SIZE);
        let mut enc = FecEncoder::new(data, 4).unwrap();
        let (chunk_a, id_a) = {
            let (c, i) = enc.build_chunk(0, false).unwrap();
            (c.to_vec(), i)
        };
        let (chunk_b, id_b) = {
            let (c, i) = enc.build_chunk(0, false).unwrap();
            (c.to_vec(), i)
        };
        assert_eq!(id_a, id_b);
        assert_eq!(chunk_a, chunk_b);
    }

    #[test]
    fn test_fountain_overwrite_regenerates() {
        let data = random_data((MDS_MAX_CHUNKS + 10) * FEC_CHUNK_SIZE);
        let mut enc = FecEncoder::new(data, 4).unwrap();
        let (chunk_a, id_a) = {
            let (c, i) = enc.build_chunk(0, false).unwrap();
            (c.to_vec(), i)
        };
        let (chunk_b, id_b) = {
            let (c, i) = enc.build_chunk(0, true).unwrap();
            (c.to_vec(), i)
        };
        // Random 24-bit ids; a collision here is vanishingly unlikely.
        assert_ne!(id_a, id_b);
        assert_ne!(chunk_a, chunk_b);
    }

    #[test]
    fn test_mds_overwrite_is_deterministic() {
        let data = random_data(10 * FEC_CHUNK_SIZE);
        let mut enc = FecEncoder::new(data, 4).unwrap();
        let (chunk_a, id_a) = {
            let (c, i) = enc.build_chunk(1, false).unwrap();
            (c.to_vec(), i)
        };
        let (chunk_b, id_b) = {
            let (c, i) = enc.build_chunk(1, true).unwrap();
            (c.to_vec(), i)
        };
        assert_eq!(id_a, id_b);
        assert_eq!(chunk_a, chunk_b);
    }

    #[test]
    fn test_mds_recovery_ids_in_range() {
        let chunks = 18;
        let data = random_data(chunks * FEC_CHUNK_SIZE);
        let mut enc = FecEncoder::new(data, 6).unwrap();
        for slot in 0..6 {
            let (_, id) = enc.build_chunk(slot, false).unwrap();
            assert!(id >= chunks as u32);
            assert!(id < 0xff);
        }
    }

    #[test]
    fn test_fountain_ids_in_range() {
        let chunks = MDS_MAX_CHUNKS + 10;
        let data = random_data(chunks * FEC_CHUNK_SIZE);
        let mut enc = FecEncoder::new(data, 8).unwrap();
        for slot in 0..8 {
            let (_, id) = enc.build_chunk(slot, false).unwrap();
            assert!(id >= chunks as u32, "id {id} below chunk count");
            assert!(id <= FEC_CHUNK_ID_MAX);
        }
    }

    #[test]
    fn test_data_chunk_slicing() {
        let data = random_data(2 * FEC_CHUNK_SIZE + 100);
        let enc = FecEncoder::new(data.clone(), 1).unwrap();
        let (chunk, id) = enc.data_chunk(2).unwrap();
        assert_eq!(id, 2);
        assert_eq!(&chunk[..100], &data[2 * FEC_CHUNK_SIZE..]);
        assert!(chunk[100..].iter().all(|&b| b == 0));
        assert!(enc.data_chunk(3).is_err());
    }

    #[test]
    fn test_prefill() {
        let data = random_data(20 * FEC_CHUNK_SIZE);
        let mut enc = FecEncoder::new(data, 10).unwrap();
        enc.prefill_chunks().unwrap();
        for slot in 0..10 {
            let (chunk, _) = enc.build_chunk(slot, false).unwrap();
            assert_eq!(chunk.len(), FEC_CHUNK_SIZE);
        }
    }

    #[test]
    fn test_empty_data_rejected() {
        assert!(FecEncoder::new(Vec::new(), 1).is_err());
    }
}
