//! Block primitives, the compact block header, and body reassembly.
//!
//! A relayed block travels as two FEC objects:
//!
//! - the **header object**: codec version, advertised height, the 80-byte
//!   block header, the short-txid nonce, a 6-byte short id and compressed
//!   length per non-prefilled transaction, and the indexes of prefilled
//!   transactions;
//! - the **body object**: the compressed transactions concatenated in block
//!   order, followed by the prefilled transactions in consensus form.
//!
//! A receiver that already has transactions in its mempool can regenerate
//! their exact slice of the body and hand fully covered chunks straight to
//! the FEC decoder, cutting the number of chunks it needs off the wire.

use std::collections::HashMap;
use std::hash::Hasher;

use siphasher::sip::SipHasher24;

use crate::error::{CodecError, Result};
use crate::ser::{Reader, Writer};
use crate::tx::{double_sha256, Transaction};
use crate::tx_codec::{compressed_tx_bytes, decompress_tx_bytes};
use crate::CodecVersion;

/// Chunk granularity of the FEC layer; body coverage is tracked per chunk.
pub const CHUNK_SIZE: usize = orbit_fec::FEC_CHUNK_SIZE;

/// Short transaction ids are 6 bytes.
pub const SHORT_ID_LEN: usize = 6;
pub type ShortId = [u8; SHORT_ID_LEN];

/// Block-position indexes must fit a u16.
const MAX_BLOCK_TXS: usize = u16::MAX as usize;

/// An 80-byte block header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_block: [u8; 32],
    pub merkle_root: [u8; 32],
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn encode(&self, w: &mut Writer) {
        w.write_u32(self.version);
        w.write_raw(&self.prev_block);
        w.write_raw(&self.merkle_root);
        w.write_u32(self.time);
        w.write_u32(self.bits);
        w.write_u32(self.nonce);
    }

    pub fn decode(r: &mut Reader) -> Result<Self> {
        Ok(Self {
            version: r.read_u32()?,
            prev_block: r.read_array::<32>()?,
            merkle_root: r.read_array::<32>()?,
            time: r.read_u32()?,
            bits: r.read_u32()?,
            nonce: r.read_u32()?,
        })
    }

    pub fn serialized(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(80);
        self.encode(&mut w);
        w.into_bytes()
    }

    pub fn hash(&self) -> [u8; 32] {
        double_sha256(&self.serialized())
    }

    /// Low 64 bits of the header hash, the compact wire identifier.
    pub fn hash_prefix(&self) -> u64 {
        u64::from_le_bytes(self.hash()[..8].try_into().unwrap())
    }
}

/// A full block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<Transaction>,
}

impl Block {
    pub fn consensus_encode(&self, w: &mut Writer) {
        self.header.encode(w);
        w.write_compact_size(self.txs.len() as u64);
        for tx in &self.txs {
            tx.consensus_encode(w);
        }
    }

    pub fn consensus_decode(r: &mut Reader) -> Result<Self> {
        let header = BlockHeader::decode(r)?;
        let n = r.read_compact_size()? as usize;
        if n > MAX_BLOCK_TXS {
            return Err(CodecError::Oversized {
                what: "block txs",
                len: n,
            });
        }
        let mut txs = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            txs.push(Transaction::consensus_decode(r)?);
        }
        Ok(Self { header, txs })
    }

    pub fn serialized(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(1024);
        self.consensus_encode(&mut w);
        w.into_bytes()
    }

    pub fn hash(&self) -> [u8; 32] {
        self.header.hash()
    }
}

/// SipHash keys for a block's short ids, derived from header and nonce.
pub fn short_id_keys(header: &BlockHeader, nonce: u64) -> (u64, u64) {
    let mut preimage = header.serialized();
    preimage.extend_from_slice(&nonce.to_le_bytes());
    let digest = double_sha256(&preimage);
    (
        u64::from_le_bytes(digest[..8].try_into().unwrap()),
        u64::from_le_bytes(digest[8..16].try_into().unwrap()),
    )
}

/// 6-byte short id of a transaction under the given keys.
pub fn short_id(keys: (u64, u64), wtxid: &[u8; 32]) -> ShortId {
    let mut hasher = SipHasher24::new_with_keys(keys.0, keys.1);
    hasher.write(wtxid);
    let hash = hasher.finish();
    hash.to_le_bytes()[..SHORT_ID_LEN].try_into().unwrap()
}

/// The header-side FEC object: everything a receiver needs to reassemble a
/// block body from mempool contents plus FEC chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactBlockHeader {
    pub codec_version: CodecVersion,
    /// Advertised block height, or -1 when unknown.
    pub height: i32,
    pub header: BlockHeader,
    /// Nonce feeding the short-id keys.
    pub nonce: u64,
    /// Short ids of the non-prefilled transactions, in block order.
    pub short_ids: Vec<ShortId>,
    /// Block positions of the prefilled transactions, strictly ascending.
    pub prefilled: Vec<u16>,
    /// Compressed byte length of each non-prefilled transaction.
    pub tx_lens: Vec<u32>,
}

impl CompactBlockHeader {
    /// Builds the compact header for `block`, prefilling the transactions at
    /// the given block positions (typically at least the coinbase).
    pub fn from_block(
        block: &Block,
        codec_version: CodecVersion,
        height: i32,
        nonce: u64,
        prefill: &[u16],
    ) -> Result<Self> {
        if block.txs.len() > MAX_BLOCK_TXS {
            return Err(CodecError::Oversized {
                what: "block txs",
                len: block.txs.len(),
            });
        }
        let mut prefill: Vec<u16> = prefill.to_vec();
        prefill.sort_unstable();
        prefill.dedup();
        if prefill.iter().any(|&i| i as usize >= block.txs.len()) {
            return Err(CodecError::Malformed("prefill index"));
        }

        let keys = short_id_keys(&block.header, nonce);
        let mut short_ids = Vec::with_capacity(block.txs.len());
        let mut tx_lens = Vec::with_capacity(block.txs.len());
        for (i, tx) in block.txs.iter().enumerate() {
            if prefill.binary_search(&(i as u16)).is_ok() {
                continue;
            }
            short_ids.push(short_id(keys, &tx.wtxid()));
            tx_lens.push(compressed_tx_bytes(tx, codec_version).len() as u32);
        }

        Ok(Self {
            codec_version,
            height,
            header: block.header.clone(),
            nonce,
            short_ids,
            prefilled: prefill,
            tx_lens,
        })
    }

    pub fn total_txs(&self) -> usize {
        self.short_ids.len() + self.prefilled.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(96 + self.short_ids.len() * 8);
        w.write_u8(self.codec_version.to_byte());
        w.write_u32(self.height as u32);
        self.header.encode(&mut w);
        w.write_u64(self.nonce);
        w.write_compact_size(self.short_ids.len() as u64);
        for id in &self.short_ids {
            w.write_raw(id);
        }
        w.write_compact_size(self.prefilled.len() as u64);
        let mut prev: i64 = -1;
        for &index in &self.prefilled {
            w.write_varint((index as i64 - prev - 1) as u64);
            prev = index as i64;
        }
        for &len in &self.tx_lens {
            w.write_varint(len as u64);
        }
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let codec_version = CodecVersion::from_byte(r.read_u8()?)?;
        let height = r.read_u32()? as i32;
        let header = BlockHeader::decode(&mut r)?;
        let nonce = r.read_u64()?;

        let n_short = r.read_compact_size()? as usize;
        if n_short > MAX_BLOCK_TXS {
            return Err(CodecError::Oversized {
                what: "short ids",
                len: n_short,
            });
        }
        let mut short_ids = Vec::with_capacity(n_short.min(4096));
        for _ in 0..n_short {
            short_ids.push(r.read_array::<SHORT_ID_LEN>()?);
        }

        let n_prefilled = r.read_compact_size()? as usize;
        if n_short + n_prefilled > MAX_BLOCK_TXS {
            return Err(CodecError::Oversized {
                what: "block txs",
                len: n_short + n_prefilled,
            });
        }
        let mut prefilled = Vec::with_capacity(n_prefilled.min(4096));
        let mut prev: i64 = -1;
        for _ in 0..n_prefilled {
            let delta = r.read_varint()?;
            let index = prev + 1 + delta as i64;
            if index > u16::MAX as i64 {
                return Err(CodecError::Malformed("prefill index"));
            }
            prefilled.push(index as u16);
            prev = index;
        }

        let mut tx_lens = Vec::with_capacity(n_short.min(4096));
        for _ in 0..n_short {
            let len = r.read_varint()?;
            if len > 4_000_000 {
                return Err(CodecError::Oversized {
                    what: "tx length",
                    len: len as usize,
                });
            }
            tx_lens.push(len as u32);
        }

        if !r.is_empty() {
            return Err(CodecError::Malformed("trailing header bytes"));
        }
        if prefilled.iter().any(|&i| (i as usize) >= n_short + n_prefilled) {
            return Err(CodecError::Malformed("prefill index"));
        }

        Ok(Self {
            codec_version,
            height,
            header,
            nonce,
            short_ids,
            prefilled,
            tx_lens,
        })
    }
}

/// Builds the body FEC object for `block` under `header`.
pub fn build_coded_body(block: &Block, header: &CompactBlockHeader) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    let mut lens = header.tx_lens.iter();
    for (i, tx) in block.txs.iter().enumerate() {
        if header.prefilled.binary_search(&(i as u16)).is_ok() {
            continue;
        }
        let bytes = compressed_tx_bytes(tx, header.codec_version);
        let expected = *lens.next().ok_or(CodecError::Malformed("tx length table"))?;
        if bytes.len() as u32 != expected {
            return Err(CodecError::Malformed("tx length mismatch"));
        }
        body.extend_from_slice(&bytes);
    }
    for &index in &header.prefilled {
        let tx = block
            .txs
            .get(index as usize)
            .ok_or(CodecError::Malformed("prefill index"))?;
        let mut w = Writer::new();
        tx.consensus_encode(&mut w);
        body.extend_from_slice(w.as_bytes());
    }
    Ok(body)
}

/// Reassembles the full block from a completely decoded body.
pub fn assemble_block(header: &CompactBlockHeader, body: &[u8]) -> Result<Block> {
    let compressed_len: usize = header.tx_lens.iter().map(|&l| l as usize).sum();
    if compressed_len > body.len() {
        return Err(CodecError::Malformed("body shorter than length table"));
    }

    let mut regular = Vec::with_capacity(header.short_ids.len());
    let mut pos = 0usize;
    for &len in &header.tx_lens {
        let slice = &body[pos..pos + len as usize];
        regular.push(
            decompress_tx_bytes(slice, header.codec_version)
                .map_err(|_| CodecError::DecompressionFailed("body transaction"))?,
        );
        pos += len as usize;
    }

    let mut r = Reader::new(&body[compressed_len..]);
    let mut prefilled = Vec::with_capacity(header.prefilled.len());
    for _ in &header.prefilled {
        prefilled.push(Transaction::consensus_decode(&mut r)?);
    }
    if !r.is_empty() {
        return Err(CodecError::Malformed("trailing body bytes"));
    }

    let total = header.total_txs();
    let mut txs = Vec::with_capacity(total);
    let mut regular_it = regular.into_iter();
    let mut prefilled_it = header.prefilled.iter().copied().zip(prefilled).peekable();
    for position in 0..total {
        if prefilled_it.peek().map(|(i, _)| *i as usize) == Some(position) {
            txs.push(prefilled_it.next().unwrap().1);
        } else {
            txs.push(regular_it.next().ok_or(CodecError::Malformed("tx count"))?);
        }
    }

    Ok(Block {
        header: header.header.clone(),
        txs,
    })
}

/// Receiver-side body reconstruction from mempool contents.
///
/// Tracks which body bytes are known from locally held transactions and
/// yields every chunk that becomes fully covered, ready to feed to the FEC
/// decoder as a data chunk.
#[derive(Debug)]
pub struct BlockAssembler {
    header: CompactBlockHeader,
    body_len: usize,
    compressed_len: usize,
    offsets: Vec<usize>,
    written: Vec<bool>,
    body: Vec<u8>,
    chunk_given: Vec<bool>,
    index: HashMap<ShortId, usize>,
}

impl BlockAssembler {
    pub fn new(header: CompactBlockHeader, body_len: usize) -> Result<Self> {
        let compressed_len: usize = header.tx_lens.iter().map(|&l| l as usize).sum();
        if compressed_len > body_len {
            return Err(CodecError::Malformed("body shorter than length table"));
        }
        let mut offsets = Vec::with_capacity(header.tx_lens.len());
        let mut pos = 0usize;
        for &len in &header.tx_lens {
            offsets.push(pos);
            pos += len as usize;
        }
        let mut index = HashMap::with_capacity(header.short_ids.len());
        for (slot, id) in header.short_ids.iter().enumerate() {
            index.insert(*id, slot);
        }
        let n_chunks = body_len.div_ceil(CHUNK_SIZE);
        Ok(Self {
            written: vec![false; header.tx_lens.len()],
            body: vec![0u8; body_len],
            chunk_given: vec![false; n_chunks],
            index,
            offsets,
            compressed_len,
            body_len,
            header,
        })
    }

    pub fn header(&self) -> &CompactBlockHeader {
        &self.header
    }

    /// Number of non-prefilled transactions already regenerated locally.
    pub fn txs_filled(&self) -> usize {
        self.written.iter().filter(|&&w| w).count()
    }

    /// Offers locally known transactions; returns every body chunk that is
    /// now fully covered, as `(chunk_index, chunk_bytes)` pairs. Each chunk
    /// is yielded once.
    pub fn fill_from_mempool<'a>(
        &mut self,
        txs: impl IntoIterator<Item = &'a Transaction>,
    ) -> Vec<(u32, Vec<u8>)> {
        let keys = short_id_keys(&self.header.header, self.header.nonce);
        for tx in txs {
            let id = short_id(keys, &tx.wtxid());
            let Some(&slot) = self.index.get(&id) else {
                continue;
            };
            if self.written[slot] {
                continue;
            }
            let bytes = compressed_tx_bytes(tx, self.header.codec_version);
            if bytes.len() != self.header.tx_lens[slot] as usize {
                // Short-id collision with a different transaction; leave the
                // slot for FEC.
                tracing::debug!(
                    "short id collision on slot {} ({} vs {} bytes)",
                    slot,
                    bytes.len(),
                    self.header.tx_lens[slot]
                );
                continue;
            }
            let off = self.offsets[slot];
            self.body[off..off + bytes.len()].copy_from_slice(&bytes);
            self.written[slot] = true;
        }
        self.take_covered_chunks()
    }

    fn take_covered_chunks(&mut self) -> Vec<(u32, Vec<u8>)> {
        let mut out = Vec::new();
        let mut slot = 0usize;
        for chunk in 0..self.chunk_given.len() {
            let start = chunk * CHUNK_SIZE;
            let end = ((chunk + 1) * CHUNK_SIZE).min(self.body_len);
            if self.chunk_given[chunk] {
                continue;
            }
            // Prefilled bytes live past compressed_len and only ever arrive
            // by FEC, so chunks reaching into them stay with the decoder.
            if end > self.compressed_len {
                continue;
            }
            while slot < self.offsets.len()
                && self.offsets[slot] + self.header.tx_lens[slot] as usize <= start
            {
                slot += 1;
            }
            let mut covered = true;
            let mut s = slot;
            while s < self.offsets.len() && self.offsets[s] < end {
                if !self.written[s] {
                    covered = false;
                    break;
                }
                s += 1;
            }
            if covered {
                self.chunk_given[chunk] = true;
                let mut chunk_bytes = self.body[start..end].to_vec();
                chunk_bytes.resize(CHUNK_SIZE, 0);
                out.push((chunk as u32, chunk_bytes));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::{OutPoint, TxIn, TxOut};

    fn make_tx(seed: u8, n_outputs: usize) -> Transaction {
        Transaction {
            version: 2,
            lock_time: 0,
            inputs: vec![TxIn {
                prevout: OutPoint {
                    txid: [seed; 32],
                    vout: seed as u32,
                },
                script_sig: vec![seed; (seed as usize % 40) + 1],
                sequence: 0xffff_ffff,
                witness: Vec::new(),
            }],
            outputs: (0..n_outputs)
                .map(|i| TxOut {
                    value: (i as u64 + 1) * 1000,
                    script_pubkey: crate::script::p2pkh_script(&[seed ^ i as u8; 20]),
                })
                .collect(),
        }
    }

    fn make_block(n_txs: usize) -> Block {
        Block {
            header: BlockHeader {
                version: 0x2000_0000,
                prev_block: [0x01; 32],
                merkle_root: [0x02; 32],
                time: 1_700_000_000,
                bits: 0x1d00_ffff,
                nonce: 0x12345,
            },
            txs: (0..n_txs).map(|i| make_tx(i as u8 + 1, (i % 3) + 1)).collect(),
        }
    }

    #[test]
    fn test_block_header_roundtrip() {
        let block = make_block(1);
        let bytes = block.header.serialized();
        assert_eq!(bytes.len(), 80);
        let mut r = Reader::new(&bytes);
        assert_eq!(BlockHeader::decode(&mut r).unwrap(), block.header);
    }

    #[test]
    fn test_block_roundtrip() {
        let block = make_block(5);
        let bytes = block.serialized();
        let mut r = Reader::new(&bytes);
        assert_eq!(Block::consensus_decode(&mut r).unwrap(), block);
    }

    #[test]
    fn test_short_ids_differ_by_nonce() {
        let block = make_block(1);
        let wtxid = block.txs[0].wtxid();
        let a = short_id(short_id_keys(&block.header, 1), &wtxid);
        let b = short_id(short_id_keys(&block.header, 2), &wtxid);
        assert_ne!(a, b);
    }

    #[test]
    fn test_compact_header_roundtrip() {
        let block = make_block(7);
        let header =
            CompactBlockHeader::from_block(&block, CodecVersion::V1, 812_345, 99, &[0, 3]).unwrap();
        assert_eq!(header.short_ids.len(), 5);
        assert_eq!(header.prefilled, vec![0, 3]);
        assert_eq!(header.total_txs(), 7);

        let bytes = header.encode();
        let decoded = CompactBlockHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_compact_header_rejects_bad_version() {
        let block = make_block(1);
        let header = CompactBlockHeader::from_block(&block, CodecVersion::V1, 1, 7, &[0]).unwrap();
        let mut bytes = header.encode();
        bytes[0] = 0x63;
        assert!(matches!(
            CompactBlockHeader::decode(&bytes),
            Err(CodecError::UnsupportedCodecVersion(0x63))
        ));
    }

    #[test]
    fn test_body_roundtrip_through_assemble() {
        let block = make_block(9);
        let header =
            CompactBlockHeader::from_block(&block, CodecVersion::V1, 10, 5, &[0]).unwrap();
        let body = build_coded_body(&block, &header).unwrap();
        let assembled = assemble_block(&header, &body).unwrap();
        assert_eq!(assembled, block);
    }

    #[test]
    fn test_assemble_with_scattered_prefill() {
        let block = make_block(6);
        let header =
            CompactBlockHeader::from_block(&block, CodecVersion::V1, -1, 5, &[0, 2, 5]).unwrap();
        let body = build_coded_body(&block, &header).unwrap();
        let assembled = assemble_block(&header, &body).unwrap();
        assert_eq!(assembled, block);
    }

    #[test]
    fn test_assemble_rejects_truncated_body() {
        let block = make_block(4);
        let header = CompactBlockHeader::from_block(&block, CodecVersion::V1, 1, 5, &[0]).unwrap();
        let body = build_coded_body(&block, &header).unwrap();
        assert!(assemble_block(&header, &body[..body.len() - 1]).is_err());
    }

    #[test]
    fn test_mempool_fill_covers_chunks() {
        // Enough transactions that the body spans several chunks.
        let block = make_block(120);
        let header = CompactBlockHeader::from_block(&block, CodecVersion::V1, 1, 5, &[0]).unwrap();
        let body = build_coded_body(&block, &header).unwrap();

        let mut assembler = BlockAssembler::new(header, body.len()).unwrap();
        // The mempool holds every non-coinbase transaction.
        let chunks = assembler.fill_from_mempool(block.txs.iter().skip(1));
        assert_eq!(assembler.txs_filled(), 119);
        assert!(!chunks.is_empty());

        // Every yielded chunk matches the real body bytes.
        for (index, chunk) in &chunks {
            let start = *index as usize * CHUNK_SIZE;
            let end = (start + CHUNK_SIZE).min(body.len());
            assert_eq!(&chunk[..end - start], &body[start..end]);
        }

        // Chunks are only yielded once.
        let again = assembler.fill_from_mempool(block.txs.iter().skip(1));
        assert!(again.is_empty());
    }

    #[test]
    fn test_mempool_fill_partial_coverage() {
        let block = make_block(120);
        let header = CompactBlockHeader::from_block(&block, CodecVersion::V1, 1, 5, &[0]).unwrap();
        let body = build_coded_body(&block, &header).unwrap();

        let mut assembler = BlockAssembler::new(header, body.len()).unwrap();
        // Half the mempool: some chunks covered, some not.
        let half: Vec<_> = block.txs.iter().skip(1).step_by(2).collect();
        let chunks = assembler.fill_from_mempool(half.into_iter());
        let full: Vec<_> = block.txs.iter().skip(1).collect();
        let rest = assembler.fill_from_mempool(full.into_iter());

        let n_chunks = body.len().div_ceil(CHUNK_SIZE);
        let coverable = (0..n_chunks)
            .filter(|c| ((c + 1) * CHUNK_SIZE).min(body.len()) <= assembler.compressed_len)
            .count();
        assert_eq!(chunks.len() + rest.len(), coverable);
    }

    #[test]
    fn test_mempool_fill_chunks_decode() {
        // Chunks produced from the mempool must satisfy a real FEC decoder.
        let block = make_block(60);
        let header = CompactBlockHeader::from_block(&block, CodecVersion::V1, 1, 5, &[0]).unwrap();
        let body = build_coded_body(&block, &header).unwrap();

        let mut assembler = BlockAssembler::new(header.clone(), body.len()).unwrap();
        let chunks = assembler.fill_from_mempool(block.txs.iter().skip(1));

        let mut decoder = orbit_fec::FecDecoder::new(body.len()).unwrap();
        for (id, chunk) in &chunks {
            assert!(decoder.provide_chunk(chunk, *id).unwrap());
        }
        // Feed the remaining data chunks straight from the body.
        let n_chunks = body.len().div_ceil(CHUNK_SIZE);
        for index in 0..n_chunks as u32 {
            if chunks.iter().any(|(id, _)| *id == index) {
                continue;
            }
            let start = index as usize * CHUNK_SIZE;
            let end = (start + CHUNK_SIZE).min(body.len());
            let mut chunk = body[start..end].to_vec();
            chunk.resize(CHUNK_SIZE, 0);
            decoder.provide_chunk(&chunk, index).unwrap();
        }
        assert!(decoder.decode_ready());
        assert_eq!(decoder.decoded_data().unwrap(), body);
    }
}
