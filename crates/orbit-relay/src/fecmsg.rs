//! Building FEC chunk messages from blocks and transactions.
//!
//! A block becomes two FEC objects (compact header and coded body), each
//! emitted as its data chunks followed by recovery chunks. Recovery overhead
//! is proportional with a flat floor on the body, so small blocks still get
//! enough spare chunks to ride out bursty loss.

use rand::Rng;
use tracing::trace;

use orbit_compact::{
    build_coded_body, compressed_tx_bytes, Block, CompactBlockHeader, Transaction,
    DEFAULT_CODEC_VERSION,
};
use orbit_fec::{FecEncoder, FecError, FEC_CHUNK_SIZE};

use crate::error::Result;
use crate::wire::{build_chunk_message, MsgType};

/// Fraction of extra recovery chunks per object.
pub const FEC_OVERHEAD_RATIO: f64 = 0.05;

/// Flat extra recovery chunks for block bodies.
pub const BODY_BASE_OVERHEAD: usize = 60;

/// Extra recovery chunks for headers and transactions.
const SMALL_OBJ_BASE_OVERHEAD: usize = 2;

fn overhead_chunks(data_chunks: usize, base: usize) -> usize {
    base + (data_chunks as f64 * FEC_OVERHEAD_RATIO).ceil() as usize
}

/// Builds all chunk messages for one FEC object.
fn object_messages(
    msg_type: MsgType,
    hash_prefix: u64,
    data: &[u8],
    n_recovery: usize,
) -> Result<Vec<Vec<u8>>> {
    let obj_length = data.len() as u32;
    let codec_version = DEFAULT_CODEC_VERSION.to_byte();
    let mut encoder = FecEncoder::new(data.to_vec(), n_recovery.max(1))?;

    let mut msgs = Vec::with_capacity(encoder.chunk_count() + n_recovery);
    if encoder.chunk_count() > 1 {
        for index in 0..encoder.chunk_count() {
            let (chunk, chunk_id) = encoder.data_chunk(index)?;
            msgs.push(build_chunk_message(
                msg_type,
                hash_prefix,
                obj_length,
                chunk_id,
                codec_version,
                &chunk,
            ));
        }
    }
    // Single-chunk objects rely on repetition coding alone; the recovery
    // slots already carry the (distinct-id) copies of the one data chunk.
    let n_recovery = if encoder.chunk_count() > 1 {
        n_recovery
    } else {
        n_recovery + 1
    };
    for slot in 0..n_recovery {
        match encoder.build_chunk(slot, false) {
            Ok((chunk, chunk_id)) => msgs.push(build_chunk_message(
                msg_type,
                hash_prefix,
                obj_length,
                chunk_id,
                codec_version,
                chunk,
            )),
            // The 8-bit id space has no recovery room at 255+ data chunks.
            Err(FecError::NoRecoveryCapacity(_)) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(msgs)
}

/// Turns a block into its interleavable message sequence (header object
/// first, then body), returning the block's hash prefix alongside.
pub fn block_to_messages(block: &Block, height: i32) -> Result<(u64, Vec<Vec<u8>>)> {
    let nonce: u64 = rand::thread_rng().gen();
    // The coinbase can never be in anyone's mempool; always prefill it.
    let header =
        CompactBlockHeader::from_block(block, DEFAULT_CODEC_VERSION, height, nonce, &[0])?;
    let header_bytes = header.encode();
    let body = build_coded_body(block, &header)?;
    let hash_prefix = block.header.hash_prefix();

    let header_chunks = header_bytes.len().div_ceil(FEC_CHUNK_SIZE);
    let body_chunks = body.len().div_ceil(FEC_CHUNK_SIZE);

    let mut msgs = object_messages(
        MsgType::BlockHeader,
        hash_prefix,
        &header_bytes,
        overhead_chunks(header_chunks, SMALL_OBJ_BASE_OVERHEAD),
    )?;
    msgs.extend(object_messages(
        MsgType::BlockContents,
        hash_prefix,
        &body,
        overhead_chunks(body_chunks, BODY_BASE_OVERHEAD),
    )?);

    trace!(
        "block {:016x} height {}: {} header bytes, {} body bytes, {} messages",
        hash_prefix,
        height,
        header_bytes.len(),
        body.len(),
        msgs.len()
    );
    Ok((hash_prefix, msgs))
}

/// Turns one mempool transaction into its chunk messages.
pub fn tx_to_messages(tx: &Transaction) -> Result<Vec<Vec<u8>>> {
    let data = compressed_tx_bytes(tx, DEFAULT_CODEC_VERSION);
    let hash_prefix = u64::from_le_bytes(tx.wtxid()[..8].try_into().unwrap());
    let chunks = data.len().div_ceil(FEC_CHUNK_SIZE);
    object_messages(
        MsgType::TxContents,
        hash_prefix,
        &data,
        overhead_chunks(chunks, 1),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{ChunkMessage, HEADER_SIZE, PACKET_SIZE};
    use orbit_compact::{BlockHeader, OutPoint, TxIn, TxOut};

    fn make_block(n_txs: usize) -> Block {
        Block {
            header: BlockHeader {
                version: 0x2000_0000,
                prev_block: [3; 32],
                merkle_root: [4; 32],
                time: 1_700_000_000,
                bits: 0x1d00_ffff,
                nonce: 7,
            },
            txs: (0..n_txs)
                .map(|i| Transaction {
                    version: 2,
                    lock_time: 0,
                    inputs: vec![TxIn {
                        prevout: OutPoint {
                            txid: [i as u8; 32],
                            vout: i as u32,
                        },
                        script_sig: vec![i as u8; 30],
                        sequence: 0xffff_ffff,
                        witness: Vec::new(),
                    }],
                    outputs: vec![TxOut {
                        value: 1000 * i as u64,
                        script_pubkey: orbit_compact::script::p2pkh_script(&[i as u8; 20]),
                    }],
                })
                .collect(),
        }
    }

    #[test]
    fn test_block_messages_cover_both_objects() {
        let block = make_block(50);
        let (hash_prefix, msgs) = block_to_messages(&block, 100).unwrap();
        assert_eq!(hash_prefix, block.header.hash_prefix());
        assert!(!msgs.is_empty());

        let mut saw_header = false;
        let mut saw_body = false;
        for msg in &msgs {
            assert_eq!(msg.len(), PACKET_SIZE);
            let msg_type = crate::wire::MsgType::from_byte(msg[16]).unwrap();
            let chunk = ChunkMessage::decode(&msg[HEADER_SIZE..]).unwrap();
            assert_eq!(chunk.hash_prefix, hash_prefix);
            assert_eq!(chunk.codec_version, DEFAULT_CODEC_VERSION.to_byte());
            match msg_type {
                MsgType::BlockHeader => saw_header = true,
                MsgType::BlockContents => saw_body = true,
                other => panic!("unexpected type {other:?}"),
            }
        }
        assert!(saw_header && saw_body);
    }

    #[test]
    fn test_block_messages_decode_back() {
        let block = make_block(20);
        let (_, msgs) = block_to_messages(&block, 5).unwrap();

        // Collect the two objects and run them through real decoders.
        let mut header_dec: Option<orbit_fec::FecDecoder> = None;
        let mut body_dec: Option<orbit_fec::FecDecoder> = None;
        for msg in &msgs {
            let msg_type = crate::wire::MsgType::from_byte(msg[16]).unwrap();
            let chunk = ChunkMessage::decode(&msg[HEADER_SIZE..]).unwrap();
            let dec = match msg_type {
                MsgType::BlockHeader => header_dec
                    .get_or_insert_with(|| orbit_fec::FecDecoder::new(chunk.obj_length as usize).unwrap()),
                MsgType::BlockContents => body_dec
                    .get_or_insert_with(|| orbit_fec::FecDecoder::new(chunk.obj_length as usize).unwrap()),
                _ => unreachable!(),
            };
            dec.provide_chunk(&chunk.payload, chunk.chunk_id).unwrap();
        }

        let mut header_dec = header_dec.unwrap();
        let mut body_dec = body_dec.unwrap();
        assert!(header_dec.decode_ready());
        assert!(body_dec.decode_ready());

        let compact = CompactBlockHeader::decode(&header_dec.decoded_data().unwrap()).unwrap();
        let body = body_dec.decoded_data().unwrap();
        let assembled = orbit_compact::assemble_block(&compact, &body).unwrap();
        assert_eq!(assembled, block);
    }

    #[test]
    fn test_tx_messages_single_chunk() {
        let tx = make_block(1).txs.remove(0);
        let msgs = tx_to_messages(&tx).unwrap();
        // A small transaction fits one chunk; repetition coding sends >= 2
        // copies with distinct ids.
        assert!(msgs.len() >= 2);
        let a = ChunkMessage::decode(&msgs[0][HEADER_SIZE..]).unwrap();
        let b = ChunkMessage::decode(&msgs[1][HEADER_SIZE..]).unwrap();
        assert_eq!(a.payload, b.payload);
        assert_ne!(a.chunk_id, b.chunk_id);

        let mut dec = orbit_fec::FecDecoder::new(a.obj_length as usize).unwrap();
        dec.provide_chunk(&b.payload, b.chunk_id).unwrap();
        assert!(dec.decode_ready());
        let recovered =
            orbit_compact::decompress_tx_bytes(&dec.decoded_data().unwrap(), DEFAULT_CODEC_VERSION)
                .unwrap();
        assert_eq!(recovered, tx);
    }
}
