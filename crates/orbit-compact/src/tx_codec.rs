//! Whole-transaction compression.
//!
//! Stream layout, all little-endian:
//!
//! ```text
//! tx_header: u8        bits 0..2 locktime code {zero, varint, raw-32}
//!                      bits 2..4 version code  {1, 2, varint}
//! [version varint]     when the version code says so
//! [locktime]           varint or raw u32 per the locktime code
//! input count, output count (compact sizes)
//! per input:  outpoint (txid ‖ compact vout)
//!             in_header: u8 (bits 0..3 sequence code)
//!             [sequence u32 when raw]
//!             scriptSig header + template payload (see scriptsig module)
//! per output: compressed amount, compressed script
//! ```
//!
//! Sequence codes cover the values that dominate real traffic: zero, final,
//! final-minus-one, "same as the last explicitly encoded sequence", and a
//! raw fallback. The codec version is carried out of band (block header or
//! chunk message), not in the per-transaction stream.

use crate::amount::{read_amount, write_amount};
use crate::error::{CodecError, Result};
use crate::script::{read_script, write_script};
use crate::scriptsig::{compress_input, decompress_input};
use crate::ser::{Reader, Writer};
use crate::tx::{OutPoint, Transaction, TxIn, TxOut};
use crate::CodecVersion;

const MAX_INPUTS: usize = 1_000_000;
const MAX_OUTPUTS: usize = 1_000_000;

const LOCKTIME_ZERO: u8 = 0;
const LOCKTIME_VARINT: u8 = 1;
const LOCKTIME_RAW: u8 = 2;

const VERSION_ONE: u8 = 0;
const VERSION_TWO: u8 = 1;
const VERSION_VARINT: u8 = 2;

const SEQ_ZERO: u8 = 0;
const SEQ_FINAL: u8 = 1;
const SEQ_FINAL_LESS_ONE: u8 = 2;
const SEQ_LAST_ENCODED: u8 = 3;
const SEQ_RAW: u8 = 4;

/// Locktimes below this encode smaller as a varint than as raw bytes.
const LOCKTIME_VARINT_CUTOFF: u32 = 1 << 28;

fn tx_header(tx: &Transaction) -> (u8, u8, u8) {
    let locktime_code = if tx.lock_time == 0 {
        LOCKTIME_ZERO
    } else if tx.lock_time < LOCKTIME_VARINT_CUTOFF {
        LOCKTIME_VARINT
    } else {
        LOCKTIME_RAW
    };
    let version_code = match tx.version {
        1 => VERSION_ONE,
        2 => VERSION_TWO,
        _ => VERSION_VARINT,
    };
    (locktime_code | (version_code << 2), locktime_code, version_code)
}

fn sequence_code(sequence: u32, last_raw: Option<u32>) -> u8 {
    match sequence {
        0 => SEQ_ZERO,
        0xffff_ffff => SEQ_FINAL,
        0xffff_fffe => SEQ_FINAL_LESS_ONE,
        s if Some(s) == last_raw => SEQ_LAST_ENCODED,
        _ => SEQ_RAW,
    }
}

/// Compresses `tx` into `w`.
pub fn compress_transaction(tx: &Transaction, version: CodecVersion, w: &mut Writer) {
    let (header, locktime_code, version_code) = tx_header(tx);
    w.write_u8(header);
    if version_code == VERSION_VARINT {
        w.write_varint(tx.version as u64);
    }
    match locktime_code {
        LOCKTIME_VARINT => w.write_varint(tx.lock_time as u64),
        LOCKTIME_RAW => w.write_u32(tx.lock_time),
        _ => {}
    }

    w.write_compact_size(tx.inputs.len() as u64);
    w.write_compact_size(tx.outputs.len() as u64);

    let mut last_raw: Option<u32> = None;
    for input in &tx.inputs {
        w.write_raw(&input.prevout.txid);
        w.write_compact_size(input.prevout.vout as u64);
        let code = sequence_code(input.sequence, last_raw);
        w.write_u8(code);
        if code == SEQ_RAW {
            w.write_u32(input.sequence);
            last_raw = Some(input.sequence);
        }
        compress_input(w, &input.script_sig, &input.witness);
    }

    for output in &tx.outputs {
        write_amount(w, output.value, version);
        write_script(w, &output.script_pubkey);
    }
}

/// Convenience form of [`compress_transaction`].
pub fn compressed_tx_bytes(tx: &Transaction, version: CodecVersion) -> Vec<u8> {
    let mut w = Writer::with_capacity(256);
    compress_transaction(tx, version, &mut w);
    w.into_bytes()
}

/// Reverses [`compress_transaction`].
pub fn decompress_transaction(r: &mut Reader, version: CodecVersion) -> Result<Transaction> {
    let header = r.read_u8()?;
    let locktime_code = header & 0x03;
    let version_code = (header >> 2) & 0x03;

    let tx_version = match version_code {
        VERSION_ONE => 1,
        VERSION_TWO => 2,
        VERSION_VARINT => {
            let v = r.read_varint()?;
            u32::try_from(v).map_err(|_| CodecError::Malformed("tx version"))?
        }
        _ => return Err(CodecError::Malformed("tx version code")),
    };
    let lock_time = match locktime_code {
        LOCKTIME_ZERO => 0,
        LOCKTIME_VARINT => {
            let v = r.read_varint()?;
            u32::try_from(v).map_err(|_| CodecError::Malformed("locktime"))?
        }
        LOCKTIME_RAW => r.read_u32()?,
        _ => return Err(CodecError::Malformed("locktime code")),
    };

    let n_inputs = r.read_compact_size()? as usize;
    let n_outputs = r.read_compact_size()? as usize;
    if n_inputs > MAX_INPUTS {
        return Err(CodecError::Oversized {
            what: "inputs",
            len: n_inputs,
        });
    }
    if n_outputs > MAX_OUTPUTS {
        return Err(CodecError::Oversized {
            what: "outputs",
            len: n_outputs,
        });
    }

    let mut last_raw: Option<u32> = None;
    let mut inputs = Vec::with_capacity(n_inputs.min(1024));
    for _ in 0..n_inputs {
        let txid = r.read_array::<32>()?;
        let vout = u32::try_from(r.read_compact_size()?)
            .map_err(|_| CodecError::Malformed("outpoint index"))?;
        let seq_header = r.read_u8()?;
        let sequence = match seq_header & 0x07 {
            SEQ_ZERO => 0,
            SEQ_FINAL => 0xffff_ffff,
            SEQ_FINAL_LESS_ONE => 0xffff_fffe,
            SEQ_LAST_ENCODED => last_raw.ok_or(CodecError::Malformed("sequence back-reference"))?,
            SEQ_RAW => {
                let s = r.read_u32()?;
                last_raw = Some(s);
                s
            }
            _ => return Err(CodecError::Malformed("sequence code")),
        };
        let (script_sig, witness) = decompress_input(r)?;
        inputs.push(TxIn {
            prevout: OutPoint { txid, vout },
            script_sig,
            sequence,
            witness,
        });
    }

    let mut outputs = Vec::with_capacity(n_outputs.min(1024));
    for _ in 0..n_outputs {
        let value = read_amount(r, version)?;
        let script_pubkey = read_script(r)?;
        outputs.push(TxOut {
            value,
            script_pubkey,
        });
    }

    Ok(Transaction {
        version: tx_version,
        lock_time,
        inputs,
        outputs,
    })
}

/// Decompresses a standalone compressed transaction, requiring the whole
/// buffer to be consumed.
pub fn decompress_tx_bytes(bytes: &[u8], version: CodecVersion) -> Result<Transaction> {
    let mut r = Reader::new(bytes);
    let tx = decompress_transaction(&mut r, version)?;
    if !r.is_empty() {
        return Err(CodecError::Malformed("trailing bytes after transaction"));
    }
    Ok(tx)
}
