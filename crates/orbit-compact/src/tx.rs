//! Transaction primitives and consensus serialization.

use sha2::{Digest, Sha256};

use crate::error::{CodecError, Result};
use crate::ser::{Reader, Writer};

/// Hard sanity bounds applied while decoding untrusted bytes.
const MAX_INPUTS: usize = 1_000_000;
const MAX_OUTPUTS: usize = 1_000_000;
const MAX_SCRIPT_LEN: usize = 10_000;
const MAX_WITNESS_ITEMS: usize = 100_000;
const MAX_WITNESS_ITEM_LEN: usize = 4_000_000;

/// Double SHA-256, the object hash used throughout the relay.
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

/// Reference to an output of a previous transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutPoint {
    pub txid: [u8; 32],
    pub vout: u32,
}

/// A transaction input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    pub witness: Vec<Vec<u8>>,
}

/// A transaction output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

/// A full transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub lock_time: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
}

impl Transaction {
    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|i| !i.witness.is_empty())
    }

    /// Consensus encoding; witnesses use the marker/flag extension when any
    /// input carries one.
    pub fn consensus_encode(&self, w: &mut Writer) {
        let witness = self.has_witness();
        w.write_u32(self.version);
        if witness {
            w.write_u8(0x00);
            w.write_u8(0x01);
        }
        w.write_compact_size(self.inputs.len() as u64);
        for input in &self.inputs {
            w.write_raw(&input.prevout.txid);
            w.write_u32(input.prevout.vout);
            w.write_var_bytes(&input.script_sig);
            w.write_u32(input.sequence);
        }
        w.write_compact_size(self.outputs.len() as u64);
        for output in &self.outputs {
            w.write_u64(output.value);
            w.write_var_bytes(&output.script_pubkey);
        }
        if witness {
            for input in &self.inputs {
                w.write_compact_size(input.witness.len() as u64);
                for item in &input.witness {
                    w.write_var_bytes(item);
                }
            }
        }
        w.write_u32(self.lock_time);
    }

    pub fn consensus_decode(r: &mut Reader) -> Result<Self> {
        let version = r.read_u32()?;

        let mut n_inputs = r.read_compact_size()? as usize;
        let mut segwit = false;
        if n_inputs == 0 {
            // Either the witness marker or a transaction with no inputs;
            // only the former is valid here.
            let flag = r.read_u8()?;
            if flag != 0x01 {
                return Err(CodecError::Malformed("witness flag"));
            }
            segwit = true;
            n_inputs = r.read_compact_size()? as usize;
        }
        if n_inputs > MAX_INPUTS {
            return Err(CodecError::Oversized {
                what: "inputs",
                len: n_inputs,
            });
        }

        let mut inputs = Vec::with_capacity(n_inputs.min(1024));
        for _ in 0..n_inputs {
            let txid = r.read_array::<32>()?;
            let vout = r.read_u32()?;
            let script_sig = r.read_var_bytes(MAX_SCRIPT_LEN, "script_sig")?.to_vec();
            let sequence = r.read_u32()?;
            inputs.push(TxIn {
                prevout: OutPoint { txid, vout },
                script_sig,
                sequence,
                witness: Vec::new(),
            });
        }

        let n_outputs = r.read_compact_size()? as usize;
        if n_outputs > MAX_OUTPUTS {
            return Err(CodecError::Oversized {
                what: "outputs",
                len: n_outputs,
            });
        }
        let mut outputs = Vec::with_capacity(n_outputs.min(1024));
        for _ in 0..n_outputs {
            let value = r.read_u64()?;
            let script_pubkey = r.read_var_bytes(MAX_SCRIPT_LEN, "script_pubkey")?.to_vec();
            outputs.push(TxOut {
                value,
                script_pubkey,
            });
        }

        if segwit {
            let mut any = false;
            for input in &mut inputs {
                let n_items = r.read_compact_size()? as usize;
                if n_items > MAX_WITNESS_ITEMS {
                    return Err(CodecError::Oversized {
                        what: "witness items",
                        len: n_items,
                    });
                }
                for _ in 0..n_items {
                    input
                        .witness
                        .push(r.read_var_bytes(MAX_WITNESS_ITEM_LEN, "witness item")?.to_vec());
                }
                any |= n_items > 0;
            }
            if !any {
                return Err(CodecError::Malformed("segwit marker without witnesses"));
            }
        }

        let lock_time = r.read_u32()?;
        Ok(Self {
            version,
            lock_time,
            inputs,
            outputs,
        })
    }

    /// Full serialization including witnesses.
    pub fn serialized(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(512);
        self.consensus_encode(&mut w);
        w.into_bytes()
    }

    fn serialized_no_witness(&self) -> Vec<u8> {
        let stripped = Transaction {
            version: self.version,
            lock_time: self.lock_time,
            inputs: self
                .inputs
                .iter()
                .map(|i| TxIn {
                    witness: Vec::new(),
                    ..i.clone()
                })
                .collect(),
            outputs: self.outputs.clone(),
        };
        stripped.serialized()
    }

    /// Transaction id: hash of the witness-stripped serialization.
    pub fn txid(&self) -> [u8; 32] {
        double_sha256(&self.serialized_no_witness())
    }

    /// Witness transaction id: hash of the full serialization.
    pub fn wtxid(&self) -> [u8; 32] {
        double_sha256(&self.serialized())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    pub fn input(script_sig: Vec<u8>, witness: Vec<Vec<u8>>) -> TxIn {
        TxIn {
            prevout: OutPoint {
                txid: [0x11; 32],
                vout: 1,
            },
            script_sig,
            sequence: 0xffff_ffff,
            witness,
        }
    }

    pub fn simple_tx(inputs: Vec<TxIn>, outputs: Vec<TxOut>) -> Transaction {
        Transaction {
            version: 2,
            lock_time: 0,
            inputs,
            outputs,
        }
    }
}
