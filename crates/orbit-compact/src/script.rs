//! Script forms: classification, push parsing and output-script compression.
//!
//! Output scripts use a two-level compressed form: six special single-byte
//! tags cover the overwhelmingly common cases (pay-to-pubkey-hash,
//! pay-to-script-hash and pay-to-pubkey in its compressed and uncompressed
//! encodings), everything else is written as a length-prefixed literal with
//! the length shifted past the special tags.

use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::PublicKey;
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use crate::error::{CodecError, Result};
use crate::ser::{Reader, Writer};

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKMULTISIG: u8 = 0xae;

/// Number of special compressed output-script tags.
pub const SPECIAL_SCRIPTS: u64 = 6;

/// Scripts above this length are dropped while decoding.
pub const MAX_SCRIPT_SIZE: usize = 10_000;

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// RIPEMD160(SHA256(data)), the script-hash form.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    Ripemd160::digest(Sha256::digest(data)).into()
}

/// Minimal push of `data` onto a script.
pub fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        0 => script.push(OP_0),
        1..=0x4b => {
            script.push(data.len() as u8);
            script.extend_from_slice(data);
        }
        0x4c..=0xff => {
            script.push(OP_PUSHDATA1);
            script.push(data.len() as u8);
            script.extend_from_slice(data);
        }
        _ => {
            script.push(OP_PUSHDATA2);
            script.extend_from_slice(&(data.len() as u16).to_le_bytes());
            script.extend_from_slice(data);
        }
    }
}

/// Builds a script from pushed values only.
pub fn push_only_script(values: &[Vec<u8>]) -> Vec<u8> {
    let mut script = Vec::new();
    for value in values {
        push_data(&mut script, value);
    }
    script
}

/// Splits a push-only script into its pushed values. `None` when the script
/// contains any non-push opcode (including the OP_N shortcuts, which do not
/// round-trip through a byte push).
pub fn parse_push_only(script: &[u8]) -> Option<Vec<Vec<u8>>> {
    let mut values = Vec::new();
    let mut pos = 0usize;
    while pos < script.len() {
        let op = script[pos];
        pos += 1;
        let len = match op {
            OP_0 => 0,
            1..=0x4b => op as usize,
            OP_PUSHDATA1 => {
                let len = *script.get(pos)? as usize;
                pos += 1;
                len
            }
            OP_PUSHDATA2 => {
                let bytes = script.get(pos..pos + 2)?;
                pos += 2;
                u16::from_le_bytes(bytes.try_into().unwrap()) as usize
            }
            _ => return None,
        };
        let data = script.get(pos..pos + len)?;
        pos += len;
        values.push(data.to_vec());
    }
    Some(values)
}

/// Is this a plausible SEC1 public key encoding?
pub fn is_pubkey_shape(data: &[u8]) -> bool {
    matches!(
        (data.len(), data.first()),
        (33, Some(0x02)) | (33, Some(0x03)) | (65, Some(0x04))
    )
}

pub fn p2pkh_script(hash: &[u8; 20]) -> Vec<u8> {
    let mut script = vec![OP_DUP, OP_HASH160, 20];
    script.extend_from_slice(hash);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

pub fn p2sh_script(hash: &[u8; 20]) -> Vec<u8> {
    let mut script = vec![OP_HASH160, 20];
    script.extend_from_slice(hash);
    script.push(OP_EQUAL);
    script
}

pub fn p2pk_script(pubkey: &[u8]) -> Vec<u8> {
    let mut script = vec![pubkey.len() as u8];
    script.extend_from_slice(pubkey);
    script.push(OP_CHECKSIG);
    script
}

/// The k-of-n bare multisig script over compressed pubkeys.
pub fn multisig_script(k: u8, pubkeys: &[Vec<u8>]) -> Vec<u8> {
    debug_assert!(k >= 1 && pubkeys.len() >= k as usize && pubkeys.len() <= 16);
    let mut script = vec![0x50 + k];
    for key in pubkeys {
        push_data(&mut script, key);
    }
    script.push(0x50 + pubkeys.len() as u8);
    script.push(OP_CHECKMULTISIG);
    script
}

/// Parses a bare k-of-n multisig over compressed pubkeys.
pub fn parse_multisig(script: &[u8]) -> Option<(u8, Vec<Vec<u8>>)> {
    if script.len() < 3 {
        return None;
    }
    let k_op = script[0];
    if !(OP_1..=OP_16).contains(&k_op) {
        return None;
    }
    let k = k_op - 0x50;
    let n_op = script[script.len() - 2];
    if !(OP_1..=OP_16).contains(&n_op) || *script.last()? != OP_CHECKMULTISIG {
        return None;
    }
    let n = n_op - 0x50;
    let keys = parse_push_only(&script[1..script.len() - 2])?;
    if keys.len() != n as usize || k > n {
        return None;
    }
    if !keys.iter().all(|key| key.len() == 33 && matches!(key[0], 0x02 | 0x03)) {
        return None;
    }
    Some((k, keys))
}

/// A compressible output script.
enum SpecialScript {
    P2pkh([u8; 20]),
    P2sh([u8; 20]),
    P2pkCompressed(u8, [u8; 32]),
    P2pkUncompressed(u8, [u8; 32]),
}

fn classify_output(script: &[u8]) -> Option<SpecialScript> {
    if script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 20
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
    {
        return Some(SpecialScript::P2pkh(script[3..23].try_into().unwrap()));
    }
    if script.len() == 23 && script[0] == OP_HASH160 && script[1] == 20 && script[22] == OP_EQUAL {
        return Some(SpecialScript::P2sh(script[2..22].try_into().unwrap()));
    }
    if script.len() == 35
        && script[0] == 33
        && matches!(script[1], 0x02 | 0x03)
        && script[34] == OP_CHECKSIG
    {
        return Some(SpecialScript::P2pkCompressed(
            script[1],
            script[2..34].try_into().unwrap(),
        ));
    }
    if script.len() == 67 && script[0] == 65 && script[1] == 0x04 && script[66] == OP_CHECKSIG {
        // Only a key that is actually on the curve can be rebuilt from its
        // x coordinate.
        if PublicKey::from_sec1_bytes(&script[1..66]).is_ok() {
            let parity = script[65] & 0x01;
            return Some(SpecialScript::P2pkUncompressed(
                0x04 | parity,
                script[2..34].try_into().unwrap(),
            ));
        }
    }
    None
}

/// Writes `script` in compressed output form.
pub fn write_script(w: &mut Writer, script: &[u8]) {
    match classify_output(script) {
        Some(SpecialScript::P2pkh(hash)) => {
            w.write_varint(0);
            w.write_raw(&hash);
        }
        Some(SpecialScript::P2sh(hash)) => {
            w.write_varint(1);
            w.write_raw(&hash);
        }
        Some(SpecialScript::P2pkCompressed(prefix, x)) => {
            w.write_varint(prefix as u64);
            w.write_raw(&x);
        }
        Some(SpecialScript::P2pkUncompressed(tag, x)) => {
            w.write_varint(tag as u64);
            w.write_raw(&x);
        }
        None => {
            w.write_varint(script.len() as u64 + SPECIAL_SCRIPTS);
            w.write_raw(script);
        }
    }
}

/// Reads a script written by [`write_script`].
pub fn read_script(r: &mut Reader) -> Result<Vec<u8>> {
    let code = r.read_varint()?;
    match code {
        0 => Ok(p2pkh_script(&r.read_array::<20>()?)),
        1 => Ok(p2sh_script(&r.read_array::<20>()?)),
        2 | 3 => {
            let x = r.read_array::<32>()?;
            let mut key = vec![code as u8];
            key.extend_from_slice(&x);
            Ok(p2pk_script(&key))
        }
        4 | 5 => {
            let x = r.read_array::<32>()?;
            let mut compressed = vec![0x02 | (code as u8 & 0x01)];
            compressed.extend_from_slice(&x);
            let point = PublicKey::from_sec1_bytes(&compressed)
                .map_err(|_| CodecError::Malformed("pubkey point"))?;
            let uncompressed = point.to_encoded_point(false);
            Ok(p2pk_script(uncompressed.as_bytes()))
        }
        _ => {
            let len = (code - SPECIAL_SCRIPTS) as usize;
            if len > MAX_SCRIPT_SIZE {
                return Err(CodecError::Oversized {
                    what: "script",
                    len,
                });
            }
            Ok(r.read_bytes(len)?.to_vec())
        }
    }
}
