//! Input script compression: template recognition and stripping.
//!
//! Spending scripts are overwhelmingly one of a handful of shapes. When an
//! input matches a recognised template, its signatures are stored as bare
//! 64-byte `r‖s` pairs (DER framing and, for the common SIGHASH_ALL case,
//! the sighash byte are reconstructed), pubkeys as 32-byte x coordinates
//! with a parity flag, and script hashes are dropped entirely and re-derived
//! by hashing. Anything unrecognised passes through verbatim, so compression
//! never loses information.
//!
//! Recognition is deliberately strict: pushes must be minimal and signatures
//! strictly DER-encoded, otherwise the input falls through to a verbatim
//! template and still round-trips bit-exactly.
//!
//! ## Wire form
//!
//! Each input carries a 16-bit header:
//!
//! ```text
//! bits 0..4   template
//! bit  4      every signature uses SIGHASH_ALL
//! bit  5      pubkey y is odd (single-key templates)
//! bit  6      pubkey is uncompressed (single-key templates)
//! ```
//!
//! followed by the template payload. Multisig templates start their payload
//! with a packed `(k, n)` code.

use crate::error::{CodecError, Result};
use crate::script::{
    hash160, p2pkh_script, parse_multisig, parse_push_only, push_only_script, sha256,
};
use crate::ser::{Reader, Writer};

const MAX_WITNESS_ITEMS: usize = 100_000;
const MAX_WITNESS_ITEM_LEN: usize = 4_000_000;
const MAX_SCRIPT_LEN: usize = 10_000;

/// The recognised spending-script shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScriptSigTemplate {
    P2shP2wshOther = 0,
    WitOther = 1,
    NonwitOther = 2,
    P2shUw = 3,
    P2pk = 4,
    P2pkh = 5,
    P2wpkh = 6,
    P2shP2wpkh = 7,
    P2shP2wshP2pkh = 8,
    Ms = 9,
    P2shMs = 10,
    P2wshMs = 11,
    P2shP2wshMs = 12,
}

impl ScriptSigTemplate {
    pub fn from_bits(bits: u16) -> Result<Self> {
        use ScriptSigTemplate::*;
        Ok(match bits {
            0 => P2shP2wshOther,
            1 => WitOther,
            2 => NonwitOther,
            3 => P2shUw,
            4 => P2pk,
            5 => P2pkh,
            6 => P2wpkh,
            7 => P2shP2wpkh,
            8 => P2shP2wshP2pkh,
            9 => Ms,
            10 => P2shMs,
            11 => P2wshMs,
            12 => P2shP2wshMs,
            _ => return Err(CodecError::Malformed("scriptsig template")),
        })
    }
}

const FLAG_SIGHASH_ALL: u16 = 1 << 4;
const FLAG_PUBKEY_ODD: u16 = 1 << 5;
const FLAG_PUBKEY_UNCOMPRESSED: u16 = 1 << 6;

pub const SIGHASH_ALL: u8 = 0x01;

/// Packs a multisig threshold pair into 16 bits.
pub fn kn_code(k: u8, n: u8) -> u16 {
    ((k as u16) << 8) | n as u16
}

/// Inverse of [`kn_code`].
pub fn kn_decode(code: u16) -> Result<(u8, u8)> {
    let (k, n) = ((code >> 8) as u8, (code & 0xff) as u8);
    if k == 0 || n == 0 || k > n || n > 16 {
        return Err(CodecError::Malformed("multisig kn code"));
    }
    Ok((k, n))
}

/// A strictly DER-encoded ECDSA signature with its sighash byte.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedSig {
    r: [u8; 32],
    s: [u8; 32],
    sighash: u8,
}

/// Strict DER parse (the consensus BIP66 rules). Returns `None` for
/// anything that would not re-encode to the same bytes.
fn parse_sig(sig: &[u8]) -> Option<ParsedSig> {
    let len = sig.len();
    if !(9..=73).contains(&len) {
        return None;
    }
    let der_len = len - 1;
    if sig[0] != 0x30 || sig[1] as usize != der_len - 2 {
        return None;
    }
    if sig[2] != 0x02 {
        return None;
    }
    let len_r = sig[3] as usize;
    if len_r == 0 || len_r > 33 || 5 + len_r >= der_len {
        return None;
    }
    if sig[4] & 0x80 != 0 {
        return None;
    }
    if len_r > 1 && sig[4] == 0 && sig[5] & 0x80 == 0 {
        return None;
    }
    if sig[4 + len_r] != 0x02 {
        return None;
    }
    let len_s = sig[5 + len_r] as usize;
    if len_s == 0 || len_s > 33 || len_r + len_s + 6 != der_len {
        return None;
    }
    let s_start = 6 + len_r;
    if sig[s_start] & 0x80 != 0 {
        return None;
    }
    if len_s > 1 && sig[s_start] == 0 && sig[s_start + 1] & 0x80 == 0 {
        return None;
    }

    let right_align = |bytes: &[u8]| -> Option<[u8; 32]> {
        let bytes = if bytes.len() == 33 {
            if bytes[0] != 0 {
                return None;
            }
            &bytes[1..]
        } else {
            bytes
        };
        let mut out = [0u8; 32];
        out[32 - bytes.len()..].copy_from_slice(bytes);
        Some(out)
    };

    Some(ParsedSig {
        r: right_align(&sig[4..4 + len_r])?,
        s: right_align(&sig[s_start..s_start + len_s])?,
        sighash: sig[len - 1],
    })
}

/// Minimal positive DER integer body for a 32-byte big-endian value.
fn minimal_int(value: &[u8; 32]) -> Vec<u8> {
    let start = value.iter().position(|&b| b != 0).unwrap_or(31);
    let mut out = Vec::with_capacity(34);
    if value[start] & 0x80 != 0 {
        out.push(0);
    }
    out.extend_from_slice(&value[start..]);
    out
}

fn encode_sig(sig: &ParsedSig) -> Vec<u8> {
    let r = minimal_int(&sig.r);
    let s = minimal_int(&sig.s);
    let mut out = Vec::with_capacity(r.len() + s.len() + 7);
    out.push(0x30);
    out.push((r.len() + s.len() + 4) as u8);
    out.push(0x02);
    out.push(r.len() as u8);
    out.extend_from_slice(&r);
    out.push(0x02);
    out.push(s.len() as u8);
    out.extend_from_slice(&s);
    out.push(sig.sighash);
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ParsedPubkey {
    Compressed { odd: bool, x: [u8; 32] },
    Uncompressed { body: [u8; 64] },
}

fn parse_pubkey(bytes: &[u8]) -> Option<ParsedPubkey> {
    match (bytes.len(), bytes.first()?) {
        (33, 0x02) | (33, 0x03) => Some(ParsedPubkey::Compressed {
            odd: bytes[0] == 0x03,
            x: bytes[1..].try_into().unwrap(),
        }),
        (65, 0x04) => Some(ParsedPubkey::Uncompressed {
            body: bytes[1..].try_into().unwrap(),
        }),
        _ => None,
    }
}

fn pubkey_bytes(key: &ParsedPubkey) -> Vec<u8> {
    match key {
        ParsedPubkey::Compressed { odd, x } => {
            let mut out = vec![if *odd { 0x03 } else { 0x02 }];
            out.extend_from_slice(x);
            out
        }
        ParsedPubkey::Uncompressed { body } => {
            let mut out = vec![0x04];
            out.extend_from_slice(body);
            out
        }
    }
}

fn pubkey_flags(key: &ParsedPubkey) -> u16 {
    match key {
        ParsedPubkey::Compressed { odd: true, .. } => FLAG_PUBKEY_ODD,
        ParsedPubkey::Compressed { odd: false, .. } => 0,
        ParsedPubkey::Uncompressed { .. } => FLAG_PUBKEY_UNCOMPRESSED,
    }
}

fn write_sig_body(w: &mut Writer, sig: &ParsedSig, sighash_all: bool) {
    w.write_raw(&sig.r);
    w.write_raw(&sig.s);
    if !sighash_all {
        w.write_u8(sig.sighash);
    }
}

fn read_sig_body(r: &mut Reader, sighash_all: bool) -> Result<ParsedSig> {
    let r32 = r.read_array::<32>()?;
    let s32 = r.read_array::<32>()?;
    let sighash = if sighash_all { SIGHASH_ALL } else { r.read_u8()? };
    Ok(ParsedSig {
        r: r32,
        s: s32,
        sighash,
    })
}

fn write_pubkey_body(w: &mut Writer, key: &ParsedPubkey) {
    match key {
        ParsedPubkey::Compressed { x, .. } => w.write_raw(x),
        ParsedPubkey::Uncompressed { body } => w.write_raw(body),
    }
}

fn read_pubkey_body(r: &mut Reader, flags: u16) -> Result<ParsedPubkey> {
    if flags & FLAG_PUBKEY_UNCOMPRESSED != 0 {
        Ok(ParsedPubkey::Uncompressed {
            body: r.read_array::<64>()?,
        })
    } else {
        Ok(ParsedPubkey::Compressed {
            odd: flags & FLAG_PUBKEY_ODD != 0,
            x: r.read_array::<32>()?,
        })
    }
}

fn write_witness_stack(w: &mut Writer, witness: &[Vec<u8>]) {
    w.write_compact_size(witness.len() as u64);
    for item in witness {
        w.write_var_bytes(item);
    }
}

fn read_witness_stack(r: &mut Reader) -> Result<Vec<Vec<u8>>> {
    let count = r.read_compact_size()? as usize;
    if count > MAX_WITNESS_ITEMS {
        return Err(CodecError::Oversized {
            what: "witness items",
            len: count,
        });
    }
    let mut stack = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        stack.push(r.read_var_bytes(MAX_WITNESS_ITEM_LEN, "witness item")?.to_vec());
    }
    Ok(stack)
}

/// The p2wsh scriptSig form: a single push of `0x00 0x20 <sha256>`.
fn p2wsh_program_push(script: &[u8]) -> Vec<u8> {
    let mut program = vec![0x00, 0x20];
    program.extend_from_slice(&sha256(script));
    push_only_script(&[program])
}

fn p2wpkh_redeem_push(key: &ParsedPubkey) -> Vec<u8> {
    let mut program = vec![0x00, 0x14];
    program.extend_from_slice(&hash160(&pubkey_bytes(key)));
    push_only_script(&[program])
}

/// Is this pushed value a segwit program (version byte plus 2..=40 bytes)?
fn is_witness_program(value: &[u8]) -> bool {
    (4..=42).contains(&value.len())
        && (value[0] == 0x00 || (0x51..=0x60).contains(&value[0]))
        && value[1] as usize == value.len() - 2
}

/// One classified input, ready to serialize.
enum Classified {
    SingleSig {
        template: ScriptSigTemplate,
        sig: ParsedSig,
        pubkey: Option<ParsedPubkey>,
    },
    Multisig {
        template: ScriptSigTemplate,
        k: u8,
        n: u8,
        sigs: Vec<ParsedSig>,
        keys: Vec<ParsedPubkey>,
    },
    ShUnknownWitness {
        program: Vec<u8>,
    },
    ShWshOther,
    WitnessOther,
    NonwitnessOther,
}

fn classify(script_sig: &[u8], witness: &[Vec<u8>]) -> Classified {
    use Classified::*;
    use ScriptSigTemplate::*;

    // Strip candidates only when the scriptSig consists of minimal pushes;
    // anything else must travel verbatim to stay bit-exact.
    let pushes = parse_push_only(script_sig)
        .filter(|values| push_only_script(values) == script_sig);

    if let Some(pushes) = &pushes {
        if witness.is_empty() {
            match pushes.as_slice() {
                [sig] => {
                    if let Some(sig) = parse_sig(sig) {
                        return SingleSig {
                            template: P2pk,
                            sig,
                            pubkey: None,
                        };
                    }
                }
                [sig, key] => {
                    if let (Some(sig), Some(key)) = (parse_sig(sig), parse_pubkey(key)) {
                        return SingleSig {
                            template: P2pkh,
                            sig,
                            pubkey: Some(key),
                        };
                    }
                }
                _ => {}
            }
            // Bare or wrapped multisig: a dummy empty push then signatures.
            if pushes.len() >= 2 && pushes[0].is_empty() {
                let body = &pushes[1..];
                if let Some(sigs) = body
                    .iter()
                    .map(|s| parse_sig(s))
                    .collect::<Option<Vec<_>>>()
                {
                    if sigs.len() <= 16 {
                        return Multisig {
                            template: Ms,
                            k: sigs.len() as u8,
                            n: sigs.len() as u8,
                            sigs,
                            keys: Vec::new(),
                        };
                    }
                }
                if body.len() >= 2 {
                    if let Some((k, raw_keys)) = parse_multisig(body.last().unwrap()) {
                        if k as usize == body.len() - 1 {
                            if let Some(sigs) = body[..body.len() - 1]
                                .iter()
                                .map(|s| parse_sig(s))
                                .collect::<Option<Vec<_>>>()
                            {
                                let keys = raw_keys
                                    .iter()
                                    .map(|key| parse_pubkey(key))
                                    .collect::<Option<Vec<_>>>();
                                if let Some(keys) = keys {
                                    return Multisig {
                                        template: P2shMs,
                                        k,
                                        n: keys.len() as u8,
                                        sigs,
                                        keys,
                                    };
                                }
                            }
                        }
                    }
                }
            }
        } else {
            // Witness-bearing inputs.
            if pushes.is_empty() {
                match witness {
                    [sig, key] => {
                        if let (Some(sig), Some(key)) = (parse_sig(sig), parse_pubkey(key)) {
                            return SingleSig {
                                template: P2wpkh,
                                sig,
                                pubkey: Some(key),
                            };
                        }
                    }
                    [first, middle @ .., wscript] if first.is_empty() && !middle.is_empty() => {
                        if let Some(classified) =
                            classify_wsh_multisig(P2wshMs, middle, wscript)
                        {
                            return classified;
                        }
                    }
                    _ => {}
                }
                if !witness.is_empty() {
                    return WitnessOther;
                }
            } else if pushes.len() == 1 {
                // P2SH-wrapped witness spends.
                if witness.len() == 2 {
                    if let (Some(sig), Some(key)) =
                        (parse_sig(&witness[0]), parse_pubkey(&witness[1]))
                    {
                        if p2wpkh_redeem_push(&key) == script_sig {
                            return SingleSig {
                                template: P2shP2wpkh,
                                sig,
                                pubkey: Some(key),
                            };
                        }
                    }
                }
                if witness.len() == 3 {
                    if let (Some(sig), Some(key)) =
                        (parse_sig(&witness[0]), parse_pubkey(&witness[1]))
                    {
                        let wscript = p2pkh_script(&hash160(&pubkey_bytes(&key)));
                        if witness[2] == wscript && p2wsh_program_push(&wscript) == script_sig {
                            return SingleSig {
                                template: P2shP2wshP2pkh,
                                sig,
                                pubkey: Some(key),
                            };
                        }
                    }
                }
                if let [first, middle @ .., wscript] = witness {
                    if first.is_empty()
                        && !middle.is_empty()
                        && p2wsh_program_push(wscript) == script_sig
                    {
                        if let Some(classified) =
                            classify_wsh_multisig(P2shP2wshMs, middle, wscript)
                        {
                            return classified;
                        }
                    }
                }
                if let Some(last) = witness.last() {
                    if p2wsh_program_push(last) == script_sig {
                        return ShWshOther;
                    }
                }
                if is_witness_program(&pushes[0]) {
                    return ShUnknownWitness {
                        program: pushes[0].clone(),
                    };
                }
            }
        }
    }

    NonwitnessOther
}

fn classify_wsh_multisig(
    template: ScriptSigTemplate,
    sigs: &[Vec<u8>],
    wscript: &[u8],
) -> Option<Classified> {
    let (k, raw_keys) = parse_multisig(wscript)?;
    if k as usize != sigs.len() {
        return None;
    }
    let sigs = sigs.iter().map(|s| parse_sig(s)).collect::<Option<Vec<_>>>()?;
    let keys = raw_keys
        .iter()
        .map(|key| parse_pubkey(key))
        .collect::<Option<Vec<_>>>()?;
    Some(Classified::Multisig {
        template,
        k,
        n: keys.len() as u8,
        sigs,
        keys,
    })
}

/// Compresses one input's scripts into `w`.
pub fn compress_input(w: &mut Writer, script_sig: &[u8], witness: &[Vec<u8>]) {
    match classify(script_sig, witness) {
        Classified::SingleSig {
            template,
            sig,
            pubkey,
        } => {
            let sighash_all = sig.sighash == SIGHASH_ALL;
            let mut header = template as u16;
            if sighash_all {
                header |= FLAG_SIGHASH_ALL;
            }
            if let Some(key) = &pubkey {
                header |= pubkey_flags(key);
            }
            w.write_u16(header);
            write_sig_body(w, &sig, sighash_all);
            if let Some(key) = &pubkey {
                write_pubkey_body(w, key);
            }
        }
        Classified::Multisig {
            template,
            k,
            n,
            sigs,
            keys,
        } => {
            let sighash_all = sigs.iter().all(|s| s.sighash == SIGHASH_ALL);
            let mut header = template as u16;
            if sighash_all {
                header |= FLAG_SIGHASH_ALL;
            }
            w.write_u16(header);
            w.write_u16(kn_code(k, n));
            for sig in &sigs {
                write_sig_body(w, sig, sighash_all);
            }
            if !keys.is_empty() {
                let mut parity = vec![0u8; keys.len().div_ceil(8)];
                for (i, key) in keys.iter().enumerate() {
                    if matches!(key, ParsedPubkey::Compressed { odd: true, .. }) {
                        parity[i / 8] |= 1 << (i % 8);
                    }
                }
                w.write_raw(&parity);
                for key in &keys {
                    write_pubkey_body(w, key);
                }
            }
        }
        Classified::ShUnknownWitness { program } => {
            w.write_u16(ScriptSigTemplate::P2shUw as u16);
            w.write_var_bytes(&program);
            write_witness_stack(w, witness);
        }
        Classified::ShWshOther => {
            w.write_u16(ScriptSigTemplate::P2shP2wshOther as u16);
            write_witness_stack(w, witness);
        }
        Classified::WitnessOther => {
            w.write_u16(ScriptSigTemplate::WitOther as u16);
            write_witness_stack(w, witness);
        }
        Classified::NonwitnessOther => {
            w.write_u16(ScriptSigTemplate::NonwitOther as u16);
            w.write_var_bytes(script_sig);
            write_witness_stack(w, witness);
        }
    }
}

/// Reverses [`compress_input`], rebuilding the exact scriptSig and witness.
pub fn decompress_input(r: &mut Reader) -> Result<(Vec<u8>, Vec<Vec<u8>>)> {
    let header = r.read_u16()?;
    let template = ScriptSigTemplate::from_bits(header & 0x0f)?;
    let sighash_all = header & FLAG_SIGHASH_ALL != 0;

    use ScriptSigTemplate::*;
    match template {
        P2pk => {
            let sig = read_sig_body(r, sighash_all)?;
            Ok((push_only_script(&[encode_sig(&sig)]), Vec::new()))
        }
        P2pkh => {
            let sig = read_sig_body(r, sighash_all)?;
            let key = read_pubkey_body(r, header)?;
            Ok((
                push_only_script(&[encode_sig(&sig), pubkey_bytes(&key)]),
                Vec::new(),
            ))
        }
        P2wpkh => {
            let sig = read_sig_body(r, sighash_all)?;
            let key = read_pubkey_body(r, header)?;
            Ok((Vec::new(), vec![encode_sig(&sig), pubkey_bytes(&key)]))
        }
        P2shP2wpkh => {
            let sig = read_sig_body(r, sighash_all)?;
            let key = read_pubkey_body(r, header)?;
            Ok((
                p2wpkh_redeem_push(&key),
                vec![encode_sig(&sig), pubkey_bytes(&key)],
            ))
        }
        P2shP2wshP2pkh => {
            let sig = read_sig_body(r, sighash_all)?;
            let key = read_pubkey_body(r, header)?;
            let wscript = p2pkh_script(&hash160(&pubkey_bytes(&key)));
            Ok((
                p2wsh_program_push(&wscript),
                vec![encode_sig(&sig), pubkey_bytes(&key), wscript],
            ))
        }
        Ms | P2shMs | P2wshMs | P2shP2wshMs => {
            let (k, n) = kn_decode(r.read_u16()?)?;
            let mut sigs = Vec::with_capacity(k as usize);
            for _ in 0..k {
                sigs.push(read_sig_body(r, sighash_all)?);
            }
            let sig_bytes: Vec<Vec<u8>> = sigs.iter().map(encode_sig).collect();

            if template == Ms {
                let mut values = vec![Vec::new()];
                values.extend(sig_bytes);
                return Ok((push_only_script(&values), Vec::new()));
            }

            let mut parity = vec![0u8; (n as usize).div_ceil(8)];
            for byte in parity.iter_mut() {
                *byte = r.read_u8()?;
            }
            let mut keys = Vec::with_capacity(n as usize);
            for i in 0..n as usize {
                let odd = parity[i / 8] & (1 << (i % 8)) != 0;
                keys.push(pubkey_bytes(&ParsedPubkey::Compressed {
                    odd,
                    x: r.read_array::<32>()?,
                }));
            }
            let script = crate::script::multisig_script(k, &keys);

            match template {
                P2shMs => {
                    let mut values = vec![Vec::new()];
                    values.extend(sig_bytes);
                    values.push(script);
                    Ok((push_only_script(&values), Vec::new()))
                }
                P2wshMs => {
                    let mut witness = vec![Vec::new()];
                    witness.extend(sig_bytes);
                    witness.push(script);
                    Ok((Vec::new(), witness))
                }
                P2shP2wshMs => {
                    let mut witness = vec![Vec::new()];
                    witness.extend(sig_bytes);
                    witness.push(script.clone());
                    Ok((p2wsh_program_push(&script), witness))
                }
                _ => unreachable!(),
            }
        }
        P2shUw => {
            let program = r.read_var_bytes(MAX_SCRIPT_LEN, "witness program")?.to_vec();
            let witness = read_witness_stack(r)?;
            Ok((push_only_script(&[program]), witness))
        }
        P2shP2wshOther => {
            let witness = read_witness_stack(r)?;
            let last = witness
                .last()
                .ok_or(CodecError::Malformed("empty witness for p2wsh input"))?;
            Ok((p2wsh_program_push(last), witness))
        }
        WitOther => Ok((Vec::new(), read_witness_stack(r)?)),
        NonwitOther => {
            let script_sig = r.read_var_bytes(MAX_SCRIPT_LEN, "script_sig")?.to_vec();
            let witness = read_witness_stack(r)?;
            Ok((script_sig, witness))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A canonical-looking signature with the given sighash byte.
    pub(crate) fn dummy_sig(seed: u8, sighash: u8) -> Vec<u8> {
        let sig = ParsedSig {
            r: {
                let mut r = [0u8; 32];
                r[0] = 0x7f;
                r[31] = seed;
                r
            },
            s: {
                let mut s = [0u8; 32];
                s[0] = 0x10;
                s[31] = seed.wrapping_add(1);
                s
            },
            sighash,
        };
        encode_sig(&sig)
    }

    fn dummy_key(seed: u8, odd: bool) -> Vec<u8> {
        let mut key = vec![if odd { 0x03 } else { 0x02 }];
        key.extend_from_slice(&[seed; 32]);
        key
    }

    fn roundtrip(script_sig: &[u8], witness: &[Vec<u8>]) -> ScriptSigTemplate {
        let mut w = Writer::new();
        compress_input(&mut w, script_sig, witness);
        let mut r = Reader::new(w.as_bytes());
        let header = u16::from_le_bytes(w.as_bytes()[..2].try_into().unwrap());
        let template = ScriptSigTemplate::from_bits(header & 0x0f).unwrap();
        let (out_sig, out_wit) = decompress_input(&mut r).unwrap();
        assert!(r.is_empty());
        assert_eq!(out_sig, script_sig);
        assert_eq!(out_wit, witness);
        template
    }

    #[test]
    fn test_sig_parse_rejects_non_der() {
        assert!(parse_sig(&[0x30, 0x01]).is_none());
        assert!(parse_sig(&vec![0u8; 80]).is_none());
        let mut sig = dummy_sig(1, 0x01);
        sig[0] = 0x31;
        assert!(parse_sig(&sig).is_none());
    }

    #[test]
    fn test_sig_roundtrip_exact() {
        for sighash in [0x01u8, 0x02, 0x03, 0x81] {
            let sig = dummy_sig(9, sighash);
            let parsed = parse_sig(&sig).unwrap();
            assert_eq!(encode_sig(&parsed), sig);
        }
    }

    #[test]
    fn test_p2pk() {
        let t = roundtrip(&push_only_script(&[dummy_sig(1, 0x01)]), &[]);
        assert_eq!(t, ScriptSigTemplate::P2pk);
    }

    #[test]
    fn test_p2pk_nonstandard_sighash() {
        let t = roundtrip(&push_only_script(&[dummy_sig(1, 0x83)]), &[]);
        assert_eq!(t, ScriptSigTemplate::P2pk);
    }

    #[test]
    fn test_p2pkh_variants() {
        for odd in [false, true] {
            let script = push_only_script(&[dummy_sig(3, 0x01), dummy_key(7, odd)]);
            assert_eq!(roundtrip(&script, &[]), ScriptSigTemplate::P2pkh);
        }
        // Uncompressed key.
        let mut key = vec![0x04];
        key.extend_from_slice(&[0x55; 64]);
        let script = push_only_script(&[dummy_sig(3, 0x01), key]);
        assert_eq!(roundtrip(&script, &[]), ScriptSigTemplate::P2pkh);
    }

    #[test]
    fn test_p2wpkh() {
        let witness = vec![dummy_sig(2, 0x01), dummy_key(4, true)];
        assert_eq!(roundtrip(&[], &witness), ScriptSigTemplate::P2wpkh);
    }

    #[test]
    fn test_p2sh_p2wpkh() {
        let key = dummy_key(4, false);
        let witness = vec![dummy_sig(2, 0x01), key.clone()];
        let script_sig = p2wpkh_redeem_push(&parse_pubkey(&key).unwrap());
        assert_eq!(roundtrip(&script_sig, &witness), ScriptSigTemplate::P2shP2wpkh);
    }

    #[test]
    fn test_p2sh_p2wsh_p2pkh() {
        let key = dummy_key(8, true);
        let wscript = p2pkh_script(&hash160(&key));
        let witness = vec![dummy_sig(5, 0x01), key, wscript.clone()];
        let script_sig = p2wsh_program_push(&wscript);
        assert_eq!(
            roundtrip(&script_sig, &witness),
            ScriptSigTemplate::P2shP2wshP2pkh
        );
    }

    #[test]
    fn test_bare_multisig() {
        let script = push_only_script(&[Vec::new(), dummy_sig(1, 0x01), dummy_sig(2, 0x01)]);
        assert_eq!(roundtrip(&script, &[]), ScriptSigTemplate::Ms);
    }

    #[test]
    fn test_p2sh_multisig() {
        let keys = vec![dummy_key(1, false), dummy_key(2, true), dummy_key(3, false)];
        let redeem = crate::script::multisig_script(2, &keys);
        let script = push_only_script(&[
            Vec::new(),
            dummy_sig(1, 0x01),
            dummy_sig(2, 0x01),
            redeem,
        ]);
        assert_eq!(roundtrip(&script, &[]), ScriptSigTemplate::P2shMs);
    }

    #[test]
    fn test_p2wsh_multisig() {
        let keys = vec![dummy_key(1, true), dummy_key(2, false)];
        let wscript = crate::script::multisig_script(2, &keys);
        let witness = vec![Vec::new(), dummy_sig(1, 0x01), dummy_sig(2, 0x01), wscript];
        assert_eq!(roundtrip(&[], &witness), ScriptSigTemplate::P2wshMs);
    }

    #[test]
    fn test_p2sh_p2wsh_multisig() {
        let keys = vec![dummy_key(1, false), dummy_key(2, false), dummy_key(3, true)];
        let wscript = crate::script::multisig_script(2, &keys);
        let witness = vec![
            Vec::new(),
            dummy_sig(1, 0x01),
            dummy_sig(2, 0x01),
            wscript.clone(),
        ];
        let script_sig = p2wsh_program_push(&wscript);
        assert_eq!(roundtrip(&script_sig, &witness), ScriptSigTemplate::P2shP2wshMs);
    }

    #[test]
    fn test_multisig_mixed_sighash() {
        let script = push_only_script(&[Vec::new(), dummy_sig(1, 0x01), dummy_sig(2, 0x83)]);
        assert_eq!(roundtrip(&script, &[]), ScriptSigTemplate::Ms);
    }

    #[test]
    fn test_p2sh_unknown_witness() {
        let mut program = vec![0x51, 0x20];
        program.extend_from_slice(&[0xab; 32]);
        let script_sig = push_only_script(&[program]);
        let witness = vec![vec![0x01, 0x02], vec![0x03]];
        assert_eq!(roundtrip(&script_sig, &witness), ScriptSigTemplate::P2shUw);
    }

    #[test]
    fn test_p2sh_p2wsh_other() {
        let wscript = vec![0x51, 0x51, 0x87];
        let script_sig = p2wsh_program_push(&wscript);
        let witness = vec![vec![0xaa], wscript];
        assert_eq!(roundtrip(&script_sig, &witness), ScriptSigTemplate::P2shP2wshOther);
    }

    #[test]
    fn test_witness_other() {
        let witness = vec![vec![0x01; 50], vec![0x02; 3], Vec::new()];
        assert_eq!(roundtrip(&[], &witness), ScriptSigTemplate::WitOther);
    }

    #[test]
    fn test_nonwitness_other() {
        assert_eq!(roundtrip(&[0x51, 0x87], &[]), ScriptSigTemplate::NonwitOther);
        assert_eq!(roundtrip(&[], &[]), ScriptSigTemplate::NonwitOther);
    }

    #[test]
    fn test_both_scripts_fall_back_verbatim() {
        // scriptSig and witness both present but matching no template.
        let witness = vec![vec![0x09; 10]];
        let script_sig = push_only_script(&[vec![0x01, 0x02, 0x03]]);
        assert_eq!(roundtrip(&script_sig, &witness), ScriptSigTemplate::NonwitOther);
    }

    #[test]
    fn test_non_minimal_push_falls_back() {
        // The same value pushed with PUSHDATA1 instead of a direct push.
        let sig = dummy_sig(1, 0x01);
        let mut script_sig = vec![crate::script::OP_PUSHDATA1, sig.len() as u8];
        script_sig.extend_from_slice(&sig);
        assert_eq!(roundtrip(&script_sig, &[]), ScriptSigTemplate::NonwitOther);
    }

    #[test]
    fn test_kn_code_roundtrip() {
        for k in 1..=16u8 {
            for n in k..=16u8 {
                assert_eq!(kn_decode(kn_code(k, n)).unwrap(), (k, n));
            }
        }
        assert!(kn_decode(kn_code(3, 2)).is_err());
        assert!(kn_decode(0).is_err());
    }
}
