//! Output amount compression.
//!
//! Most on-chain amounts are round numbers, so amounts of the form
//! `d * 10^(e+1)` with a single significant digit compress to one code
//! byte: `1 + 10*e + d` (d in 1..=9, e in 0..=9), with 0 encoding itself.
//! Everything else is written as a sentinel followed by the raw satoshi
//! value.
//!
//! Version note: an earlier stream revision used a sentinel that collided
//! with another output code; from codec version 1 on the sentinel is
//! shifted up by one. Both decode paths are kept so old streams stay
//! readable.

use crate::error::{CodecError, Result};
use crate::ser::{Reader, Writer};
use crate::CodecVersion;

/// Largest valid amount: 21 million coins in satoshis.
pub const MAX_MONEY: u64 = 2_100_000_000_000_000;

/// Largest compact amount code; the sentinel lives above this.
const MAX_COMPACT_CODE: u64 = 100;

/// Marker introducing a raw varint amount.
pub fn amount_sentinel(version: CodecVersion) -> u64 {
    match version {
        CodecVersion::V0 => MAX_COMPACT_CODE + 1,
        CodecVersion::V1 => MAX_COMPACT_CODE + 2,
    }
}

/// Compact code for `amount`, if it has one.
fn compress_amount(amount: u64) -> Option<u64> {
    if amount == 0 {
        return Some(0);
    }
    if amount % 10 != 0 {
        return None;
    }
    let mut d = amount / 10;
    let mut e = 0u64;
    while d % 10 == 0 && e < 9 {
        d /= 10;
        e += 1;
    }
    (1..=9).contains(&d).then_some(1 + 10 * e + d)
}

/// Inverse of [`compress_amount`] for codes `0..=100`.
fn decompress_amount(code: u64) -> Result<u64> {
    if code == 0 {
        return Ok(0);
    }
    let d = (code - 1) % 10;
    let e = (code - 1) / 10;
    if d == 0 {
        return Err(CodecError::Malformed("amount code"));
    }
    Ok(d * 10u64.pow(e as u32 + 1))
}

/// Writes `amount` in compressed form.
pub fn write_amount(w: &mut Writer, amount: u64, version: CodecVersion) {
    match compress_amount(amount) {
        Some(code) => w.write_varint(code),
        None => {
            w.write_varint(amount_sentinel(version));
            w.write_varint(amount);
        }
    }
}

/// Reads an amount written by [`write_amount`].
pub fn read_amount(r: &mut Reader, version: CodecVersion) -> Result<u64> {
    let code = r.read_varint()?;
    let sentinel = amount_sentinel(version);
    if code == sentinel {
        return r.read_varint();
    }
    if code > MAX_COMPACT_CODE {
        return Err(CodecError::Malformed("amount code"));
    }
    decompress_amount(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(amount: u64, version: CodecVersion) -> usize {
        let mut w = Writer::new();
        write_amount(&mut w, amount, version);
        let mut r = Reader::new(w.as_bytes());
        assert_eq!(read_amount(&mut r, version).unwrap(), amount);
        assert!(r.is_empty());
        w.len()
    }

    #[test]
    fn test_zero_is_one_byte() {
        assert_eq!(roundtrip(0, CodecVersion::V1), 1);
    }

    #[test]
    fn test_round_amounts_compress() {
        for (amount, _) in [
            (10u64, ()),
            (50, ()),
            (100, ()),
            (5_000, ()),
            (100_000_000, ()),
            (9_0000_000_000, ()),
        ] {
            assert_eq!(roundtrip(amount, CodecVersion::V1), 1, "amount {amount}");
        }
    }

    #[test]
    fn test_irregular_amounts_roundtrip() {
        for amount in [1u64, 7, 99, 123, 1234, 12_345_678, 999_999_999, MAX_MONEY] {
            roundtrip(amount, CodecVersion::V0);
            roundtrip(amount, CodecVersion::V1);
        }
    }

    #[test]
    fn test_exhaustive_small_range() {
        for amount in 0..100_000u64 {
            let mut w = Writer::new();
            write_amount(&mut w, amount, CodecVersion::V1);
            let mut r = Reader::new(w.as_bytes());
            assert_eq!(read_amount(&mut r, CodecVersion::V1).unwrap(), amount);
        }
    }

    #[test]
    fn test_powers_of_ten() {
        let mut amount = 1u64;
        while amount <= MAX_MONEY {
            roundtrip(amount, CodecVersion::V1);
            amount *= 10;
        }
    }

    #[test]
    fn test_sentinel_differs_between_versions() {
        assert_eq!(amount_sentinel(CodecVersion::V0) + 1, amount_sentinel(CodecVersion::V1));
    }

    #[test]
    fn test_old_sentinel_rejected_by_v1() {
        let mut w = Writer::new();
        w.write_varint(amount_sentinel(CodecVersion::V0));
        w.write_varint(123);
        let mut r = Reader::new(w.as_bytes());
        assert!(read_amount(&mut r, CodecVersion::V1).is_err());
    }
}
