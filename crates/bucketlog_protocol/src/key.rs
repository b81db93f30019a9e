//! Lexicographically sortable integer encoding.
//!
//! Integers are written in base 32 with a fixed width per bit count,
//! using an alphabet whose ASCII order matches digit order. Plain string
//! comparison of two encodings of the same width therefore matches
//! numeric comparison. The descending variant encodes `max - n`, so
//! larger values sort first and a `LIST` scan returns newest first.

use crate::error::{ProtocolError, ProtocolResult};

/// Digit alphabet, in ascending ASCII order.
pub const ALPHABET: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";

const DIGIT_BITS: u32 = 5;
const RADIX: u64 = 32;

/// Number of characters used for a `bits`-wide encoding.
pub fn encoded_width(bits: u32) -> usize {
    bits.div_ceil(DIGIT_BITS) as usize
}

fn max_value(bits: u32) -> ProtocolResult<u64> {
    match bits {
        1..=63 => Ok((1u64 << bits) - 1),
        64 => Ok(u64::MAX),
        _ => Err(ProtocolError::InvalidEncoding(format!(
            "bit width must be 1..=64, got {bits}"
        ))),
    }
}

fn digit_value(c: u8) -> Option<u64> {
    match c {
        b'0'..=b'9' => Some(u64::from(c - b'0')),
        b'a'..=b'v' => Some(u64::from(c - b'a') + 10),
        _ => None,
    }
}

/// Encodes `n` so that encodings sort ascending with `n`.
///
/// # Errors
///
/// Returns an error if `bits` is outside `1..=64` or `n` does not fit.
pub fn encode(n: u64, bits: u32) -> ProtocolResult<String> {
    let max = max_value(bits)?;
    if n > max {
        return Err(ProtocolError::InvalidEncoding(format!(
            "{n} does not fit in {bits} bits"
        )));
    }

    let width = encoded_width(bits);
    let mut digits = vec![b'0'; width];
    let mut rest = n;
    for slot in digits.iter_mut().rev() {
        *slot = ALPHABET[(rest % RADIX) as usize];
        rest /= RADIX;
    }
    // alphabet is ASCII
    Ok(digits.into_iter().map(char::from).collect())
}

/// Decodes an ascending encoding.
///
/// # Errors
///
/// Returns an error on a wrong width, a character outside the alphabet,
/// or a value wider than `bits`.
pub fn decode(s: &str, bits: u32) -> ProtocolResult<u64> {
    let max = max_value(bits)?;
    let width = encoded_width(bits);
    if s.len() != width {
        return Err(ProtocolError::InvalidEncoding(format!(
            "expected {width} characters for {bits} bits, got {:?}",
            s
        )));
    }

    let mut value: u128 = 0;
    for c in s.bytes() {
        let d = digit_value(c)
            .ok_or_else(|| ProtocolError::InvalidEncoding(format!("bad digit in {s:?}")))?;
        value = value * u128::from(RADIX) + u128::from(d);
    }

    if value > u128::from(max) {
        return Err(ProtocolError::InvalidEncoding(format!(
            "{s:?} exceeds {bits} bits"
        )));
    }
    Ok(value as u64)
}

/// Encodes `n` so that encodings sort descending with `n`.
///
/// # Errors
///
/// Returns an error if `bits` is outside `1..=64` or `n` does not fit.
pub fn encode_desc(n: u64, bits: u32) -> ProtocolResult<String> {
    let max = max_value(bits)?;
    if n > max {
        return Err(ProtocolError::InvalidEncoding(format!(
            "{n} does not fit in {bits} bits"
        )));
    }
    encode(max - n, bits)
}

/// Decodes a descending encoding.
///
/// # Errors
///
/// Same as [`decode`].
pub fn decode_desc(s: &str, bits: u32) -> ProtocolResult<u64> {
    Ok(max_value(bits)? - decode(s, bits)?)
}
