//! Order-preserving key encoding.
//!
//! Every encoded value is a tag byte followed by a self-delimiting payload,
//! so memcmp order equals the value's natural order and compound keys are
//! plain concatenations. The null tag (0x00) sorts before everything and is
//! exempt from unique checks.

use rust_decimal::Decimal;

use crate::error::{GaldrError, Result};
use crate::types::Value;

pub const MAX_KEY_LEN: usize = 512;

pub const TAG_NULL: u8 = 0x00;
pub const TAG_BOOL: u8 = 0x01;
pub const TAG_INT: u8 = 0x02;
pub const TAG_DOUBLE: u8 = 0x03;
pub const TAG_DECIMAL: u8 = 0x04;
pub const TAG_STRING: u8 = 0x05;
pub const TAG_DATETIME: u8 = 0x06;
pub const TAG_DATEONLY: u8 = 0x07;
pub const TAG_TIMEONLY: u8 = 0x08;
pub const TAG_TIMESPAN: u8 = 0x09;
pub const TAG_DTOFFSET: u8 = 0x0A;
pub const TAG_GUID: u8 = 0x0B;
pub const TAG_BYTES: u8 = 0x0C;
pub const TAG_UINT: u8 = 0x0D;

/// Encode a document id for the primary tree and as the secondary key
/// suffix: big-endian with the sign bit flipped.
pub fn encode_id(id: i64) -> [u8; 8] {
    ((id as u64) ^ (1u64 << 63)).to_be_bytes()
}

pub fn decode_id(bytes: &[u8]) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    (u64::from_be_bytes(raw) ^ (1u64 << 63)) as i64
}

fn flip_i64(v: i64) -> [u8; 8] {
    ((v as u64) ^ (1u64 << 63)).to_be_bytes()
}

fn flip_i16(v: i16) -> [u8; 2] {
    ((v as u16) ^ (1u16 << 15)).to_be_bytes()
}

fn flip_i128(v: i128) -> [u8; 16] {
    ((v as u128) ^ (1u128 << 127)).to_be_bytes()
}

/// IEEE-754 bit trick: negative values flip all bits, others flip the sign
/// bit, giving total order matching numeric order (NaN sorts above +inf).
fn double_bits(v: f64) -> [u8; 8] {
    let bits = v.to_bits();
    let mapped = if bits & (1u64 << 63) != 0 {
        !bits
    } else {
        bits ^ (1u64 << 63)
    };
    mapped.to_be_bytes()
}

/// Split into floor + fraction so the pair orders correctly for negatives
/// too (value = floor + frac, 0 <= frac < 1). Rescaling a full 96-bit
/// mantissa to one fixed scale would overflow i128; the fraction alone
/// never does.
fn decimal_bytes(d: Decimal) -> Result<[u8; 32]> {
    let floor = d.floor().normalize();
    let floor_int: i128 = if floor.scale() == 0 {
        floor.mantissa()
    } else {
        floor.mantissa() / 10i128.pow(floor.scale())
    };

    let frac = (d - d.floor()).normalize();
    if frac.scale() > 28 {
        return Err(GaldrError::InvalidArgument(
            "decimal scale exceeds 28 digits".into(),
        ));
    }
    let scaled: i128 = frac.mantissa() * 10i128.pow(28 - frac.scale());

    let mut out = [0u8; 32];
    out[..16].copy_from_slice(&flip_i128(floor_int));
    out[16..].copy_from_slice(&(scaled as u128).to_be_bytes());
    Ok(out)
}

/// Escape embedded zero bytes (0x00 -> 0x00 0xFF) and terminate with
/// 0x00 0x00, keeping byte strings self-delimiting and order-preserving.
fn push_escaped(bytes: &[u8], out: &mut Vec<u8>) {
    for &b in bytes {
        out.push(b);
        if b == 0 {
            out.push(0xFF);
        }
    }
    out.push(0x00);
    out.push(0x00);
}

/// Encode one typed value into its order-preserving byte form.
pub fn encode_value(value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(16);
    match value {
        Value::Null => out.push(TAG_NULL),
        Value::Boolean(v) => {
            out.push(TAG_BOOL);
            out.push(if *v { 0x01 } else { 0x00 });
        }
        Value::Int32(v) => {
            out.push(TAG_INT);
            out.extend_from_slice(&flip_i64(*v as i64));
        }
        Value::Int64(v) => {
            out.push(TAG_INT);
            out.extend_from_slice(&flip_i64(*v));
        }
        Value::UInt32(v) => {
            // Unsigned: plain big-endian, no sign bit to flip.
            out.push(TAG_UINT);
            out.extend_from_slice(&(*v as u64).to_be_bytes());
        }
        Value::UInt64(v) => {
            out.push(TAG_UINT);
            out.extend_from_slice(&v.to_be_bytes());
        }
        Value::Double(v) => {
            out.push(TAG_DOUBLE);
            out.extend_from_slice(&double_bits(*v));
        }
        Value::Decimal(v) => {
            out.push(TAG_DECIMAL);
            out.extend_from_slice(&decimal_bytes(*v)?);
        }
        Value::String(v) => {
            if v.as_bytes().contains(&0) {
                return Err(GaldrError::InvalidArgument(
                    "indexed strings may not contain NUL".into(),
                ));
            }
            out.push(TAG_STRING);
            out.extend_from_slice(v.as_bytes());
            out.push(0x00);
        }
        Value::Guid(v) => {
            out.push(TAG_GUID);
            out.extend_from_slice(v.as_bytes());
        }
        Value::DateTime(v) => {
            out.push(TAG_DATETIME);
            out.extend_from_slice(&flip_i64(*v));
        }
        Value::DateOnly(v) => {
            out.push(TAG_DATEONLY);
            out.extend_from_slice(&flip_i64(*v));
        }
        Value::TimeOnly(v) => {
            out.push(TAG_TIMEONLY);
            out.extend_from_slice(&flip_i64(*v));
        }
        Value::TimeSpan(v) => {
            out.push(TAG_TIMESPAN);
            out.extend_from_slice(&flip_i64(*v));
        }
        Value::DateTimeOffset { ticks, offset_minutes } => {
            out.push(TAG_DTOFFSET);
            out.extend_from_slice(&flip_i64(*ticks));
            out.extend_from_slice(&flip_i16(*offset_minutes));
        }
        Value::Bytes(v) => {
            out.push(TAG_BYTES);
            push_escaped(v, &mut out);
        }
    }
    if out.len() > MAX_KEY_LEN {
        return Err(GaldrError::InvalidArgument(format!(
            "encoded key length {} exceeds maximum {}",
            out.len(),
            MAX_KEY_LEN
        )));
    }
    Ok(out)
}

/// Compound key: concatenation in declaration order. Each component is
/// self-delimiting, so concatenation preserves tuple ordering.
pub fn encode_compound(values: &[Value]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for value in values {
        out.extend_from_slice(&encode_value(value)?);
    }
    if out.len() > MAX_KEY_LEN {
        return Err(GaldrError::InvalidArgument(format!(
            "encoded compound key length {} exceeds maximum {}",
            out.len(),
            MAX_KEY_LEN
        )));
    }
    Ok(out)
}

/// Encoded prefix for a `StartsWith` probe on a string field: the tag and
/// the prefix bytes without the terminator, so every string starting with
/// the prefix sorts inside `[key, prefix_end(key))`.
pub fn encode_string_prefix(prefix: &str) -> Result<Vec<u8>> {
    if prefix.as_bytes().contains(&0) {
        return Err(GaldrError::InvalidArgument(
            "prefix may not contain NUL".into(),
        ));
    }
    let mut out = Vec::with_capacity(1 + prefix.len());
    out.push(TAG_STRING);
    out.extend_from_slice(prefix.as_bytes());
    Ok(out)
}

/// Smallest byte string strictly greater than every string starting with
/// `prefix`: increment the last non-0xFF byte and truncate. Returns None
/// (no upper bound) for an empty or all-0xFF prefix.
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    while let Some(&last) = out.last() {
        if last == 0xFF {
            out.pop();
        } else {
            *out.last_mut().unwrap() = last + 1;
            return Some(out);
        }
    }
    None
}
