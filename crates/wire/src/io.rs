//! Byte-level put/get helpers.
//!
//! All integers are little-endian. Readers take `&mut &[u8]` and advance the
//! slice; every read is bounds-checked so malformed input surfaces as a
//! [`WireError`] instead of a panic or over-allocation.

use crate::error::WireError;

/// Something that has a canonical wire encoding.
pub trait WireEncode {
    fn encode(&self, out: &mut Vec<u8>);

    /// Encode into a fresh buffer.
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }
}

/// Something that can be decoded from its canonical wire encoding.
pub trait WireDecode: Sized {
    fn decode(input: &mut &[u8]) -> Result<Self, WireError>;

    /// Decode a complete buffer, rejecting trailing bytes.
    fn from_bytes(mut input: &[u8]) -> Result<Self, WireError> {
        let value = Self::decode(&mut input)?;
        if !input.is_empty() {
            return Err(WireError::TrailingBytes(input.len()));
        }
        Ok(value)
    }
}

pub fn put_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

pub fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_i8(out: &mut Vec<u8>, v: i8) {
    out.push(v as u8);
}

pub fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes);
}

pub fn get_u8(input: &mut &[u8]) -> Result<u8, WireError> {
    let b = get_bytes(input, 1)?;
    Ok(b[0])
}

pub fn get_u16(input: &mut &[u8]) -> Result<u16, WireError> {
    let b = get_bytes(input, 2)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

pub fn get_u32(input: &mut &[u8]) -> Result<u32, WireError> {
    let b = get_bytes(input, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

pub fn get_u64(input: &mut &[u8]) -> Result<u64, WireError> {
    let b = get_bytes(input, 8)?;
    let mut arr = [0u8; 8];
    arr.copy_from_slice(b);
    Ok(u64::from_le_bytes(arr))
}

pub fn get_i8(input: &mut &[u8]) -> Result<i8, WireError> {
    Ok(get_u8(input)? as i8)
}

/// Take exactly `len` bytes from the front of `input`.
pub fn get_bytes<'a>(input: &mut &'a [u8], len: usize) -> Result<&'a [u8], WireError> {
    if input.len() < len {
        return Err(WireError::Truncated {
            needed: len - input.len(),
        });
    }
    let (head, tail) = input.split_at(len);
    *input = tail;
    Ok(head)
}

/// Read a `u32` element count and sanity-check it against the bytes that
/// remain, given a minimum encoded size per element. Rejects counts that
/// could not possibly fit, so a bogus length field cannot drive a huge
/// allocation.
pub fn get_count(input: &mut &[u8], min_elem_size: usize) -> Result<usize, WireError> {
    let count = get_u32(input)? as usize;
    if count.saturating_mul(min_elem_size) > input.len() {
        return Err(WireError::InvalidValue("element count exceeds input"));
    }
    Ok(count)
}
