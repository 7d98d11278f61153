pub mod dex_file;
pub(crate) mod leb;
pub mod opcode_format;
pub mod writer;

use crate::dex::leb::decode_uleb128;
use crate::error::{fail_format, VdexError, VdexResult};

// Basic little-endian type reading and writing, shared by the dex and vdex
// parsers. All reads are bounds-checked and fail with a format error rather
// than panicking on truncated input.

pub(crate) fn read_u1(bytes: &[u8], ix: &mut usize) -> VdexResult<u8> {
    if bytes.len() < *ix + 1 {
        fail_format!("unexpected end of stream reading u1 at index {}", *ix);
    }
    let result = bytes[*ix];
    *ix += 1;
    Ok(result)
}

pub(crate) fn read_u2(bytes: &[u8], ix: &mut usize) -> VdexResult<u16> {
    if bytes.len() < *ix + 2 {
        fail_format!("unexpected end of stream reading u2 at index {}", *ix);
    }
    let result = ((bytes[*ix + 1] as u16) << 8) | (bytes[*ix] as u16);
    *ix += 2;
    Ok(result)
}

pub(crate) fn read_u4(bytes: &[u8], ix: &mut usize) -> VdexResult<u32> {
    if bytes.len() < *ix + 4 {
        fail_format!("unexpected end of stream reading u4 at index {}", *ix);
    }
    let result = ((bytes[*ix + 3] as u32) << 24)
        | ((bytes[*ix + 2] as u32) << 16)
        | ((bytes[*ix + 1] as u32) << 8)
        | (bytes[*ix] as u32);
    *ix += 4;
    Ok(result)
}

pub(crate) fn read_uleb128(bytes: &[u8], ix: &mut usize) -> VdexResult<u32> {
    if *ix >= bytes.len() {
        fail_format!("unexpected end of stream reading uleb128 at index {}", *ix);
    }
    let (val, size) = decode_uleb128(&bytes[*ix..]);
    *ix += size;
    Ok(val)
}

pub(crate) fn read_x(bytes: &[u8], ix: &mut usize, length: usize) -> VdexResult<Vec<u8>> {
    if bytes.len() >= *ix && bytes.len() - *ix >= length {
        let mut v = Vec::with_capacity(length);
        v.extend_from_slice(&bytes[*ix..*ix + length]);
        *ix += length;
        Ok(v)
    } else {
        Err(VdexError::Format(format!(
            "buffer too short for {length} byte array read at index {}",
            *ix
        )))
    }
}

pub(crate) fn write_u1(buffer: &mut Vec<u8>, val: u8) -> usize {
    buffer.push(val);
    1
}

pub(crate) fn write_u2(buffer: &mut Vec<u8>, val: u16) -> usize {
    buffer.push(val as u8);
    buffer.push((val >> 8) as u8);
    2
}

pub(crate) fn write_u4(buffer: &mut Vec<u8>, val: u32) -> usize {
    for i in 0..4 {
        buffer.push((val >> (i * 8)) as u8);
    }
    4
}

pub(crate) fn write_uleb128(buffer: &mut Vec<u8>, val: u32) -> usize {
    let encoded = leb::encode_uleb128(val);
    let c = encoded.len();
    buffer.extend(encoded);
    c
}

pub(crate) fn write_x(buffer: &mut Vec<u8>, val: &[u8]) -> usize {
    let len = val.len();
    buffer.extend(val);
    len
}
