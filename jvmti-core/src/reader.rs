// Helper functions for reading wire data types from buffers

use crate::types::Location;
use crate::wire::DecodeError;
use bytes::Buf;

/// Read a u8
pub fn read_u8(buf: &mut &[u8]) -> Result<u8, DecodeError> {
    if buf.remaining() < 1 {
        return Err(DecodeError::Truncated("u8"));
    }
    Ok(buf.get_u8())
}

pub fn read_bool(buf: &mut &[u8]) -> Result<bool, DecodeError> {
    match read_u8(buf)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(DecodeError::Malformed(format!("invalid boolean {}", other))),
    }
}

/// Read a u32
pub fn read_u32(buf: &mut &[u8]) -> Result<u32, DecodeError> {
    if buf.remaining() < 4 {
        return Err(DecodeError::Truncated("u32"));
    }
    Ok(buf.get_u32())
}

/// Read a i32
pub fn read_i32(buf: &mut &[u8]) -> Result<i32, DecodeError> {
    if buf.remaining() < 4 {
        return Err(DecodeError::Truncated("i32"));
    }
    Ok(buf.get_i32())
}

/// Read a u64
pub fn read_u64(buf: &mut &[u8]) -> Result<u64, DecodeError> {
    if buf.remaining() < 8 {
        return Err(DecodeError::Truncated("u64"));
    }
    Ok(buf.get_u64())
}

/// Method ID widened to u64, then the code index as u64
pub fn read_location(buf: &mut &[u8]) -> Result<Location, DecodeError> {
    let method = read_u64(buf)?;
    let index = read_u64(buf)?;

    let method = u32::try_from(method)
        .map_err(|_| DecodeError::Malformed(format!("method id {:#x} out of range", method)))?;
    let index = u32::try_from(index)
        .map_err(|_| DecodeError::Malformed(format!("code index {} out of range", index)))?;
    Ok(Location::new(method, index))
}
