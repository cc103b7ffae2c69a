//! Little-endian byte-slice codec helpers.
//!
//! The on-disk layout (spec §6) is little-endian throughout. These mirror
//! the teacher's `storage::btree::encoding` helpers but read/write LE and
//! return `Result` with `ErrorCode::IntegrityViolated` on short buffers,
//! since every caller here is decoding untrusted device content.

use crate::error::{Error, ErrorCode, Result};

pub fn read_u16(data: &[u8], offset: usize) -> Result<u16> {
    let bytes = data
        .get(offset..offset + 2)
        .ok_or(Error::new(ErrorCode::IntegrityViolated))?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

pub fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    let bytes = data
        .get(offset..offset + 4)
        .ok_or(Error::new(ErrorCode::IntegrityViolated))?;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

pub fn read_u64(data: &[u8], offset: usize) -> Result<u64> {
    let bytes = data
        .get(offset..offset + 8)
        .ok_or(Error::new(ErrorCode::IntegrityViolated))?;
    Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
}

pub fn write_u16(data: &mut [u8], offset: usize, value: u16) -> Result<()> {
    let slot = data
        .get_mut(offset..offset + 2)
        .ok_or(Error::new(ErrorCode::IntegrityViolated))?;
    slot.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub fn write_u32(data: &mut [u8], offset: usize, value: u32) -> Result<()> {
    let slot = data
        .get_mut(offset..offset + 4)
        .ok_or(Error::new(ErrorCode::IntegrityViolated))?;
    slot.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub fn write_u64(data: &mut [u8], offset: usize, value: u64) -> Result<()> {
    let slot = data
        .get_mut(offset..offset + 8)
        .ok_or(Error::new(ErrorCode::IntegrityViolated))?;
    slot.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let mut buf = [0u8; 16];
        write_u16(&mut buf, 0, 0xabcd).unwrap();
        write_u32(&mut buf, 2, 0x1122_3344).unwrap();
        write_u64(&mut buf, 8, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(read_u16(&buf, 0).unwrap(), 0xabcd);
        assert_eq!(read_u32(&buf, 2).unwrap(), 0x1122_3344);
        assert_eq!(read_u64(&buf, 8).unwrap(), 0x1122_3344_5566_7788);
    }

    #[test]
    fn short_buffer_errors() {
        let buf = [0u8; 2];
        assert!(read_u32(&buf, 0).is_err());
    }
}
