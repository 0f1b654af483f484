// Record header layout and bounds validation for the append-only data region.
use crate::core::error::{Error, ErrorKind};

pub const RECORD_MAGIC: [u8; 4] = *b"REC1";
pub const RECORD_HEADER_LEN: usize = 32;
pub const MAX_KEY_LEN: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RecordHeader {
    pub key_len: u32,
    pub key_len_xor: u32,
    pub flags: u32,
    pub value_len: u64,
    /// Offset of the previous record in the same bucket chain, 0 at the tail.
    pub next: u64,
}

impl RecordHeader {
    pub fn new(key_len: u32, value_len: u64, next: u64) -> Self {
        Self {
            key_len,
            key_len_xor: key_len ^ 0xFFFF_FFFF,
            flags: 0,
            value_len,
            next,
        }
    }

    pub fn encode(&self) -> [u8; RECORD_HEADER_LEN] {
        let mut buf = [0u8; RECORD_HEADER_LEN];
        buf[0..4].copy_from_slice(&RECORD_MAGIC);
        write_u32(&mut buf, 4, self.key_len);
        write_u32(&mut buf, 8, self.key_len_xor);
        write_u32(&mut buf, 12, self.flags);
        write_u64(&mut buf, 16, self.value_len);
        write_u64(&mut buf, 24, self.next);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < RECORD_HEADER_LEN {
            return Err(Error::new(ErrorKind::Corrupt).with_message("record header too small"));
        }
        if buf[0..4] != RECORD_MAGIC {
            return Err(Error::new(ErrorKind::Corrupt).with_message("bad record magic"));
        }
        Ok(Self {
            key_len: read_u32(buf, 4),
            key_len_xor: read_u32(buf, 8),
            flags: read_u32(buf, 12),
            value_len: read_u64(buf, 16),
            next: read_u64(buf, 24),
        })
    }

    /// Checks that a record read at `offset` fits inside `[data_start, data_end)`.
    pub fn validate(&self, offset: u64, data_start: u64, data_end: u64) -> Result<(), Error> {
        if self.key_len ^ self.key_len_xor != 0xFFFF_FFFF {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("key length xor mismatch")
                .with_offset(offset));
        }
        if self.key_len == 0 || self.key_len as usize > MAX_KEY_LEN {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("key length out of range")
                .with_offset(offset));
        }
        let end = offset
            .checked_add(self.total_len())
            .ok_or_else(|| Error::new(ErrorKind::Corrupt).with_message("record length overflow"))?;
        if end > data_end {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("record extends past end of data")
                .with_offset(offset));
        }
        if self.next != 0 && (self.next < data_start || self.next >= offset) {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("chain link points outside older records")
                .with_offset(offset));
        }
        Ok(())
    }

    pub fn total_len(&self) -> u64 {
        record_total_len(self.key_len as usize, self.value_len)
    }
}

pub fn record_total_len(key_len: usize, value_len: u64) -> u64 {
    RECORD_HEADER_LEN as u64 + key_len as u64 + value_len
}

pub fn validate_key(key: &[u8]) -> Result<(), Error> {
    if key.is_empty() {
        return Err(Error::new(ErrorKind::Usage).with_message("record key must not be empty"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("record key exceeds {MAX_KEY_LEN} bytes")));
    }
    Ok(())
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(out)
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(out)
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}
