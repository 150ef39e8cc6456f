//! Forward-only reader over a borrowed byte buffer, plus the Bitcoin
//! compact-size integer codec used throughout the wire format.

use crate::errors::Error;

#[derive(Clone, Copy)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.remaining() < n {
            return Err(Error::MalformedRequest);
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.buf[start..start + n])
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32_le(&mut self) -> Result<u32, Error> {
        let s = self.take(4)?;
        Ok(u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Reads a Bitcoin compact-size integer (1, 3, 5 or 9 bytes).
    pub fn read_varint(&mut self) -> Result<u64, Error> {
        match self.read_u8()? {
            n @ 0x00..=0xfc => Ok(n as u64),
            0xfd => {
                let s = self.take(2)?;
                Ok(u16::from_le_bytes([s[0], s[1]]) as u64)
            }
            0xfe => Ok(self.read_u32_le()? as u64),
            0xff => {
                let s = self.take(8)?;
                Ok(u64::from_le_bytes([
                    s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7],
                ]))
            }
        }
    }
}

/// Encodes `value` as a compact-size integer into `out`, returning the
/// encoded length.
pub fn encode_compact_size(value: u64, out: &mut [u8; 9]) -> usize {
    if value <= 0xfc {
        out[0] = value as u8;
        1
    } else if value <= 0xffff {
        out[0] = 0xfd;
        out[1..3].copy_from_slice(&(value as u16).to_le_bytes());
        3
    } else if value <= 0xffff_ffff {
        out[0] = 0xfe;
        out[1..5].copy_from_slice(&(value as u32).to_le_bytes());
        5
    } else {
        out[0] = 0xff;
        out[1..9].copy_from_slice(&value.to_le_bytes());
        9
    }
}
