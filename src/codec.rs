// Command and reply streams
//
// Integers travel as variable-length "encoded uints":
//   0xxxxxxx                     -> 0..=127
//   10xxxxxx yyyyyyyy            -> 128 + (x | y << 6)
//   110xxxxx yyyyyyyy zzzzzzzz   -> 16512 + (x | y << 5 | z << 13)
// Small values (most sensor readings) cost a single byte.

use core::fmt;

const ONE_BYTE_MAX: u32 = 0x80;
const TWO_BYTE_BASE: u32 = ONE_BYTE_MAX;
const THREE_BYTE_BASE: u32 = TWO_BYTE_BASE + (1 << 14);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// Input ended in the middle of a value
    UnexpectedEnd,
    /// Prefix bits do not form a valid encoding, or the value overflows u16
    Malformed,
    /// No room left in the reply buffer
    BufferFull,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::UnexpectedEnd => write!(f, "unexpected end of command"),
            CodecError::Malformed => write!(f, "malformed encoded integer"),
            CodecError::BufferFull => write!(f, "reply buffer full"),
        }
    }
}

/// Read cursor over a caller-owned command buffer.
pub struct CommandReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> CommandReader<'a> {
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Continue reading a buffer from `pos` (e.g. after a suspension).
    pub fn at(buf: &'a [u8], pos: usize) -> Self {
        Self {
            buf,
            pos: pos.min(buf.len()),
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        let b = *self.buf.get(self.pos).ok_or(CodecError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(b)
    }

    // Cursor is left untouched on error so a caller can report position.
    pub fn read_encoded_u16(&mut self) -> Result<u16, CodecError> {
        let start = self.pos;
        let result = self.decode_u16();
        if result.is_err() {
            self.pos = start;
        }
        result
    }

    fn decode_u16(&mut self) -> Result<u16, CodecError> {
        let b0 = self.read_u8()? as u32;
        let value = if b0 & 0x80 == 0 {
            b0
        } else if b0 & 0xC0 == 0x80 {
            let b1 = self.read_u8()? as u32;
            TWO_BYTE_BASE + ((b0 & 0x3F) | (b1 << 6))
        } else if b0 & 0xE0 == 0xC0 {
            let b1 = self.read_u8()? as u32;
            let b2 = self.read_u8()? as u32;
            THREE_BYTE_BASE + ((b0 & 0x1F) | (b1 << 5) | (b2 << 13))
        } else {
            return Err(CodecError::Malformed);
        };

        u16::try_from(value).map_err(|_| CodecError::Malformed)
    }
}

/// Write cursor over a caller-owned reply buffer.
pub struct ReplyWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl<'a> ReplyWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, len: 0 }
    }

    /// Resume writing after `len` bytes already in `buf`.
    pub fn with_len(buf: &'a mut [u8], len: usize) -> Self {
        let len = len.min(buf.len());
        Self { buf, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn written(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn write_u8(&mut self, b: u8) -> Result<(), CodecError> {
        let slot = self.buf.get_mut(self.len).ok_or(CodecError::BufferFull)?;
        *slot = b;
        self.len += 1;
        Ok(())
    }

    // All-or-nothing: a value that does not fit leaves the buffer as it was.
    pub fn write_encoded_u16(&mut self, value: u16) -> Result<(), CodecError> {
        let mut tmp = [0u8; 3];
        let n = encode_u16(value, &mut tmp);
        if self.buf.len() - self.len < n {
            return Err(CodecError::BufferFull);
        }
        self.buf[self.len..self.len + n].copy_from_slice(&tmp[..n]);
        self.len += n;
        Ok(())
    }
}

/// Encode `value` into `out`, returning the number of bytes used (1..=3).
pub fn encode_u16(value: u16, out: &mut [u8; 3]) -> usize {
    let v = value as u32;
    if v < ONE_BYTE_MAX {
        out[0] = v as u8;
        1
    } else if v < THREE_BYTE_BASE {
        let r = v - TWO_BYTE_BASE;
        out[0] = 0x80 | (r & 0x3F) as u8;
        out[1] = (r >> 6) as u8;
        2
    } else {
        let r = v - THREE_BYTE_BASE;
        out[0] = 0xC0 | (r & 0x1F) as u8;
        out[1] = (r >> 5) as u8;
        out[2] = (r >> 13) as u8;
        3
    }
}
