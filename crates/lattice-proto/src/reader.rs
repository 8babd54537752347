//! Primitive-level message decoding
//!
//! A `MessageReader` is a cursor over the assembled chunk chain of one
//! inbound message. Chunk boundaries are invisible to callers: a read
//! that spans two chunks advances transparently. Every decode failure is
//! fatal for the message (fail-fast), never silently recovered.

use crate::chunk::PooledChunk;
use crate::error::WireError;
use crate::types::{DateTime, Decimal, Guid, TimeSpan};
use crate::writer::{LEN_TAG_BIAS, LEN_TAG_EXTENDED, LEN_TAG_NULL};

/// Chunk-chained primitive reader for one inbound message.
pub struct MessageReader {
    chunks: Vec<PooledChunk>,
    message_id: u64,
    chunk_idx: usize,
    offset: usize,
}

impl MessageReader {
    /// Wrap an ordered, fully assembled chunk chain.
    pub fn new(chunks: Vec<PooledChunk>) -> Result<MessageReader, WireError> {
        let first = chunks
            .first()
            .ok_or(WireError::CorruptMessage("message with no chunks"))?;
        let header = first.header()?;
        if !header.is_first {
            return Err(WireError::CorruptMessage("chain does not start with a first chunk"));
        }
        let message_id = header.message_id;
        Ok(MessageReader {
            chunks,
            message_id,
            chunk_idx: 0,
            offset: 0,
        })
    }

    /// Id shared by every chunk of this message.
    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    /// Total unread payload bytes.
    pub fn remaining(&self) -> usize {
        let mut total = 0;
        for (i, chunk) in self.chunks.iter().enumerate().skip(self.chunk_idx) {
            let payload = chunk.payload().len();
            if i == self.chunk_idx {
                total += payload.saturating_sub(self.offset);
            } else {
                total += payload;
            }
        }
        total
    }

    /// True once every payload byte has been consumed.
    pub fn at_end(&self) -> bool {
        self.remaining() == 0
    }

    /// Copy exactly `out.len()` bytes, advancing across chunk boundaries.
    pub fn read_bytes(&mut self, out: &mut [u8]) -> Result<(), WireError> {
        let mut written = 0;
        while written < out.len() {
            let Some(chunk) = self.chunks.get(self.chunk_idx) else {
                return Err(WireError::UnexpectedEndOfMessage);
            };
            let payload = chunk.payload();
            if self.offset >= payload.len() {
                self.chunk_idx += 1;
                self.offset = 0;
                continue;
            }
            let take = (payload.len() - self.offset).min(out.len() - written);
            out[written..written + take].copy_from_slice(&payload[self.offset..self.offset + take]);
            self.offset += take;
            written += take;
        }
        Ok(())
    }

    // --- Primitives ---

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        let mut buf = [0u8; 1];
        self.read_bytes(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, WireError> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(WireError::InvalidTag { what: "bool", tag }),
        }
    }

    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        let mut buf = [0u8; 2];
        self.read_bytes(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_i16(&mut self) -> Result<i16, WireError> {
        Ok(self.read_u16()? as i16)
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        let mut buf = [0u8; 4];
        self.read_bytes(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        let mut buf = [0u8; 8];
        self.read_bytes(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_i64(&mut self) -> Result<i64, WireError> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_f32(&mut self) -> Result<f32, WireError> {
        Ok(f32::from_le_bytes(self.read_u32()?.to_le_bytes()))
    }

    pub fn read_f64(&mut self) -> Result<f64, WireError> {
        Ok(f64::from_le_bytes(self.read_u64()?.to_le_bytes()))
    }

    pub fn read_decimal(&mut self) -> Result<Decimal, WireError> {
        let mut buf = [0u8; 16];
        self.read_bytes(&mut buf)?;
        Ok(Decimal::from_le_bytes(buf))
    }

    pub fn read_datetime(&mut self) -> Result<DateTime, WireError> {
        Ok(DateTime::from_ticks(self.read_i64()?))
    }

    pub fn read_timespan(&mut self) -> Result<TimeSpan, WireError> {
        Ok(TimeSpan::from_ticks(self.read_i64()?))
    }

    pub fn read_guid(&mut self) -> Result<Guid, WireError> {
        let mut buf = [0u8; 16];
        self.read_bytes(&mut buf)?;
        Ok(Guid::from_bytes(buf))
    }

    /// Short-form length prefix shared by strings and arrays; `None`
    /// means null.
    pub fn read_len_tag(&mut self) -> Result<Option<usize>, WireError> {
        match self.read_u8()? {
            LEN_TAG_NULL => Ok(None),
            LEN_TAG_EXTENDED => {
                let len = self.read_u32()? as usize;
                Ok(Some(len))
            }
            tag => Ok(Some(tag as usize - LEN_TAG_BIAS)),
        }
    }

    /// Length-prefixed UTF-16 string; `None` means null.
    pub fn read_string(&mut self) -> Result<Option<String>, WireError> {
        let Some(units) = self.read_len_tag()? else {
            return Ok(None);
        };
        if units > self.remaining() / 2 {
            // Length-prefix mismatch: fail before allocating.
            return Err(WireError::UnexpectedEndOfMessage);
        }
        let mut buf = Vec::with_capacity(units);
        for _ in 0..units {
            buf.push(self.read_u16()?);
        }
        let decoded: Result<String, _> = char::decode_utf16(buf.into_iter())
            .map(|r| r.map_err(|_| WireError::InvalidUtf16))
            .collect();
        decoded.map(Some)
    }
}
