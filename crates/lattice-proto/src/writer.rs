//! Primitive-level message encoding
//!
//! A `MessageWriter` is a cursor over a growing chain of pooled chunks.
//! Writes never straddle chunk boundaries from the caller's point of
//! view: when the current chunk fills, it is finalized and a fresh one is
//! acquired from the pool (blocking while the pool is exhausted, which is
//! how chunk backpressure reaches serializers).

use std::sync::Arc;

use crate::chunk::{ChunkPool, PooledChunk, CHUNK_HEADER_SIZE};
use crate::types::{DateTime, Decimal, Guid, TimeSpan};

/// Short-form length tag: `0` = null, `1` = extended (`u32` follows),
/// `2..=255` = inline length `tag - 2`.
pub const LEN_TAG_NULL: u8 = 0;
pub const LEN_TAG_EXTENDED: u8 = 1;
pub const LEN_TAG_BIAS: usize = 2;
pub const LEN_INLINE_MAX: usize = 253;

/// Chunk-chained primitive writer for one outbound message.
pub struct MessageWriter {
    pool: Arc<ChunkPool>,
    message_id: u64,
    completed: Vec<PooledChunk>,
    current: Option<PooledChunk>,
}

impl MessageWriter {
    /// Start a message. Acquires the first chunk immediately.
    pub fn new(pool: Arc<ChunkPool>, message_id: u64) -> MessageWriter {
        let mut current = pool.acquire_blocking();
        current.buf_mut().resize(CHUNK_HEADER_SIZE, 0);
        MessageWriter {
            pool,
            message_id,
            completed: Vec::new(),
            current: Some(current),
        }
    }

    /// Id stamped on every chunk of this message.
    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    fn current(&mut self) -> &mut PooledChunk {
        self.current.as_mut().expect("writer already finished")
    }

    /// Finalize the current chunk as non-last and start the next one.
    fn roll_over(&mut self) {
        let is_first = self.completed.is_empty();
        let mut next = self.pool.acquire_blocking();
        next.buf_mut().resize(CHUNK_HEADER_SIZE, 0);
        let mut finished = self.current.replace(next).expect("writer already finished");
        finished.finalize(self.message_id, is_first, false);
        self.completed.push(finished);
    }

    /// Append raw bytes, splitting across chunks as needed.
    pub fn write_bytes(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let space = self.current().payload_space();
            if space == 0 {
                self.roll_over();
                continue;
            }
            let take = space.min(data.len());
            self.current().buf_mut().extend_from_slice(&data[..take]);
            data = &data[take..];
        }
    }

    /// Finalize the message and hand back the chunk chain, last chunk
    /// flagged.
    pub fn finish(mut self) -> Vec<PooledChunk> {
        let is_first = self.completed.is_empty();
        let mut last = self.current.take().expect("writer already finished");
        last.finalize(self.message_id, is_first, true);
        let mut chunks = std::mem::take(&mut self.completed);
        chunks.push(last);
        chunks
    }

    // --- Primitives ---

    pub fn write_bool(&mut self, v: bool) {
        self.write_u8(v as u8);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.write_bytes(&[v]);
    }

    pub fn write_i8(&mut self, v: i8) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_u16(&mut self, v: u16) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_i16(&mut self, v: i16) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_f32(&mut self, v: f32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_decimal(&mut self, v: Decimal) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_datetime(&mut self, v: DateTime) {
        self.write_i64(v.ticks());
    }

    pub fn write_timespan(&mut self, v: TimeSpan) {
        self.write_i64(v.ticks());
    }

    pub fn write_guid(&mut self, v: Guid) {
        self.write_bytes(v.as_bytes());
    }

    /// Short-form length prefix shared by strings and arrays.
    pub fn write_len_tag(&mut self, len: Option<usize>) {
        match len {
            None => self.write_u8(LEN_TAG_NULL),
            Some(len) if len <= LEN_INLINE_MAX => self.write_u8((len + LEN_TAG_BIAS) as u8),
            Some(len) => {
                self.write_u8(LEN_TAG_EXTENDED);
                self.write_u32(len as u32);
            }
        }
    }

    /// Length-prefixed UTF-16 string; `None` encodes null. The length
    /// counts UTF-16 code units.
    pub fn write_string(&mut self, v: Option<&str>) {
        match v {
            None => self.write_len_tag(None),
            Some(s) => {
                let units: Vec<u16> = s.encode_utf16().collect();
                self.write_len_tag(Some(units.len()));
                for unit in units {
                    self.write_u16(unit);
                }
            }
        }
    }
}
