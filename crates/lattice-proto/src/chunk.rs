//! Pooled chunk framing
//!
//! A chunk is the framing unit of the byte stream: a fixed-maximum buffer
//! with a 16-byte header. A logical message is the ordered concatenation
//! of one or more chunks sharing a message id; chunks of different
//! messages may interleave on a connection. Chunks are pooled: the pool
//! caps total allocation, exhaustion applies backpressure, and a dropped
//! guard returns its buffer to the free list.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

use crate::error::WireError;

/// Size of the fixed chunk header in bytes.
pub const CHUNK_HEADER_SIZE: usize = 16;

/// Smallest usable chunk: header plus a little payload.
pub const MIN_CHUNK_SIZE: usize = 32;

/// Default chunk size (16 KB).
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Default number of chunks in the pool.
pub const DEFAULT_CHUNK_POOL_SIZE: usize = 256;

/// Message id reserved for connection keep-alive probes. Real request ids
/// start at 1.
pub const KEEP_ALIVE_MESSAGE_ID: u64 = 0;

const FLAG_FIRST: u8 = 0b0000_0001;
const FLAG_LAST: u8 = 0b0000_0010;
const FLAG_KNOWN_MASK: u8 = FLAG_FIRST | FLAG_LAST;

/// Parsed chunk header.
///
/// Wire layout, little-endian:
/// `u32 size | u8 flags | u8 reserved | u16 reserved | u64 messageId`.
/// `size` counts the whole chunk including this header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
    pub size: u32,
    pub is_first: bool,
    pub is_last: bool,
    pub message_id: u64,
}

impl ChunkHeader {
    /// Encode into a 16-byte header image.
    pub fn encode(&self) -> [u8; CHUNK_HEADER_SIZE] {
        let mut out = [0u8; CHUNK_HEADER_SIZE];
        self.encode_into(&mut out);
        out
    }

    /// Encode into the first 16 bytes of `buf`.
    pub fn encode_into(&self, buf: &mut [u8]) {
        let mut flags = 0u8;
        if self.is_first {
            flags |= FLAG_FIRST;
        }
        if self.is_last {
            flags |= FLAG_LAST;
        }
        buf[0..4].copy_from_slice(&self.size.to_le_bytes());
        buf[4] = flags;
        buf[5] = 0;
        buf[6..8].copy_from_slice(&0u16.to_le_bytes());
        buf[8..16].copy_from_slice(&self.message_id.to_le_bytes());
    }

    /// Parse a header image, failing fast on malformed frames.
    pub fn decode(buf: &[u8; CHUNK_HEADER_SIZE]) -> Result<ChunkHeader, WireError> {
        let size = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let flags = buf[4];
        if flags & !FLAG_KNOWN_MASK != 0 {
            return Err(WireError::CorruptChunkHeader("unknown flag bits set"));
        }
        if (size as usize) < CHUNK_HEADER_SIZE {
            return Err(WireError::CorruptChunkHeader("size smaller than header"));
        }
        Ok(ChunkHeader {
            size,
            is_first: flags & FLAG_FIRST != 0,
            is_last: flags & FLAG_LAST != 0,
            message_id: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
        })
    }
}

/// A pool of reusable chunk buffers.
///
/// The pool maintains at most `max_chunks` buffers of `chunk_size` bytes.
/// When every buffer is in flight, `try_acquire` returns `None`; the
/// async and blocking acquire paths suspend instead, which is how chunk
/// backpressure reaches producers.
pub struct ChunkPool {
    free: Mutex<Vec<BytesMut>>,
    returned: Condvar,
    notify: Notify,
    chunk_size: usize,
    max_chunks: usize,
    allocated: AtomicUsize,
}

impl ChunkPool {
    /// Create a pool of `max_chunks` buffers of `chunk_size` bytes each.
    pub fn new(max_chunks: usize, chunk_size: usize) -> Result<Arc<ChunkPool>, WireError> {
        if chunk_size < MIN_CHUNK_SIZE {
            return Err(WireError::ChunkTooSmall {
                size: chunk_size,
                needed: MIN_CHUNK_SIZE,
            });
        }
        Ok(Arc::new(ChunkPool {
            free: Mutex::new(Vec::with_capacity(max_chunks)),
            returned: Condvar::new(),
            notify: Notify::new(),
            chunk_size,
            max_chunks: max_chunks.max(1),
            allocated: AtomicUsize::new(0),
        }))
    }

    /// Pool with default sizing.
    pub fn with_defaults() -> Arc<ChunkPool> {
        ChunkPool::new(DEFAULT_CHUNK_POOL_SIZE, DEFAULT_CHUNK_SIZE).expect("default sizes are valid")
    }

    /// Attempt to acquire a chunk without waiting.
    ///
    /// Returns `None` when the pool is exhausted.
    pub fn try_acquire(self: &Arc<Self>) -> Option<PooledChunk> {
        let mut free = self.free.lock();
        if let Some(buf) = free.pop() {
            return Some(PooledChunk::new(buf, Arc::clone(self)));
        }
        // Allocation count only grows under the lock, so no CAS retry loop
        // is needed here.
        if self.allocated.load(Ordering::Relaxed) < self.max_chunks {
            self.allocated.fetch_add(1, Ordering::Relaxed);
            let buf = BytesMut::with_capacity(self.chunk_size);
            return Some(PooledChunk::new(buf, Arc::clone(self)));
        }
        None
    }

    /// Acquire a chunk, suspending the task while the pool is exhausted.
    pub async fn acquire(self: &Arc<Self>) -> PooledChunk {
        loop {
            let notified = self.notify.notified();
            if let Some(chunk) = self.try_acquire() {
                return chunk;
            }
            notified.await;
        }
    }

    /// Acquire a chunk, blocking the calling thread while the pool is
    /// exhausted. Used by the synchronous serializer path.
    pub fn acquire_blocking(self: &Arc<Self>) -> PooledChunk {
        loop {
            if let Some(chunk) = self.try_acquire() {
                return chunk;
            }
            let mut free = self.free.lock();
            if free.is_empty() && self.allocated.load(Ordering::Relaxed) >= self.max_chunks {
                self.returned.wait(&mut free);
            }
        }
    }

    fn release(&self, mut buf: BytesMut) {
        buf.clear();
        let mut free = self.free.lock();
        free.push(buf);
        drop(free);
        self.returned.notify_one();
        self.notify.notify_waiters();
    }

    /// Size of each chunk buffer in bytes.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Maximum number of chunks this pool will allocate.
    pub fn max_chunks(&self) -> usize {
        self.max_chunks
    }

    /// Number of buffers allocated so far (free or in flight).
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Number of buffers currently on the free list.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Number of buffers currently in flight.
    pub fn in_use(&self) -> usize {
        self.allocated() - self.available()
    }
}

/// A chunk buffer acquired from a pool, returned on drop.
pub struct PooledChunk {
    buf: Option<BytesMut>,
    pool: Arc<ChunkPool>,
}

impl PooledChunk {
    fn new(buf: BytesMut, pool: Arc<ChunkPool>) -> PooledChunk {
        PooledChunk { buf: Some(buf), pool }
    }

    /// Full chunk bytes, header included.
    pub fn bytes(&self) -> &[u8] {
        self.buf.as_ref().map(|b| b.as_ref()).unwrap_or(&[])
    }

    /// Payload bytes, header excluded.
    pub fn payload(&self) -> &[u8] {
        let bytes = self.bytes();
        if bytes.len() > CHUNK_HEADER_SIZE {
            &bytes[CHUNK_HEADER_SIZE..]
        } else {
            &[]
        }
    }

    pub fn buf_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("chunk buffer already released")
    }

    /// Capacity left for payload bytes.
    pub fn payload_space(&self) -> usize {
        self.pool.chunk_size().saturating_sub(self.bytes().len())
    }

    /// Parse this chunk's header.
    pub fn header(&self) -> Result<ChunkHeader, WireError> {
        let bytes = self.bytes();
        if bytes.len() < CHUNK_HEADER_SIZE {
            return Err(WireError::CorruptChunkHeader("truncated header"));
        }
        ChunkHeader::decode(bytes[0..CHUNK_HEADER_SIZE].try_into().unwrap())
    }

    /// Stamp the header into the first 16 bytes and set the size field
    /// from the current length.
    pub fn finalize(&mut self, message_id: u64, is_first: bool, is_last: bool) {
        let len = self.bytes().len() as u32;
        let header = ChunkHeader {
            size: len,
            is_first,
            is_last,
            message_id,
        };
        let buf = self.buf_mut();
        debug_assert!(buf.len() >= CHUNK_HEADER_SIZE);
        header.encode_into(&mut buf[0..CHUNK_HEADER_SIZE]);
    }
}

impl std::fmt::Debug for PooledChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledChunk")
            .field("len", &self.bytes().len())
            .finish()
    }
}

impl Drop for PooledChunk {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

/// Build a stand-alone keep-alive probe chunk: first and last, empty
/// payload, reserved message id zero.
pub fn keep_alive_chunk(pool: &Arc<ChunkPool>) -> Option<PooledChunk> {
    let mut chunk = pool.try_acquire()?;
    chunk.buf_mut().resize(CHUNK_HEADER_SIZE, 0);
    chunk.finalize(KEEP_ALIVE_MESSAGE_ID, true, true);
    Some(chunk)
}
