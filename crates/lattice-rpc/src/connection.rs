//! Framed connection
//!
//! One full-duplex chunked transport over a single byte stream. A
//! connection owns three background tasks: a sender draining the bounded
//! outbound queue (chunk order within a message is preserved, chunks of
//! different messages may interleave), a receiver assembling inbound
//! chunks into messages, and a keep-alive timer that posts probe chunks
//! into the queue rather than touching the socket itself.
//!
//! Closing a connection fails every outstanding request with a
//! communication error; operation implementations already running are
//! not interrupted, their responses are simply dropped.

use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use lattice_proto::chunk::{keep_alive_chunk, CHUNK_HEADER_SIZE, KEEP_ALIVE_MESSAGE_ID};
use lattice_proto::{
    ChunkHeader, ChunkPool, MessageReader, MessageWriter, PooledChunk, TransportConfig, WireError,
};

use crate::clock::Clock;

/// Byte-stream seam: plain TCP in this crate, TLS wrappers plug in
/// externally.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for T {}

/// Connection lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Opening,
    Open,
    Closing,
    Closed,
}

/// Communication fault delivered to pending requests and callers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CommError {
    #[error("connection closed: {0}")]
    Closed(String),

    #[error("i/o failure: {0}")]
    Io(String),

    #[error("inactivity timeout")]
    InactivityTimeout,

    #[error("wire fault: {0}")]
    Wire(#[from] WireError),
}

/// Handler invoked for every assembled inbound message that is not a
/// response to a locally registered request.
pub type MessageHandler = Arc<dyn Fn(Arc<Connection>, u64, MessageReader) + Send + Sync>;

type PendingSender = oneshot::Sender<Result<MessageReader, CommError>>;

/// Completion of one outstanding request.
pub type ResponseFuture = oneshot::Receiver<Result<MessageReader, CommError>>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A live framed connection.
pub struct Connection {
    id: u64,
    peer: SocketAddr,
    state: Mutex<ConnectionState>,
    pool: Arc<ChunkPool>,
    config: TransportConfig,
    clock: Arc<dyn Clock>,
    outbound_tx: mpsc::Sender<PooledChunk>,
    pending: DashMap<u64, PendingSender>,
    next_request_id: AtomicU64,
    /// User-opaque slot; the host stamps the bound service here after a
    /// successful Connect.
    tag: RwLock<Option<Arc<dyn Any + Send + Sync>>>,
    last_send: Mutex<Instant>,
    last_recv: Mutex<Instant>,
    closed_tx: watch::Sender<bool>,
}

impl Connection {
    /// Wrap a byte stream and start the sender, receiver, and keep-alive
    /// tasks. The handler sees every inbound message with no matching
    /// pending request.
    pub fn spawn<T: Transport>(
        stream: T,
        peer: SocketAddr,
        pool: Arc<ChunkPool>,
        config: TransportConfig,
        clock: Arc<dyn Clock>,
        handler: MessageHandler,
    ) -> Arc<Connection> {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.max_queued_chunk_count);
        let (closed_tx, _) = watch::channel(false);
        let now = clock.now();

        let conn = Arc::new(Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            state: Mutex::new(ConnectionState::Opening),
            pool,
            config,
            clock,
            outbound_tx,
            pending: DashMap::new(),
            next_request_id: AtomicU64::new(1),
            tag: RwLock::new(None),
            last_send: Mutex::new(now),
            last_recv: Mutex::new(now),
            closed_tx,
        });

        let (read_half, write_half) = tokio::io::split(stream);
        tokio::spawn(Connection::sender_loop(Arc::clone(&conn), write_half, outbound_rx));
        tokio::spawn(Connection::receiver_loop(Arc::clone(&conn), read_half, handler));
        tokio::spawn(Connection::keep_alive_loop(Arc::clone(&conn)));
        conn
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn pool(&self) -> &Arc<ChunkPool> {
        &self.pool
    }

    /// The user-opaque tag slot.
    pub fn tag(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.tag.read().clone()
    }

    pub fn set_tag(&self, tag: Arc<dyn Any + Send + Sync>) {
        *self.tag.write() = Some(tag);
    }

    /// Mark the handshake complete.
    pub fn mark_open(&self) {
        let mut state = self.state.lock();
        if *state == ConnectionState::Opening {
            *state = ConnectionState::Open;
        }
    }

    fn is_send_allowed(&self) -> bool {
        matches!(self.state(), ConnectionState::Opening | ConnectionState::Open)
    }

    /// Allocate the next request id. Ids strictly increase for the
    /// lifetime of the connection; zero stays reserved for keep-alive.
    pub fn allocate_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Serialize and enqueue a request message, registering a pending
    /// completion. Blocks (asynchronously) when the outbound queue is at
    /// `max_queued_chunk_count`.
    pub async fn send_request(
        &self,
        serialize: impl FnOnce(&mut MessageWriter) -> Result<(), WireError>,
    ) -> Result<(u64, ResponseFuture), CommError> {
        let request_id = self.allocate_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);
        match self.send_message(request_id, serialize).await {
            Ok(()) => Ok((request_id, rx)),
            Err(e) => {
                self.pending.remove(&request_id);
                Err(e)
            }
        }
    }

    /// Serialize and enqueue a response for a request id the peer is
    /// waiting on.
    pub async fn send_response(
        &self,
        request_id: u64,
        serialize: impl FnOnce(&mut MessageWriter) -> Result<(), WireError>,
    ) -> Result<(), CommError> {
        self.send_message(request_id, serialize).await
    }

    async fn send_message(
        &self,
        request_id: u64,
        serialize: impl FnOnce(&mut MessageWriter) -> Result<(), WireError>,
    ) -> Result<(), CommError> {
        if !self.is_send_allowed() {
            return Err(CommError::Closed("connection is shut down".into()));
        }
        let mut writer = MessageWriter::new(Arc::clone(&self.pool), request_id);
        serialize(&mut writer)?;
        let chunks = writer.finish();
        for chunk in chunks {
            self.outbound_tx
                .send(chunk)
                .await
                .map_err(|_| CommError::Closed("sender task is gone".into()))?;
        }
        *self.last_send.lock() = self.clock.now();
        Ok(())
    }

    /// Close the connection and fail every outstanding request.
    pub fn close(&self, reason: CommError) {
        {
            let mut state = self.state.lock();
            if matches!(*state, ConnectionState::Closing | ConnectionState::Closed) {
                return;
            }
            *state = ConnectionState::Closing;
        }
        debug!(conn = self.id, %reason, "closing connection");
        self.fail_pending(&reason);
        let _ = self.closed_tx.send(true);
        *self.state.lock() = ConnectionState::Closed;
    }

    fn fail_pending(&self, reason: &CommError) {
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(reason.clone()));
            }
        }
    }

    /// Resolves when the connection reaches the closed state.
    pub async fn wait_closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state(), ConnectionState::Closing | ConnectionState::Closed)
    }

    // --- Background tasks ---

    async fn sender_loop<W: AsyncWrite + Send + Unpin>(
        conn: Arc<Connection>,
        mut write_half: W,
        mut outbound_rx: mpsc::Receiver<PooledChunk>,
    ) {
        let mut closed_rx = conn.closed_tx.subscribe();
        loop {
            let chunk = tokio::select! {
                chunk = outbound_rx.recv() => match chunk {
                    Some(chunk) => chunk,
                    None => break,
                },
                _ = closed_rx.changed() => break,
            };
            // The socket is never yielded mid-chunk: one write per
            // pre-assembled chunk, then the chunk returns to the pool.
            if let Err(e) = write_half.write_all(chunk.bytes()).await {
                conn.close(CommError::Io(e.to_string()));
                break;
            }
        }
        let _ = write_half.shutdown().await;
        trace!(conn = conn.id, "sender loop exited");
    }

    async fn receiver_loop<R: AsyncRead + Send + Unpin>(
        conn: Arc<Connection>,
        mut read_half: R,
        handler: MessageHandler,
    ) {
        // Partial messages under assembly, keyed by message id. Only
        // this task touches the map.
        let mut partial: HashMap<u64, Vec<PooledChunk>> = HashMap::new();
        let mut closed_rx = conn.closed_tx.subscribe();

        loop {
            let mut header_buf = [0u8; CHUNK_HEADER_SIZE];
            let read = tokio::select! {
                read = read_half.read_exact(&mut header_buf) => read,
                _ = closed_rx.changed() => break,
            };
            if let Err(e) = read {
                conn.close(CommError::Io(e.to_string()));
                break;
            }
            let header = match ChunkHeader::decode(&header_buf) {
                Ok(header) => header,
                Err(e) => {
                    conn.close(CommError::Wire(e));
                    break;
                }
            };

            let payload_len = header.size as usize - CHUNK_HEADER_SIZE;
            if payload_len > conn.pool.chunk_size() - CHUNK_HEADER_SIZE {
                conn.close(CommError::Wire(WireError::CorruptChunkHeader(
                    "chunk larger than configured chunk size",
                )));
                break;
            }

            // Suspension point: a free chunk from the pool.
            let mut chunk = conn.pool.acquire().await;
            chunk.buf_mut().extend_from_slice(&header_buf);
            chunk.buf_mut().resize(CHUNK_HEADER_SIZE + payload_len, 0);
            if let Err(e) = read_half
                .read_exact(&mut chunk.buf_mut()[CHUNK_HEADER_SIZE..])
                .await
            {
                conn.close(CommError::Io(e.to_string()));
                break;
            }
            *conn.last_recv.lock() = conn.clock.now();

            if header.message_id == KEEP_ALIVE_MESSAGE_ID {
                // Probe: activity already noted, chunk goes straight back.
                continue;
            }

            let chain = partial.entry(header.message_id).or_default();
            if header.is_first != chain.is_empty() {
                conn.close(CommError::Wire(WireError::CorruptMessage(
                    "chunk chain out of order",
                )));
                break;
            }
            chain.push(chunk);
            if !header.is_last {
                continue;
            }

            let chunks = partial.remove(&header.message_id).expect("chain just touched");
            let reader = match MessageReader::new(chunks) {
                Ok(reader) => reader,
                Err(e) => {
                    conn.close(CommError::Wire(e));
                    break;
                }
            };
            Connection::deliver(&conn, header.message_id, reader, &handler);
        }
        trace!(conn = conn.id, "receiver loop exited");
    }

    fn deliver(conn: &Arc<Connection>, message_id: u64, reader: MessageReader, handler: &MessageHandler) {
        if let Some((_, tx)) = conn.pending.remove(&message_id) {
            if tx.send(Ok(reader)).is_err() {
                debug!(conn = conn.id, request = message_id, "response arrived after caller gave up");
            }
            return;
        }
        handler(Arc::clone(conn), message_id, reader);
    }

    async fn keep_alive_loop(conn: Arc<Connection>) {
        let interval = conn.config.inactivity_interval();
        let timeout = conn.config.inactivity_timeout();
        let tick = (interval / 4).max(Duration::from_millis(100));
        let mut closed_rx = conn.closed_tx.subscribe();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = closed_rx.changed() => break,
            }
            let now = conn.clock.now();
            let since_recv = now.saturating_duration_since(*conn.last_recv.lock());
            if since_recv >= timeout {
                warn!(conn = conn.id, "no traffic within inactivity timeout");
                conn.close(CommError::InactivityTimeout);
                break;
            }
            let since_send = now.saturating_duration_since(*conn.last_send.lock());
            if since_recv >= interval && since_send >= interval {
                // Probe travels the normal queue; a backpressured queue
                // already counts as traffic in flight.
                if let Some(probe) = keep_alive_chunk(&conn.pool) {
                    if conn.outbound_tx.try_send(probe).is_ok() {
                        *conn.last_send.lock() = now;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;
    use lattice_proto::FORMAT_VERSION;

    fn test_config(max_queued: usize) -> TransportConfig {
        TransportConfig {
            chunk_size: 64,
            chunk_pool_size: 128,
            max_queued_chunk_count: max_queued,
            inactivity_interval_secs: 3600,
            inactivity_timeout_secs: 7200,
        }
    }

    fn noop_handler() -> MessageHandler {
        Arc::new(|_, _, _| {})
    }

    /// Echo handler: replies to every inbound message with its payload
    /// string, uppercased.
    fn echo_handler() -> MessageHandler {
        Arc::new(|conn, request_id, mut reader| {
            tokio::spawn(async move {
                let text = reader.read_string().unwrap().unwrap_or_default();
                conn.send_response(request_id, |w| {
                    w.write_string(Some(&text.to_uppercase()));
                    Ok(())
                })
                .await
                .unwrap();
            });
        })
    }

    fn pair(
        config: TransportConfig,
        a_handler: MessageHandler,
        b_handler: MessageHandler,
    ) -> (Arc<Connection>, Arc<Connection>) {
        let (a_stream, b_stream) = tokio::io::duplex(16 * 1024);
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let pool_a = ChunkPool::new(config.chunk_pool_size, config.chunk_size).unwrap();
        let pool_b = ChunkPool::new(config.chunk_pool_size, config.chunk_size).unwrap();
        let a = Connection::spawn(a_stream, addr, pool_a, config.clone(), system_clock(), a_handler);
        let b = Connection::spawn(b_stream, addr, pool_b, config, system_clock(), b_handler);
        a.mark_open();
        b.mark_open();
        (a, b)
    }

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let (a, _b) = pair(test_config(32), noop_handler(), echo_handler());

        let (_, response) = a
            .send_request(|w| {
                w.write_string(Some("ping"));
                Ok(())
            })
            .await
            .unwrap();
        let mut reader = response.await.unwrap().unwrap();
        assert_eq!(reader.read_string().unwrap().as_deref(), Some("PING"));
    }

    #[tokio::test]
    async fn test_request_ids_strictly_increase() {
        let (a, _b) = pair(test_config(32), noop_handler(), echo_handler());
        let mut last = 0;
        for _ in 0..10 {
            let (id, response) = a
                .send_request(|w| {
                    w.write_string(Some("x"));
                    Ok(())
                })
                .await
                .unwrap();
            assert!(id > last, "ids must strictly increase");
            last = id;
            response.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_multi_chunk_message_reassembles() {
        let (a, _b) = pair(test_config(64), noop_handler(), echo_handler());
        // 200 chars at chunk size 64 spans several chunks.
        let long: String = std::iter::repeat('x').take(200).collect();
        let (_, response) = a
            .send_request(|w| {
                w.write_string(Some(&long));
                Ok(())
            })
            .await
            .unwrap();
        let mut reader = response.await.unwrap().unwrap();
        assert_eq!(
            reader.read_string().unwrap().as_deref(),
            Some(long.to_uppercase().as_str())
        );
    }

    #[tokio::test]
    async fn test_close_fails_outstanding_requests() {
        let (a, _b) = pair(test_config(32), noop_handler(), noop_handler());
        let (_, response) = a
            .send_request(|w| {
                w.write_string(Some("never answered"));
                Ok(())
            })
            .await
            .unwrap();

        a.close(CommError::Closed("test shutdown".into()));
        let result = response.await.unwrap();
        assert!(matches!(result, Err(CommError::Closed(_))));
        assert_eq!(a.state(), ConnectionState::Closed);

        // Further sends fail.
        let err = a.send_request(|_| Ok(())).await;
        assert!(matches!(err, Err(CommError::Closed(_))));
    }

    #[tokio::test]
    async fn test_backpressure_blocks_producer() {
        // No reader on the far side and a tiny queue: the producer must
        // block rather than allocate.
        let (a_stream, b_stream) = tokio::io::duplex(64);
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let config = test_config(2);
        let pool = ChunkPool::new(config.chunk_pool_size, config.chunk_size).unwrap();
        let a = Connection::spawn(
            a_stream,
            addr,
            pool,
            config,
            system_clock(),
            noop_handler(),
        );
        a.mark_open();
        // Keep the far half alive but never read from it.
        std::mem::forget(b_stream);

        let filler = async {
            for _ in 0..64 {
                a.send_response(1, |w| {
                    w.write_bytes(&[0u8; 256]);
                    Ok(())
                })
                .await
                .unwrap();
            }
        };
        let outcome = tokio::time::timeout(Duration::from_millis(300), filler).await;
        assert!(outcome.is_err(), "producer should block on the full queue");
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_timeout_closes_connection() {
        // Far side is raw and silent: no probes come back.
        let (a_stream, b_stream) = tokio::io::duplex(64 * 1024);
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let config = TransportConfig {
            chunk_size: 64,
            chunk_pool_size: 16,
            max_queued_chunk_count: 16,
            inactivity_interval_secs: 1,
            inactivity_timeout_secs: 3,
        };
        let pool = ChunkPool::new(16, 64).unwrap();
        let a = Connection::spawn(a_stream, addr, pool, config, system_clock(), noop_handler());
        a.mark_open();
        std::mem::forget(b_stream);

        tokio::time::timeout(Duration::from_secs(10), a.wait_closed())
            .await
            .expect("connection should close on inactivity");
        assert!(a.is_closed());
    }

    #[tokio::test]
    async fn test_interleaved_messages_on_one_connection() {
        // Handler that answers slow for "slow", fast for "fast".
        let handler: MessageHandler = Arc::new(|conn, request_id, mut reader| {
            tokio::spawn(async move {
                let text = reader.read_string().unwrap().unwrap();
                if text == "slow" {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                conn.send_response(request_id, |w| {
                    w.write_string(Some(&text));
                    Ok(())
                })
                .await
                .unwrap();
            });
        });
        let (a, _b) = pair(test_config(32), noop_handler(), handler);

        let (slow_id, slow) = a
            .send_request(|w| {
                w.write_string(Some("slow"));
                Ok(())
            })
            .await
            .unwrap();
        let (fast_id, fast) = a
            .send_request(|w| {
                w.write_string(Some("fast"));
                Ok(())
            })
            .await
            .unwrap();
        assert!(fast_id > slow_id);

        // The fast response arrives first; both complete correctly.
        let mut fast_reader = fast.await.unwrap().unwrap();
        assert_eq!(fast_reader.read_string().unwrap().as_deref(), Some("fast"));
        let mut slow_reader = slow.await.unwrap().unwrap();
        assert_eq!(slow_reader.read_string().unwrap().as_deref(), Some("slow"));
    }

    #[test]
    fn test_format_version_is_stable() {
        assert_eq!(FORMAT_VERSION, 1);
    }
}
