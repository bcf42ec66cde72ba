//! Per-peer session state for streaming transports.
//!
//! A session owns the write path, the framing, the bounded event buffer used
//! for `Last-Event-ID` replay, and the lifecycle metadata the sweeper acts
//! on. All writes and state transitions are serialised under the session
//! mutex; the event sequence is strictly increasing per session.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use tether_jsonrpc::{CodecError, Error, Notification, Request, RequestId, Response};

use crate::framer::Framer;
use crate::lifecycle::OverflowPolicy;
use crate::trips::RoundTrips;

/// Capacity of the per-session round-trip ring.
const TRIP_RING_CAPACITY: usize = 20;

/// Lifecycle state of a session. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Detached,
    Closed,
}

/// The write side of a session. Writers are held weakly in the sense that a
/// session may have none (detached) and the current one is replaced wholesale
/// on reattach.
#[async_trait]
pub trait SessionWriter: Send {
    async fn write(&mut self, data: &[u8]) -> std::io::Result<()>;
}

/// Adapts any async writer (stdout, a duplex pipe, a test buffer) into a
/// [`SessionWriter`]. Flushes after every write so streaming peers see frames
/// immediately.
pub struct IoWriter<W>(pub W);

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> SessionWriter for IoWriter<W> {
    async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.0.write_all(data).await?;
        self.0.flush().await
    }
}

#[derive(Clone)]
struct BufferedEvent {
    id: u64,
    data: Bytes,
}

struct Inner {
    writer: Option<Box<dyn SessionWriter>>,
    framer: Framer,
    sse: bool,
    events: VecDeque<BufferedEvent>,
    buffer_cap: usize,
    overflow_policy: OverflowPolicy,
    overflowed: bool,
    error: Option<String>,
    state: SessionState,
    created_at: Instant,
    last_seen: Instant,
    detached_at: Option<Instant>,
}

/// Point-in-time view of the lifecycle fields, used by the sweeper and tests.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub created_at: Instant,
    pub last_seen: Instant,
    pub detached_at: Option<Instant>,
    pub has_error: bool,
    pub overflowed: bool,
    pub buffered_events: usize,
}

/// Per-peer state of a streaming transport, keyed by an opaque id.
pub struct Session {
    id: String,
    seq: AtomicU64,
    writer_gen: AtomicU64,
    trips: Arc<RoundTrips>,
    inner: Mutex<Inner>,
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn trips(&self) -> &Arc<RoundTrips> {
        &self.trips
    }

    /// Allocates the next outbound request id. Shares the sequence with the
    /// event counter so replay ids and server-initiated request ids never
    /// collide on one stream.
    pub fn next_request_id(&self) -> RequestId {
        RequestId::Number((self.seq.fetch_add(1, Ordering::SeqCst) + 1) as i64)
    }

    /// The most recently issued sequence value, without advancing it.
    pub fn last_sequence(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Advances the sequence to at least `id` when the inbound request id is
    /// an integer, so ids minted by this side stay unique.
    pub fn seed_request_id(&self, id: &RequestId) {
        if let Some(n) = id.as_i64() {
            if n > 0 {
                self.seq.fetch_max(n as u64, Ordering::SeqCst);
            }
        }
    }

    /// Current writer attachment generation. Background emitters capture the
    /// generation at start and exit once it changes.
    pub fn writer_generation(&self) -> u64 {
        self.writer_gen.load(Ordering::SeqCst)
    }

    /// Frames and writes a payload, buffering it when the event buffer is
    /// enabled. A write failure latches the session error but does not change
    /// lifecycle state.
    pub async fn send_data(&self, data: &[u8]) {
        let mut inner = self.inner.lock().await;
        inner.last_seen = Instant::now();

        let needs_seq = inner.sse || inner.buffer_cap > 0 || inner.framer.consumes_sequence();
        let seq = if needs_seq {
            self.seq.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            0
        };

        let mut framed = inner.framer.frame(seq, data);
        if inner.sse {
            let mut with_id = format!("id: {seq}\n").into_bytes();
            with_id.extend_from_slice(&framed);
            framed = with_id;
        }

        if let Some(writer) = inner.writer.as_mut() {
            if let Err(err) = writer.write(&framed).await {
                warn!(session = %self.id, error = %err, "session write failed");
                inner.error = Some(err.to_string());
            }
        }

        if inner.buffer_cap > 0 {
            let cap = inner.buffer_cap;
            let policy = inner.overflow_policy;
            inner.events.push_back(BufferedEvent {
                id: seq,
                data: Bytes::from(framed),
            });
            while inner.events.len() > cap {
                if policy == OverflowPolicy::Mark {
                    inner.overflowed = true;
                }
                inner.events.pop_front();
            }
        }
    }

    pub async fn send_request(&self, request: &Request) -> Result<(), CodecError> {
        let data = serde_json::to_vec(request)?;
        self.send_data(&data).await;
        Ok(())
    }

    /// Serialises and sends a response. A response carrying an error has its
    /// result omitted on the wire.
    pub async fn send_response(&self, response: &Response) -> Result<(), CodecError> {
        let data = serde_json::to_vec(response)?;
        self.send_data(&data).await;
        Ok(())
    }

    pub async fn send_error(&self, error: &Error) -> Result<(), CodecError> {
        let data = serde_json::to_vec(error)?;
        self.send_data(&data).await;
        Ok(())
    }

    pub async fn send_notification(&self, notification: &Notification) -> Result<(), CodecError> {
        let data = serde_json::to_vec(notification)?;
        self.send_data(&data).await;
        Ok(())
    }

    /// Writes bytes to the current writer without framing, sequencing or
    /// buffering. Used for handshake events and keepalive comments that must
    /// not participate in replay. Refreshes `last_seen`.
    pub async fn send_raw(&self, data: &[u8]) {
        let mut inner = self.inner.lock().await;
        inner.last_seen = Instant::now();
        if let Some(writer) = inner.writer.as_mut() {
            if let Err(err) = writer.write(data).await {
                inner.error = Some(err.to_string());
            }
        }
    }

    /// Writes an SSE comment frame keeping the connection warm.
    pub async fn send_keepalive(&self) {
        self.send_raw(b": keepalive\n\n").await;
    }

    /// Returns buffered framed payloads with sequence id strictly greater
    /// than `last_id`; `0` returns the whole buffer.
    pub async fn events_after(&self, last_id: u64) -> Vec<Bytes> {
        let inner = self.inner.lock().await;
        inner
            .events
            .iter()
            .filter(|ev| last_id == 0 || ev.id > last_id)
            .map(|ev| ev.data.clone())
            .collect()
    }

    /// Replays buffered events after `last_id` to the current writer, holding
    /// the session mutex so live traffic cannot interleave mid-replay.
    /// Returns the number of frames written.
    pub async fn replay_after(&self, last_id: u64) -> usize {
        let mut inner = self.inner.lock().await;
        let frames: Vec<Bytes> = inner
            .events
            .iter()
            .filter(|ev| last_id == 0 || ev.id > last_id)
            .map(|ev| ev.data.clone())
            .collect();
        let mut written = 0;
        if let Some(writer) = inner.writer.as_mut() {
            for frame in &frames {
                match writer.write(frame).await {
                    Ok(()) => written += 1,
                    Err(err) => {
                        inner.error = Some(err.to_string());
                        break;
                    }
                }
            }
        }
        written
    }

    /// Replaces the writer and marks the session active, bumping the writer
    /// generation so stale background emitters retire. Returns the new
    /// generation.
    pub async fn mark_active_with_writer(&self, writer: Box<dyn SessionWriter>) -> u64 {
        let mut inner = self.inner.lock().await;
        inner.writer = Some(writer);
        inner.state = SessionState::Active;
        inner.detached_at = None;
        inner.last_seen = Instant::now();
        self.writer_gen.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Clears the writer and records the detachment time.
    pub async fn mark_detached(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            return;
        }
        inner.writer = None;
        inner.state = SessionState::Detached;
        inner.detached_at = Some(Instant::now());
    }

    /// Detaches only when the writer generation still matches `generation`,
    /// so a finished stream does not tear down a newer attachment.
    pub async fn mark_detached_if_current(&self, generation: u64) {
        if self.writer_generation() == generation {
            self.mark_detached().await;
        }
    }

    /// Refreshes `last_seen` without sending data.
    pub async fn touch(&self) {
        let mut inner = self.inner.lock().await;
        inner.last_seen = Instant::now();
    }

    /// Terminal transition: drops the writer, fails pending round trips and
    /// marks the session closed.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.writer = None;
        inner.state = SessionState::Closed;
        drop(inner);
        self.trips.close_with_error("session closed");
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub async fn latched_error(&self) -> Option<String> {
        self.inner.lock().await.error.clone()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock().await;
        SessionSnapshot {
            state: inner.state,
            created_at: inner.created_at,
            last_seen: inner.last_seen,
            detached_at: inner.detached_at,
            has_error: inner.error.is_some(),
            overflowed: inner.overflowed,
            buffered_events: inner.events.len(),
        }
    }

    pub async fn set_framer(&self, framer: Framer) {
        self.inner.lock().await.framer = framer;
    }

    /// Enables SSE mode: each frame is preceded by `id: <seq>\n` and buffered
    /// under that id for replay.
    pub async fn set_sse(&self, enabled: bool) {
        self.inner.lock().await.sse = enabled;
    }

    pub async fn set_event_buffer(&self, capacity: usize) {
        self.inner.lock().await.buffer_cap = capacity;
    }

    pub async fn set_overflow_policy(&self, policy: OverflowPolicy) {
        self.inner.lock().await.overflow_policy = policy;
    }

    /// Whether the buffer dropped events under the `Mark` overflow policy,
    /// meaning a replay may have a gap.
    pub async fn overflowed(&self) -> bool {
        self.inner.lock().await.overflowed
    }

    #[cfg(test)]
    pub(crate) async fn backdate_last_seen(&self, by: std::time::Duration) {
        let mut inner = self.inner.lock().await;
        if let Some(at) = Instant::now().checked_sub(by) {
            inner.last_seen = at;
        }
    }

    #[cfg(test)]
    pub(crate) async fn backdate_created_at(&self, by: std::time::Duration) {
        let mut inner = self.inner.lock().await;
        if let Some(at) = Instant::now().checked_sub(by) {
            inner.created_at = at;
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("seq", &self.seq.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Builder for [`Session`]. The default is a writer-less, unbuffered session
/// with line framing; transports reconfigure the stream shape on attach.
pub struct SessionBuilder {
    id: Option<String>,
    writer: Option<Box<dyn SessionWriter>>,
    framer: Framer,
    sse: bool,
    buffer_cap: usize,
    overflow_policy: OverflowPolicy,
    trip_capacity: usize,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self {
            id: None,
            writer: None,
            framer: Framer::LineJson,
            sse: false,
            buffer_cap: 0,
            overflow_policy: OverflowPolicy::DropOldest,
            trip_capacity: TRIP_RING_CAPACITY,
        }
    }
}

impl SessionBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn writer(mut self, writer: Box<dyn SessionWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn framer(mut self, framer: Framer) -> Self {
        self.framer = framer;
        self
    }

    pub fn sse(mut self, enabled: bool) -> Self {
        self.sse = enabled;
        self
    }

    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.buffer_cap = capacity;
        self
    }

    pub fn overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    pub fn trip_capacity(mut self, capacity: usize) -> Self {
        self.trip_capacity = capacity;
        self
    }

    pub fn build(self) -> Arc<Session> {
        let now = Instant::now();
        let writer_present = self.writer.is_some();
        Arc::new(Session {
            id: self.id.unwrap_or_else(|| Uuid::now_v7().to_string()),
            seq: AtomicU64::new(0),
            writer_gen: AtomicU64::new(if writer_present { 1 } else { 0 }),
            trips: Arc::new(RoundTrips::new(self.trip_capacity)),
            inner: Mutex::new(Inner {
                writer: self.writer,
                framer: self.framer,
                sse: self.sse,
                events: VecDeque::new(),
                buffer_cap: self.buffer_cap,
                overflow_policy: self.overflow_policy,
                overflowed: false,
                error: None,
                state: SessionState::Active,
                created_at: now,
                last_seen: now,
                detached_at: None,
            }),
        })
    }
}

/// Test/in-process writer collecting frames into a shared buffer.
pub struct BufferWriter(pub Arc<parking_lot::Mutex<Vec<u8>>>);

impl BufferWriter {
    pub fn pair() -> (Box<dyn SessionWriter>, Arc<parking_lot::Mutex<Vec<u8>>>) {
        let buf = Arc::new(parking_lot::Mutex::new(Vec::new()));
        (Box::new(BufferWriter(Arc::clone(&buf))), buf)
    }
}

#[async_trait]
impl SessionWriter for BufferWriter {
    async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.0.lock().extend_from_slice(data);
        Ok(())
    }
}
