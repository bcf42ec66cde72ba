//! Round-trip registry: a bounded, concurrency-safe ring matching outbound
//! requests to inbound responses by id.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use tether_jsonrpc::{Notification, Request, RequestId, Response};

/// Failures of the round-trip registry, distinguishable from protocol errors.
#[derive(Debug, Clone, Error)]
pub enum TripError {
    #[error("round-trip ring is full (capacity {0})")]
    RingFull(usize),

    #[error("no pending round trip matches id {0}")]
    NotMatched(RequestId),

    #[error("round trip timed out after {0:?}")]
    TimedOut(Duration),

    #[error("round trip cancelled")]
    Cancelled,

    #[error("registry closed: {0}")]
    Closed(String),
}

struct Pending {
    request: Request,
    tx: oneshot::Sender<Result<Response, TripError>>,
}

/// An in-flight request awaiting its response.
pub struct RoundTrip {
    pub request: Request,
    rx: oneshot::Receiver<Result<Response, TripError>>,
}

impl RoundTrip {
    /// Suspends until the trip completes, the deadline passes, or the
    /// producer side goes away. Late completions after a timeout are
    /// discarded by the caller releasing the slot.
    pub async fn wait(self, timeout: Duration) -> Result<Response, TripError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Err(_elapsed) => Err(TripError::TimedOut(timeout)),
            Ok(Err(_recv)) => Err(TripError::Cancelled),
            Ok(Ok(outcome)) => outcome,
        }
    }
}

/// The producer half of a matched trip. Completion is single-shot; dropping
/// it without responding cancels the waiter.
pub struct Completion {
    request: Request,
    tx: oneshot::Sender<Result<Response, TripError>>,
}

impl Completion {
    /// The request this completion answers, as recorded at `add` time.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Delivers the response, waking the single waiter. A completion that
    /// races a timed-out waiter is a no-op.
    pub fn respond(self, response: Response) {
        let _ = self.tx.send(Ok(response));
    }

    /// Fails the trip with an error outcome carried as an error response.
    pub fn fail(self, error: tether_jsonrpc::ErrorObject) {
        let id = self.request.id.clone();
        let _ = self.tx.send(Ok(Response::with_error(id, error)));
    }
}

/// Fixed-capacity registry of pending round trips.
///
/// Slot allocation and matching scan forward from independent atomic cursors;
/// there is no FIFO guarantee on ids, and the producer side must choose ids
/// uniquely (a monotonic counter suffices).
pub struct RoundTrips {
    slots: Mutex<Vec<Option<Pending>>>,
    add_cursor: AtomicUsize,
    match_cursor: AtomicUsize,
    capacity: usize,
    closed: Mutex<Option<String>>,
}

impl RoundTrips {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots: Mutex::new(slots),
            add_cursor: AtomicUsize::new(0),
            match_cursor: AtomicUsize::new(0),
            capacity,
            closed: Mutex::new(None),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Assigns the request to the first free slot. Fails when the ring is
    /// full or the registry has been closed.
    pub fn add(&self, request: Request) -> Result<RoundTrip, TripError> {
        if let Some(msg) = self.closed.lock().as_ref() {
            return Err(TripError::Closed(msg.clone()));
        }
        let mut slots = self.slots.lock();
        let start = self.add_cursor.fetch_add(1, Ordering::Relaxed) % self.capacity;
        for offset in 0..self.capacity {
            let i = (start + offset) % self.capacity;
            if slots[i].is_none() {
                let (tx, rx) = oneshot::channel();
                slots[i] = Some(Pending {
                    request: request.clone(),
                    tx,
                });
                return Ok(RoundTrip { request, rx });
            }
        }
        Err(TripError::RingFull(self.capacity))
    }

    /// Removes and returns the first pending slot whose request id equals
    /// `id`. Matching is by id equality, not arrival order.
    pub fn match_id(&self, id: &RequestId) -> Result<Completion, TripError> {
        if let Some(msg) = self.closed.lock().as_ref() {
            return Err(TripError::Closed(msg.clone()));
        }
        let mut slots = self.slots.lock();
        let start = self.match_cursor.fetch_add(1, Ordering::Relaxed) % self.capacity;
        for offset in 0..self.capacity {
            let i = (start + offset) % self.capacity;
            let matches = slots[i]
                .as_ref()
                .is_some_and(|pending| pending.request.id == *id);
            if matches {
                let pending = slots[i].take().expect("slot checked above");
                return Ok(Completion {
                    request: pending.request,
                    tx: pending.tx,
                });
            }
        }
        Err(TripError::NotMatched(id.clone()))
    }

    /// Latches an error: all future `add`/`match_id` calls return it, and
    /// every pending waiter is failed with it.
    pub fn close_with_error(&self, message: impl Into<String>) {
        let message = message.into();
        *self.closed.lock() = Some(message.clone());
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            if let Some(pending) = slot.take() {
                let _ = pending.tx.send(Err(TripError::Closed(message.clone())));
            }
        }
    }

    /// Number of occupied slots.
    pub fn pending(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }
}

/// Bounded side-channel delivering inbound notifications to a consumer.
/// Overflow drops the newest notification and reports it.
pub struct NotificationQueue {
    tx: mpsc::Sender<Notification>,
    dropped: AtomicU64,
}

impl NotificationQueue {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    pub fn publish(&self, notification: Notification) {
        if let Err(err) = self.tx.try_send(notification) {
            let method = match &err {
                mpsc::error::TrySendError::Full(n) => n.method.clone(),
                mpsc::error::TrySendError::Closed(n) => n.method.clone(),
            };
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(%method, dropped, "notification queue overflow, dropping");
        }
    }

    /// Total notifications dropped due to overflow or a gone consumer.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
