//! # tether-client
//!
//! Streaming JSON-RPC clients for the tether framework:
//!
//! - [`StdioClient`]: line-framed client over caller-supplied reader/writer
//!   halves (the usual peer is a spawned child process; process plumbing is
//!   the caller's concern).
//! - [`SseClient`]: HTTP+SSE profile. The GET stream's `endpoint` event
//!   advertises where to POST; responses arrive as `message` frames.
//! - [`StreamableClient`]: streamable-HTTP profile. The first POST is the
//!   handshake capturing the session id header; a background GET stream
//!   reconnects with exponential backoff and `Last-Event-ID` replay.
//!
//! All clients share [`ClientCore`]: round-trip correlation, a bounded
//! notification queue, server-initiated request serving, and the listener /
//! interceptor hooks.

pub mod base;
pub mod error;
pub mod sse;
pub mod sse_stream;
pub mod stdio;
pub mod streamable;

pub use base::{ClientCore, ClientHandler, ClientOptions, DefaultClientHandler, Interceptor, Listener, SendData};
pub use error::ClientError;
pub use sse::{SseClient, SseClientOptions};
pub use sse_stream::{SseEvent, SseParser};
pub use stdio::StdioClient;
pub use streamable::{StreamableClient, StreamableClientOptions};

/// Reconnect backoff base for streaming clients.
pub(crate) const BACKOFF_BASE: std::time::Duration = std::time::Duration::from_millis(500);

/// Reconnect backoff cap.
pub(crate) const BACKOFF_CAP: std::time::Duration = std::time::Duration::from_secs(10);
