//! # tether-http
//!
//! HTTP transports for the tether JSON-RPC framework, built on hyper:
//!
//! - [`streamable`]: the single-endpoint streamable-HTTP profile. A POST
//!   without a session header is the handshake; a POST with one carries a
//!   message and may upgrade to SSE; a GET (re)attaches the event stream with
//!   `Last-Event-ID` replay; DELETE tears the session down.
//! - [`sse`]: the two-endpoint SSE profile. A GET opens the stream and
//!   advertises the message endpoint via an `endpoint` event; POSTs carry
//!   messages.
//! - [`streaming`]: the NDJSON profile with `{"id":N,"data":…}` envelope
//!   framing.
//!
//! Sessions, dispatch and lifecycle come from `tether-transport`; this crate
//! only adds the HTTP surface.

pub mod bff;
pub mod body;
pub mod cors;
pub mod locate;
pub mod origin;
pub mod server;
pub mod sse;
pub mod streamable;
pub mod streaming;

pub use bff::{AuthCookie, BffAuth, SameSite};
pub use body::{empty_body, full_body, streaming_channel, BoxedBody, ChannelWriter, StreamHandle};
pub use cors::CorsConfig;
pub use locate::SessionLocation;
pub use server::{HttpHandler, Server};
pub use sse::{SseHandler, SseOptions};
pub use streamable::{StreamableHandler, StreamableOptions};
pub use streaming::{StreamingHandler, StreamingOptions};

/// Default session id header, shared by the streamable and NDJSON profiles.
pub const DEFAULT_SESSION_HEADER: &str = "Mcp-Session-Id";

/// MIME type of SSE streams.
pub const SSE_MIME: &str = "text/event-stream";

/// MIME type of NDJSON streams.
pub const NDJSON_MIME: &str = "application/x-ndjson";
