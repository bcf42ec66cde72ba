//! # tether-transport
//!
//! The transport-independent machinery of the tether JSON-RPC framework:
//!
//! - [`trips`]: bounded round-trip registry correlating outbound request ids
//!   with inbound responses
//! - [`session`]: per-peer state owning the write path, framing, event buffer
//!   and lifecycle metadata
//! - [`dispatch`]: the base dispatcher routing classified messages to the
//!   user handler or a pending round trip
//! - [`lifecycle`]: removal policies and the background sweeper
//! - [`auth`]: server-held BFF authentication grants
//! - [`stdio`]: the line-framed stdio server with its single implicit session
//!
//! HTTP transports build on this crate from `tether-http`; streaming clients
//! from `tether-client`.

pub mod auth;
pub mod dispatch;
pub mod framer;
pub mod lifecycle;
pub mod session;
pub mod stdio;
pub mod store;
pub mod transport;
pub mod trips;

use thiserror::Error;

pub use dispatch::{Context, Dispatcher, Handler};
pub use framer::Framer;
pub use lifecycle::{LifecycleConfig, OverflowPolicy, RemovalPolicy, Sweeper};
pub use session::{
    BufferWriter, IoWriter, Session, SessionBuilder, SessionSnapshot, SessionState, SessionWriter,
};
pub use store::{MemorySessionStore, SessionStore};
pub use transport::ServerTransport;
pub use trips::{Completion, NotificationQueue, RoundTrip, RoundTrips, TripError};

use tether_jsonrpc::CodecError;

/// Default per-request run timeout, matching the server-side trip timeout of
/// the wire protocol (outbound requests are expected to resolve within
/// minutes, not hours).
pub const DEFAULT_RUN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5 * 60);

/// Errors surfaced by transport-side send paths.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Trip(#[from] TripError),

    #[error("session write failed: {0}")]
    Write(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
