use thiserror::Error;

use tether_jsonrpc::{CodecError, UnauthorizedError};
use tether_transport::TripError;

/// Client-side failures, keeping transport, registry and protocol concerns
/// distinguishable for callers.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Trip(#[from] TripError),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("handshake missing {0} header")]
    Handshake(String),

    #[error("invalid status code {status}: {body}")]
    Status { status: u16, body: String },

    #[error(transparent)]
    Unauthorized(#[from] UnauthorizedError),

    #[error("client closed: {0}")]
    Closed(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),
}

impl ClientError {
    /// Whether the failure is (or wraps) an authorization rejection.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ClientError::Unauthorized(_))
    }
}
