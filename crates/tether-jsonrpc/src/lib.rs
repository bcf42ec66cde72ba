//! # JSON-RPC 2.0 Codec
//!
//! Transport-agnostic JSON-RPC 2.0 envelope types with a shape-based message
//! classifier. This crate owns the wire format only; dispatch, sessions and
//! transports live in `tether-transport` and above.
//!
//! ## Design
//! - `params`, `result` and error `data` are kept as raw JSON
//!   ([`serde_json::value::RawValue`]) so schema binding is deferred to the
//!   handler that understands the method.
//! - Classification ([`classify`]) inspects only the presence of `id`,
//!   `method` and `error`, so a payload can be routed before it is fully
//!   validated.
//! - Decoding validates required fields per envelope type; a notification
//!   carrying an `id` is a parse failure.

pub mod batch;
pub mod error;
pub mod message;
pub mod notification;
pub mod request;
pub mod response;
pub mod types;
pub mod unauthorized;

pub use batch::{BatchItem, BatchRequest, BatchResponse};
pub use error::{CodecError, Error, ErrorObject};
pub use message::{classify, Message, MessageKind};
pub use notification::Notification;
pub use request::Request;
pub use response::Response;
pub use types::{RequestId, Version};
pub use unauthorized::UnauthorizedError;

/// JSON-RPC protocol version constant.
pub const VERSION: &str = "2.0";

/// Standard JSON-RPC 2.0 error codes.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}
