use serde::{Deserialize, Serialize};

use crate::error::{CodecError, Error};
use crate::notification::Notification;
use crate::request::Request;
use crate::response::Response;

/// The four shapes a JSON-RPC envelope can take on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Notification,
    Response,
    Error,
}

/// Classifies a payload by partial parse, looking only at the presence of
/// the `id`, `method` and `error` keys (a `null` value reads as absent):
///
/// - `error` present and `method` absent: error envelope
/// - `method` present and `id` absent: notification
/// - `method` present and `id` present: request
/// - anything else: response
///
/// Presence is purely structural: an empty `method` string still routes as a
/// request or notification, so full decoding can answer it with a proper
/// parse failure instead of dropping it on the response path. Unparseable
/// payloads classify as [`MessageKind::Response`]; full decoding reports the
/// actual parse failure.
pub fn classify(data: &[u8]) -> MessageKind {
    #[derive(Default, Deserialize)]
    struct Probe {
        #[serde(default)]
        id: Option<serde_json::Value>,
        #[serde(default)]
        method: Option<String>,
        #[serde(default)]
        error: Option<serde_json::Value>,
    }

    let probe: Probe = serde_json::from_slice(data).unwrap_or_default();
    let has_method = probe.method.is_some();
    if probe.error.is_some() && !has_method {
        MessageKind::Error
    } else if has_method && probe.id.is_none() {
        MessageKind::Notification
    } else if has_method {
        MessageKind::Request
    } else {
        MessageKind::Response
    }
}

/// A fully decoded JSON-RPC envelope of any kind.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
    Error(Error),
}

impl Message {
    /// Classifies and fully decodes a payload.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        match classify(data) {
            MessageKind::Request => Ok(Message::Request(Request::from_slice(data)?)),
            MessageKind::Notification => {
                Ok(Message::Notification(Notification::from_slice(data)?))
            }
            MessageKind::Response => Ok(Message::Response(Response::from_slice(data)?)),
            MessageKind::Error => Ok(Message::Error(Error::from_slice(data)?)),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Request(_) => MessageKind::Request,
            Message::Notification(_) => MessageKind::Notification,
            Message::Response(_) => MessageKind::Response,
            Message::Error(_) => MessageKind::Error,
        }
    }

    /// The method name for request and notification envelopes.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(r) => Some(&r.method),
            Message::Notification(n) => Some(&n.method),
            _ => None,
        }
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_by_shape() {
        assert_eq!(
            classify(br#"{"jsonrpc":"2.0","method":"ping","id":1}"#),
            MessageKind::Request
        );
        assert_eq!(
            classify(br#"{"jsonrpc":"2.0","method":"ping"}"#),
            MessageKind::Notification
        );
        assert_eq!(
            classify(br#"{"jsonrpc":"2.0","id":1,"result":"pong"}"#),
            MessageKind::Response
        );
        assert_eq!(
            classify(br#"{"jsonrpc":"2.0","id":1,"error":{"code":-32700,"message":"x"}}"#),
            MessageKind::Error
        );
    }

    #[test]
    fn null_id_reads_as_absent() {
        assert_eq!(
            classify(br#"{"jsonrpc":"2.0","method":"ping","id":null}"#),
            MessageKind::Notification
        );
    }

    #[test]
    fn error_with_method_is_not_an_error_envelope() {
        // a request whose params happen to mention "error" stays a request
        assert_eq!(
            classify(br#"{"jsonrpc":"2.0","method":"m","id":1,"error":{"code":1,"message":""}}"#),
            MessageKind::Request
        );
    }

    #[test]
    fn empty_method_still_routes_by_shape() {
        // key presence decides the route; non-emptiness is a decode concern
        assert_eq!(
            classify(br#"{"jsonrpc":"2.0","method":"","id":1}"#),
            MessageKind::Request
        );
        assert_eq!(
            classify(br#"{"jsonrpc":"2.0","method":""}"#),
            MessageKind::Notification
        );
        assert!(Message::decode(br#"{"jsonrpc":"2.0","method":"","id":1}"#).is_err());
    }

    #[test]
    fn garbage_classifies_as_response_and_fails_decode() {
        assert_eq!(classify(b"not json"), MessageKind::Response);
        assert!(Message::decode(b"not json").is_err());
    }

    #[test]
    fn decode_routes_to_typed_envelope() {
        let msg = Message::decode(br#"{"jsonrpc":"2.0","method":"sum","id":7}"#).unwrap();
        assert_eq!(msg.kind(), MessageKind::Request);
        assert_eq!(msg.method(), Some("sum"));
    }
}
