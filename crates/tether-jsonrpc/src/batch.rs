use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::CodecError;
use crate::message::{classify, MessageKind};
use crate::notification::Notification;
use crate::request::Request;
use crate::response::Response;

/// One element of a batch request: either a request or a notification,
/// distinguished by the presence of `id`.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum BatchItem {
    Request(Request),
    Notification(Notification),
}

impl BatchItem {
    pub fn method(&self) -> &str {
        match self {
            BatchItem::Request(r) => &r.method,
            BatchItem::Notification(n) => &n.method,
        }
    }

    pub fn is_notification(&self) -> bool {
        matches!(self, BatchItem::Notification(_))
    }
}

/// A JSON-RPC 2.0 batch request. An empty array is malformed per the
/// protocol and rejected on decode.
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct BatchRequest(pub Vec<BatchItem>);

impl BatchRequest {
    pub fn from_slice(data: &[u8]) -> Result<Self, CodecError> {
        let items: Vec<Box<RawValue>> = serde_json::from_slice(data)?;
        Self::parse_items(items)
    }

    fn parse_items(items: Vec<Box<RawValue>>) -> Result<Self, CodecError> {
        if items.is_empty() {
            return Err(CodecError::EmptyBatch);
        }
        let mut parsed = Vec::with_capacity(items.len());
        for raw in items {
            let bytes = raw.get().as_bytes();
            match classify(bytes) {
                MessageKind::Notification => {
                    parsed.push(BatchItem::Notification(Notification::from_slice(bytes)?))
                }
                _ => parsed.push(BatchItem::Request(Request::from_slice(bytes)?)),
            }
        }
        Ok(BatchRequest(parsed))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BatchItem> {
        self.0.iter()
    }
}

impl<'de> Deserialize<'de> for BatchRequest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let items = Vec::<Box<RawValue>>::deserialize(deserializer)?;
        Self::parse_items(items).map_err(de::Error::custom)
    }
}

/// A JSON-RPC 2.0 batch response, serialised as a JSON array.
///
/// Error outcomes ride in [`Response::error`], so a single element type
/// covers both. An empty batch is only valid when built in-process from zero
/// elements; a parsed empty array is rejected.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct BatchResponse(pub Vec<Response>);

impl BatchResponse {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, response: Response) {
        self.0.push(response);
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, CodecError> {
        let items: Vec<Response> = serde_json::from_slice(data)?;
        if items.is_empty() {
            return Err(CodecError::EmptyBatch);
        }
        Ok(BatchResponse(items))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for BatchResponse {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let items = Vec::<Response>::deserialize(deserializer)?;
        if items.is_empty() {
            return Err(de::Error::custom("invalid batch response: empty array"));
        }
        Ok(BatchResponse(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RequestId;

    const MIXED: &[u8] = br#"[
        {"jsonrpc":"2.0","method":"sum","params":[1,2,4],"id":1},
        {"jsonrpc":"2.0","method":"notify_hello","params":[7]},
        {"jsonrpc":"2.0","method":"subtract","params":[42,23],"id":2}
    ]"#;

    #[test]
    fn mixed_batch_decodes() {
        let batch = BatchRequest::from_slice(MIXED).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.iter().filter(|i| i.is_notification()).count(), 1);
        assert_eq!(batch.0[0].method(), "sum");
        match &batch.0[2] {
            BatchItem::Request(r) => assert_eq!(r.id, RequestId::Number(2)),
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn empty_batch_is_invalid_request() {
        match BatchRequest::from_slice(b"[]") {
            Err(CodecError::EmptyBatch) => {}
            other => panic!("expected EmptyBatch, got {other:?}"),
        }
    }

    #[test]
    fn trailing_comma_is_a_parse_error() {
        let input = br#"[{"jsonrpc":"2.0","method":"sum","params":[1,2,4],"id":1},]"#;
        match BatchRequest::from_slice(input) {
            Err(CodecError::Json(_)) => {}
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn in_process_empty_batch_response_serialises() {
        let batch = BatchResponse::new();
        assert_eq!(serde_json::to_string(&batch).unwrap(), "[]");
        // but a parsed empty array is rejected
        assert!(BatchResponse::from_slice(b"[]").is_err());
    }

    #[test]
    fn batch_response_serialises_as_array() {
        let mut batch = BatchResponse::new();
        batch.push(Response::with_result(RequestId::Number(1), &3).unwrap());
        batch.push(Response::with_error(
            RequestId::Number(2),
            crate::ErrorObject::invalid_request("Invalid Request", None),
        ));
        let encoded = serde_json::to_string(&batch).unwrap();
        assert!(encoded.starts_with('['));
        assert!(encoded.contains(r#""result":3"#));
        assert!(encoded.contains("-32600"));
    }
}
