use std::fmt;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error as ThisError;

use crate::error_codes;
use crate::response::Response;
use crate::types::{RequestId, Version};

/// The error member of a JSON-RPC error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<RawValue>>,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>, data: Option<Box<RawValue>>) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }

    pub fn parse_error(message: impl Into<String>, data: Option<Box<RawValue>>) -> Self {
        Self::new(error_codes::PARSE_ERROR, message, data)
    }

    pub fn invalid_request(message: impl Into<String>, data: Option<Box<RawValue>>) -> Self {
        Self::new(error_codes::INVALID_REQUEST, message, data)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("method {method} not found"),
            None,
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_PARAMS, message, None)
    }

    pub fn internal(message: impl Into<String>, data: Option<Box<RawValue>>) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, message, data)
    }
}

/// A standalone JSON-RPC error envelope.
///
/// This is the shape the classifier reports as [`crate::MessageKind::Error`]:
/// an `error` member without a `method`. The id is optional because a parse
/// error may not know which request it answers.
#[derive(Debug, Clone, Serialize)]
pub struct Error {
    pub jsonrpc: Version,
    pub id: Option<RequestId>,
    pub error: ErrorObject,
}

impl Error {
    pub fn new(id: Option<RequestId>, error: ErrorObject) -> Self {
        Self {
            jsonrpc: Version,
            id,
            error,
        }
    }

    pub fn parse_error(id: Option<RequestId>, message: impl Into<String>) -> Self {
        Self::new(id, ErrorObject::parse_error(message, None))
    }

    pub fn invalid_request(id: Option<RequestId>, message: impl Into<String>) -> Self {
        Self::new(id, ErrorObject::invalid_request(message, None))
    }

    pub fn method_not_found(id: Option<RequestId>, method: &str) -> Self {
        Self::new(id, ErrorObject::method_not_found(method))
    }

    pub fn internal(id: Option<RequestId>, message: impl Into<String>) -> Self {
        Self::new(id, ErrorObject::internal(message, None))
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Converts into the response envelope carrying the same error, for
    /// round-trip completion. Returns `None` when the envelope has no id to
    /// correlate with.
    pub fn into_response(self) -> Option<Response> {
        let id = self.id?;
        Some(Response::with_error(id, self.error))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "jsonrpc error {}: {}", self.error.code, self.error.message)
    }
}

impl std::error::Error for Error {}

impl<'de> Deserialize<'de> for Error {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Wire {
            jsonrpc: Option<Version>,
            #[serde(default)]
            id: Option<RequestId>,
            error: Option<ErrorObject>,
        }

        let wire = Wire::deserialize(deserializer)?;
        wire.jsonrpc
            .ok_or_else(|| de::Error::custom("field jsonrpc in error: required"))?;
        let error = wire
            .error
            .ok_or_else(|| de::Error::custom("field error in error envelope: required"))?;
        Ok(Error {
            jsonrpc: Version,
            id: wire.id,
            error,
        })
    }
}

/// Decode failures raised by the codec, distinguishing the shapes the
/// protocol maps to distinct error codes.
#[derive(Debug, ThisError)]
pub enum CodecError {
    #[error("failed to parse JSON-RPC message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid batch request: empty array")]
    EmptyBatch,
}

impl CodecError {
    /// Maps the failure onto the protocol error code it should surface as.
    pub fn code(&self) -> i64 {
        match self {
            CodecError::Json(_) => error_codes::PARSE_ERROR,
            CodecError::EmptyBatch => error_codes::INVALID_REQUEST,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelope_round_trip() {
        let err = Error::new(
            Some(RequestId::Number(3)),
            ErrorObject::invalid_request("Invalid Request", None),
        );
        let encoded = serde_json::to_vec(&err).unwrap();
        let back = Error::from_slice(&encoded).unwrap();
        assert_eq!(back.id, Some(RequestId::Number(3)));
        assert_eq!(back.error.code, -32600);
    }

    #[test]
    fn parse_error_serialises_null_id() {
        let err = Error::parse_error(None, "unexpected end of input");
        let encoded = serde_json::to_string(&err).unwrap();
        assert!(encoded.contains(r#""id":null"#));
        assert!(encoded.contains("-32700"));
    }

    #[test]
    fn error_without_error_member_fails() {
        assert!(Error::from_slice(br#"{"jsonrpc":"2.0","id":1}"#).is_err());
    }

    #[test]
    fn codec_error_codes() {
        let parse: CodecError = serde_json::from_str::<serde_json::Value>("{,}")
            .unwrap_err()
            .into();
        assert_eq!(parse.code(), -32700);
        assert_eq!(CodecError::EmptyBatch.code(), -32600);
    }
}
