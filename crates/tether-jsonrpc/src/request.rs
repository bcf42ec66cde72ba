use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::CodecError;
use crate::types::{RequestId, Version};

/// A JSON-RPC request: a method invocation that expects a response.
///
/// `params` is kept as raw JSON; the handler that knows the method decodes it
/// into its own parameter type on demand.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub jsonrpc: Version,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Box<RawValue>>,
}

impl Request {
    /// Creates a request with pre-serialised parameters.
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>) -> Self {
        Self {
            jsonrpc: Version,
            id: id.into(),
            method: method.into(),
            params: None,
        }
    }

    /// Creates a request serialising `params` in place.
    pub fn with_params<P: Serialize>(
        id: impl Into<RequestId>,
        method: impl Into<String>,
        params: &P,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            jsonrpc: Version,
            id: id.into(),
            method: method.into(),
            params: Some(serde_json::value::to_raw_value(params)?),
        })
    }

    /// Decodes a request, failing when `jsonrpc`, `id` or `method` is missing.
    pub fn from_slice(data: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Decodes the raw `params` into a concrete type.
    pub fn params_as<'a, P: Deserialize<'a>>(&'a self) -> Result<P, CodecError> {
        let raw = self
            .params
            .as_deref()
            .map(RawValue::get)
            .unwrap_or("null");
        Ok(serde_json::from_str(raw)?)
    }
}

impl<'de> Deserialize<'de> for Request {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Wire {
            jsonrpc: Option<Version>,
            id: Option<RequestId>,
            method: Option<String>,
            #[serde(default)]
            params: Option<Box<RawValue>>,
        }

        let wire = Wire::deserialize(deserializer)?;
        wire.jsonrpc
            .ok_or_else(|| de::Error::custom("field jsonrpc in request: required"))?;
        let id = wire
            .id
            .ok_or_else(|| de::Error::custom("field id in request: required"))?;
        let method = wire
            .method
            .ok_or_else(|| de::Error::custom("field method in request: required"))?;
        if method.is_empty() {
            return Err(de::Error::custom("field method in request: must not be empty"));
        }
        Ok(Request {
            jsonrpc: Version,
            id,
            method,
            params: wire.params,
        })
    }
}
