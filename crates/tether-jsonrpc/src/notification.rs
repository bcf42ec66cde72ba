use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::CodecError;
use crate::types::Version;

/// A JSON-RPC notification: a method invocation with no reply.
///
/// The presence of an `id` field on the wire is a decode failure; an envelope
/// with both `method` and `id` is a [`crate::Request`].
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub jsonrpc: Version,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Box<RawValue>>,
}

impl Notification {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: Version,
            method: method.into(),
            params: None,
        }
    }

    pub fn with_params<P: Serialize>(
        method: impl Into<String>,
        params: &P,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            jsonrpc: Version,
            method: method.into(),
            params: Some(serde_json::value::to_raw_value(params)?),
        })
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn params_as<'a, P: Deserialize<'a>>(&'a self) -> Result<P, CodecError> {
        let raw = self
            .params
            .as_deref()
            .map(RawValue::get)
            .unwrap_or("null");
        Ok(serde_json::from_str(raw)?)
    }
}

impl<'de> Deserialize<'de> for Notification {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Wire {
            jsonrpc: Option<Version>,
            method: Option<String>,
            #[serde(default)]
            params: Option<Box<RawValue>>,
            #[serde(default)]
            id: Option<serde_json::Value>,
        }

        let wire = Wire::deserialize(deserializer)?;
        if wire.id.is_some() {
            return Err(de::Error::custom("field id in notification: not allowed"));
        }
        wire.jsonrpc
            .ok_or_else(|| de::Error::custom("field jsonrpc in notification: required"))?;
        let method = wire
            .method
            .ok_or_else(|| de::Error::custom("field method in notification: required"))?;
        if method.is_empty() {
            return Err(de::Error::custom(
                "field method in notification: must not be empty",
            ));
        }
        Ok(Notification {
            jsonrpc: Version,
            method,
            params: wire.params,
        })
    }
}
