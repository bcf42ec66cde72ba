use serde::de::{self, Deserializer};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::value::RawValue;

use crate::error::{CodecError, ErrorObject};
use crate::types::{RequestId, Version};

/// A JSON-RPC response echoing a request id.
///
/// Exactly one of `result` and `error` is meaningful. Decoding an envelope
/// with neither fails; encoding an envelope that carries an error omits the
/// `result` field entirely.
#[derive(Debug, Clone)]
pub struct Response {
    pub jsonrpc: Version,
    pub id: RequestId,
    pub result: Option<Box<RawValue>>,
    pub error: Option<ErrorObject>,
}

impl Response {
    /// Creates an empty success response for the given request id. The
    /// dispatcher hands this to the user handler to fill in.
    pub fn new(id: RequestId) -> Self {
        Self {
            jsonrpc: Version,
            id,
            result: None,
            error: None,
        }
    }

    /// Creates a success response with a pre-serialised result.
    pub fn with_result<R: Serialize>(id: RequestId, result: &R) -> Result<Self, CodecError> {
        Ok(Self {
            jsonrpc: Version,
            id,
            result: Some(serde_json::value::to_raw_value(result)?),
            error: None,
        })
    }

    /// Creates an error response.
    pub fn with_error(id: RequestId, error: ErrorObject) -> Self {
        Self {
            jsonrpc: Version,
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Sets the result, serialising in place. Clears any previous error.
    pub fn set_result<R: Serialize>(&mut self, result: &R) -> Result<(), CodecError> {
        self.result = Some(serde_json::value::to_raw_value(result)?);
        self.error = None;
        Ok(())
    }

    /// Sets the error. The `result` field is omitted on serialisation.
    pub fn set_error(&mut self, error: ErrorObject) {
        self.error = Some(error);
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Decodes the raw `result` into a concrete type.
    pub fn result_as<'a, R: Deserialize<'a>>(&'a self) -> Result<R, CodecError> {
        let raw = self
            .result
            .as_deref()
            .map(RawValue::get)
            .unwrap_or("null");
        Ok(serde_json::from_str(raw)?)
    }
}

impl Serialize for Response {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut st = serializer.serialize_struct("Response", 3)?;
        st.serialize_field("jsonrpc", &self.jsonrpc)?;
        st.serialize_field("id", &self.id)?;
        if let Some(error) = &self.error {
            // result and error are mutually exclusive on the wire
            st.serialize_field("error", error)?;
        } else if let Some(result) = &self.result {
            st.serialize_field("result", result)?;
        } else {
            st.serialize_field("result", &serde_json::Value::Null)?;
        }
        st.end()
    }
}

impl<'de> Deserialize<'de> for Response {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Wire {
            jsonrpc: Option<Version>,
            id: Option<RequestId>,
            #[serde(default, deserialize_with = "raw_keeping_null")]
            result: Option<Box<RawValue>>,
            #[serde(default)]
            error: Option<ErrorObject>,
        }

        let wire = Wire::deserialize(deserializer)?;
        wire.jsonrpc
            .ok_or_else(|| de::Error::custom("field jsonrpc in response: required"))?;
        let id = wire
            .id
            .ok_or_else(|| de::Error::custom("field id in response: required"))?;
        if wire.result.is_none() && wire.error.is_none() {
            return Err(de::Error::custom(
                "response requires one of result or error",
            ));
        }
        Ok(Response {
            jsonrpc: Version,
            id,
            result: wire.result,
            error: wire.error,
        })
    }
}

/// Deserialises `result` preserving an explicit JSON `null` as raw `"null"`,
/// so `{"result":null}` stays a valid void response rather than reading as an
/// absent field.
fn raw_keeping_null<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Box<RawValue>>, D::Error> {
    Box::<RawValue>::deserialize(deserializer).map(Some)
}
