//! Framers adapt a raw JSON payload into the on-wire frame of a transport.

use std::sync::Arc;

use serde::Serialize;
use serde_json::value::RawValue;

/// User-supplied framing function.
pub type CustomFramer = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// The framing applied by a session before writing.
#[derive(Clone, Default)]
pub enum Framer {
    /// One JSON message per line; the client reader relies on a trailing
    /// newline as the delimiter.
    #[default]
    LineJson,
    /// `event: message\ndata: <payload>\n\n`. When SSE mode is enabled on the
    /// session, the session additionally prepends `id: <seq>\n`.
    Sse,
    /// One line of `{"id":<seq>,"data":<payload>}` so the stream can be
    /// resumed with `Last-Event-ID`.
    NdjsonEnvelope,
    Custom(CustomFramer),
}

impl std::fmt::Debug for Framer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Framer::LineJson => f.write_str("LineJson"),
            Framer::Sse => f.write_str("Sse"),
            Framer::NdjsonEnvelope => f.write_str("NdjsonEnvelope"),
            Framer::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl Framer {
    /// Whether this framer consumes the session sequence itself.
    pub fn consumes_sequence(&self) -> bool {
        matches!(self, Framer::NdjsonEnvelope)
    }

    pub fn frame(&self, seq: u64, payload: &[u8]) -> Vec<u8> {
        match self {
            Framer::LineJson => frame_line(payload),
            Framer::Sse => frame_sse(payload),
            Framer::NdjsonEnvelope => frame_ndjson(seq, payload),
            Framer::Custom(f) => f(payload),
        }
    }
}

fn frame_line(payload: &[u8]) -> Vec<u8> {
    if payload.is_empty() {
        return vec![b'\n'];
    }
    if payload.ends_with(b"\n") {
        return payload.to_vec();
    }
    let mut framed = Vec::with_capacity(payload.len() + 1);
    framed.extend_from_slice(payload);
    framed.push(b'\n');
    framed
}

fn frame_sse(payload: &[u8]) -> Vec<u8> {
    let trimmed = String::from_utf8_lossy(payload);
    format!("event: message\ndata: {}\n\n", trimmed.trim()).into_bytes()
}

fn frame_ndjson(seq: u64, payload: &[u8]) -> Vec<u8> {
    #[derive(Serialize)]
    struct Envelope<'a> {
        id: u64,
        data: &'a RawValue,
    }

    let trimmed = String::from_utf8_lossy(payload).trim().to_string();
    let mut framed = match RawValue::from_string(trimmed) {
        Ok(raw) => serde_json::to_vec(&Envelope {
            id: seq,
            data: &raw,
        })
        .unwrap_or_else(|_| format!("{{\"id\":{seq},\"data\":null}}").into_bytes()),
        // payload was not valid JSON; carry it as a string so the line stays parseable
        Err(_) => {
            let text = String::from_utf8_lossy(payload).trim().to_string();
            serde_json::to_vec(&serde_json::json!({ "id": seq, "data": text }))
                .unwrap_or_else(|_| format!("{{\"id\":{seq},\"data\":null}}").into_bytes())
        }
    };
    framed.push(b'\n');
    framed
}
