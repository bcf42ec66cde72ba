//! Incremental SSE frame parser over a chunked byte stream.

/// One parsed SSE event. `data` holds the last `data:` line of the frame;
/// tether servers emit single-line JSON payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    fn is_empty(&self) -> bool {
        self.id.is_none() && self.event.is_none() && self.data.is_empty()
    }
}

/// Feed chunks in as they arrive; complete events (terminated by a blank
/// line) come out. Comment lines (leading `:`, e.g. keepalives) are ignored.
#[derive(Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    current: SseEvent,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.current.is_empty() {
                    events.push(std::mem::take(&mut self.current));
                }
                continue;
            }
            if let Some(rest) = line.strip_prefix("id:") {
                self.current.id = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("event:") {
                self.current.event = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.current.data = rest.trim().to_string();
            }
            // anything else (comments included) is skipped
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_frames() {
        let mut parser = SseParser::new();
        let events =
            parser.push(b"id: 3\nevent: message\ndata: {\"jsonrpc\":\"2.0\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id.as_deref(), Some("3"));
        assert_eq!(events[0].event.as_deref(), Some("message"));
        assert_eq!(events[0].data, "{\"jsonrpc\":\"2.0\"}");
    }

    #[test]
    fn handles_split_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"event: end").is_empty());
        assert!(parser.push(b"point\ndata: /message?session_id=").is_empty());
        let events = parser.push(b"abc\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("endpoint"));
        assert_eq!(events[0].data, "/message?session_id=abc");
    }

    #[test]
    fn skips_keepalive_comments() {
        let mut parser = SseParser::new();
        let events = parser.push(b": keepalive\n\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let mut parser = SseParser::new();
        let events = parser.push(b"id: 1\ndata: a\n\nid: 2\ndata: b\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].id.as_deref(), Some("2"));
    }

    #[test]
    fn crlf_lines_are_tolerated() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: y\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "y");
    }
}
