//! Line-delimited JSON decoding
//!
//! Turns raw transport bytes into typed [`StreamEvent`]s. Each line is one
//! JSON object with a `type` discriminator; SSE-style `data: ` prefixes are
//! accepted so the same decoder works behind either transport.

use thiserror::Error;
use tracing::{debug, info, warn};

use super::event::StreamEvent;

/// End-of-stream marker some backends emit instead of a `finish` event
const DONE_MARKER: &str = "[DONE]";

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed JSON line: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown event type: {0}")]
    UnknownType(String),
}

/// Incremental decoder that keeps the partial line between chunks
#[derive(Debug, Default)]
pub struct WireDecoder {
    /// Bytes of the unfinished line from previous chunks
    partial_line: Vec<u8>,
    /// Lines decoded so far, for logging
    line_count: usize,
    /// Bytes received counter
    bytes_received: usize,
}

impl WireDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning the decode result of every complete line
    pub fn push_chunk(&mut self, bytes: &[u8]) -> Vec<Result<StreamEvent, WireError>> {
        self.bytes_received += bytes.len();
        self.partial_line.extend_from_slice(bytes);
        debug!(
            "Wire chunk received: {} bytes (total: {} bytes)",
            bytes.len(),
            self.bytes_received
        );

        // Split on raw bytes so a char cut between chunks stays intact
        let Some(last_newline) = self.partial_line.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };
        let rest = self.partial_line.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial_line, rest);

        String::from_utf8_lossy(&complete)
            .lines()
            .filter_map(|line| self.decode_line(line))
            .collect()
    }

    /// Decode whatever is left in the buffer once the transport closes
    pub fn finish(&mut self) -> Option<Result<StreamEvent, WireError>> {
        let rest = std::mem::take(&mut self.partial_line);
        let rest = String::from_utf8_lossy(&rest);
        info!(
            "Wire decoder finishing: {} lines, {} bytes total",
            self.line_count, self.bytes_received
        );
        self.decode_line(&rest)
    }

    /// Decode a single line; blank lines and SSE comments yield `None`
    pub fn decode_line(&mut self, line: &str) -> Option<Result<StreamEvent, WireError>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with(':') {
            return None;
        }
        let data = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
        if data.is_empty() {
            return None;
        }
        self.line_count += 1;

        if data == DONE_MARKER {
            debug!("Wire [DONE] marker after {} lines", self.line_count);
            return Some(Ok(StreamEvent::Finish));
        }

        Some(decode_event(data))
    }
}

/// Decode one JSON payload into an event
pub fn decode_event(data: &str) -> Result<StreamEvent, WireError> {
    let value: serde_json::Value = serde_json::from_str(data)?;
    let event_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or("unknown")
        .to_string();

    serde_json::from_value::<StreamEvent>(value).map_err(|e| {
        if e.to_string().contains("unknown variant") {
            WireError::UnknownType(event_type)
        } else {
            warn!("Failed to decode '{}' event: {}", event_type, e);
            WireError::Json(e)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_lines_across_chunks() {
        let mut decoder = WireDecoder::new();

        let first = decoder.push_chunk(b"{\"type\":\"content\",\"text\":\"He");
        assert!(first.is_empty());

        let second = decoder.push_chunk(b"llo\"}\n{\"type\":\"finish\"}\n");
        assert_eq!(second.len(), 2);
        assert_eq!(
            *second[0].as_ref().unwrap(),
            StreamEvent::Content {
                text: "Hello".to_string()
            }
        );
        assert_eq!(*second[1].as_ref().unwrap(), StreamEvent::Finish);
    }

    #[test]
    fn test_multibyte_char_split_between_chunks() {
        let mut decoder = WireDecoder::new();
        let line = "{\"type\":\"content\",\"text\":\"caf\u{e9}\"}\n".as_bytes();
        // Cut inside the two-byte 'é'
        let cut = line.len() - 4;
        assert!(decoder.push_chunk(&line[..cut]).is_empty());
        let events = decoder.push_chunk(&line[cut..]);
        assert_eq!(
            *events[0].as_ref().unwrap(),
            StreamEvent::Content {
                text: "caf\u{e9}".to_string()
            }
        );
    }

    #[test]
    fn test_sse_prefix_and_done_marker() {
        let mut decoder = WireDecoder::new();
        let events = decoder.push_chunk(
            b": keep-alive\n\ndata: {\"type\":\"reasoning\",\"text\":\"hmm\"}\ndata: [DONE]\n",
        );
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0].as_ref().unwrap(),
            StreamEvent::Reasoning { .. }
        ));
        assert_eq!(*events[1].as_ref().unwrap(), StreamEvent::Finish);
    }

    #[test]
    fn test_unknown_type_is_reported() {
        let err = decode_event(r#"{"type":"telemetry","x":1}"#).unwrap_err();
        assert!(matches!(err, WireError::UnknownType(ref t) if t == "telemetry"));

        let err = decode_event("{not json").unwrap_err();
        assert!(matches!(err, WireError::Json(_)));
    }

    #[test]
    fn test_finish_flushes_trailing_line() {
        let mut decoder = WireDecoder::new();
        assert!(decoder
            .push_chunk(b"{\"type\":\"status_update\",\"stage\":\"searching\"}")
            .is_empty());
        let last = decoder.finish().unwrap().unwrap();
        assert_eq!(
            last,
            StreamEvent::StatusUpdate {
                stage: "searching".to_string()
            }
        );
        assert!(decoder.finish().is_none());
    }
}
