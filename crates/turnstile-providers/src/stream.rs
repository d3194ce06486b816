//! Plumbing shared by every adapter: chunk ids, SSE framing and HTTP error
//! mapping.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use turnstile_core::Error;

/// Hands out chunk ids for one completion stream, one per emitted chunk.
#[derive(Debug, Default, Clone)]
pub struct ChunkIds {
    next: u64,
}

impl ChunkIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }

    /// Number of ids issued so far.
    pub fn issued(&self) -> u64 {
        self.next
    }
}

/// Splits a raw `text/event-stream` body into event data payloads.
///
/// Bytes may end mid-character or mid-event; whatever is incomplete is kept
/// for the next push. Comment lines and non-data fields are dropped.
#[derive(Debug, Default)]
pub(crate) struct SseFramer {
    buffer: String,
    undecoded: Vec<u8>,
}

impl SseFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns the data of every event completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.undecoded.extend_from_slice(bytes);
        let valid = match std::str::from_utf8(&self.undecoded) {
            Ok(text) => text.len(),
            Err(e) => e.valid_up_to(),
        };
        let decoded: Vec<u8> = self.undecoded.drain(..valid).collect();
        self.buffer.push_str(&String::from_utf8_lossy(&decoded));
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        let mut events = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..end + 2).collect();
            if let Some(data) = event_data(&block) {
                events.push(data);
            }
        }
        events
    }

    /// Data of a trailing event that never got its blank line.
    pub fn finish(&mut self) -> Option<String> {
        let block = std::mem::take(&mut self.buffer);
        event_data(&block)
    }
}

fn event_data(block: &str) -> Option<String> {
    let lines: Vec<&str> = block
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.strip_prefix(' ').unwrap_or(data))
        .collect();
    (!lines.is_empty()).then(|| lines.join("\n"))
}

/// Map a non-success HTTP response onto a transport error.
pub(crate) fn http_error(status: u16, body: &str) -> Error {
    #[derive(Deserialize)]
    struct ErrorResponse {
        error: ErrorDetail,
    }

    #[derive(Deserialize)]
    struct ErrorDetail {
        message: String,
    }

    let message = serde_json::from_str::<ErrorResponse>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.to_string());

    match status {
        401 | 403 => Error::auth(message),
        429 => Error::rate_limit(message),
        _ => Error::api(status, message),
    }
}

/// Client configured for unbuffered SSE reads.
pub(crate) fn streaming_client() -> Client {
    // HTTP/1.1 without decompression; both can make the body arrive in one piece.
    Client::builder()
        .http1_only()
        .no_gzip()
        .no_brotli()
        .no_deflate()
        .connect_timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_else(|_| Client::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_ids_advance_by_one() {
        let mut ids = ChunkIds::new();
        assert_eq!(ids.next_id(), 0);
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.issued(), 2);
    }

    #[test]
    fn test_framer_splits_events_across_pushes() {
        let mut framer = SseFramer::new();
        assert!(framer.push(b"data: {\"a\":").is_empty());
        let events = framer.push(b"1}\n\ndata: [DONE]\n\n");
        assert_eq!(events, vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn test_framer_handles_crlf_and_comments() {
        let mut framer = SseFramer::new();
        let events = framer.push(b": OPENROUTER PROCESSING\r\n\r\nevent: x\r\ndata: one\r");
        assert!(events.is_empty());
        let events = framer.push(b"\n\r\n");
        assert_eq!(events, vec!["one".to_string()]);
    }

    #[test]
    fn test_framer_keeps_split_utf8() {
        let mut framer = SseFramer::new();
        let bytes = "data: héllo\n\n".as_bytes();
        // Split inside the two-byte 'é'.
        assert!(framer.push(&bytes[..8]).is_empty());
        assert_eq!(framer.push(&bytes[8..]), vec!["héllo".to_string()]);
    }

    #[test]
    fn test_framer_finish_returns_trailing_event() {
        let mut framer = SseFramer::new();
        assert!(framer.push(b"data: tail").is_empty());
        assert_eq!(framer.finish().as_deref(), Some("tail"));
        assert_eq!(framer.finish(), None);
    }

    #[test]
    fn test_http_error_mapping() {
        let body = r#"{"error":{"message":"bad key","type":"auth"}}"#;
        assert!(matches!(http_error(401, body), Error::Auth(m) if m == "bad key"));
        assert!(matches!(http_error(429, "slow down"), Error::RateLimit(_)));
        assert!(matches!(
            http_error(500, "boom"),
            Error::Api { status: 500, .. }
        ));
    }
}
