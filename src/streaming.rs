//! Buffered decoder for line-framed streaming responses.
//!
//! Handles the case where a JSON line or SSE event is split across TCP chunk
//! boundaries, which is routine with streaming completion endpoints.

use serde_json::Value;

/// Buffered decoder for newline-delimited JSON streams, with SSE framing
/// support (`data: {...}` lines; the `[DONE]` sentinel is skipped).
///
/// Accumulates raw bytes, splits on newline boundaries, and yields complete
/// JSON values.
///
/// # Example
///
/// ```
/// use inferchain::streaming::StreamDecoder;
///
/// let mut decoder = StreamDecoder::new();
///
/// // First chunk: partial JSON
/// let values = decoder.decode(b"{\"delta\":");
/// assert!(values.is_empty());
///
/// // Second chunk: completes the line
/// let values = decoder.decode(b"\"hello\"}\n");
/// assert_eq!(values.len(), 1);
/// assert_eq!(values[0]["delta"], "hello");
/// ```
pub struct StreamDecoder {
    buffer: String,
}

impl StreamDecoder {
    /// Create a new empty decoder.
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    /// Feed a raw chunk and return any complete JSON values.
    ///
    /// Incomplete lines are buffered until the next chunk arrives. Lines
    /// that are neither JSON nor `data:`-prefixed JSON are skipped.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Value> {
        let text = String::from_utf8_lossy(chunk);
        self.buffer.push_str(&text);

        let mut values = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            if let Some(val) = Self::parse_line(line.trim()) {
                values.push(val);
            }
        }
        values
    }

    /// Flush remaining buffer content after the stream ends, handling a
    /// trailing line not terminated by a newline.
    pub fn flush(&mut self) -> Option<Value> {
        let remaining = self.buffer.trim().to_string();
        self.buffer.clear();
        Self::parse_line(&remaining)
    }

    fn parse_line(line: &str) -> Option<Value> {
        if line.is_empty() {
            return None;
        }
        let payload = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
        if payload == "[DONE]" {
            return None;
        }
        serde_json::from_str::<Value>(payload).ok()
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_complete_lines() {
        let mut decoder = StreamDecoder::new();
        let values = decoder.decode(b"{\"delta\":\"hello\"}\n{\"delta\":\"world\"}\n");
        assert_eq!(values.len(), 2);
        assert_eq!(values[0]["delta"], "hello");
        assert_eq!(values[1]["delta"], "world");
    }

    #[test]
    fn test_split_across_chunks() {
        let mut decoder = StreamDecoder::new();
        assert!(decoder.decode(b"{\"delta\":").is_empty());
        let values = decoder.decode(b"\"hello\"}\n");
        assert_eq!(values.len(), 1);
        assert_eq!(values[0]["delta"], "hello");
    }

    #[test]
    fn test_split_mid_value() {
        let mut decoder = StreamDecoder::new();
        assert!(decoder.decode(b"{\"delta\":\"hel").is_empty());
        assert!(decoder.decode(b"lo wor").is_empty());
        let values = decoder.decode(b"ld\"}\n");
        assert_eq!(values.len(), 1);
        assert_eq!(values[0]["delta"], "hello world");
    }

    #[test]
    fn test_sse_framing() {
        let mut decoder = StreamDecoder::new();
        let values = decoder.decode(b"data: {\"delta\":\"a\"}\n\ndata: [DONE]\n");
        assert_eq!(values.len(), 1);
        assert_eq!(values[0]["delta"], "a");
    }

    #[test]
    fn test_flush_remaining() {
        let mut decoder = StreamDecoder::new();
        decoder.decode(b"{\"done\":true}");
        let flushed = decoder.flush();
        assert_eq!(flushed.unwrap()["done"], json!(true));
        assert!(decoder.flush().is_none());
    }

    #[test]
    fn test_non_json_lines_skipped() {
        let mut decoder = StreamDecoder::new();
        let values = decoder.decode(b"not json\n{\"ok\":true}\ngarbage\n");
        assert_eq!(values.len(), 1);
        assert_eq!(values[0]["ok"], json!(true));
    }

    #[test]
    fn test_empty_chunks() {
        let mut decoder = StreamDecoder::new();
        assert!(decoder.decode(b"").is_empty());
        assert!(decoder.decode(b"\n\n").is_empty());
    }
}
