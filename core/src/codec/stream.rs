//! Newline-delimited JSON framing used on the partner-station link.

use log::warn;
use serde::Serialize;
use serde_json::Value;

use crate::prelude::LinkResult;

const DELIMITER: u8 = b'\n';
const DEFAULT_MAX_PENDING: usize = 64 * 1024;

/// Serializes one message followed by a single `\n`.
pub fn encode_message<T: Serialize + ?Sized>(message: &T) -> LinkResult<Vec<u8>> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(DELIMITER);
    Ok(bytes)
}

/// Splits a buffer into complete JSON messages and the unterminated remainder.
///
/// Segments that are blank or fail to parse are dropped without affecting the
/// rest of the buffer.
pub fn decode_stream(buffer: &[u8]) -> (Vec<Value>, Vec<u8>) {
    let (complete, remainder) = match buffer.iter().rposition(|&b| b == DELIMITER) {
        Some(last) => (&buffer[..last], &buffer[last + 1..]),
        None => return (Vec::new(), buffer.to_vec()),
    };

    let messages = complete
        .split(|&b| b == DELIMITER)
        .filter_map(parse_segment)
        .collect();
    (messages, remainder.to_vec())
}

fn parse_segment(segment: &[u8]) -> Option<Value> {
    if segment.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    match serde_json::from_slice(segment) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(
                "dropping undecodable message ({}): {:?}",
                err,
                String::from_utf8_lossy(segment)
            );
            None
        }
    }
}

/// Accumulates socket reads and yields complete messages.
///
/// An unterminated tail longer than the limit is discarded.
#[derive(Debug)]
pub struct StreamDecoder {
    pending: Vec<u8>,
    max_pending: usize,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_PENDING)
    }
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_pending: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_pending,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.pending.extend_from_slice(chunk);
        let (messages, remainder) = decode_stream(&self.pending);
        if remainder.len() > self.max_pending {
            warn!(
                "discarding {} bytes of unterminated message data",
                remainder.len()
            );
            self.pending.clear();
        } else {
            self.pending = remainder;
        }
        messages
    }

    /// Bytes of the incomplete trailing segment.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encoded_message_has_single_terminator() {
        let bytes = encode_message(&json!({"cmd": "abort"})).unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
        assert_eq!(bytes.iter().filter(|&&b| b == b'\n').count(), 1);
    }

    #[test]
    fn complete_message_and_partial_tail_are_separated() {
        let message = json!({"telemetry": {"altitude": 1200.5}, "timestamp": "t"});
        let partial = br#"{"telemetry": {"alt"#;
        let mut buffer = encode_message(&message).unwrap();
        buffer.extend_from_slice(partial);

        let (messages, remainder) = decode_stream(&buffer);
        assert_eq!(messages, vec![message]);
        assert_eq!(remainder, partial.to_vec());
    }

    #[test]
    fn bad_segment_does_not_discard_neighbours() {
        let buffer = b"{\"a\":1}\nnot json\n\n{\"b\":2}\n{\"c\"";
        let (messages, remainder) = decode_stream(buffer);
        assert_eq!(messages, vec![json!({"a": 1}), json!({"b": 2})]);
        assert_eq!(remainder, b"{\"c\"".to_vec());
    }

    #[test]
    fn decoder_reassembles_split_messages() {
        let mut decoder = StreamDecoder::new();
        assert!(decoder.feed(b"{\"cmd\":").is_empty());
        assert_eq!(decoder.pending(), b"{\"cmd\":");
        let messages = decoder.feed(b"\"abort\"}\n{\"x\"");
        assert_eq!(messages, vec![json!({"cmd": "abort"})]);
        assert_eq!(decoder.pending(), b"{\"x\"");
    }

    #[test]
    fn decoder_drops_tail_past_the_limit() {
        let mut decoder = StreamDecoder::with_limit(8);
        let messages = decoder.feed(b"{\"a\":1}\n{\"padding\":");
        assert_eq!(messages, vec![json!({"a": 1})]);
        assert!(decoder.pending().is_empty());

        let messages = decoder.feed(b"{\"b\":2}\n");
        assert_eq!(messages, vec![json!({"b": 2})]);
    }
}
