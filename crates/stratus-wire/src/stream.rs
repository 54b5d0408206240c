// Incremental decoder for the server-push text stream.
//
// Bytes arrive in arbitrary chunks; the decoder buffers until it sees a line
// terminator, applies the line to the frame being accumulated, and emits the
// frame on a blank line.
use bytes::{Buf, BytesMut};

use crate::{Error, Result};

/// Event name assigned to frames that carry no `event:` field.
pub const DEFAULT_EVENT: &str = "message";

/// Reserved event name the server sends once the stream is established.
pub const CONNECT_EVENT: &str = "PB_CONNECT";

/// One discrete server-pushed unit.
///
/// ```
/// use stratus_wire::StreamDecoder;
///
/// let mut decoder = StreamDecoder::new(1024);
/// decoder.push(b"event: topic1\ndata: {\"x\":1}\n\n");
/// let frame = decoder.next_frame().expect("decode").expect("frame");
/// assert_eq!(frame.event, "topic1");
/// assert_eq!(frame.data, "{\"x\":1}");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub event: String,
    pub data: String,
    pub id: String,
}

impl Default for StreamFrame {
    fn default() -> Self {
        Self {
            event: DEFAULT_EVENT.to_string(),
            data: String::new(),
            id: String::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Accumulator {
    frame: StreamFrame,
    data_lines: usize,
    // Set once any field line lands; a blank line with nothing accumulated emits nothing.
    touched: bool,
}

impl Accumulator {
    fn apply(&mut self, field: &str, value: &str) {
        match field {
            "event" => self.frame.event = value.to_string(),
            "data" => {
                if self.data_lines > 0 {
                    self.frame.data.push('\n');
                }
                self.frame.data.push_str(value);
                self.data_lines += 1;
            }
            "id" => self.frame.id = value.to_string(),
            _ => return,
        }
        self.touched = true;
    }

    fn take(&mut self) -> Option<StreamFrame> {
        let done = std::mem::take(self);
        done.touched.then_some(done.frame)
    }
}

/// Line-oriented frame decoder.
///
/// The decoder is per connection: a reconnect starts a fresh decoder so a
/// half-received frame never leaks across epochs.
#[derive(Debug)]
pub struct StreamDecoder {
    buffer: BytesMut,
    current: Accumulator,
    max_line_bytes: usize,
    // Bytes at the front of `buffer` already known to hold no line terminator.
    scanned: usize,
}

impl StreamDecoder {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            current: Accumulator::default(),
            max_line_bytes: max_line_bytes.max(1),
            scanned: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Returns the next complete frame, or `None` when more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<StreamFrame>> {
        while let Some(end) = self.find_line_end() {
            self.scanned = 0;
            let mut line = self.buffer.split_to(end + 1);
            line.truncate(end);
            if line.last() == Some(&b'\r') {
                line.truncate(end - 1);
            }
            if end > self.max_line_bytes {
                return Err(Error::LineTooLong {
                    limit: self.max_line_bytes,
                });
            }
            if let Some(frame) = self.apply_line(&line) {
                return Ok(Some(frame));
            }
        }
        self.scanned = self.buffer.len();
        if self.buffer.len() > self.max_line_bytes {
            let limit = self.max_line_bytes;
            self.buffer.advance(self.buffer.len());
            self.scanned = 0;
            return Err(Error::LineTooLong { limit });
        }
        Ok(None)
    }

    fn find_line_end(&self) -> Option<usize> {
        self.buffer[self.scanned..]
            .iter()
            .position(|byte| *byte == b'\n')
            .map(|offset| self.scanned + offset)
    }

    fn apply_line(&mut self, line: &[u8]) -> Option<StreamFrame> {
        if line.is_empty() {
            return self.current.take();
        }
        if line[0] == b':' {
            return None;
        }
        let line = String::from_utf8_lossy(line);
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_ref(), ""),
        };
        self.current.apply(field, value);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(decoder: &mut StreamDecoder) -> Vec<StreamFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = decoder.next_frame().expect("decode") {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn decodes_connect_then_topic_frame() {
        let mut decoder = StreamDecoder::new(1024);
        decoder.push(b"event:PB_CONNECT\ndata:{\"clientId\":\"abc\"}\n\n");
        decoder.push(b"event:topic1\ndata:{\"x\":1}\n\n");
        let frames = drain(&mut decoder);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event, CONNECT_EVENT);
        assert_eq!(frames[0].data, "{\"clientId\":\"abc\"}");
        assert_eq!(frames[1].event, "topic1");
        assert_eq!(frames[1].data, "{\"x\":1}");
    }

    #[test]
    fn joins_data_lines_and_handles_crlf() {
        let mut decoder = StreamDecoder::new(1024);
        decoder.push(b"data: first\r\ndata: second\r\nid: 7\r\n\r\n");
        let frames = drain(&mut decoder);
        assert_eq!(
            frames,
            vec![StreamFrame {
                event: DEFAULT_EVENT.to_string(),
                data: "first\nsecond".to_string(),
                id: "7".to_string(),
            }]
        );
    }

    #[test]
    fn frames_split_across_chunks() {
        let mut decoder = StreamDecoder::new(1024);
        decoder.push(b"event: up");
        assert!(decoder.next_frame().expect("decode").is_none());
        decoder.push(b"dates\ndata: {\"a\"");
        assert!(decoder.next_frame().expect("decode").is_none());
        decoder.push(b":2}\n");
        assert!(decoder.next_frame().expect("decode").is_none());
        decoder.push(b"\n");
        let frame = decoder.next_frame().expect("decode").expect("frame");
        assert_eq!(frame.event, "updates");
        assert_eq!(frame.data, "{\"a\":2}");
    }

    #[test]
    fn comments_and_unknown_fields_are_ignored() {
        let mut decoder = StreamDecoder::new(1024);
        decoder.push(b": keepalive\n\n");
        decoder.push(b"retry: 1000\nfoo: bar\nevent: t\ndata: x\n\n");
        let frames = drain(&mut decoder);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "t");
        assert_eq!(frames[0].data, "x");
    }

    #[test]
    fn blank_line_resets_defaults() {
        let mut decoder = StreamDecoder::new(1024);
        decoder.push(b"event: a\nid: 1\ndata: one\n\ndata: two\n\n");
        let frames = drain(&mut decoder);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].event, DEFAULT_EVENT);
        assert_eq!(frames[1].id, "");
        assert_eq!(frames[1].data, "two");
    }

    #[test]
    fn only_first_space_after_colon_is_stripped() {
        let mut decoder = StreamDecoder::new(1024);
        decoder.push(b"data:  padded\n\n");
        let frame = decoder.next_frame().expect("decode").expect("frame");
        assert_eq!(frame.data, " padded");
    }

    #[test]
    fn overlong_line_is_rejected() {
        let mut decoder = StreamDecoder::new(8);
        decoder.push(b"data: 0123456789");
        assert!(matches!(
            decoder.next_frame(),
            Err(Error::LineTooLong { limit: 8 })
        ));
    }

    #[test]
    fn partial_line_is_scanned_once() {
        let mut decoder = StreamDecoder::new(1024);
        for byte in b"data: abcdef" {
            decoder.push(&[*byte]);
            assert!(decoder.next_frame().expect("decode").is_none());
            assert_eq!(decoder.scanned, decoder.buffer.len());
        }
        decoder.push(b"\n\nevent: next");
        let frame = decoder.next_frame().expect("decode").expect("frame");
        assert_eq!(frame.data, "abcdef");
        assert_eq!(decoder.scanned, 0);
        assert!(decoder.next_frame().expect("decode").is_none());
        assert_eq!(decoder.scanned, "event: next".len());
    }
}
