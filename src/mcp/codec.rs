//! Newline-delimited JSON-RPC framing.
//!
//! The stdio transport carries one UTF-8 JSON object per line:
//!
//! - Messages are delimited by `\n` (a trailing `\r` is tolerated)
//! - Messages must not contain embedded newlines
//! - A message is only yielded once its delimiter has arrived
//!
//! A line that is not a valid message is yielded as [`Frame::Malformed`]
//! instead of an error, so the decoder resynchronises on the next delimiter
//! and later valid frames are never lost.

use std::io;

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::mcp::protocol::{parse_message, FrameError, Message};

/// Largest frame accepted before the decoder starts discarding (16 MiB).
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// How much of a malformed line is kept for diagnostics.
const MALFORMED_PREVIEW_LEN: usize = 200;

/// One decoded unit of the frame stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A well-formed JSON-RPC message.
    Message(Message),
    /// A delimited unit that is not a valid message.
    Malformed(MalformedFrame),
}

/// A line that could not be decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedFrame {
    /// The start of the offending line (lossy UTF-8, truncated).
    pub preview: String,
    /// Why it was rejected.
    pub error: FrameError,
}

/// Stateful line codec for JSON-RPC messages.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    /// Offset already scanned for a delimiter in the current buffer.
    next_index: usize,
    /// Maximum frame length.
    max_length: usize,
    /// Set while skipping the remainder of an oversized frame.
    discarding: bool,
}

impl FrameCodec {
    /// Creates a codec with the default frame length limit.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_max_length(MAX_FRAME_LENGTH)
    }

    /// Creates a codec with a custom frame length limit.
    #[must_use]
    pub const fn with_max_length(max_length: usize) -> Self {
        Self {
            next_index: 0,
            max_length,
            discarding: false,
        }
    }

    fn oversized(&self, preview: String) -> Frame {
        Frame::Malformed(MalformedFrame {
            preview,
            error: FrameError::Syntax(format!("frame exceeds {} bytes", self.max_length)),
        })
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialises a message into a newline-terminated frame.
///
/// # Errors
///
/// Returns an error if the message cannot be serialised.
pub fn encode_frame(message: &Message) -> io::Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(&message.to_value())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    // stdio framing forbids embedded newlines
    debug_assert!(
        !bytes.contains(&b'\n'),
        "JSON message must not contain embedded newlines"
    );

    bytes.push(b'\n');
    Ok(bytes)
}

fn decode_line(line: &[u8]) -> Frame {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text,
        Err(e) => {
            return Frame::Malformed(MalformedFrame {
                preview: preview(&String::from_utf8_lossy(line)),
                error: FrameError::Syntax(format!("invalid UTF-8: {e}")),
            })
        }
    };

    match parse_message(text) {
        Ok(message) => Frame::Message(message),
        Err(error) => Frame::Malformed(MalformedFrame {
            preview: preview(text),
            error,
        }),
    }
}

fn preview(text: &str) -> String {
    text.chars().take(MALFORMED_PREVIEW_LEN).collect()
}

fn strip_line_ending(mut line: &[u8]) -> &[u8] {
    if let Some(rest) = line.strip_suffix(b"\n") {
        line = rest;
    }
    line.strip_suffix(b"\r").unwrap_or(line)
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Frame>> {
        loop {
            let Some(offset) = buf[self.next_index..].iter().position(|b| *b == b'\n') else {
                if buf.len() > self.max_length {
                    // Oversized: drop what we have and skip to the next delimiter.
                    buf.clear();
                    self.next_index = 0;
                    self.discarding = true;
                } else {
                    self.next_index = buf.len();
                }
                return Ok(None);
            };

            let end = self.next_index + offset + 1;
            let raw = buf.split_to(end);
            self.next_index = 0;

            if self.discarding {
                self.discarding = false;
                return Ok(Some(self.oversized(String::new())));
            }

            let line = strip_line_ending(&raw);
            if line.len() > self.max_length {
                return Ok(Some(self.oversized(preview(&String::from_utf8_lossy(line)))));
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(decode_line(line)));
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<Frame>> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }

        let truncated = !self.discarding && !buf.iter().all(u8::is_ascii_whitespace);
        let rest = buf.split();
        self.next_index = 0;
        self.discarding = false;

        if truncated {
            return Ok(Some(Frame::Malformed(MalformedFrame {
                preview: preview(&String::from_utf8_lossy(&rest)),
                error: FrameError::Syntax("truncated frame at end of stream".to_string()),
            })));
        }
        Ok(None)
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> io::Result<()> {
        let bytes = encode_frame(&message)?;
        dst.reserve(bytes.len());
        dst.put_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::{JsonRpcRequest, RequestId};
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    fn request(id: i64) -> Message {
        Message::Request(JsonRpcRequest::new(RequestId::Number(id), "ping", None))
    }

    #[test]
    fn encode_appends_single_delimiter() {
        let bytes = encode_frame(&request(1)).unwrap();
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
        assert_eq!(bytes.last(), Some(&b'\n'));
    }

    #[test]
    fn encoded_strings_with_newlines_stay_on_one_line() {
        let message = Message::Request(JsonRpcRequest::new(
            RequestId::Number(1),
            "tools/call",
            Some(serde_json::json!({"text": "line one\nline two"})),
        ));
        let bytes = encode_frame(&message).unwrap();
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[test]
    fn decode_waits_for_delimiter() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&br#"{"jsonrpc":"2.0","id":1,"#[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(br#""method":"ping"}"#);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Message(request(1)))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn malformed_line_does_not_swallow_next_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"this is not json\n");
        buf.extend_from_slice(&encode_frame(&request(2)).unwrap());

        let Some(Frame::Malformed(bad)) = codec.decode(&mut buf).unwrap() else {
            panic!("expected malformed frame");
        };
        assert!(matches!(bad.error, FrameError::Syntax(_)));
        assert_eq!(bad.preview, "this is not json");

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Message(request(2)))
        );
    }

    #[test]
    fn structurally_invalid_message_is_malformed_not_syntax() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"{\"jsonrpc\":\"2.0\",\"id\":3}\n"[..]);
        let Some(Frame::Malformed(bad)) = codec.decode(&mut buf).unwrap() else {
            panic!("expected malformed frame");
        };
        assert!(matches!(bad.error, FrameError::Invalid { .. }));
    }

    #[test]
    fn blank_lines_and_crlf_are_tolerated() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\n   \r\n");
        buf.extend_from_slice(br#"{"jsonrpc":"2.0","id":5,"method":"ping"}"#);
        buf.extend_from_slice(b"\r\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Message(request(5)))
        );
    }

    #[test]
    fn oversized_frame_is_discarded_until_delimiter() {
        let mut codec = FrameCodec::with_max_length(16);
        let mut buf = BytesMut::from(&b"0123456789abcdefghij"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());

        buf.extend_from_slice(b"tail\n");
        let Some(Frame::Malformed(bad)) = codec.decode(&mut buf).unwrap() else {
            panic!("expected malformed frame");
        };
        assert!(bad.error.to_string().contains("exceeds 16 bytes"));

        buf.extend_from_slice(b"{\"jsonrpc\":\"2.0\",\"id\":6,\"method\":\"ping\"}\n");
        let mut codec_with_room = FrameCodec::new();
        assert_eq!(
            codec_with_room.decode(&mut buf).unwrap(),
            Some(Frame::Message(request(6)))
        );
    }

    #[test]
    fn complete_oversized_line_is_malformed() {
        let mut codec = FrameCodec::with_max_length(16);
        let mut buf = BytesMut::from(&b"0123456789abcdefghij\nok\n"[..]);
        let Some(Frame::Malformed(bad)) = codec.decode(&mut buf).unwrap() else {
            panic!("expected malformed frame");
        };
        assert!(bad.error.to_string().contains("exceeds 16 bytes"));
        assert_eq!(bad.preview, "0123456789abcdefghij");
        assert_eq!(&buf[..], b"ok\n");
    }

    #[test]
    fn unterminated_tail_at_eof_is_truncated() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&br#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#[..]);
        let Some(Frame::Malformed(bad)) = codec.decode_eof(&mut buf).unwrap() else {
            panic!("expected truncated frame");
        };
        assert!(bad.error.to_string().contains("truncated"));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[tokio::test]
    async fn framed_read_handles_split_reads() {
        let first = br#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#;
        let mock = tokio_test::io::Builder::new()
            .read(&first[..10])
            .read(&first[10..])
            .read(b"\ngarbage\n{\"jsonrpc\":\"2.0\",")
            .read(b"\"id\":2,\"method\":\"ping\"}\n")
            .build();

        let frames: Vec<Frame> = FramedRead::new(mock, FrameCodec::new())
            .map(|frame| frame.unwrap())
            .collect()
            .await;

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], Frame::Message(request(1)));
        assert!(matches!(frames[1], Frame::Malformed(_)));
        assert_eq!(frames[2], Frame::Message(request(2)));
    }
}
