// Newline-delimited JSON framing over the child's stdio byte streams.

use super::types::Message;
use bytes::BytesMut;
use std::io;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

/// One decoded stdout line
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(Message),
    /// A non-blank line that is not a JSON-RPC message, e.g. a startup banner.
    Text(String),
}

/// Decodes the child's stdout into [`Frame`]s.
///
/// Line splitting is delegated to [`LinesCodec`] with a length cap. Oversized
/// and non-UTF-8 lines are logged and skipped, so the stream never yields an
/// error for bad input and `FramedRead` keeps going.
#[derive(Debug)]
pub struct Framer {
    lines: LinesCodec,
}

impl Framer {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_line_bytes),
        }
    }

    fn next_frame(&mut self, src: &mut BytesMut, eof: bool) -> Option<Frame> {
        loop {
            let line = next_line(&mut self.lines, src, eof)?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match Message::from_slice(trimmed.as_bytes()) {
                Ok(message) => return Some(Frame::Message(message)),
                Err(e) => {
                    debug!("Line from MCP process is not a message: {}", e);
                    return Some(Frame::Text(line));
                }
            }
        }
    }
}

impl Decoder for Framer {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Frame>> {
        Ok(self.next_frame(src, false))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Frame>> {
        Ok(self.next_frame(src, true))
    }
}

/// Length-capped lines of the child's stderr, skipping lines it cannot decode.
#[derive(Debug)]
pub struct LogLines {
    lines: LinesCodec,
}

impl LogLines {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_line_bytes),
        }
    }
}

impl Decoder for LogLines {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<String>> {
        Ok(next_line(&mut self.lines, src, false))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<String>> {
        Ok(next_line(&mut self.lines, src, true))
    }
}

/// Next complete line, dropping oversized and undecodable ones.
///
/// `LinesCodec` consumes the offending bytes before reporting either error,
/// so retrying always makes progress.
fn next_line(lines: &mut LinesCodec, src: &mut BytesMut, eof: bool) -> Option<String> {
    loop {
        let decoded = if eof {
            lines.decode_eof(src)
        } else {
            lines.decode(src)
        };

        match decoded {
            Ok(line) => return line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!(
                    "Discarding line from MCP process longer than {} bytes",
                    lines.max_length()
                );
            }
            Err(LinesCodecError::Io(e)) => {
                warn!("Discarding unreadable line from MCP process: {}", e);
            }
        }
    }
}
