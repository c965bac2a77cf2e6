use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::MAX_LINE_LENGTH;
use crate::error::{ProtocolError, Result};

/// One decoded unit from the command channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundLine {
    /// A complete line without its terminator (`\n` or `\r\n`)
    Text(String),
    /// A line longer than the limit was skipped; carries the number of bytes dropped
    Oversized(usize),
}

/// Newline framing for the TLS command channel.
///
/// Unlike `LinesCodec`, an overlong line is reported as [`InboundLine::Oversized`] instead
/// of an error, so the framed stream stays usable and the next line is read normally.
/// Invalid UTF-8 is replaced rather than rejected; the message codec decides what to do
/// with the text.
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_length: usize,
    next_index: usize,
    discarding: bool,
    discarded: usize,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
            discarded: 0,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn to_text(mut line: &[u8]) -> String {
    if let [rest @ .., b'\r'] = line {
        line = rest;
    }
    String::from_utf8_lossy(line).into_owned()
}

impl Decoder for LineCodec {
    type Item = InboundLine;
    type Error = ProtocolError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<InboundLine>> {
        loop {
            let read_to = std::cmp::min(self.max_length.saturating_add(1), buf.len());
            let newline = buf[self.next_index.min(read_to)..read_to]
                .iter()
                .position(|b| *b == b'\n');

            match (self.discarding, newline) {
                (true, Some(offset)) => {
                    let dropped = self.discarded + self.next_index + offset;
                    buf.advance(self.next_index + offset + 1);
                    self.discarding = false;
                    self.discarded = 0;
                    self.next_index = 0;
                    return Ok(Some(InboundLine::Oversized(dropped)));
                }
                (true, None) => {
                    self.discarded += read_to;
                    buf.advance(read_to);
                    self.next_index = 0;
                    if buf.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(offset)) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let line = buf.split_to(end + 1);
                    return Ok(Some(InboundLine::Text(to_text(&line[..end]))));
                }
                (false, None) if buf.len() > self.max_length => {
                    self.discarding = true;
                    self.discarded = 0;
                    self.next_index = 0;
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<InboundLine>> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }

        if self.discarding {
            let dropped = self.discarded + buf.len();
            buf.clear();
            self.discarding = false;
            self.discarded = 0;
            self.next_index = 0;
            return Ok(Some(InboundLine::Oversized(dropped)));
        }

        if buf.is_empty() {
            return Ok(None);
        }

        // Unterminated trailing line at EOF
        let line = buf.split_to(buf.len());
        self.next_index = 0;
        Ok(Some(InboundLine::Text(to_text(&line))))
    }
}

impl<'a> Encoder<&'a str> for LineCodec {
    type Error = ProtocolError;

    fn encode(&mut self, line: &'a str, dst: &mut BytesMut) -> Result<()> {
        if line.len() > self.max_length {
            return Err(ProtocolError::Transport(
                crate::error::constants::ERR_LINE_TOO_LONG.into(),
            ));
        }
        dst.reserve(line.len() + 1);
        dst.put(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn text(s: &str) -> Option<InboundLine> {
        Some(InboundLine::Text(s.to_string()))
    }

    #[test]
    fn test_splits_lines_and_strips_cr() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from("CONNECTED|abc\r\n{\"command\":\"PONG\"}\npartial");
        assert_eq!(codec.decode(&mut buf).unwrap(), text("CONNECTED|abc"));
        assert_eq!(codec.decode(&mut buf).unwrap(), text("{\"command\":\"PONG\"}"));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"-line\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), text("partial-line"));
    }

    #[test]
    fn test_oversized_line_is_skipped() {
        let mut codec = LineCodec::with_max_length(8);
        let mut buf = BytesMut::from("0123456789ABCDEF\nPONG\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(InboundLine::Oversized(16)));
        assert_eq!(codec.decode(&mut buf).unwrap(), text("PONG"));
    }

    #[test]
    fn test_oversized_across_reads() {
        let mut codec = LineCodec::with_max_length(4);
        let mut buf = BytesMut::from("aaaaaaa");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"aaa\nok\n");
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(InboundLine::Oversized(_))
        ));
        assert_eq!(codec.decode(&mut buf).unwrap(), text("ok"));
    }

    #[test]
    fn test_eof_flushes_trailing_text() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from("BYE");
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), text("BYE"));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_encode_appends_newline() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        codec.encode("{\"command\":\"PING\"}", &mut buf).unwrap();
        assert_eq!(&buf[..], b"{\"command\":\"PING\"}\n");
    }
}
