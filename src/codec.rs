use bytes::{Buf, BufMut, BytesMut};
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{Command, Frame};
use crate::parser::{escape_header_value, parse_frame_slice, unescape_header_value};

/// Errors produced while encoding or decoding STOMP frames.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The underlying stream failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// The bytes on the wire do not form a valid frame.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Items produced or consumed by the codec.
///
/// A `StompItem` is either a decoded `Frame` or a `Heartbeat` marker
/// representing a single EOL received outside any frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StompItem {
    /// A decoded STOMP frame (command + headers + body)
    Frame(Frame),
    /// A single heartbeat pulse (LF)
    Heartbeat,
}

/// `StompCodec` implements `tokio_util::codec::{Decoder, Encoder}` for the
/// STOMP wire protocol.
///
/// Responsibilities:
/// - Decode incoming bytes into `StompItem::Frame` or `StompItem::Heartbeat`.
/// - Support both NUL-terminated frames and frames using the `content-length`
///   header for binary bodies containing NUL bytes.
/// - Encode `StompItem` back into bytes for the wire format and emit
///   `content-length` when necessary.
#[derive(Debug, Default)]
pub struct StompCodec {
    // stateless: every decode call parses from the start of `src`
}

impl StompCodec {
    pub fn new() -> Self {
        Self {}
    }
}

fn protocol(msg: impl Into<String>) -> CodecError {
    CodecError::Protocol(msg.into())
}

fn decode_text(raw: &[u8], what: &str) -> Result<String, CodecError> {
    let unescaped =
        unescape_header_value(raw).map_err(|e| protocol(format!("{} in {}", e, what)))?;
    String::from_utf8(unescaped).map_err(|e| protocol(format!("invalid utf8 in {}: {}", what, e)))
}

impl Decoder for StompCodec {
    type Item = StompItem;
    type Error = CodecError;

    /// Decode bytes from `src` into a `StompItem`.
    ///
    /// Returns
    /// - `Ok(Some(StompItem))` when a full item (frame or heartbeat) was
    ///   decoded and bytes were consumed from `src` accordingly.
    /// - `Ok(None)` when more bytes are required; `src` is left untouched.
    /// - `Err(CodecError::Protocol)` on malformed input (bad escape, header
    ///   line without a colon, unknown command, missing NUL after a
    ///   content-length body, invalid UTF-8).
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // heartbeat: a lone EOL outside a frame
        match src.chunk() {
            [] => return Ok(None),
            [b'\n', ..] => {
                src.advance(1);
                return Ok(Some(StompItem::Heartbeat));
            }
            [b'\r', b'\n', ..] => {
                src.advance(2);
                return Ok(Some(StompItem::Heartbeat));
            }
            [b'\r'] => return Ok(None),
            _ => {}
        }

        let Some(raw) = parse_frame_slice(src.chunk()).map_err(protocol)? else {
            return Ok(None);
        };
        src.advance(raw.consumed);

        let command_str = std::str::from_utf8(&raw.command)
            .map_err(|e| protocol(format!("invalid utf8 in command: {}", e)))?;
        let command = command_str
            .parse::<Command>()
            .map_err(|e| protocol(e.to_string()))?;

        let mut headers = Vec::with_capacity(raw.headers.len());
        for (k, v) in raw.headers {
            headers.push((decode_text(&k, "header key")?, decode_text(&v, "header value")?));
        }

        let frame = Frame {
            command,
            headers,
            body: raw.body,
        };
        tracing::trace!(command = %frame.command, body_len = frame.body.len(), "decoded frame");
        Ok(Some(StompItem::Frame(frame)))
    }

    /// Bytes left over when the stream ends mean a frame was cut short.
    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(item) => Ok(Some(item)),
            None if buf.is_empty() => Ok(None),
            None => Err(protocol(format!(
                "stream ended inside a frame ({} bytes without NUL terminator)",
                buf.len()
            ))),
        }
    }
}

impl Encoder<StompItem> for StompCodec {
    type Error = CodecError;

    /// Encode a `StompItem` into the provided destination buffer.
    ///
    /// A caller-supplied `content-length` header must match the body length.
    /// When none is supplied and the body contains NUL or is not UTF-8, one
    /// is added so the receiver can frame the body.
    fn encode(&mut self, item: StompItem, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = match item {
            StompItem::Heartbeat => {
                dst.put_u8(b'\n');
                return Ok(());
            }
            StompItem::Frame(frame) => frame,
        };

        let mut headers = frame.headers;
        match frame_content_length(&headers) {
            Some(Ok(n)) if n == frame.body.len() => {}
            Some(Ok(n)) => {
                return Err(protocol(format!(
                    "content-length {} does not match body length {}",
                    n,
                    frame.body.len()
                )));
            }
            Some(Err(v)) => return Err(protocol(format!("invalid content-length '{}'", v))),
            None => {
                let include_cl =
                    frame.body.contains(&0) || std::str::from_utf8(&frame.body).is_err();
                if include_cl {
                    headers.push(("content-length".to_string(), frame.body.len().to_string()));
                }
            }
        }

        dst.reserve(frame.body.len() + 64);
        dst.extend_from_slice(frame.command.as_str().as_bytes());
        dst.put_u8(b'\n');
        for (k, v) in &headers {
            dst.extend_from_slice(escape_header_value(k).as_bytes());
            dst.put_u8(b':');
            dst.extend_from_slice(escape_header_value(v).as_bytes());
            dst.put_u8(b'\n');
        }
        dst.put_u8(b'\n');
        dst.extend_from_slice(&frame.body);
        dst.put_u8(0);

        tracing::trace!(command = %frame.command, body_len = frame.body.len(), "encoded frame");
        Ok(())
    }
}

fn frame_content_length(headers: &[(String, String)]) -> Option<Result<usize, String>> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .map(|(_, v)| v.trim().parse::<usize>().map_err(|_| v.clone()))
}
