//! Message framing
//!
//! [`PgCodec`] is the server side: it cuts the byte stream into [`Frame`]s and
//! serializes [`BackendMessage`]s. [`PgClientCodec`] is the mirror image used
//! by clients and tests. Framing never interprets message bodies; the parser
//! does that.

use crate::error::{PgWireError, Result};
use crate::protocol::formatter::MessageFormatter;
use crate::protocol::message::{BackendMessage, FrontendMessage};
use crate::protocol::parser::MessageParser;
use bytes::{Buf, Bytes, BytesMut};
use log::trace;
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound for the untagged first message, as in PostgreSQL
pub const MAX_STARTUP_PACKET_LENGTH: usize = 10_000;

/// Default upper bound for a regular message
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 64 * 1024 * 1024;

/// Most buffer space reserved ahead of bytes that have not arrived yet
const MAX_READ_AHEAD: usize = 8 * 1024;

/// One complete message envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message type byte; `None` for startup-phase messages
    pub tag: Option<u8>,

    /// Message body, without type byte and length
    pub body: Bytes,
}

/// Which envelope layout the next message uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingPhase {
    /// Length, then body (StartupMessage, SSLRequest, GSSENCRequest, CancelRequest)
    Startup,
    /// Type byte, length, then body
    Regular,
}

/// Server-side codec
#[derive(Debug, Clone)]
pub struct PgCodec {
    phase: FramingPhase,
    max_message_length: usize,
}

impl PgCodec {
    /// Create a codec that expects a startup-phase message first
    pub fn new(max_message_length: usize) -> Self {
        Self {
            phase: FramingPhase::Startup,
            max_message_length,
        }
    }

    /// Current framing phase
    pub fn phase(&self) -> FramingPhase {
        self.phase
    }

    /// Switch framing phase (after the startup packet has been accepted)
    pub fn set_phase(&mut self, phase: FramingPhase) {
        self.phase = phase;
    }

    /// Largest accepted message length, including the length field
    pub fn max_message_length(&self) -> usize {
        self.max_message_length
    }
}

impl Default for PgCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_LENGTH)
    }
}

/// Cut one frame off the front of `src`
///
/// Nothing is consumed until the whole frame is buffered, so partial reads
/// never lose bytes.
fn decode_frame(src: &mut BytesMut, tagged: bool, max_length: usize) -> Result<Option<Frame>> {
    let header = if tagged { 5 } else { 4 };
    if src.len() < header {
        src.reserve(header - src.len());
        return Ok(None);
    }

    let offset = header - 4;
    let mut length_bytes = [0u8; 4];
    length_bytes.copy_from_slice(&src[offset..header]);
    let length = i32::from_be_bytes(length_bytes);

    if length < 4 {
        return Err(PgWireError::Framing(format!("invalid message length {}", length)));
    }
    let length = length as usize;
    if length > max_length {
        return Err(PgWireError::Framing(format!(
            "message length {} exceeds the limit of {} bytes",
            length, max_length
        )));
    }

    let total = offset + length;
    if src.len() < total {
        // The length field is untrusted; grow with the data instead
        src.reserve((total - src.len()).min(MAX_READ_AHEAD));
        return Ok(None);
    }

    let tag = if tagged { Some(src[0]) } else { None };
    let mut frame = src.split_to(total);
    frame.advance(header);
    Ok(Some(Frame {
        tag,
        body: frame.freeze(),
    }))
}

impl Decoder for PgCodec {
    type Item = Frame;
    type Error = PgWireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let frame = match self.phase {
            FramingPhase::Startup => decode_frame(
                src,
                false,
                self.max_message_length.min(MAX_STARTUP_PACKET_LENGTH),
            )?,
            FramingPhase::Regular => decode_frame(src, true, self.max_message_length)?,
        };
        if let Some(frame) = &frame {
            trace!(
                "Decoded frame {:?} ({} bytes)",
                frame.tag.map(char::from),
                frame.body.len()
            );
        }
        Ok(frame)
    }
}

impl Encoder<BackendMessage> for PgCodec {
    type Error = PgWireError;

    fn encode(&mut self, message: BackendMessage, dst: &mut BytesMut) -> Result<()> {
        MessageFormatter::new().write_backend_message(dst, &message)
    }
}

/// Client-side codec: decodes backend messages, encodes frontend messages
///
/// The single-byte answer to SSLRequest has no envelope and must be read
/// from the raw stream before this codec is attached.
#[derive(Debug, Clone)]
pub struct PgClientCodec {
    max_message_length: usize,
}

impl PgClientCodec {
    /// Create a client codec
    pub fn new() -> Self {
        Self {
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
        }
    }
}

impl Default for PgClientCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PgClientCodec {
    type Item = BackendMessage;
    type Error = PgWireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BackendMessage>> {
        match decode_frame(src, true, self.max_message_length)? {
            Some(frame) => MessageParser::new().parse_backend_message(&frame).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<FrontendMessage> for PgClientCodec {
    type Error = PgWireError;

    fn encode(&mut self, message: FrontendMessage, dst: &mut BytesMut) -> Result<()> {
        MessageFormatter::new().write_frontend_message(dst, &message)
    }
}
