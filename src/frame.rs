//! # Frame
//!
//! The `frame` module implements WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//! Each frame is one wire-level unit: the payload plus the protocol metadata needed to
//! interpret it.
//!
//! ### Frame Binary Format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! :                     Payload Data continued ...                :
//! +---------------------------------------------------------------+
//! ```
//!
//! Frames come in two categories:
//!
//! - **Data Frames**: `OpCode::Text`, `OpCode::Binary` and `OpCode::Continuation`
//! - **Control Frames**: `OpCode::Close`, `OpCode::Ping` and `OpCode::Pong`. They are never
//!   fragmented, never compressed and carry at most 125 bytes.
//!
//! This crate is a client: every frame it writes is masked, and a masked frame coming from the
//! server is a protocol error.
//!
//! ```rust
//! use tidews::frame::Frame;
//! use tidews::close::CloseCode;
//!
//! let text = Frame::text("Hello, WebSocket!");
//! let ping = Frame::ping("Ping payload");
//! let close = Frame::close(CloseCode::Normal, b"Normal closure");
//!
//! assert_eq!(close.close_code(), Some(CloseCode::Normal));
//! ```
use bytes::Bytes;

use crate::{close::CloseCode, WebSocketError};

/// WebSocket operation code (OpCode) that determines the semantic meaning and handling of a frame.
///
/// The numeric values for each OpCode are defined in [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8):
/// - Continuation = 0x0
/// - Text = 0x1
/// - Binary = 0x2
/// - Close = 0x8
/// - Ping = 0x9
/// - Pong = 0xA
///
/// The ranges 0x3-0x7 and 0xB-0xF are reserved and rejected.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` if the `OpCode` represents a control frame (`Close`, `Ping`, or `Pong`).
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// A WebSocket frame.
///
/// **Note: This low-level struct should rarely be used directly.** The connection reassembles
/// frames into [`Message`](crate::Message)s and builds outgoing frames itself.
///
/// # Fields
/// - `fin`: Final fragment flag. When `true`, this frame completes a message.
/// - `opcode`: Defines the frame type.
/// - `payload`: Frame payload, already unmasked.
///
/// The RSV1 bit (per-message compression) is exposed through [`Frame::is_compressed`].
#[derive(Debug, Clone)]
pub struct Frame {
    /// Indicates if this is the final frame in a message.
    pub fin: bool,
    /// The opcode of the frame, defining its type.
    pub opcode: OpCode,
    /// Flag indicating whether the payload is compressed (RSV1).
    pub(crate) is_compressed: bool,
    /// Masking key to use when encoding. A fresh random key is drawn when `None`.
    pub(crate) mask: Option<[u8; 4]>,
    /// The payload of the frame.
    pub payload: Bytes,
}

/// Largest possible frame header: 2 bytes, 8 bytes of extended length and the masking key.
pub(crate) const MAX_HEAD_SIZE: usize = 14;

impl Frame {
    /// Creates a new frame.
    pub fn new(fin: bool, opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            opcode,
            is_compressed: false,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Creates a new frame whose payload is compressed with permessage-deflate.
    pub fn compressed(fin: bool, opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            is_compressed: true,
            ..Self::new(fin, opcode, payload)
        }
    }

    /// Creates a final text frame.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Text, payload)
    }

    /// Creates a final binary frame.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Binary, payload)
    }

    /// Creates a continuation frame, final by default.
    pub fn continuation(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Continuation, payload)
    }

    /// Creates a ping frame.
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Ping, payload)
    }

    /// Creates a pong frame.
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Pong, payload)
    }

    /// Creates a close frame with a status code and reason.
    pub fn close(code: CloseCode, reason: impl AsRef<[u8]>) -> Self {
        let reason = reason.as_ref();
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&u16::from(code).to_be_bytes());
        payload.extend_from_slice(reason);

        Self::new(true, OpCode::Close, payload)
    }

    /// Creates a close frame with a raw payload.
    ///
    /// This method does not validate if `payload` is a valid close frame payload.
    pub fn close_raw(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Close, payload)
    }

    /// Sets the FIN flag.
    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Uses a fixed masking key instead of a random one.
    pub fn with_mask(mut self, mask: [u8; 4]) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Returns `true` if the RSV1 bit is set.
    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.is_compressed
    }

    /// Extracts the status code from a Close frame's payload.
    ///
    /// Returns `None` if the payload is too short to contain one.
    pub fn close_code(&self) -> Option<CloseCode> {
        let code = u16::from_be_bytes(self.payload.get(0..2)?.try_into().ok()?);
        Some(CloseCode::from(code))
    }

    /// Extracts the reason from a Close frame's payload.
    ///
    /// Returns `None` if there is no status code or the reason is not valid UTF-8.
    pub fn close_reason(&self) -> Option<&str> {
        std::str::from_utf8(self.payload.get(2..)?).ok()
    }

    /// Formats the frame header into `head` with the MASK bit set and returns its length.
    ///
    /// # Panics
    /// Panics if `head` is shorter than [`MAX_HEAD_SIZE`].
    pub(crate) fn fmt_head(&self, head: &mut [u8], mask: [u8; 4]) -> usize {
        let compression = u8::from(self.is_compressed);
        head[0] = (self.fin as u8) << 7 | compression << 6 | u8::from(self.opcode);

        let len = self.payload.len();
        let size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len < 65536 {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        head[1] |= 0x80;
        head[size..size + 4].copy_from_slice(&mask);
        size + 4
    }
}
