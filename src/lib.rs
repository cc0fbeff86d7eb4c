//! # tidews
//! A strict client implementation of the WebSocket protocol (RFC 6455) and permessage-deflate
//! compression (RFC 7692), with automatic handling of control frames, message fragmentation and
//! negotiated compression.
//!
//! Every frame is validated as it arrives: reserved bits, opcodes, masking direction, control
//! frame rules, close codes and UTF-8 payloads. Violations end the connection with the close
//! code RFC 6455 prescribes, so the client passes the Autobahn conformance suite.
//!
//! # Features
//! The crate provides several optional features that can be enabled in your `Cargo.toml`:
//!
//! - `logging` (default): Enables debug logging for connection negotiation and frame processing
//!   using the `log` crate.
//!
//! - `zlib`: Links zlib for DEFLATE. Required to honour a `client_max_window_bits` smaller than 15
//!   on outgoing messages. Without it such connections still receive compressed messages but send
//!   uncompressed ones.
//!
//! - `simd`: Uses `simdutf8` as the fast path of the UTF-8 validator.
//!
//! - `json`: Enables sending serialized JSON data as text messages.
//!
//! # Connection model
//! Connecting spawns one task per connection. That task owns the transport and is the only
//! writer of the connection state. The caller receives [`Event`]s from the [`WebSocket`] stream
//! and sends through a [`WebSocketHandle`]. Sending only enqueues and never blocks.
//!
//! ```no_run
//! use futures::StreamExt;
//! use tidews::{Event, Message, WebSocket};
//!
//! #[tokio::main]
//! async fn main() -> tidews::Result<()> {
//!     let mut ws = WebSocket::connect("wss://echo.websocket.org".parse()?).start();
//!
//!     while let Some(event) = ws.next().await {
//!         match event {
//!             Event::Open { .. } => ws.send_text("hello"),
//!             Event::Message(Message::Text(text)) => {
//!                 println!("{text}");
//!                 ws.close(None, "");
//!             }
//!             Event::End { code, reason, .. } => println!("ended: {code:?} {reason}"),
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Memory Safety
//! - Maximum frame payload size (configurable, default 1 MiB)
//! - Maximum reassembled message size, compressed or not (configurable, default 2 MiB)
//! - Bounded handshake response size

#![cfg_attr(docsrs, feature(doc_cfg))]

mod compression;
mod cursor;
mod handshake;
mod mask;
mod native;
mod utf8;

pub mod close;
pub mod codec;
pub mod frame;
pub mod stream;

use thiserror::Error;

pub use native::*;

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Represents errors that can occur during WebSocket operations.
///
/// The errors are broadly categorized into:
///
/// - Protocol errors: framing rules the peer violated. The connection closes with 1002.
/// - Payload errors: invalid UTF-8 or undecodable compressed data. The connection closes with 1007.
/// - Handshake errors: the connection never opens.
/// - Network errors: the transport failed or timed out. Reported with 1006.
/// - Library errors: misuse of the API, such as encoding an unfinished frame.
///
/// [`WebSocketError::close_code`] gives the close code each error maps to.
#[derive(Error, Debug)]
pub enum WebSocketError {
    // ---------------- protocol ----------------
    /// Occurs when receiving a data frame while a fragmented message is still incomplete.
    #[error("Invalid fragment")]
    InvalidFragment,

    /// Occurs when receiving a continuation frame without a preceding initial frame.
    #[error("Invalid continuation frame")]
    InvalidContinuationFrame,

    /// Indicates that a received close frame has a payload of 1 byte (close frames must be
    /// either empty or at least 2 bytes long).
    #[error("Invalid close frame")]
    InvalidCloseFrame,

    /// Occurs when a close frame carries a status code that is not allowed on the wire.
    #[error("Invalid close code: {0}")]
    InvalidCloseCode(u16),

    /// RSV2 or RSV3 is set. No extension negotiating them is supported.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// A control frame (ping, pong or close) was received with the FIN bit not set.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame payload exceeds 125 bytes.
    #[error("Control frame too large")]
    ControlFrameTooLarge,

    /// A control frame has the RSV1 (compression) bit set.
    #[error("Control frame must not be compressed")]
    CompressedControlFrame,

    /// The server masked a frame. Only clients mask.
    #[error("Server sent masked frame")]
    MaskedFrame,

    /// Receipt of a frame with a reserved opcode (0x3-0x7, 0xB-0xF).
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// The 64-bit extended payload length has its most significant bit set.
    #[error("Invalid payload length")]
    InvalidPayloadLength,

    /// A compressed frame arrived on a connection that did not negotiate compression,
    /// or the RSV1 bit was set on a continuation frame.
    #[error("Received compressed frame on stream that doesn't support compression")]
    CompressionNotSupported,

    // ---------------- payload ----------------
    /// A text frame or close frame reason contains invalid UTF-8 data.
    #[error("Invalid UTF-8")]
    InvalidUTF8,

    /// A compressed message could not be inflated.
    #[error("Decompression error: {0}")]
    Decompression(std::io::Error),

    // ---------------- size ----------------
    /// A frame or a reassembled message exceeds the configured limits.
    #[error("Frame too large")]
    FrameTooLarge,

    // ---------------- handshake ----------------
    /// The URL is not a `ws://` or `wss://` URL with a host.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// A header in the request or in the server response is malformed or unacceptable.
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// The server response is not a `HTTP/1.1 101` upgrade response.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The permessage-deflate parameters are malformed or out of range.
    #[error("Invalid compression options: {0}")]
    InvalidCompressionOptions(String),

    /// The `Upgrade` response header is missing or is not `websocket`.
    #[error("Invalid upgrade header")]
    InvalidUpgradeHeader,

    /// The `Connection` response header is missing or does not contain `upgrade`.
    #[error("Invalid connection header")]
    InvalidConnectionHeader,

    /// The `Sec-WebSocket-Accept` response header does not match the key that was sent.
    #[error("Invalid Sec-WebSocket-Accept header")]
    InvalidAcceptKey,

    /// Wraps errors from URL parsing that may occur when processing WebSocket URLs.
    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    // ---------------- network ----------------
    /// Wraps standard I/O errors from the transport.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// A connect, read, write or close deadline elapsed.
    #[error("Operation timed out")]
    Timeout,

    /// The transport ended without a close handshake, or an operation was attempted on a
    /// closed connection.
    #[error("Connection is closed")]
    ConnectionClosed,

    // ---------------- library ----------------
    /// A frame with the FIN bit cleared was handed to the encoder.
    #[error("Unfinished frames cannot be sent")]
    UnfinishedFrame,

    /// An outgoing message could not be compressed.
    #[error("Compression error: {0}")]
    Compression(std::io::Error),

    /// Wraps errors produced when serializing JSON data.
    #[cfg(feature = "json")]
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    // ---------------- memory ----------------
    /// A buffer could not grow.
    #[error("Out of memory")]
    OutOfMemory(#[from] std::collections::TryReserveError),
}

impl WebSocketError {
    /// Returns the close code a connection failing with this error reports.
    pub fn close_code(&self) -> close::CloseCode {
        use close::CloseCode;

        match self {
            Self::InvalidFragment
            | Self::InvalidContinuationFrame
            | Self::InvalidCloseFrame
            | Self::InvalidCloseCode(_)
            | Self::ReservedBitsNotZero
            | Self::ControlFrameFragmented
            | Self::ControlFrameTooLarge
            | Self::CompressedControlFrame
            | Self::MaskedFrame
            | Self::InvalidOpCode(_)
            | Self::InvalidPayloadLength
            | Self::CompressionNotSupported => CloseCode::Protocol,
            Self::InvalidUTF8 | Self::Decompression(_) => CloseCode::Invalid,
            Self::FrameTooLarge => CloseCode::Size,
            Self::UnfinishedFrame | Self::Compression(_) | Self::OutOfMemory(_) => CloseCode::Error,
            #[cfg(feature = "json")]
            Self::Json(_) => CloseCode::Error,
            Self::InvalidAddress(_)
            | Self::InvalidHeader(_)
            | Self::InvalidResponse(_)
            | Self::InvalidCompressionOptions(_)
            | Self::InvalidUpgradeHeader
            | Self::InvalidConnectionHeader
            | Self::InvalidAcceptKey
            | Self::UrlParseError(_)
            | Self::IoError(_)
            | Self::Timeout
            | Self::ConnectionClosed => CloseCode::Abnormal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use close::CloseCode;

    #[test]
    fn test_close_code_mapping() {
        assert_eq!(WebSocketError::MaskedFrame.close_code(), CloseCode::Protocol);
        assert_eq!(WebSocketError::InvalidOpCode(3).close_code(), CloseCode::Protocol);
        assert_eq!(WebSocketError::InvalidUTF8.close_code(), CloseCode::Invalid);
        assert_eq!(WebSocketError::FrameTooLarge.close_code(), CloseCode::Size);
        assert_eq!(WebSocketError::ConnectionClosed.close_code(), CloseCode::Abnormal);
        assert_eq!(WebSocketError::Timeout.close_code(), CloseCode::Abnormal);
        assert_eq!(
            WebSocketError::InvalidResponse("HTTP/1.1 200 OK".into()).close_code(),
            CloseCode::Abnormal
        );
    }
}
