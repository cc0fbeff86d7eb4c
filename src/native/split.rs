//! Message assembly on the read side and message encoding on the write side.
//!
//! Neither half performs I/O. The connection driver feeds decoded frames to [`ReadHalf`] and
//! hands outgoing messages to [`WriteHalf`] before writing the resulting frames.

use bytes::Bytes;

use crate::{
    compression::{Compressor, Decompressor},
    frame::{Frame, OpCode},
    utf8::Utf8Validator,
    Result, WebSocketError,
};

use super::{CloseFrame, Message};

/// Largest payload of a control frame.
const MAX_CONTROL_PAYLOAD: usize = 125;

// ================ ReadHalf ====================

/// Reassembles frames into messages.
///
/// A data frame without FIN starts a fragmented message. Until its last continuation frame
/// arrives, only continuation frames and control frames are accepted. Control frames are
/// returned immediately and leave the message in progress untouched.
///
/// Each frame is inflated and UTF-8 checked as it arrives, so an invalid message fails on the
/// fragment that makes it invalid rather than when it completes.
pub(crate) struct ReadHalf {
    /// Optional decompressor used to decompress incoming payloads.
    inflate: Option<Decompressor>,
    /// Leader of the message being assembled.
    fragment: Option<Fragment>,
    /// Accumulated binary payload.
    accumulated: Vec<u8>,
    /// Inflated payload of the current text frame, before validation.
    scratch: Vec<u8>,
    /// Text of the message being assembled.
    utf8: Utf8Validator,
    /// Maximum size of a reassembled message.
    max_read_buffer: usize,
    /// Set once a Close frame was received.
    is_closed: bool,
}

/// Fragmented message header.
struct Fragment {
    opcode: OpCode,
    is_compressed: bool,
}

impl ReadHalf {
    pub(super) fn new(inflate: Option<Decompressor>, max_read_buffer: usize) -> Self {
        Self {
            inflate,
            fragment: None,
            accumulated: Vec::new(),
            scratch: Vec::new(),
            utf8: Utf8Validator::new(),
            max_read_buffer,
            is_closed: false,
        }
    }

    /// Processes an incoming frame.
    ///
    /// # Returns
    /// - `Ok(Some(Message))` for a control frame or the frame completing a data message.
    /// - `Ok(None)` if the frame is part of a fragmented message and not yet complete.
    /// - `Err(WebSocketError)` if the frame breaks fragmentation rules, or the payload is not
    ///   valid UTF-8, not valid DEFLATE or too large.
    pub(super) fn on_frame(&mut self, frame: Frame) -> Result<Option<Message>> {
        if self.is_closed {
            return Err(WebSocketError::ConnectionClosed);
        }

        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                if self.fragment.is_some() {
                    return Err(WebSocketError::InvalidFragment);
                }
                if frame.is_compressed() && self.inflate.is_none() {
                    return Err(WebSocketError::CompressionNotSupported);
                }

                self.fragment = Some(Fragment {
                    opcode: frame.opcode,
                    is_compressed: frame.is_compressed(),
                });
                self.push(&frame.payload, frame.fin)
            }
            OpCode::Continuation => {
                if self.fragment.is_none() {
                    return Err(WebSocketError::InvalidContinuationFrame);
                }
                // RSV1 belongs to the first frame of a message only
                if frame.is_compressed() {
                    return Err(WebSocketError::CompressionNotSupported);
                }

                self.push(&frame.payload, frame.fin)
            }
            OpCode::Ping => Ok(Some(Message::Ping(frame.payload))),
            OpCode::Pong => Ok(Some(Message::Pong(frame.payload))),
            OpCode::Close => {
                self.is_closed = true;

                let Some(code) = frame.close_code() else {
                    return Ok(Some(Message::Close(None)));
                };

                let mut reason = Utf8Validator::new();
                reason.append(&frame.payload[2..])?;
                let reason = reason.finish()?;

                Ok(Some(Message::Close(Some(CloseFrame { code, reason }))))
            }
        }
    }

    /// Adds the payload of one data frame to the message in progress.
    fn push(&mut self, payload: &[u8], fin: bool) -> Result<Option<Message>> {
        let Some(fragment) = &self.fragment else {
            return Err(WebSocketError::InvalidContinuationFrame);
        };
        let opcode = fragment.opcode;
        let is_compressed = fragment.is_compressed;

        match (opcode, is_compressed) {
            (OpCode::Text, false) => {
                if self.utf8.len() + payload.len() > self.max_read_buffer {
                    return Err(WebSocketError::FrameTooLarge);
                }
                self.utf8.append(payload)?;
            }
            (OpCode::Text, true) => {
                let limit = self.max_read_buffer.saturating_sub(self.utf8.len());
                let inflate = self
                    .inflate
                    .as_mut()
                    .ok_or(WebSocketError::CompressionNotSupported)?;

                self.scratch.clear();
                inflate.decompress(payload, fin, &mut self.scratch, limit)?;
                self.utf8.append(&self.scratch)?;
            }
            (_, false) => {
                if self.accumulated.len() + payload.len() > self.max_read_buffer {
                    return Err(WebSocketError::FrameTooLarge);
                }
                self.accumulated.try_reserve(payload.len())?;
                self.accumulated.extend_from_slice(payload);
            }
            (_, true) => {
                let inflate = self
                    .inflate
                    .as_mut()
                    .ok_or(WebSocketError::CompressionNotSupported)?;
                inflate.decompress(payload, fin, &mut self.accumulated, self.max_read_buffer)?;
            }
        }

        if !fin {
            return Ok(None);
        }

        self.fragment = None;
        if self.scratch.capacity() > self.max_read_buffer / 4 {
            self.scratch = Vec::new();
        }

        let message = if opcode == OpCode::Text {
            Message::Text(self.utf8.finish()?)
        } else {
            Message::Binary(Bytes::from(std::mem::take(&mut self.accumulated)))
        };

        Ok(Some(message))
    }
}

// ================ WriteHalf ====================

/// Turns outgoing messages into frames.
///
/// Text and binary messages are compressed when permessage-deflate was negotiated and the
/// client window can be honoured. Messages always go out as a single frame.
pub(crate) struct WriteHalf {
    deflate: Option<Compressor>,
}

impl WriteHalf {
    pub(super) fn new(deflate: Option<Compressor>) -> Self {
        Self { deflate }
    }

    /// Builds the frame carrying `message`.
    ///
    /// Control payloads are cut to 125 bytes, close reasons to 123 bytes on a character
    /// boundary.
    pub(super) fn encode(&mut self, message: Message) -> Result<Frame> {
        let frame = match message {
            Message::Text(text) => self.data_frame(OpCode::Text, Bytes::from(text))?,
            Message::Binary(data) => self.data_frame(OpCode::Binary, data)?,
            Message::Ping(payload) => Frame::ping(truncate_control(payload)),
            Message::Pong(payload) => Frame::pong(truncate_control(payload)),
            Message::Close(None) => Frame::close_raw(Bytes::new()),
            // reporting-only and out of range codes cannot go on the wire
            Message::Close(Some(CloseFrame { code, .. })) if !code.is_allowed() => {
                Frame::close_raw(Bytes::new())
            }
            Message::Close(Some(CloseFrame { code, reason })) => {
                Frame::close(code, truncate_reason(&reason))
            }
        };

        Ok(frame)
    }

    fn data_frame(&mut self, opcode: OpCode, payload: Bytes) -> Result<Frame> {
        match self.deflate.as_mut() {
            Some(deflate) => {
                let output = deflate.compress(&payload)?;
                Ok(Frame::compressed(true, opcode, output))
            }
            None => Ok(Frame::new(true, opcode, payload)),
        }
    }
}

fn truncate_control(mut payload: Bytes) -> Bytes {
    payload.truncate(MAX_CONTROL_PAYLOAD);
    payload
}

fn truncate_reason(reason: &str) -> &str {
    let max = MAX_CONTROL_PAYLOAD - 2;
    if reason.len() <= max {
        return reason;
    }

    let mut end = max;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}
