//! # Codec
//!
//! Frame-level encoding and decoding, plugged into [`tokio_util::codec::Framed`].
//!
//! The [`Decoder`] is resumable: when the buffer ends in the middle of a frame it keeps the
//! stage it reached in an explicit [`ReadState`] and returns `Ok(None)`. The next call picks
//! up at that stage, which stays correct even if the rest of the frame arrives one byte at a
//! time.
//!
//! The [`Encoder`] writes complete client frames: always masked with a fresh key.
use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    cursor::ByteCursor,
    frame::{Frame, OpCode, MAX_HEAD_SIZE},
    mask::apply_mask,
    WebSocketError,
};

/// Where the decoder stopped in the current frame.
enum ReadState {
    /// Waiting for the two fixed header bytes.
    Head,
    /// Fixed header read, waiting for the extended payload length (if any).
    Length(Header),
    /// Header complete, waiting for the whole payload.
    Payload(Header, usize),
}

/// Fields of the two fixed header bytes.
struct Header {
    fin: bool,
    rsv1: bool,
    opcode: OpCode,
    length_code: u8,
}

/// A combined codec that provides both encoding and decoding functionality for WebSocket frames.
pub struct Codec {
    decoder: Decoder,
    encoder: Encoder,
}

impl From<(Decoder, Encoder)> for Codec {
    fn from((decoder, encoder): (Decoder, Encoder)) -> Self {
        Self { decoder, encoder }
    }
}

impl codec::Decoder for Codec {
    type Item = <Decoder as codec::Decoder>::Item;
    type Error = <Decoder as codec::Decoder>::Error;

    #[inline]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode(src)
    }
}

impl codec::Encoder<Frame> for Codec {
    type Error = <Encoder as codec::Encoder<Frame>>::Error;

    #[inline]
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encoder.encode(item, dst)
    }
}

/// A decoder for frames sent by a server.
pub struct Decoder {
    /// Saved position inside the frame in flight.
    state: ReadState,
    /// Maximum allowed size for a frame payload.
    max_payload_read: usize,
    /// Whether permessage-deflate was negotiated, making RSV1 legal on data frames.
    compression: bool,
}

impl Decoder {
    /// Creates a new `Decoder`.
    ///
    /// # Parameters
    /// - `max_payload_read`: The maximum allowed payload size, in bytes.
    /// - `compression`: Whether the RSV1 bit may be set on data frames.
    pub fn new(max_payload_read: usize, compression: bool) -> Self {
        Self {
            state: ReadState::Head,
            max_payload_read,
            compression,
        }
    }

    /// Validates the two fixed header bytes.
    fn parse_head(&self, b0: u8, b1: u8) -> Result<Header, WebSocketError> {
        let fin = b0 & 0b1000_0000 != 0;
        let rsv1 = b0 & 0b0100_0000 != 0;

        if b0 & 0b0011_0000 != 0 {
            return Err(WebSocketError::ReservedBitsNotZero);
        }

        let opcode = OpCode::try_from(b0 & 0b0000_1111)?;

        if b1 & 0b1000_0000 != 0 {
            return Err(WebSocketError::MaskedFrame);
        }
        let length_code = b1 & 0x7F;

        if opcode.is_control() {
            if !fin {
                return Err(WebSocketError::ControlFrameFragmented);
            }
            if length_code > 125 {
                return Err(WebSocketError::ControlFrameTooLarge);
            }
            if rsv1 {
                return Err(WebSocketError::CompressedControlFrame);
            }
            if opcode == OpCode::Close && length_code == 1 {
                return Err(WebSocketError::InvalidCloseFrame);
            }
        } else if rsv1 && !self.compression {
            return Err(WebSocketError::CompressionNotSupported);
        }

        Ok(Header {
            fin,
            rsv1,
            opcode,
            length_code,
        })
    }

    fn check_length(&self, length: u64) -> Result<usize, WebSocketError> {
        if length & (1 << 63) != 0 {
            return Err(WebSocketError::InvalidPayloadLength);
        }

        let length = usize::try_from(length).map_err(|_| WebSocketError::FrameTooLarge)?;
        if length > self.max_payload_read {
            return Err(WebSocketError::FrameTooLarge);
        }

        Ok(length)
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    /// Decodes the next frame from `src`.
    ///
    /// # Returns
    /// - `Ok(Some(Frame))`: a complete frame.
    /// - `Ok(None)`: more bytes are needed. The parse position is saved.
    /// - `Err(WebSocketError)`: the bytes violate RFC 6455.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match std::mem::replace(&mut self.state, ReadState::Head) {
                ReadState::Head => {
                    let mut cursor = ByteCursor::new(&src[..]);
                    let (Ok(b0), Ok(b1)) = (cursor.next_u8(), cursor.next_u8()) else {
                        return Ok(None);
                    };

                    let header = self.parse_head(b0, b1)?;
                    src.advance(cursor.consumed());
                    self.state = ReadState::Length(header);
                }
                ReadState::Length(header) => {
                    let mut cursor = ByteCursor::new(&src[..]);
                    let length = match header.length_code {
                        126 => cursor.read_u16().map(u64::from),
                        127 => cursor.read_u64(),
                        code => Ok(u64::from(code)),
                    };
                    let Ok(length) = length else {
                        self.state = ReadState::Length(header);
                        return Ok(None);
                    };

                    let length = self.check_length(length)?;
                    src.advance(cursor.consumed());
                    self.state = ReadState::Payload(header, length);
                }
                ReadState::Payload(header, length) => {
                    if src.len() < length {
                        // let the read loop pull the rest of the payload in one go
                        src.reserve(length - src.len());
                        self.state = ReadState::Payload(header, length);
                        return Ok(None);
                    }

                    let payload = src.split_to(length).freeze();
                    let mut frame = Frame::new(header.fin, header.opcode, payload);
                    frame.is_compressed = header.rsv1;

                    if frame.opcode == OpCode::Close {
                        if let Some(code) = frame.close_code() {
                            if !code.is_allowed() {
                                return Err(WebSocketError::InvalidCloseCode(u16::from(code)));
                            }
                        }
                    }

                    return Ok(Some(frame));
                }
            }
        }
    }
}

/// Encoder for client frames.
///
/// Writes the header, a masking key and the masked payload. Frames without the FIN bit are
/// refused with [`WebSocketError::UnfinishedFrame`].
pub struct Encoder;

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if !frame.fin {
            return Err(WebSocketError::UnfinishedFrame);
        }

        let mask = frame.mask.unwrap_or_else(rand::random);

        let mut head = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut head, mask);

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&head[..size]);

        let start = dst.len();
        dst.extend_from_slice(&frame.payload);
        apply_mask(&mut dst[start..], mask);

        Ok(())
    }
}
