//! permessage-deflate (RFC 7692): extension negotiation and the DEFLATE streams behind it.
//!
//! Compressed messages are raw DEFLATE without a zlib header. A sender flushes each message
//! with a sync flush and strips the resulting `00 00 FF FF` trailer, so the receiving side
//! appends it back before inflating the last fragment.
use std::io;

use flate2::{FlushCompress, FlushDecompress, Status};
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, digit1, space0},
    combinator::opt,
    sequence::{delimited, pair, preceded},
    IResult, Parser,
};

use crate::{CompressionLevel, DeflateOptions, Result, WebSocketError};

static PERMESSAGE_DEFLATE: &str = "permessage-deflate";

/// Trailer removed from every compressed message by the sender.
const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Window size used when a `*_max_window_bits` parameter has no value.
pub(crate) const MAX_WINDOW_BITS: u8 = 15;

/// Parameters of the permessage-deflate extension.
///
/// Used twice during the handshake: rendered into the client offer, then parsed back from
/// the server's `Sec-WebSocket-Extensions` response header to get the agreed settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct WebSocketExtensions {
    pub(crate) server_max_window_bits: Option<u8>,
    pub(crate) client_max_window_bits: Option<u8>,
    pub(crate) server_no_context_takeover: bool,
    pub(crate) client_no_context_takeover: bool,
}

impl<'a> From<&'a DeflateOptions> for WebSocketExtensions {
    fn from(value: &'a DeflateOptions) -> Self {
        Self {
            server_max_window_bits: value.server_max_window_bits,
            client_max_window_bits: value.client_max_window_bits,
            server_no_context_takeover: value.server_no_context_takeover,
            client_no_context_takeover: value.client_no_context_takeover,
        }
    }
}

impl std::fmt::Display for WebSocketExtensions {
    /// Formats the client offer.
    ///
    /// `client_max_window_bits` is always offered, without a value unless one was configured,
    /// which lets the server pick any window for the client.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{PERMESSAGE_DEFLATE}")?;

        if self.client_no_context_takeover {
            write!(f, "; client_no_context_takeover")?;
        }
        if self.server_no_context_takeover {
            write!(f, "; server_no_context_takeover")?;
        }
        match self.client_max_window_bits {
            Some(bits) => write!(f, "; client_max_window_bits={bits}")?,
            None => write!(f, "; client_max_window_bits")?,
        }
        if let Some(bits) = self.server_max_window_bits {
            write!(f, "; server_max_window_bits={bits}")?;
        }

        Ok(())
    }
}

impl WebSocketExtensions {
    /// Looks for permessage-deflate in a `Sec-WebSocket-Extensions` response header.
    ///
    /// The header may list several comma separated extensions. Other extensions are skipped;
    /// `Ok(None)` means permessage-deflate was not accepted.
    pub(crate) fn from_response(header: &str) -> Result<Option<Self>> {
        for extension in header.split(',') {
            let extension = extension.trim();
            let name = extension.split(';').next().unwrap_or_default().trim();
            if name == PERMESSAGE_DEFLATE {
                return extension.parse().map(Some);
            }
        }

        Ok(None)
    }

    /// Parses a single permessage-deflate extension with its parameters.
    ///
    /// Window bits must be in `8..=15`; a window parameter without a value means 15.
    /// Unknown parameters are ignored.
    fn parse(input: &str) -> Result<Self> {
        let mut this = Self::default();

        let (mut input, _) = tag::<_, _, nom::error::Error<&str>>(PERMESSAGE_DEFLATE)
            .parse(input.trim())
            .map_err(|err| WebSocketError::InvalidCompressionOptions(err.to_string()))?;

        while !input.trim_end().is_empty() {
            let (remaining, (key, value)) = Self::parse_extension(input)
                .map_err(|err| WebSocketError::InvalidCompressionOptions(err.to_string()))?;

            match key {
                "client_no_context_takeover" => this.client_no_context_takeover = true,
                "server_no_context_takeover" => this.server_no_context_takeover = true,
                "server_max_window_bits" => {
                    this.server_max_window_bits = Some(Self::window_bits(key, value)?)
                }
                "client_max_window_bits" => {
                    this.client_max_window_bits = Some(Self::window_bits(key, value)?)
                }
                _ => {}
            }

            input = remaining;
        }

        Ok(this)
    }

    /// Parses a single `; key[=value]` parameter. Values may be quoted.
    fn parse_extension(input: &str) -> IResult<&str, (&str, Option<&str>)> {
        preceded(
            (space0, char(';'), space0),
            pair(
                take_while1(|c: char| c.is_alphanumeric() || c == '_'),
                opt(preceded(
                    (space0, char('='), space0),
                    alt((delimited(char('"'), digit1, char('"')), digit1)),
                )),
            ),
        )
        .parse(input)
    }

    fn window_bits(key: &str, value: Option<&str>) -> Result<u8> {
        let Some(value) = value else {
            return Ok(MAX_WINDOW_BITS);
        };

        match value.parse::<u8>() {
            Ok(bits) if (8..=MAX_WINDOW_BITS).contains(&bits) => Ok(bits),
            _ => Err(WebSocketError::InvalidCompressionOptions(format!(
                "{key}={value} is outside 8..=15"
            ))),
        }
    }
}

impl std::str::FromStr for WebSocketExtensions {
    type Err = WebSocketError;

    fn from_str(input: &str) -> Result<Self> {
        Self::parse(input)
    }
}

/// Returns `true` if the linked DEFLATE backend can compress within a window of `bits`.
///
/// zlib silently widens an 8 bit raw deflate window to 9, and the pure Rust backend only
/// produces 15 bit windows.
pub(crate) fn can_compress_with_window(bits: u8) -> bool {
    if cfg!(feature = "zlib") {
        (9..=MAX_WINDOW_BITS).contains(&bits)
    } else {
        bits == MAX_WINDOW_BITS
    }
}

/// Compresses outgoing messages.
///
/// Every call to [`Compressor::compress`] produces one complete message payload.
pub(crate) struct Compressor {
    deflate: flate2::Compress,
    no_context_takeover: bool,
}

impl Compressor {
    /// Creates a compressor for the negotiated window, or `None` if the backend cannot honour it.
    pub(crate) fn new(level: CompressionLevel, window_bits: u8, no_context_takeover: bool) -> Option<Self> {
        if !can_compress_with_window(window_bits) {
            return None;
        }

        #[cfg(feature = "zlib")]
        let deflate = flate2::Compress::new_with_window_bits(level, false, window_bits);
        #[cfg(not(feature = "zlib"))]
        let deflate = flate2::Compress::new(level, false);

        Some(Self {
            deflate,
            no_context_takeover,
        })
    }

    /// Compresses one message and strips the sync flush trailer.
    pub(crate) fn compress(&mut self, mut input: &[u8]) -> Result<Vec<u8>> {
        let mut output = Vec::new();
        output.try_reserve(input.len() / 2 + 64)?;

        while !input.is_empty() {
            grow(&mut output)?;

            let before_in = self.deflate.total_in();
            self.deflate
                .compress_vec(input, &mut output, FlushCompress::None)
                .map_err(|err| WebSocketError::Compression(deflate_error(err)))?;
            let consumed = (self.deflate.total_in() - before_in) as usize;

            input = &input[consumed..];
        }

        grow(&mut output)?;
        self.deflate
            .compress_vec(&[], &mut output, FlushCompress::Sync)
            .map_err(|err| WebSocketError::Compression(deflate_error(err)))?;

        // drain whatever the sync flush could not fit
        loop {
            grow(&mut output)?;

            let before_out = self.deflate.total_out();
            self.deflate
                .compress_vec(&[], &mut output, FlushCompress::None)
                .map_err(|err| WebSocketError::Compression(deflate_error(err)))?;

            if before_out == self.deflate.total_out() {
                break;
            }
        }

        if output.ends_with(&DEFLATE_TRAILER) {
            output.truncate(output.len() - DEFLATE_TRAILER.len());
        }

        if self.no_context_takeover {
            self.deflate.reset();
        }

        Ok(output)
    }
}

/// Inflates incoming compressed messages, one frame at a time.
///
/// The inflater carries partial DEFLATE blocks from one fragment to the next, so frames are
/// handed over as they arrive.
pub(crate) struct Decompressor {
    inflate: flate2::Decompress,
    no_context_takeover: bool,
    /// The peer ended the DEFLATE stream with a final block.
    stream_end: bool,
}

impl Decompressor {
    /// Creates a decompressor for the server's window.
    ///
    /// flate2 accepts windows of 9 to 15 bits. An inflater with a larger window reads data
    /// produced with a smaller one, so an 8 bit window is inflated with 9.
    pub(crate) fn new(window_bits: u8, no_context_takeover: bool) -> Self {
        #[cfg(feature = "zlib")]
        let inflate = flate2::Decompress::new_with_window_bits(false, window_bits.clamp(9, MAX_WINDOW_BITS));
        #[cfg(not(feature = "zlib"))]
        let inflate = {
            let _ = window_bits;
            flate2::Decompress::new(false)
        };

        Self {
            inflate,
            no_context_takeover,
            stream_end: false,
        }
    }

    /// Inflates the payload of one frame into `output`.
    ///
    /// `fin` marks the last frame of the message: the trailer is fed and, without context
    /// takeover, the window is dropped afterwards. Growing `output` past `limit` bytes fails
    /// with [`WebSocketError::FrameTooLarge`].
    pub(crate) fn decompress(
        &mut self,
        input: &[u8],
        fin: bool,
        output: &mut Vec<u8>,
        limit: usize,
    ) -> Result<()> {
        self.inflate_into(input, output, limit)?;

        if fin {
            if !self.stream_end {
                self.inflate_into(&DEFLATE_TRAILER, output, limit)?;
            }

            if self.no_context_takeover || self.stream_end {
                self.inflate.reset(false);
                self.stream_end = false;
            }
        }

        Ok(())
    }

    fn inflate_into(&mut self, mut input: &[u8], output: &mut Vec<u8>, limit: usize) -> Result<()> {
        loop {
            grow(output)?;

            let before_in = self.inflate.total_in();
            let before_out = self.inflate.total_out();

            let status = self
                .inflate
                .decompress_vec(input, output, FlushDecompress::Sync)
                .map_err(|err| WebSocketError::Decompression(inflate_error(err)))?;

            let consumed = (self.inflate.total_in() - before_in) as usize;
            let produced = (self.inflate.total_out() - before_out) as usize;
            input = &input[consumed..];

            if output.len() > limit {
                return Err(WebSocketError::FrameTooLarge);
            }

            match status {
                Status::StreamEnd => {
                    self.stream_end = true;
                    if !input.is_empty() {
                        return Err(WebSocketError::Decompression(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "data after the final deflate block",
                        )));
                    }
                    return Ok(());
                }
                Status::Ok | Status::BufError => {
                    let output_full = output.len() == output.capacity();
                    if input.is_empty() && !output_full {
                        return Ok(());
                    }
                    if consumed == 0 && produced == 0 && !output_full {
                        return Err(WebSocketError::Decompression(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "corrupt deflate stream",
                        )));
                    }
                }
            }
        }
    }
}

/// Doubles the capacity of `output` once it is full.
fn grow(output: &mut Vec<u8>) -> Result<()> {
    if output.len() == output.capacity() {
        output.try_reserve(output.capacity().max(1024))?;
    }
    Ok(())
}

fn deflate_error(err: flate2::CompressError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, err.to_string())
}

fn inflate_error(err: flate2::DecompressError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err.to_string())
}
