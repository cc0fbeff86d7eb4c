//! Incremental, strict UTF-8 validation.
//!
//! Text messages arrive in pieces: fragments, and inside compressed messages whatever the
//! inflater produced for each fragment. [`Utf8Validator`] consumes those pieces in order,
//! keeps the state of a code point cut between two pieces, and fails as soon as the input can
//! no longer be the prefix of valid UTF-8 (RFC 3629). The decoded text is accumulated, so a
//! completed message does not need a second validation pass.

use crate::{Result, WebSocketError};

/// Strict streaming UTF-8 decoder.
#[derive(Default)]
pub(crate) struct Utf8Validator {
    /// Text decoded so far.
    text: String,
    /// Length of the multi-byte sequence in progress, 0 when between code points.
    count: u8,
    /// Bytes of the sequence in progress consumed so far.
    processed: u8,
    /// Code point accumulator for the sequence in progress.
    codepoint: u32,
}

impl Utf8Validator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Validates and appends the next run of bytes.
    pub(crate) fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if self.count == 0 {
            if bytes.is_ascii() {
                // every byte below 0x80 is its own code point
                self.text
                    .push_str(std::str::from_utf8(bytes).map_err(|_| WebSocketError::InvalidUTF8)?);
                return Ok(());
            }

            #[cfg(feature = "simd")]
            if let Ok(text) = simdutf8::basic::from_utf8(bytes) {
                self.text.push_str(text);
                return Ok(());
            }
        }

        self.text.try_reserve(bytes.len())?;
        for &byte in bytes {
            self.push_byte(byte)?;
        }

        Ok(())
    }

    /// Bytes taken in so far, counting the start of a sequence still waiting for more bytes.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.text.len() + self.processed as usize
    }

    /// Returns `true` when no multi-byte sequence is waiting for more bytes.
    #[inline]
    pub(crate) fn is_complete(&self) -> bool {
        self.count == 0
    }

    /// Ends the current message and returns its text.
    ///
    /// Fails if the input stopped in the middle of a code point. The validator is reset
    /// either way.
    pub(crate) fn finish(&mut self) -> Result<String> {
        let complete = self.is_complete();
        let text = std::mem::take(&mut self.text);
        self.reset();

        if complete {
            Ok(text)
        } else {
            Err(WebSocketError::InvalidUTF8)
        }
    }

    /// Drops any decoded text and pending sequence.
    pub(crate) fn reset(&mut self) {
        self.text.clear();
        self.count = 0;
        self.processed = 0;
        self.codepoint = 0;
    }

    fn push_byte(&mut self, byte: u8) -> Result<()> {
        if self.count == 0 {
            let (count, bits) = match byte {
                0x00..=0x7F => {
                    self.text.push(char::from(byte));
                    return Ok(());
                }
                // 0xC0 and 0xC1 can only start overlong encodings
                0xC2..=0xDF => (2, byte & 0x1F),
                0xE0..=0xEF => (3, byte & 0x0F),
                // above 0xF4 every sequence exceeds U+10FFFF
                0xF0..=0xF4 => (4, byte & 0x07),
                _ => return Err(WebSocketError::InvalidUTF8),
            };

            self.count = count;
            self.processed = 1;
            self.codepoint = u32::from(bits);
            return Ok(());
        }

        if byte & 0xC0 != 0x80 {
            return Err(WebSocketError::InvalidUTF8);
        }

        // The second byte already tells overlong forms, surrogates and values above U+10FFFF
        // apart from valid ones.
        if self.processed == 1 {
            let valid = match (self.count, self.codepoint) {
                (3, 0x0) => byte >= 0xA0,
                (3, 0xD) => byte <= 0x9F,
                (4, 0x0) => byte >= 0x90,
                (4, 0x4) => byte <= 0x8F,
                _ => true,
            };
            if !valid {
                return Err(WebSocketError::InvalidUTF8);
            }
        }

        self.codepoint = (self.codepoint << 6) | u32::from(byte & 0x3F);
        self.processed += 1;

        if self.processed == self.count {
            let min = match self.count {
                2 => 0x80,
                3 => 0x800,
                _ => 0x10000,
            };
            if self.codepoint < min {
                return Err(WebSocketError::InvalidUTF8);
            }

            // rejects surrogates and values above U+10FFFF
            let ch = char::from_u32(self.codepoint).ok_or(WebSocketError::InvalidUTF8)?;
            self.text.push(ch);

            self.count = 0;
            self.processed = 0;
            self.codepoint = 0;
        }

        Ok(())
    }
}
