//! Non-blocking cursor over the accumulating input buffer.
//!
//! The cursor never consumes from the underlying buffer. Callers read as far as they can,
//! and only once a whole parsing stage succeeded do they advance the buffer by
//! [`ByteCursor::consumed`]. A stage that runs out of bytes leaves the buffer untouched, so
//! parsing resumes from the same position when more bytes arrive.

/// Signals that the buffer ran out before the current parsing stage could complete.
///
/// This is not an error: decoding suspends and resumes on the next delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NeedMoreInput;

/// Read cursor over a byte slice.
pub(crate) struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes read so far.
    #[inline]
    pub(crate) fn consumed(&self) -> usize {
        self.pos
    }

    /// Bytes left after the cursor.
    #[inline]
    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    #[inline]
    pub(crate) fn next_u8(&mut self) -> Result<u8, NeedMoreInput> {
        let byte = *self.buf.get(self.pos).ok_or(NeedMoreInput)?;
        self.pos += 1;
        Ok(byte)
    }

    /// Reads exactly `n` bytes.
    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], NeedMoreInput> {
        if self.remaining() < n {
            return Err(NeedMoreInput);
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16, NeedMoreInput> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64, NeedMoreInput> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(bytes))
    }
}
