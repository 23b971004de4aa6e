use super::error::{ShimError, ShimResult};

/// Origin of a seek, with POSIX `SEEK_SET`/`SEEK_CUR`/`SEEK_END` meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
}

impl Whence {
    /// Maps the C constants `0`, `1` and `2` to a [`Whence`].
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Whence::Start),
            1 => Some(Whence::Current),
            2 => Some(Whence::End),
            _ => None,
        }
    }
}

/// Base trait for pull-based byte streams handed to the engine.
///
/// The required methods mirror the engine's stream callbacks: a cursor, a
/// `seek` that only repositions, and a `next` that refills the readable
/// window and returns its first byte. Any of the read methods may fail with
/// [`ShimError::TryLater`]; the caller is expected to replay the identical
/// call once the awaited data has been delivered.
pub trait BaseStream {
    // ============================================================================
    // Required methods (must be implemented by all stream types)
    // ============================================================================

    /// Returns the total length of the stream in bytes.
    fn length(&self) -> usize;

    /// Returns the logical position of the next byte to be read.
    fn pos(&self) -> usize;

    /// Repositions the cursor and discards the readable window.
    ///
    /// The result is clamped to `[0, length]`. Seeking never fails and never
    /// triggers I/O.
    fn seek(&mut self, offset: i64, whence: Whence) -> usize;

    /// Refills the readable window at the current position and returns its
    /// first byte, or `None` at the end of the stream.
    ///
    /// `len` is a hint for how much the caller intends to read.
    fn next(&mut self, len: usize) -> ShimResult<Option<u8>>;

    /// Number of bytes left in the readable window.
    fn available(&self) -> usize;

    /// Reads one byte, refilling the window through [`BaseStream::next`]
    /// when it is empty.
    fn read_byte(&mut self) -> ShimResult<Option<u8>>;

    /// Releases the stream's resources. Further reads fail.
    fn close(&mut self) -> ShimResult<()>;

    // ============================================================================
    // Provided methods with default implementations
    // ============================================================================

    /// Returns true if the stream contains no data.
    fn is_empty(&self) -> bool {
        self.length() == 0
    }

    /// Sets the absolute position.
    fn set_pos(&mut self, pos: usize) -> usize {
        self.seek(pos as i64, Whence::Start)
    }

    /// Reads a single byte without advancing the position.
    fn peek_byte(&mut self) -> ShimResult<Option<u8>> {
        let current_pos = self.pos();
        let byte = self.read_byte()?;
        if byte.is_some() {
            self.set_pos(current_pos);
        }
        Ok(byte)
    }

    /// Reads into `buf` and returns the number of bytes copied.
    ///
    /// A read that hits a missing block after copying some bytes returns the
    /// short count; the error is reported by the following call.
    fn read_into(&mut self, buf: &mut [u8]) -> ShimResult<usize> {
        let mut n = 0;
        while n < buf.len() {
            match self.read_byte() {
                Ok(Some(byte)) => {
                    buf[n] = byte;
                    n += 1;
                }
                Ok(None) => break,
                Err(e) if n > 0 && e.is_try_later() => break,
                Err(e) => return Err(e),
            }
        }
        Ok(n)
    }

    /// Reads up to `length` bytes; fewer are returned only at the end of the
    /// stream.
    ///
    /// On any error the position is restored, so the call can be replayed
    /// as-is after a `TryLater`.
    fn read_bytes(&mut self, length: usize) -> ShimResult<Vec<u8>> {
        let start = self.pos();
        let mut bytes = Vec::with_capacity(length.min(self.length()));
        while bytes.len() < length {
            match self.read_byte() {
                Ok(Some(byte)) => bytes.push(byte),
                Ok(None) => break,
                Err(e) => {
                    self.set_pos(start);
                    return Err(e);
                }
            }
        }
        Ok(bytes)
    }

    /// Reads exactly `length` bytes or fails with `UnexpectedEndOfStream`.
    fn get_bytes(&mut self, length: usize) -> ShimResult<Vec<u8>> {
        let start = self.pos();
        let bytes = self.read_bytes(length)?;
        if bytes.len() < length {
            self.set_pos(start);
            return Err(ShimError::UnexpectedEndOfStream);
        }
        Ok(bytes)
    }

    /// Reads a 16-bit unsigned integer (big-endian) from the stream.
    fn get_uint16(&mut self) -> ShimResult<u16> {
        let b = self.get_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Reads a 32-bit signed integer (big-endian) from the stream.
    fn get_int32(&mut self) -> ShimResult<i32> {
        let b = self.get_bytes(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads `length` bytes and converts them to a UTF-8 string.
    ///
    /// Invalid UTF-8 sequences are replaced with the replacement character.
    fn get_string(&mut self, length: usize) -> ShimResult<String> {
        let bytes = self.get_bytes(length)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Skips `n` bytes; clamped at the end of the stream.
    fn skip(&mut self, n: usize) -> usize {
        self.seek(n as i64, Whence::Current)
    }
}

/// Clamps `base + offset` to `[0, length]`.
pub(crate) fn clamp_offset(base: usize, offset: i64, length: usize) -> usize {
    let target = base as i128 + offset as i128;
    target.clamp(0, length as i128) as usize
}
