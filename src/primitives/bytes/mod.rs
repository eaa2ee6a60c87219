#![forbid(unsafe_code)]
//! Encoding and buffer utilities shared across the page and log layers.

pub mod be {
    //! Fixed-offset big-endian field access for page buffers.
    //!
    //! Callers validate offsets against the page length first; an out of range
    //! offset here is a bug and panics like slice indexing does.

    use core::convert::TryInto;

    /// Reads a u32 stored at `off`.
    pub fn get_u32(buf: &[u8], off: usize) -> u32 {
        u32::from_be_bytes(buf[off..off + 4].try_into().unwrap())
    }

    /// Writes a u32 at `off`.
    pub fn put_u32(buf: &mut [u8], off: usize, v: u32) {
        buf[off..off + 4].copy_from_slice(&v.to_be_bytes());
    }

    /// Reads a u64 stored at `off`.
    pub fn get_u64(buf: &[u8], off: usize) -> u64 {
        u64::from_be_bytes(buf[off..off + 8].try_into().unwrap())
    }

    /// Writes a u64 at `off`.
    pub fn put_u64(buf: &mut [u8], off: usize, v: u64) {
        buf[off..off + 8].copy_from_slice(&v.to_be_bytes());
    }

    /// Reads an i64 stored at `off`.
    pub fn get_i64(buf: &[u8], off: usize) -> i64 {
        get_u64(buf, off) as i64
    }

    /// Writes an i64 at `off`.
    pub fn put_i64(buf: &mut [u8], off: usize, v: i64) {
        put_u64(buf, off, v as u64);
    }
}

pub mod out {
    //! Appending encoders for the record wire format.

    /// Appends a single byte.
    pub fn u8(dst: &mut Vec<u8>, v: u8) {
        dst.push(v);
    }

    /// Appends a big-endian u32.
    pub fn u32(dst: &mut Vec<u8>, v: u32) {
        dst.extend_from_slice(&v.to_be_bytes());
    }

    /// Appends a big-endian u64.
    pub fn u64(dst: &mut Vec<u8>, v: u64) {
        dst.extend_from_slice(&v.to_be_bytes());
    }

    /// Appends a big-endian i64.
    pub fn i64(dst: &mut Vec<u8>, v: i64) {
        dst.extend_from_slice(&v.to_be_bytes());
    }

    /// Appends `bytes` prefixed with its u32 length.
    pub fn bytes(dst: &mut Vec<u8>, bytes: &[u8]) {
        assert!(
            bytes.len() <= u32::MAX as usize,
            "byte field too long (>{} bytes)",
            u32::MAX
        );
        u32(dst, bytes.len() as u32);
        dst.extend_from_slice(bytes);
    }

    /// Encoded size of a length-prefixed byte field.
    pub const fn bytes_len(len: usize) -> usize {
        4 + len
    }
}

pub mod buf {
    //! A slice-backed cursor for decoding untrusted input.

    use core::convert::TryInto;
    use core::fmt;

    use crate::types::{Result, SombraError};

    /// A cursor for reading bytes from a slice with offset tracking.
    ///
    /// Every read is bounds checked; running past the end yields
    /// [`SombraError::Corruption`] instead of panicking, so a truncated log
    /// record surfaces as a decode failure.
    pub struct Cursor<'a> {
        /// The underlying byte slice.
        pub buf: &'a [u8],
        /// Current read offset.
        pub off: usize,
    }

    impl<'a> Cursor<'a> {
        /// Creates a new cursor starting at offset 0.
        pub fn new(buf: &'a [u8]) -> Self {
            Self { buf, off: 0 }
        }

        /// Takes the next `n` bytes from the cursor, advancing the offset.
        pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            let end = self
                .off
                .checked_add(n)
                .ok_or(SombraError::Corruption("record length overflow"))?;
            if end > self.buf.len() {
                return Err(SombraError::Corruption("record truncated"));
            }
            let slice = &self.buf[self.off..end];
            self.off = end;
            Ok(slice)
        }

        /// Reads one byte.
        pub fn u8(&mut self) -> Result<u8> {
            Ok(self.take(1)?[0])
        }

        /// Reads a big-endian u32.
        pub fn u32(&mut self) -> Result<u32> {
            Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
        }

        /// Reads a big-endian u64.
        pub fn u64(&mut self) -> Result<u64> {
            Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
        }

        /// Reads a big-endian i64.
        pub fn i64(&mut self) -> Result<i64> {
            Ok(self.u64()? as i64)
        }

        /// Reads a u32 length prefix followed by that many bytes.
        pub fn bytes(&mut self) -> Result<Vec<u8>> {
            let len = self.u32()? as usize;
            if len > self.remaining() {
                return Err(SombraError::Corruption("length prefix exceeds record"));
            }
            Ok(self.take(len)?.to_vec())
        }

        /// Returns the number of bytes remaining in the buffer.
        pub fn remaining(&self) -> usize {
            self.buf.len().saturating_sub(self.off)
        }

        /// Fails unless every byte has been consumed.
        pub fn finish(&self) -> Result<()> {
            if self.remaining() != 0 {
                return Err(SombraError::Corruption("trailing bytes after record"));
            }
            Ok(())
        }
    }

    impl<'a> fmt::Debug for Cursor<'a> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Cursor")
                .field("off", &self.off)
                .field("remaining", &self.remaining())
                .finish()
        }
    }
}
