#![forbid(unsafe_code)]

//! Big-endian encoders and a bounds-checked cursor for record payloads.

/// Appending writers for the fixed-width and length-prefixed fields used by
/// node and metadata records.
pub mod put {
    use crate::types::{Result, TesseraError};

    /// Appends one byte.
    pub fn u8(out: &mut Vec<u8>, v: u8) {
        out.push(v);
    }

    /// Appends a boolean as `0`/`1`.
    pub fn bool(out: &mut Vec<u8>, v: bool) {
        out.push(u8::from(v));
    }

    /// Appends a big-endian `i16`.
    pub fn i16(out: &mut Vec<u8>, v: i16) {
        out.extend_from_slice(&v.to_be_bytes());
    }

    /// Appends a big-endian `u32`.
    pub fn u32(out: &mut Vec<u8>, v: u32) {
        out.extend_from_slice(&v.to_be_bytes());
    }

    /// Appends a big-endian `i64`.
    pub fn i64(out: &mut Vec<u8>, v: i64) {
        out.extend_from_slice(&v.to_be_bytes());
    }

    /// Appends `bytes` preceded by its `u32` length.
    pub fn len_prefixed(out: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| TesseraError::Serialization("field longer than 4 GiB".into()))?;
        u32(out, len);
        out.extend_from_slice(bytes);
        Ok(())
    }
}

/// Slice-backed cursor for parsing.
pub mod buf {
    use core::fmt;

    use crate::types::{Result, TesseraError};

    /// A cursor for reading bytes from a slice with offset tracking.
    pub struct Cursor<'a> {
        buf: &'a [u8],
        off: usize,
    }

    impl<'a> Cursor<'a> {
        /// Creates a new cursor starting at offset 0.
        pub fn new(buf: &'a [u8]) -> Self {
            Self { buf, off: 0 }
        }

        /// Takes the next `n` bytes, failing if the slice is too short.
        pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            let end = self
                .off
                .checked_add(n)
                .filter(|end| *end <= self.buf.len())
                .ok_or_else(|| {
                    TesseraError::Serialization(format!(
                        "truncated input: need {n} bytes at offset {}, {} remaining",
                        self.off,
                        self.remaining()
                    ))
                })?;
            let slice = &self.buf[self.off..end];
            self.off = end;
            Ok(slice)
        }

        fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
            let mut out = [0u8; N];
            out.copy_from_slice(self.take(N)?);
            Ok(out)
        }

        /// Reads one byte.
        pub fn u8(&mut self) -> Result<u8> {
            Ok(self.array::<1>()?[0])
        }

        /// Reads a `0`/`1` boolean; any other byte is rejected.
        pub fn bool(&mut self) -> Result<bool> {
            match self.u8()? {
                0 => Ok(false),
                1 => Ok(true),
                other => Err(TesseraError::Serialization(format!(
                    "invalid boolean byte {other:#04x}"
                ))),
            }
        }

        /// Reads a big-endian `i16`.
        pub fn i16(&mut self) -> Result<i16> {
            Ok(i16::from_be_bytes(self.array()?))
        }

        /// Reads a big-endian `u32`.
        pub fn u32(&mut self) -> Result<u32> {
            Ok(u32::from_be_bytes(self.array()?))
        }

        /// Reads a big-endian `i64`.
        pub fn i64(&mut self) -> Result<i64> {
            Ok(i64::from_be_bytes(self.array()?))
        }

        /// Reads a `u32` length followed by that many bytes.
        pub fn len_prefixed(&mut self) -> Result<&'a [u8]> {
            let len = self.u32()? as usize;
            self.take(len)
        }

        /// Returns the number of bytes remaining in the buffer.
        pub fn remaining(&self) -> usize {
            self.buf.len().saturating_sub(self.off)
        }

        /// Current read offset.
        pub fn offset(&self) -> usize {
            self.off
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
