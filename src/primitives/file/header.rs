//! Fixed segment header stored in the first [`HEADER_SIZE`] bytes of the file.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::types::{Result, TesseraError};

/// Bytes reserved at the start of every segment file.
pub const HEADER_SIZE: u64 = 1024;

/// Length of the per-file security code.
pub const SECURITY_CODE_LEN: usize = 32;

pub(crate) const SEGMENT_MAGIC: [u8; 4] = *b"TSEG";
pub(crate) const SEGMENT_FORMAT_VERSION: u16 = 1;

/// Byte offsets for fixed header fields.
pub(crate) mod layout {
    use core::ops::Range;

    pub const MAGIC: Range<usize> = 0..4;
    pub const FORMAT_VERSION: Range<usize> = 4..6;
    pub const SIZE: Range<usize> = 8..16;
    pub const FILLED_UP_TO: Range<usize> = 16..24;
    pub const SOFTLY_CLOSED: usize = 24;
    pub const SECURITY_CODE: Range<usize> = 32..64;
    pub const CRC32: Range<usize> = 64..68;
    pub const ENCODED_LEN: usize = 68;
}

/// In-memory copy of the segment header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct SegmentHeader {
    pub size: u64,
    pub filled_up_to: u64,
    pub softly_closed: bool,
    pub security_code: [u8; SECURITY_CODE_LEN],
}

impl SegmentHeader {
    pub fn fresh(size: u64) -> Self {
        let mut security_code = [0u8; SECURITY_CODE_LEN];
        OsRng.fill_bytes(&mut security_code);
        Self {
            size,
            filled_up_to: 0,
            softly_closed: false,
            security_code,
        }
    }

    pub fn encode(&self) -> [u8; layout::ENCODED_LEN] {
        let mut out = [0u8; layout::ENCODED_LEN];
        out[layout::MAGIC].copy_from_slice(&SEGMENT_MAGIC);
        out[layout::FORMAT_VERSION].copy_from_slice(&SEGMENT_FORMAT_VERSION.to_be_bytes());
        out[layout::SIZE].copy_from_slice(&(self.size as i64).to_be_bytes());
        out[layout::FILLED_UP_TO].copy_from_slice(&(self.filled_up_to as i64).to_be_bytes());
        out[layout::SOFTLY_CLOSED] = u8::from(self.softly_closed);
        out[layout::SECURITY_CODE].copy_from_slice(&self.security_code);
        let crc = crc32fast::hash(&out[..layout::CRC32.start]);
        out[layout::CRC32].copy_from_slice(&crc.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < layout::ENCODED_LEN {
            return Err(corrupt("header truncated"));
        }
        if bytes[layout::MAGIC] != SEGMENT_MAGIC {
            return Err(corrupt("bad magic"));
        }
        let version = u16::from_be_bytes(read_array(&bytes[layout::FORMAT_VERSION]));
        if version != SEGMENT_FORMAT_VERSION {
            return Err(corrupt(&format!("unsupported format version {version}")));
        }
        let stored_crc = u32::from_be_bytes(read_array(&bytes[layout::CRC32]));
        if crc32fast::hash(&bytes[..layout::CRC32.start]) != stored_crc {
            return Err(corrupt("header checksum mismatch"));
        }
        let size = i64::from_be_bytes(read_array(&bytes[layout::SIZE]));
        let filled = i64::from_be_bytes(read_array(&bytes[layout::FILLED_UP_TO]));
        if size < 0 || filled < 0 {
            return Err(corrupt(&format!(
                "negative size ({size}) or filled-up-to ({filled})"
            )));
        }
        if filled > size {
            return Err(corrupt(&format!(
                "filled-up-to {filled} is past the file size {size}"
            )));
        }
        Ok(Self {
            size: size as u64,
            filled_up_to: filled as u64,
            softly_closed: bytes[layout::SOFTLY_CLOSED] != 0,
            security_code: read_array(&bytes[layout::SECURITY_CODE]),
        })
    }
}

fn read_array<const N: usize>(src: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(src);
    out
}

fn corrupt(what: &str) -> TesseraError {
    TesseraError::Corruption(format!("segment header: {what}"))
}
