#![forbid(unsafe_code)]

//! Paged file segment: a growable file with a validated header and a
//! filled-up-to watermark guarding every access.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::primitives::concurrency::FileLock;
use crate::primitives::io::{FileIo, StdFileIo};
use crate::primitives::mmap::{FileId, MapTarget, MmapManager};
use crate::types::{Result, TesseraError};

mod header;

pub use header::{HEADER_SIZE, SECURITY_CODE_LEN};
use header::SegmentHeader;

/// Growth and size limits for a segment.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentOptions {
    /// Positive: grow by this many bytes. Negative: grow by this percentage
    /// of the current size.
    pub increment_size: i64,
    /// Upper bound on the logical size; `0` means unbounded.
    pub max_size: u64,
    /// Fsync data and header when the segment is closed.
    pub sync_on_close: bool,
}

impl Default for SegmentOptions {
    fn default() -> Self {
        Self {
            increment_size: -50,
            max_size: 0,
            sync_on_close: true,
        }
    }
}

impl SegmentOptions {
    /// Sets the growth increment.
    pub fn increment_size(mut self, increment: i64) -> Self {
        self.increment_size = increment;
        self
    }

    /// Sets the maximum logical size.
    pub fn max_size(mut self, max: u64) -> Self {
        self.max_size = max;
        self
    }
}

enum Access {
    Direct,
    Mapped { manager: Arc<MmapManager>, id: FileId },
}

/// A single segment file.
///
/// Logical offsets start right after the header. Reads and writes must stay
/// below `filled_up_to`; space is claimed with [`PagedFile::allocate_space`].
pub struct PagedFile {
    io: StdFileIo,
    header: SegmentHeader,
    options: SegmentOptions,
    access: Access,
    was_softly_closed: bool,
    closed: bool,
    _lock: FileLock,
}

impl PagedFile {
    /// Creates a new segment with `start_size` bytes of logical space.
    ///
    /// Passing a manager routes data access through mapped windows.
    pub fn create(
        path: impl AsRef<Path>,
        start_size: u64,
        options: SegmentOptions,
        mmap: Option<Arc<MmapManager>>,
    ) -> Result<Self> {
        let path = path.as_ref();
        if options.max_size > 0 && start_size > options.max_size {
            return Err(TesseraError::CapacityExceeded {
                requested: start_size,
                max: options.max_size,
            });
        }
        let io = StdFileIo::create_new(path)?;
        let lock = FileLock::try_exclusive(&io)?;
        io.truncate(HEADER_SIZE + start_size)?;
        let mut file = Self {
            io,
            header: SegmentHeader::fresh(start_size),
            options,
            access: Self::access_for(mmap),
            was_softly_closed: true,
            closed: false,
            _lock: lock,
        };
        file.write_header()?;
        file.io.sync_all()?;
        debug!(path = %path.display(), start_size, "segment.create");
        Ok(file)
    }

    /// Opens an existing segment, validating its header.
    ///
    /// Fails with [`TesseraError::NotFound`] when the file is missing or empty
    /// and with [`TesseraError::Corruption`] when the header does not hold up.
    pub fn open(
        path: impl AsRef<Path>,
        options: SegmentOptions,
        mmap: Option<Arc<MmapManager>>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let io = StdFileIo::open_existing(path)?;
        let physical = io.len()?;
        if physical == 0 {
            return Err(TesseraError::NotFound(format!(
                "{} is empty",
                path.display()
            )));
        }
        let lock = FileLock::try_exclusive(&io)?;
        if physical < HEADER_SIZE {
            return Err(TesseraError::Corruption(format!(
                "{} is shorter than the segment header",
                path.display()
            )));
        }
        let mut raw = vec![0u8; HEADER_SIZE as usize];
        io.read_at(0, &mut raw)?;
        let header = SegmentHeader::decode(&raw)?;
        if physical < HEADER_SIZE + header.size {
            return Err(TesseraError::Corruption(format!(
                "{} holds {physical} bytes but its header claims {}",
                path.display(),
                HEADER_SIZE + header.size
            )));
        }
        let was_softly_closed = header.softly_closed;
        if !was_softly_closed {
            warn!(path = %path.display(), "segment.open.unclean_shutdown");
        }
        let mut file = Self {
            io,
            header,
            options,
            access: Self::access_for(mmap),
            was_softly_closed,
            closed: false,
            _lock: lock,
        };
        file.header.softly_closed = false;
        file.write_header()?;
        debug!(
            path = %path.display(),
            size = file.header.size,
            filled = file.header.filled_up_to,
            "segment.open"
        );
        Ok(file)
    }

    fn access_for(mmap: Option<Arc<MmapManager>>) -> Access {
        match mmap {
            Some(manager) => {
                let id = manager.register_file();
                Access::Mapped { manager, id }
            }
            None => Access::Direct,
        }
    }

    fn write_header(&mut self) -> Result<()> {
        self.io.write_at(0, &self.header.encode())
    }

    /// Whether the previous session closed the file cleanly.
    pub fn was_softly_closed(&self) -> bool {
        self.was_softly_closed
    }

    /// Logical capacity in bytes, excluding the header.
    pub fn size(&self) -> u64 {
        self.header.size
    }

    /// Bytes handed out by [`PagedFile::allocate_space`] so far.
    pub fn filled_up_to(&self) -> u64 {
        self.header.filled_up_to
    }

    /// Capacity left before the next growth.
    pub fn free_space(&self) -> u64 {
        self.header.size - self.header.filled_up_to
    }

    /// Per-file random code generated at creation.
    pub fn security_code(&self) -> &[u8; SECURITY_CODE_LEN] {
        &self.header.security_code
    }

    /// Settings in effect.
    pub fn options(&self) -> &SegmentOptions {
        &self.options
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        self.io.path()
    }

    fn growth_step(&self, current: u64) -> u64 {
        if self.options.increment_size > 0 {
            self.options.increment_size as u64
        } else {
            current.saturating_mul(self.options.increment_size.unsigned_abs()) / 100
        }
    }

    /// Claims `n` bytes at the end of the filled area and returns their offset.
    ///
    /// Grows the file by the configured increment as many times as needed,
    /// clamped to `max_size`. When the request cannot fit under `max_size`
    /// nothing is changed.
    pub fn allocate_space(&mut self, n: u64) -> Result<u64> {
        let offset = self.header.filled_up_to;
        let needed = offset.checked_add(n).ok_or(TesseraError::CapacityExceeded {
            requested: n,
            max: u64::MAX,
        })?;
        if needed > self.header.size {
            let max = self.options.max_size;
            if max > 0 && needed > max {
                return Err(TesseraError::CapacityExceeded { requested: n, max });
            }
            let mut new_size = self.header.size;
            while new_size < needed {
                let step = self.growth_step(new_size);
                new_size = if step == 0 {
                    needed
                } else {
                    new_size.saturating_add(step)
                };
            }
            if max > 0 {
                new_size = new_size.min(max);
            }
            self.resize(new_size)?;
        }
        self.header.filled_up_to = needed;
        self.write_header()?;
        Ok(offset)
    }

    fn resize(&mut self, new_size: u64) -> Result<()> {
        if new_size < self.header.size {
            if let Access::Mapped { manager, id } = &self.access {
                manager.release_file(*id)?;
            }
        }
        self.io.truncate(HEADER_SIZE + new_size)?;
        debug!(
            path = %self.path().display(),
            from = self.header.size,
            to = new_size,
            "segment.resize"
        );
        self.header.size = new_size;
        self.write_header()
    }

    /// Sets the logical size explicitly. Cannot drop below the filled area or
    /// exceed `max_size`.
    pub fn change_size(&mut self, new_size: u64) -> Result<()> {
        if new_size < self.header.filled_up_to {
            return Err(TesseraError::Invalid(
                "segment cannot shrink below its filled area",
            ));
        }
        let max = self.options.max_size;
        if max > 0 && new_size > max {
            return Err(TesseraError::CapacityExceeded {
                requested: new_size - self.header.size.min(new_size),
                max,
            });
        }
        self.resize(new_size)
    }

    /// Moves the watermark back to `filled`. No-op if `filled` is past it.
    pub fn shrink(&mut self, filled: u64) -> Result<()> {
        if filled > self.header.filled_up_to {
            return Ok(());
        }
        self.header.filled_up_to = filled;
        self.write_header()
    }

    /// Gives back the last `n` filled bytes, never going below zero.
    pub fn remove_tail(&mut self, n: u64) -> Result<()> {
        self.header.filled_up_to = self.header.filled_up_to.saturating_sub(n);
        self.write_header()
    }

    fn check_region(&self, offset: u64, len: usize) -> Result<()> {
        let filled = self.header.filled_up_to;
        match offset.checked_add(len as u64) {
            Some(end) if end <= filled => Ok(()),
            _ => Err(TesseraError::OutOfRange {
                offset,
                len: len as u64,
                filled,
            }),
        }
    }

    fn target(&self, id: FileId) -> MapTarget<'_> {
        MapTarget {
            id,
            file: self.io.file(),
            len: HEADER_SIZE + self.header.size,
        }
    }

    /// Fills `dst` from logical `offset`.
    pub fn read_bytes(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        self.check_region(offset, dst.len())?;
        let physical = HEADER_SIZE + offset;
        match &self.access {
            Access::Direct => self.io.read_at(physical, dst),
            Access::Mapped { manager, id } => manager.read_at(&self.target(*id), physical, dst),
        }
    }

    /// Reads `len` bytes from logical `offset`.
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.read_bytes(offset, &mut out)?;
        Ok(out)
    }

    /// Writes `src` at logical `offset`.
    pub fn write_bytes(&mut self, offset: u64, src: &[u8]) -> Result<()> {
        self.check_region(offset, src.len())?;
        let physical = HEADER_SIZE + offset;
        match &self.access {
            Access::Direct => self.io.write_at(physical, src),
            Access::Mapped { manager, id } => manager.write_at(&self.target(*id), physical, src),
        }
    }

    fn read_array<const N: usize>(&self, offset: u64) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        self.read_bytes(offset, &mut out)?;
        Ok(out)
    }

    /// Reads one byte.
    pub fn read_u8(&self, offset: u64) -> Result<u8> {
        Ok(self.read_array::<1>(offset)?[0])
    }

    /// Reads a big-endian `i16`.
    pub fn read_i16(&self, offset: u64) -> Result<i16> {
        Ok(i16::from_be_bytes(self.read_array(offset)?))
    }

    /// Reads a big-endian `i32`.
    pub fn read_i32(&self, offset: u64) -> Result<i32> {
        Ok(i32::from_be_bytes(self.read_array(offset)?))
    }

    /// Reads a big-endian `i64`.
    pub fn read_i64(&self, offset: u64) -> Result<i64> {
        Ok(i64::from_be_bytes(self.read_array(offset)?))
    }

    /// Writes one byte.
    pub fn write_u8(&mut self, offset: u64, v: u8) -> Result<()> {
        self.write_bytes(offset, &[v])
    }

    /// Writes a big-endian `i16`.
    pub fn write_i16(&mut self, offset: u64, v: i16) -> Result<()> {
        self.write_bytes(offset, &v.to_be_bytes())
    }

    /// Writes a big-endian `i32`.
    pub fn write_i32(&mut self, offset: u64, v: i32) -> Result<()> {
        self.write_bytes(offset, &v.to_be_bytes())
    }

    /// Writes a big-endian `i64`.
    pub fn write_i64(&mut self, offset: u64, v: i64) -> Result<()> {
        self.write_bytes(offset, &v.to_be_bytes())
    }

    /// Forces data and header to disk.
    pub fn synch(&self) -> Result<()> {
        if let Access::Mapped { manager, id } = &self.access {
            manager.flush_file(*id)?;
        }
        self.io.sync_all()
    }

    /// Marks the segment softly closed and flushes it. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if let Access::Mapped { manager, id } = &self.access {
            manager.release_file(*id)?;
        }
        self.header.softly_closed = true;
        self.write_header()?;
        if self.options.sync_on_close {
            self.io.sync_all()?;
        }
        self.closed = true;
        debug!(path = %self.path().display(), "segment.close");
        Ok(())
    }

    /// Closes the segment and removes its file.
    pub fn delete(mut self) -> Result<()> {
        self.close()?;
        let path: PathBuf = self.path().to_path_buf();
        drop(self);
        std::fs::remove_file(&path)?;
        debug!(path = %path.display(), "segment.delete");
        Ok(())
    }
}

impl fmt::Debug for PagedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagedFile")
            .field("path", &self.path().display())
            .field("size", &self.header.size)
            .field("filled_up_to", &self.header.filled_up_to)
            .field("mapped", &matches!(self.access, Access::Mapped { .. }))
            .finish()
    }
}

impl Drop for PagedFile {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Left without the softly-closed mark on purpose: the next open
        // reports the unclean shutdown.
        if let Access::Mapped { manager, id } = &self.access {
            if let Err(err) = manager.release_file(*id) {
                warn!(path = %self.path().display(), error = %err, "segment.drop.flush_failed");
            }
        }
    }
}
