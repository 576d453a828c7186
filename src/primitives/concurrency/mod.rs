#![allow(unsafe_code)]

//! Locking primitives: process-level file locks, the resource lock manager and
//! the bounded resource pool.

use std::fs::File;
use std::io;
use std::sync::Arc;

use tracing::warn;

use crate::primitives::io::StdFileIo;
use crate::types::{Result, TesseraError};

mod lock_manager;
mod resource_pool;

pub use lock_manager::{LockManager, LockMode, LockOptions, LockStatsSnapshot, ResourceLock};
pub use resource_pool::{Pooled, ResourceFactory, ResourcePool};

/// Exclusive advisory lock over the first byte of a segment file.
///
/// The lock is released when the guard drops. Advisory locks are per process,
/// so a second open of the same file inside one process is not rejected.
pub struct FileLock {
    file: Arc<File>,
    path: String,
}

impl FileLock {
    /// Attempts to take the lock without blocking.
    ///
    /// Fails with [`TesseraError::Locked`] when another process holds it.
    pub fn try_exclusive(io: &StdFileIo) -> Result<Self> {
        let file = Arc::clone(io.shared_file());
        let path = io.path().display().to_string();
        if !lock_first_byte(&file)? {
            return Err(TesseraError::Locked(path));
        }
        Ok(Self { file, path })
    }
}

impl std::fmt::Debug for FileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLock").field("path", &self.path).finish()
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = unlock_first_byte(&self.file) {
            warn!(path = %self.path, error = %err, "file_lock.unlock_failed");
        }
    }
}

fn lock_first_byte(file: &File) -> Result<bool> {
    platform::lock_region(file, 0, 1).map_err(TesseraError::from)
}

fn unlock_first_byte(file: &File) -> io::Result<()> {
    platform::unlock_region(file, 0, 1)
}

#[cfg(unix)]
mod platform {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    fn region(kind: libc::c_short, start: u64, len: u64) -> libc::flock {
        libc::flock {
            l_type: kind,
            l_whence: libc::SEEK_SET as _,
            l_start: start as libc::off_t,
            l_len: len as libc::off_t,
            l_pid: 0,
        }
    }

    pub fn lock_region(file: &File, start: u64, len: u64) -> io::Result<bool> {
        let mut flock = region(libc::F_WRLCK as libc::c_short, start, len);
        let res = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &mut flock) };
        if res == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EACCES) => Ok(false),
            _ => Err(err),
        }
    }

    pub fn unlock_region(file: &File, start: u64, len: u64) -> io::Result<()> {
        let mut flock = region(libc::F_UNLCK as libc::c_short, start, len);
        let res = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &mut flock) };
        if res == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(windows)]
mod platform {
    use std::fs::File;
    use std::io;
    use std::mem::zeroed;
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::ERROR_LOCK_VIOLATION;
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, UnlockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    fn overlapped_at(start: u64) -> OVERLAPPED {
        let mut overlapped: OVERLAPPED = unsafe { zeroed() };
        overlapped.Offset = start as u32;
        overlapped.OffsetHigh = (start >> 32) as u32;
        overlapped
    }

    pub fn lock_region(file: &File, start: u64, len: u64) -> io::Result<bool> {
        let mut overlapped = overlapped_at(start);
        let flags = LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY;
        let res = unsafe {
            LockFileEx(
                file.as_raw_handle() as isize,
                flags,
                0,
                len as u32,
                (len >> 32) as u32,
                &mut overlapped,
            )
        };
        if res != 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if matches!(err.raw_os_error(), Some(code) if code == ERROR_LOCK_VIOLATION as i32) {
            Ok(false)
        } else {
            Err(err)
        }
    }

    pub fn unlock_region(file: &File, start: u64, len: u64) -> io::Result<()> {
        let mut overlapped = overlapped_at(start);
        let res = unsafe {
            UnlockFileEx(
                file.as_raw_handle() as isize,
                0,
                len as u32,
                (len >> 32) as u32,
                &mut overlapped,
            )
        };
        if res != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod platform {
    use std::fs::File;
    use std::io;

    pub fn lock_region(_file: &File, _start: u64, _len: u64) -> io::Result<bool> {
        Ok(true)
    }

    pub fn unlock_region(_file: &File, _start: u64, _len: u64) -> io::Result<()> {
        Ok(())
    }
}
