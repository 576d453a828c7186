//! Low-level building blocks: byte codecs, positional file I/O, locking,
//! paged segment files and the shared memory-map window cache.

/// Big-endian encoding helpers.
pub mod bytes;

/// Lock manager, resource pool and whole-file locks.
pub mod concurrency;

/// Paged segment files with a persisted header.
pub mod file;

/// Positional file I/O.
pub mod io;

/// Budgeted cache of memory-mapped file windows.
pub mod mmap;
