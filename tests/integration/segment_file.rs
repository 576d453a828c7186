#![allow(missing_docs)]

mod common;

use std::sync::Arc;

use tessera::primitives::file::{PagedFile, SegmentOptions, HEADER_SIZE};
use tessera::primitives::mmap::{MmapManager, MmapOptions};
use tessera::types::{Result, TesseraError};
use tempfile::tempdir;

#[test]
fn allocations_grow_the_file_up_to_max_size() -> Result<()> {
    common::init_tracing();
    let dir = tempdir()?;
    let options = SegmentOptions::default().increment_size(100).max_size(1_000);
    let mut file = PagedFile::create(dir.path().join("grow.tsg"), 100, options, None)?;

    let mut total = 0;
    for request in [60u64, 60, 200, 300] {
        let offset = file.allocate_space(request)?;
        assert_eq!(offset, total);
        total += request;
    }
    assert_eq!(file.filled_up_to(), total);
    assert!(file.size() >= total && file.size() <= 1_000);

    let size = file.size();
    match file.allocate_space(500) {
        Err(TesseraError::CapacityExceeded { max, .. }) => assert_eq!(max, 1_000),
        other => panic!("expected capacity error, got {other:?}"),
    }
    assert_eq!(file.filled_up_to(), total);
    assert_eq!(file.size(), size);

    // Exactly reaching the maximum still works.
    file.allocate_space(1_000 - total)?;
    assert_eq!(file.size(), 1_000);
    file.close()
}

#[test]
fn reopen_reports_unclean_shutdown() -> Result<()> {
    common::init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("crash.tsg");
    {
        let mut file = PagedFile::create(&path, 64, SegmentOptions::default(), None)?;
        let offset = file.allocate_space(8)?;
        file.write_i64(offset, 0x0102_0304_0506_0708)?;
        file.synch()?;
        // dropped without close
    }
    let mut file = PagedFile::open(&path, SegmentOptions::default(), None)?;
    assert!(!file.was_softly_closed());
    assert_eq!(file.read_i64(0)?, 0x0102_0304_0506_0708);
    file.close()?;
    drop(file);

    let file = PagedFile::open(&path, SegmentOptions::default(), None)?;
    assert!(file.was_softly_closed());
    Ok(())
}

#[test]
fn open_rejects_missing_empty_and_damaged_files() -> Result<()> {
    common::init_tracing();
    let dir = tempdir()?;
    let missing = PagedFile::open(dir.path().join("nope.tsg"), SegmentOptions::default(), None);
    assert!(missing.is_err());

    let empty = dir.path().join("empty.tsg");
    std::fs::write(&empty, b"")?;
    assert!(matches!(
        PagedFile::open(&empty, SegmentOptions::default(), None),
        Err(TesseraError::NotFound(_))
    ));

    let damaged = dir.path().join("damaged.tsg");
    {
        let mut file = PagedFile::create(&damaged, 16, SegmentOptions::default(), None)?;
        file.close()?;
    }
    let mut bytes = std::fs::read(&damaged)?;
    bytes[10] ^= 0xFF;
    std::fs::write(&damaged, &bytes)?;
    assert!(matches!(
        PagedFile::open(&damaged, SegmentOptions::default(), None),
        Err(TesseraError::Corruption(_))
    ));

    let truncated = dir.path().join("short.tsg");
    std::fs::write(&truncated, vec![0u8; (HEADER_SIZE / 2) as usize])?;
    assert!(matches!(
        PagedFile::open(&truncated, SegmentOptions::default(), None),
        Err(TesseraError::Corruption(_))
    ));
    Ok(())
}

#[test]
fn mapped_segments_share_one_window_budget() -> Result<()> {
    common::init_tracing();
    let dir = tempdir()?;
    let manager = Arc::new(MmapManager::new(
        MmapOptions::default().block_size(4_096).max_memory(16 * 1_024),
    ));
    let mut a = PagedFile::create(dir.path().join("a.tsg"), 64 * 1_024, SegmentOptions::default(), Some(manager.clone()))?;
    let mut b = PagedFile::create(dir.path().join("b.tsg"), 64 * 1_024, SegmentOptions::default(), Some(manager.clone()))?;
    a.allocate_space(64 * 1_024)?;
    b.allocate_space(64 * 1_024)?;

    for block in 0..16u64 {
        a.write_i64(block * 4_096, block as i64)?;
        b.write_i64(block * 4_096, -(block as i64))?;
    }
    let stats = manager.stats();
    assert!(stats.resident_bytes <= 16 * 1_024);
    assert!(stats.evictions > 0);

    for block in 0..16u64 {
        assert_eq!(a.read_i64(block * 4_096)?, block as i64);
        assert_eq!(b.read_i64(block * 4_096)?, -(block as i64));
    }
    a.close()?;
    b.close()?;
    assert_eq!(manager.stats().windows, 0);
    Ok(())
}
