#![allow(missing_docs)]

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tessera::primitives::concurrency::LockMode;
use tessera::storage::{FileMode, Storage, StorageOptions, DEFAULT_CLUSTERS};
use tessera::types::{RecordId, RecordType, RecordVersion, Result, TesseraError, VersionCheck};
use tempfile::tempdir;

fn options(mode: FileMode) -> StorageOptions {
    StorageOptions::default()
        .file_mode(mode)
        .start_sizes(1_024, 16 * 1_024)
        .lock_timeout(Duration::from_millis(100))
}

#[test]
fn stale_version_is_rejected() -> Result<()> {
    common::init_tracing();
    let dir = tempdir()?;
    let storage = Storage::create(dir.path(), options(FileMode::Classic))?;
    let cluster = storage.cluster_id("default").expect("default cluster");
    let rid = RecordId::new(cluster, storage.create_record(cluster, b"v0", RecordType::DOCUMENT)?);

    let alice = storage.requester();
    let bob = storage.requester();
    let first = storage.read_record(alice, rid)?.expect("record");
    let second = storage.read_record(bob, rid)?.expect("record");
    assert_eq!(first.version, second.version);

    let bumped = storage.update_record(alice, rid, b"v1", first.version.into(), RecordType::DOCUMENT)?;
    assert_eq!(bumped, first.version.next());

    match storage.update_record(bob, rid, b"lost", second.version.into(), RecordType::DOCUMENT) {
        Err(TesseraError::StaleVersion { expected, actual, .. }) => {
            assert_eq!(expected, RecordVersion(0));
            assert_eq!(actual, RecordVersion(1));
        }
        other => panic!("expected a version conflict, got {other:?}"),
    }
    assert!(matches!(
        storage.delete_record(bob, rid, second.version.into()),
        Err(TesseraError::StaleVersion { .. })
    ));
    assert_eq!(&storage.read_record(bob, rid)?.expect("record").bytes[..], b"v1");
    storage.close()
}

#[test]
fn records_survive_reopen_in_both_file_modes() -> Result<()> {
    common::init_tracing();
    for mode in [FileMode::Classic, FileMode::Mmap] {
        let dir = tempdir()?;
        let mut rids = Vec::new();
        {
            let storage = Storage::create(dir.path(), options(mode))?;
            assert_eq!(storage.cluster_names(), DEFAULT_CLUSTERS.map(String::from).to_vec());
            let extra = storage.add_cluster("people")?;
            assert!(storage.add_cluster("people").is_err());
            let req = storage.requester();
            for i in 0..200u32 {
                let payload = vec![i as u8; (i % 50) as usize + 1];
                let pos = storage.create_record(extra, &payload, RecordType::BYTES)?;
                rids.push(RecordId::new(extra, pos));
            }
            storage.update_record(req, rids[3], b"rewritten", VersionCheck::Any, RecordType::FLAT)?;
            storage.delete_record(req, rids[4], VersionCheck::Any)?;
            storage.close()?;
        }

        let storage = Storage::open(dir.path(), options(mode))?;
        assert!(storage.was_cleanly_closed());
        let extra = storage.cluster_id("people").expect("cluster persisted");
        assert_eq!(storage.cluster_name(extra).as_deref(), Some("people"));
        assert_eq!(storage.count_records(extra)?, 199);
        let req = storage.requester();
        let rewritten = storage.read_record(req, rids[3])?.expect("record");
        assert_eq!(&rewritten.bytes[..], b"rewritten");
        assert_eq!(rewritten.version, RecordVersion(1));
        assert_eq!(rewritten.record_type, RecordType::FLAT);
        assert!(storage.read_record(req, rids[4])?.is_none());
        let last = storage.read_record(req, rids[199])?.expect("record");
        assert_eq!(last.bytes.len(), 199 % 50 + 1);
        storage.close()?;
    }
    Ok(())
}

#[test]
fn storage_dropped_without_close_reopens_dirty() -> Result<()> {
    let dir = tempdir()?;
    {
        let storage = Storage::create(dir.path(), options(FileMode::Classic))?;
        storage.create_record(0, b"x", RecordType::BYTES)?;
    }
    let storage = Storage::open(dir.path(), options(FileMode::Classic))?;
    assert!(!storage.was_cleanly_closed());
    storage.close()
}

#[test]
fn cache_serves_repeated_reads() -> Result<()> {
    let dir = tempdir()?;
    let storage = Storage::create(
        dir.path(),
        options(FileMode::Classic).record_cache_capacity(4),
    )?;
    let req = storage.requester();
    let rids: Vec<RecordId> = (0..8)
        .map(|i| storage.create_record(2, &[i], RecordType::BYTES).map(|pos| RecordId::new(2, pos)))
        .collect::<Result<_>>()?;
    for rid in &rids {
        storage.read_record(req, *rid)?;
    }
    let before = storage.cache_stats();
    storage.read_record(req, rids[7])?;
    storage.read_record(req, rids[7])?;
    let after = storage.cache_stats();
    assert_eq!(after.hits, before.hits + 2);
    storage.close()
}

#[test]
fn readers_wait_for_exclusive_record_locks() -> Result<()> {
    common::init_tracing();
    let dir = tempdir()?;
    let storage = Arc::new(Storage::create(dir.path(), options(FileMode::Classic))?);
    let rid = RecordId::new(2, storage.create_record(2, b"locked", RecordType::BYTES)?);

    let writer = storage.requester();
    let guard = storage.locks().lock(writer, rid, LockMode::Exclusive, None)?;
    let reader = {
        let storage = Arc::clone(&storage);
        thread::spawn(move || {
            let req = storage.requester();
            storage.read_record(req, rid)
        })
    };
    let result = reader.join().expect("reader thread");
    assert!(matches!(result, Err(TesseraError::LockTimeout { .. })));
    drop(guard);

    let req = storage.requester();
    assert_eq!(&storage.read_record(req, rid)?.expect("record").bytes[..], b"locked");
    storage.close()
}
