#![allow(missing_docs)]

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tessera::storage::FileMode;
use tessera::types::{RecordId, Result, TesseraError};
use tessera::{CommitOptions, Engine, EngineOptions, StorageOptions, TreeOptions};
use tempfile::tempdir;

fn options(interval_ms: u64) -> EngineOptions {
    EngineOptions::default()
        .storage(StorageOptions::default().file_mode(FileMode::Classic))
        .tree(TreeOptions::default().page_size(8))
        .commit(CommitOptions::default().interval(Duration::from_millis(interval_ms)))
}

#[test]
fn flushed_commits_are_visible_after_reopen() -> Result<()> {
    common::init_tracing();
    let dir = tempdir()?;
    let rid = {
        let engine = Engine::create(dir.path(), options(10_000))?;
        let tree = engine.create_batched_tree::<u64, String>()?;
        assert_eq!(engine.committer().registered(), 1);
        {
            let mut tree = tree.lock();
            for key in 0..500u64 {
                tree.put(key, format!("row {key}"))?;
            }
            tree.commit_changes()?;
            // Nodes are written right away; only the metadata waits.
            assert!(tree.is_dirty());
        }
        engine.committer().flush()?;
        assert!(!tree.lock().is_dirty());
        let stats = engine.committer().stats();
        assert_eq!(stats.scheduled, 1);
        assert_eq!(stats.committed, 1);
        let rid = tree.lock().rid();
        engine.close()?;
        rid
    };

    let engine = Engine::open(dir.path(), options(10_000))?;
    let mut tree = engine.open_tree::<u64, String>(rid)?;
    assert_eq!(tree.len(), 500);
    assert_eq!(tree.get(&499)?.as_deref(), Some("row 499"));
    tree.check_invariants()?;
    engine.close()
}

#[test]
fn shutdown_drains_pending_commits() -> Result<()> {
    common::init_tracing();
    let dir = tempdir()?;
    let rid = {
        let engine = Engine::create(dir.path(), options(60_000))?;
        let tree = engine.create_batched_tree::<u64, u64>()?;
        for round in 0..5u64 {
            let mut tree = tree.lock();
            for key in round * 100..(round + 1) * 100 {
                tree.put(key, key + round)?;
            }
            tree.commit_changes()?;
        }
        let rid = tree.lock().rid();
        assert_eq!(engine.committer().stats().committed, 0);
        engine.close()?;
        assert!(engine.committer().is_shut_down());
        assert_eq!(engine.committer().stats().committed, 1);
        rid
    };

    let engine = Engine::open(dir.path(), options(60_000))?;
    let mut tree = engine.open_tree::<u64, u64>(rid)?;
    assert_eq!(tree.len(), 500);
    assert_eq!(tree.get(&450)?, Some(454));
    engine.close()
}

#[test]
fn worker_commits_on_its_interval() -> Result<()> {
    common::init_tracing();
    let dir = tempdir()?;
    let engine = Engine::create(dir.path(), options(20))?;
    let tree = engine.create_batched_tree::<u64, u64>()?;
    {
        let mut tree = tree.lock();
        tree.put(1, 1)?;
        tree.commit_changes()?;
    }
    let mut waited = Duration::ZERO;
    while engine.committer().stats().committed == 0 && waited < Duration::from_secs(5) {
        thread::sleep(Duration::from_millis(10));
        waited += Duration::from_millis(10);
    }
    assert_eq!(engine.committer().stats().committed, 1);
    engine.close()
}

#[test]
fn concurrent_writers_share_one_batched_tree() -> Result<()> {
    common::init_tracing();
    let dir = tempdir()?;
    let engine = Engine::create(dir.path(), options(5))?;
    let tree = engine.create_batched_tree::<u64, u64>()?;
    let writers: Vec<_> = (0..4u64)
        .map(|worker| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || -> Result<()> {
                for i in 0..250u64 {
                    let mut tree = tree.lock();
                    tree.put(worker * 1_000 + i, i)?;
                    if i % 50 == 0 {
                        tree.commit_changes()?;
                    }
                }
                let committed = tree.lock().commit_changes();
                committed
            })
        })
        .collect();
    for writer in writers {
        writer.join().expect("writer thread")?;
    }
    engine.committer().flush()?;
    let rid: RecordId = tree.lock().rid();
    drop(tree);

    let mut reopened = engine.open_tree::<u64, u64>(rid)?;
    assert_eq!(reopened.len(), 1_000);
    reopened.check_invariants()?;
    engine.close()
}

#[test]
fn schedules_after_shutdown_are_refused() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::create(dir.path(), options(10))?;
    let tree = engine.create_batched_tree::<u64, u64>()?;
    engine.committer().shutdown()?;
    let mut tree = tree.lock();
    tree.put(7, 7)?;
    assert!(matches!(tree.commit_changes(), Err(TesseraError::Closed(_))));
    drop(tree);
    engine.close()
}
