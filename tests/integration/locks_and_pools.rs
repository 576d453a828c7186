#![allow(missing_docs)]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use tessera::primitives::concurrency::{LockManager, LockMode, LockOptions, ResourceFactory, ResourcePool};
use tessera::storage::FileMode;
use tessera::types::{RecordType, Result, TesseraError};
use tessera::{Engine, EngineOptions, StorageOptions};
use tempfile::tempdir;

struct Connections {
    opened: Arc<AtomicUsize>,
}

impl ResourceFactory<String, (String, usize)> for Connections {
    fn create(&self, key: &String) -> Result<(String, usize)> {
        Ok((key.clone(), self.opened.fetch_add(1, Ordering::SeqCst)))
    }

    fn reuse(&self, key: &String, resource: &mut (String, usize)) {
        resource.0.clone_from(key);
    }
}

fn pool(max: usize) -> (ResourcePool<String, (String, usize)>, Arc<AtomicUsize>) {
    let opened = Arc::new(AtomicUsize::new(0));
    let factory = Connections {
        opened: Arc::clone(&opened),
    };
    (ResourcePool::new(max, factory), opened)
}

#[test]
fn third_checkout_of_a_pool_of_two_times_out() -> Result<()> {
    common::init_tracing();
    let (pool, opened) = pool(2);
    let key = "db".to_string();
    let a = pool.get_resource(&key, Duration::from_millis(100))?;
    let b = pool.get_resource(&key, Duration::from_millis(100))?;
    assert_eq!(pool.available(), 0);

    let started = Instant::now();
    let third = pool.get_resource(&key, Duration::from_millis(100));
    let waited = started.elapsed();
    assert!(matches!(third, Err(TesseraError::LockTimeout { timeout_ms: 100, .. })));
    assert!(waited >= Duration::from_millis(90), "gave up after {waited:?}");
    assert!(waited < Duration::from_secs(2), "waited {waited:?}");

    pool.return_resource(a);
    pool.return_resource(b);
    assert_eq!(pool.available(), 2);
    assert_eq!(pool.idle(), 2);

    let again = pool.get_resource(&"other".to_string(), Duration::from_millis(100))?;
    assert_eq!(again.0, "other");
    assert_eq!(opened.load(Ordering::SeqCst), 2);
    pool.return_resource(again);
    Ok(())
}

#[test]
fn waiting_checkout_wakes_when_a_resource_returns() -> Result<()> {
    let (pool, _) = pool(1);
    let pool = Arc::new(pool);
    let held = pool.checkout(&"db".to_string(), Duration::from_millis(100))?;
    let waiter = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            pool.get_resource(&"db".to_string(), Duration::from_secs(5))
                .map(|resource| pool.return_resource(resource))
        })
    };
    thread::sleep(Duration::from_millis(50));
    drop(held);
    waiter.join().expect("waiter thread")?;
    assert_eq!(pool.available(), 1);
    Ok(())
}

#[test]
fn shared_locks_coexist_and_block_writers() -> Result<()> {
    common::init_tracing();
    let locks: LockManager<u64, u32> = LockManager::new(LockOptions::default());
    locks.acquire_lock(&1, &10, LockMode::Shared, None)?;
    locks.acquire_lock(&2, &10, LockMode::Shared, None)?;
    assert_eq!(locks.holders(&10), (2, false));

    let blocked = locks.acquire_lock(&3, &10, LockMode::Exclusive, Some(Duration::from_millis(50)));
    assert!(matches!(blocked, Err(TesseraError::LockTimeout { .. })));

    locks.release_lock(&2, &10, LockMode::Shared)?;
    // The sole remaining reader is promoted in place.
    locks.acquire_lock(&1, &10, LockMode::Exclusive, Some(Duration::from_millis(50)))?;
    assert_eq!(locks.holders(&10), (0, true));
    assert!(locks
        .acquire_lock(&2, &10, LockMode::Shared, Some(Duration::from_millis(20)))
        .is_err());
    locks.release_lock(&1, &10, LockMode::Exclusive)?;
    assert_eq!(locks.holders(&10), (0, false));

    let stats = locks.stats();
    assert_eq!(stats.promotions, 1);
    assert_eq!(stats.timeouts, 2);
    Ok(())
}

#[test]
fn releasing_an_unheld_lock_is_an_error() {
    let locks: LockManager<&'static str, u32> = LockManager::new(LockOptions::default());
    assert!(matches!(
        locks.release_lock(&7, &"tree", LockMode::Exclusive),
        Err(TesseraError::Lock(_))
    ));
    assert!(matches!(
        locks.release_lock(&7, &"tree", LockMode::Shared),
        Err(TesseraError::Lock(_))
    ));
}

#[test]
fn exclusive_waiter_gets_the_lock_after_release() -> Result<()> {
    let locks = Arc::new(LockManager::<u64, u32>::new(
        LockOptions::default().default_timeout(Duration::from_secs(5)),
    ));
    let start = Arc::new(Barrier::new(2));
    let guard = locks.lock(1, 99, LockMode::Exclusive, None)?;
    let contender = {
        let locks = Arc::clone(&locks);
        let start = Arc::clone(&start);
        thread::spawn(move || {
            start.wait();
            let lock = locks.lock(2, 99, LockMode::Exclusive, None)?;
            assert_eq!(lock.mode(), LockMode::Exclusive);
            Ok::<_, TesseraError>(())
        })
    };
    start.wait();
    thread::sleep(Duration::from_millis(30));
    drop(guard);
    contender.join().expect("contender thread")?;
    assert_eq!(locks.holders(&99), (0, false));
    Ok(())
}

#[test]
fn engine_sessions_are_pooled_and_locked_per_tree() -> Result<()> {
    common::init_tracing();
    let dir = tempdir()?;
    let engine = Engine::create(
        dir.path(),
        EngineOptions::default().storage(StorageOptions::default().file_mode(FileMode::Classic)),
    )?;
    let sessions = engine.session_pool(2);
    let rid = {
        let session = sessions.checkout(&"alice".to_string(), Duration::from_millis(100))?;
        assert_eq!(session.user(), "alice");
        let rid = session.create("default", b"hello", RecordType::BYTES)?;
        rid
    };
    {
        let session = sessions.checkout(&"bob".to_string(), Duration::from_millis(100))?;
        assert_eq!(session.user(), "bob");
        assert_eq!(&session.read(rid)?.expect("record").bytes[..], b"hello");
        assert!(matches!(
            session.create("nope", b"x", RecordType::BYTES),
            Err(TesseraError::NotFound(_))
        ));
    }
    assert_eq!(sessions.idle(), 1);

    let tree = engine.create_tree::<u64, u64>()?;
    let writer = engine.requester();
    let reader = engine.requester();
    let held = engine.lock_tree(writer, tree.rid(), LockMode::Exclusive, None)?;
    assert!(matches!(
        engine.lock_tree(reader, tree.rid(), LockMode::Shared, Some(Duration::from_millis(50))),
        Err(TesseraError::LockTimeout { .. })
    ));
    drop(held);
    let _read = engine.lock_tree(reader, tree.rid(), LockMode::Shared, Some(Duration::from_millis(50)))?;
    Ok(())
}
