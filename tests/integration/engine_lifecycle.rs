#![allow(missing_docs)]

mod common;

use tessera::storage::FileMode;
use tessera::types::{RecordId, RecordType, Result, TesseraError, VersionCheck};
use tessera::{Engine, EngineOptions};
use tempfile::tempdir;

#[test]
fn options_file_drives_the_engine() -> Result<()> {
    common::init_tracing();
    let dir = tempdir()?;
    let config = dir.path().join("tessera.toml");
    std::fs::write(
        &config,
        r#"
        tree_cluster = "indexes"

        [storage]
        file_mode = "classic"
        cluster_start_size = 2048

        [tree]
        page_size = 6
        max_cached_nodes = 64

        [commit]
        interval_ms = 50
        "#,
    )?;
    let options = EngineOptions::load(&config)?;
    assert_eq!(options.storage.file_mode, FileMode::Classic);
    assert_eq!(options.tree.page_size, 6);

    let data = dir.path().join("data");
    let engine = Engine::create(&data, options.clone())?;
    let mut tree = engine.create_tree::<u32, u32>()?;
    tree.put(1, 10)?;
    tree.save()?;
    assert_eq!(tree.page_size(), 6);
    assert_eq!(engine.storage().cluster_name(tree.rid().cluster).as_deref(), Some("indexes"));
    let rid = tree.rid();
    drop(tree);
    engine.close()?;

    let engine = Engine::open(&data, options)?;
    assert!(engine.storage().was_cleanly_closed());
    assert_eq!(engine.open_tree::<u32, u32>(rid)?.get(&1)?, Some(10));
    engine.close()
}

#[test]
fn malformed_options_file_is_a_configuration_error() -> Result<()> {
    let dir = tempdir()?;
    let config = dir.path().join("bad.toml");
    std::fs::write(&config, "[tree]\npage_size = \"big\"\n")?;
    assert!(matches!(
        EngineOptions::load(&config),
        Err(TesseraError::Configuration(_))
    ));
    assert!(matches!(
        EngineOptions::load(dir.path().join("missing.toml")),
        Err(TesseraError::Io(_))
    ));
    Ok(())
}

#[test]
fn closed_engine_refuses_work_and_closes_once() -> Result<()> {
    common::init_tracing();
    let dir = tempdir()?;
    let engine = Engine::create(dir.path(), EngineOptions::default())?;
    let mut tree = engine.create_tree::<u64, u64>()?;
    tree.put(5, 5)?;
    tree.save()?;
    let rid = tree.rid();

    engine.close()?;
    assert!(engine.is_closed());
    engine.close()?;
    assert!(matches!(engine.open_tree::<u64, u64>(rid), Err(TesseraError::Closed(_))));
    assert!(matches!(
        engine.create_batched_tree::<u64, u64>(),
        Err(TesseraError::Closed(_))
    ));
    assert!(matches!(
        engine.storage().create_record(2, b"late", RecordType::BYTES),
        Err(TesseraError::Closed(_))
    ));
    // Resident nodes stay usable; anything touching storage fails.
    assert_eq!(tree.get(&5)?, Some(5));
    tree.put(7, 7)?;
    assert!(tree.save().is_err());
    Ok(())
}

#[test]
fn creating_over_an_existing_engine_fails() -> Result<()> {
    let dir = tempdir()?;
    Engine::create(dir.path(), EngineOptions::default())?.close()?;
    assert!(Engine::create(dir.path(), EngineOptions::default()).is_err());
    let empty = tempdir()?;
    assert!(Engine::open(empty.path(), EngineOptions::default()).is_err());
    Ok(())
}

#[test]
fn engines_in_one_process_are_independent() -> Result<()> {
    common::init_tracing();
    let (a_dir, b_dir) = (tempdir()?, tempdir()?);
    let a = Engine::create(a_dir.path(), EngineOptions::default())?;
    let b = Engine::create(b_dir.path(), EngineOptions::default())?;

    let a_tree = a.create_batched_tree::<u64, u64>()?;
    let b_tree = b.create_batched_tree::<u64, u64>()?;
    assert_eq!(a.committer().registered(), 1);
    assert_eq!(b.committer().registered(), 1);

    a_tree.lock().put(1, 100)?;
    a_tree.lock().commit_changes()?;
    b_tree.lock().put(1, 200)?;

    let a_rid = a_tree.lock().rid();
    a.close()?;
    assert!(b.committer().stats().scheduled == 0 && !b.is_closed());

    let session = b.session_pool(1).get_resource(&"ops".to_string(), std::time::Duration::from_millis(50))?;
    let rid = session.create("default", b"still open", RecordType::DOCUMENT)?;
    let version = session.update(rid, b"updated", VersionCheck::Any, RecordType::DOCUMENT)?;
    assert_eq!(version.0, 1);
    assert!(session.delete(rid, version.into())?);
    assert!(session.read(rid)?.is_none());
    b.close()?;

    let a = Engine::open(a_dir.path(), EngineOptions::default())?;
    assert_eq!(a.open_tree::<u64, u64>(a_rid)?.get(&1)?, Some(100));
    a.close()
}

#[test]
fn dropping_the_engine_closes_it() -> Result<()> {
    let dir = tempdir()?;
    let rid: RecordId;
    {
        let engine = Engine::create(dir.path(), EngineOptions::default())?;
        let mut tree = engine.create_tree::<u64, u64>()?;
        tree.put(3, 9)?;
        tree.save()?;
        rid = tree.rid();
    }
    let engine = Engine::open(dir.path(), EngineOptions::default())?;
    assert!(engine.storage().was_cleanly_closed());
    assert_eq!(engine.open_tree::<u64, u64>(rid)?.get(&3)?, Some(9));
    engine.close()
}
