#![allow(missing_docs)]

mod common;

use std::ops::Bound;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tessera::storage::FileMode;
use tessera::tree::TreeStatsSnapshot;
use tessera::types::{RecordId, Result, TesseraError};
use tessera::{Engine, EngineOptions, PersistentTree, StorageOptions, TreeOptions};
use tempfile::tempdir;

fn options(page_size: usize) -> EngineOptions {
    EngineOptions::default()
        .storage(
            StorageOptions::default()
                .file_mode(FileMode::Classic)
                .start_sizes(4 * 1_024, 64 * 1_024),
        )
        .tree(TreeOptions::default().page_size(page_size))
}

#[test]
fn page_size_four_scenario_survives_reopen() -> Result<()> {
    common::init_tracing();
    let dir = tempdir()?;
    let rid = {
        let engine = Engine::create(dir.path(), options(4))?;
        let mut tree = engine.create_tree::<i64, String>()?;
        for key in [50, 20, 80, 10, 30, 60, 90, 5] {
            tree.put(key, format!("v{key}"))?;
        }
        assert_eq!(tree.remove(&50)?, Some("v50".to_string()));
        tree.save()?;
        let rid = tree.rid();
        drop(tree);
        engine.close()?;
        rid
    };

    let engine = Engine::open(dir.path(), options(4))?;
    let mut tree = engine.open_tree::<i64, String>(rid)?;
    assert_eq!(tree.len(), 7);
    assert_eq!(tree.first_key()?, Some(5));
    assert_eq!(tree.last_key()?, Some(90));
    assert_eq!(tree.keys()?, vec![5, 10, 20, 30, 60, 80, 90]);
    assert_eq!(tree.get(&30)?.as_deref(), Some("v30"));
    assert_eq!(tree.get(&50)?, None);
    let report = tree.check_invariants()?;
    assert_eq!(report.entries, 7);
    engine.close()
}

#[test]
fn thousands_of_entries_round_trip_through_storage() -> Result<()> {
    common::init_tracing();
    let dir = tempdir()?;
    let mut rng = ChaCha8Rng::seed_from_u64(0x7e55e4a);
    let mut keys: Vec<u64> = (0..3_000).collect();
    keys.shuffle(&mut rng);

    let rid = {
        let engine = Engine::create(dir.path(), options(16))?;
        let mut tree = engine.create_tree::<u64, u64>()?;
        for (i, key) in keys.iter().enumerate() {
            tree.put(*key, key * 3)?;
            if i % 500 == 499 {
                tree.save()?;
            }
        }
        for key in keys.iter().filter(|k| *k % 7 == 0) {
            assert_eq!(tree.remove(key)?, Some(key * 3));
        }
        tree.save()?;
        assert!(!tree.is_dirty());
        let rid = tree.rid();
        drop(tree);
        engine.close()?;
        rid
    };

    let engine = Engine::open(dir.path(), options(16))?;
    let mut tree = engine.open_tree::<u64, u64>(rid)?;
    let expected: Vec<(u64, u64)> = (0..3_000u64)
        .filter(|k| k % 7 != 0)
        .map(|k| (k, k * 3))
        .collect();
    assert_eq!(tree.len(), expected.len() as u64);
    assert_eq!(tree.entries()?, expected);
    tree.check_invariants()?;
    engine.close()
}

#[test]
fn point_lookup_after_open_loads_a_single_path() -> Result<()> {
    common::init_tracing();
    let dir = tempdir()?;
    let rid = {
        let engine = Engine::create(dir.path(), options(8))?;
        let mut tree = engine.create_tree::<u64, String>()?;
        for key in 0..2_000u64 {
            tree.put(key, format!("value-{key}"))?;
        }
        tree.save()?;
        let rid = tree.rid();
        drop(tree);
        engine.close()?;
        rid
    };

    let engine = Engine::open(dir.path(), options(8))?;
    let mut tree = engine.open_tree::<u64, String>(rid)?;
    assert_eq!(tree.stats(), TreeStatsSnapshot::default());
    assert_eq!(tree.get(&1_234)?.as_deref(), Some("value-1234"));
    let stats = tree.stats();
    assert_eq!(stats.value_decodes, 1);
    // One node per level of a tree with at most ~250 nodes.
    assert!(stats.node_loads <= 20, "loaded {} nodes", stats.node_loads);
    assert!(tree.resident_nodes() as u64 <= stats.node_loads);
    engine.close()
}

#[test]
fn range_cursor_over_a_reopened_tree() -> Result<()> {
    common::init_tracing();
    let dir = tempdir()?;
    let rid = {
        let engine = Engine::create(dir.path(), options(4))?;
        let mut tree = engine.create_tree::<String, u32>()?;
        for (i, word) in ["pear", "apple", "fig", "kiwi", "lime", "date", "plum", "grape"]
            .into_iter()
            .enumerate()
        {
            tree.put(word.to_string(), i as u32)?;
        }
        tree.save()?;
        let rid = tree.rid();
        drop(tree);
        engine.close()?;
        rid
    };

    let engine = Engine::open(dir.path(), options(4))?;
    let mut tree = engine.open_tree::<String, u32>(rid)?;
    let mut cursor = tree.range(Bound::Included("date".into()), Bound::Excluded("lime".into()))?;
    let mut seen = Vec::new();
    while let Some(key) = cursor.next_key(&mut tree)? {
        seen.push(key);
    }
    assert_eq!(seen, ["date", "fig", "grape", "kiwi"]);

    let mut desc = tree.seek_desc(&"kiwi".to_string())?;
    assert_eq!(desc.next(&mut tree)?, Some(("kiwi".to_string(), 3)));
    assert_eq!(desc.next_key(&mut tree)?.as_deref(), Some("grape"));
    engine.close()
}

#[test]
fn opening_with_the_wrong_shape_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::create(dir.path(), options(8))?;
    let mut tree = engine.create_tree::<u64, u64>()?;
    tree.put(1, 1)?;
    tree.save()?;
    let rid = tree.rid();

    assert!(matches!(
        engine.open_tree::<String, u64>(rid),
        Err(TesseraError::Configuration(_))
    ));
    let other = PersistentTree::<u64, u64>::load(
        engine.store_backing(),
        rid,
        TreeOptions::default().page_size(4),
    );
    assert!(matches!(other, Err(TesseraError::Configuration(_))));
    let missing = RecordId::new(rid.cluster, 9_999);
    assert!(engine.open_tree::<u64, u64>(missing).is_err());
    engine.close()
}

#[test]
fn deleted_tree_leaves_no_records_behind() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::create(dir.path(), options(4))?;
    let cluster = engine
        .storage()
        .cluster_id(&engine.options().tree_cluster)
        .expect("tree cluster");
    let mut tree = engine.create_tree::<u64, u64>()?;
    for key in 0..100 {
        tree.put(key, key)?;
    }
    tree.save()?;
    assert!(engine.storage().count_records(cluster)? > 1);
    let rid = tree.rid();
    tree.delete()?;
    assert_eq!(engine.storage().count_records(cluster)?, 0);
    assert!(matches!(
        engine.open_tree::<u64, u64>(rid),
        Err(TesseraError::NotFound(_))
    ));
    engine.close()
}

#[test]
fn bounded_node_cache_keeps_working_sets_small() -> Result<()> {
    common::init_tracing();
    let dir = tempdir()?;
    let engine = Engine::create(
        dir.path(),
        options(4).tree(TreeOptions::default().page_size(4).max_cached_nodes(16)),
    )?;
    let mut tree = engine.create_tree::<u64, u64>()?;
    for key in 0..1_000u64 {
        tree.put(key, key)?;
        if key % 100 == 99 {
            tree.save()?;
            assert!(tree.resident_nodes() <= 16, "{} resident", tree.resident_nodes());
        }
    }
    for key in (0..1_000u64).step_by(37) {
        assert_eq!(tree.get(&key)?, Some(key));
        assert!(tree.resident_nodes() <= 16);
    }
    assert!(tree.stats().evictions > 0);
    engine.close()
}
