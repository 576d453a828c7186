#![allow(missing_docs)]

mod common;

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tessera::tree::{Comparator, MemoryNodeStore, NodeStore, PersistentTree, TreeBacking, TreeOptions};
use tessera::types::Result;

fn memory_tree(page_size: usize) -> PersistentTree<i32, i32> {
    PersistentTree::create(TreeBacking::Memory, TreeOptions::default().page_size(page_size))
        .expect("valid options")
}

fn bound_strategy() -> impl Strategy<Value = Bound<i32>> {
    prop_oneof![
        Just(Bound::Unbounded),
        (-50i32..250).prop_map(Bound::Included),
        (-50i32..250).prop_map(Bound::Excluded),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn structure_holds_after_every_mutation(
        page_size in 2usize..9,
        ops in prop::collection::vec((any::<bool>(), 0i32..200, any::<i32>()), 1..300),
    ) {
        let mut tree = memory_tree(page_size);
        let mut model = BTreeMap::new();
        for (insert, key, value) in ops {
            if insert {
                prop_assert_eq!(tree.put(key, value).unwrap(), model.insert(key, value));
            } else {
                prop_assert_eq!(tree.remove(&key).unwrap(), model.remove(&key));
            }
            let report = tree.check_invariants().unwrap();
            prop_assert_eq!(report.entries, model.len() as u64);
        }
        prop_assert_eq!(tree.first_key().unwrap(), model.keys().next().copied());
        prop_assert_eq!(tree.last_key().unwrap(), model.keys().next_back().copied());
        let entries: Vec<(i32, i32)> = model.into_iter().collect();
        prop_assert_eq!(tree.entries().unwrap(), entries);
    }

    #[test]
    fn range_cursors_agree_with_btreemap(
        page_size in 2usize..6,
        keys in prop::collection::btree_set(0i32..200, 0..120),
        lo in bound_strategy(),
        hi in bound_strategy(),
    ) {
        let mut tree = memory_tree(page_size);
        for key in &keys {
            tree.put(*key, key * 2).unwrap();
        }
        let expected: Vec<i32> = keys
            .iter()
            .copied()
            .filter(|k| match lo {
                Bound::Included(b) => *k >= b,
                Bound::Excluded(b) => *k > b,
                Bound::Unbounded => true,
            })
            .filter(|k| match hi {
                Bound::Included(b) => *k <= b,
                Bound::Excluded(b) => *k < b,
                Bound::Unbounded => true,
            })
            .collect();
        let mut cursor = tree.range(lo, hi).unwrap();
        let mut seen = Vec::new();
        while let Some((key, value)) = cursor.next(&mut tree).unwrap() {
            prop_assert_eq!(value, key * 2);
            seen.push(key);
        }
        prop_assert_eq!(seen, expected);
    }
}

#[test]
fn descending_comparator_under_random_load() -> Result<()> {
    common::init_tracing();
    let mut rng = ChaCha8Rng::seed_from_u64(17);
    let reverse: Comparator<i32> = Arc::new(|a: &i32, b: &i32| b.cmp(a));
    let mut tree = PersistentTree::<i32, i32>::create_with_comparator(
        TreeBacking::Memory,
        TreeOptions::default().page_size(5),
        reverse,
    )?;
    let mut model = BTreeMap::new();
    for _ in 0..5_000 {
        let key = rng.gen_range(0..400);
        if rng.gen_bool(0.6) {
            let value = rng.gen();
            assert_eq!(tree.put(key, value)?, model.insert(key, value));
        } else {
            assert_eq!(tree.remove(&key)?, model.remove(&key));
        }
    }
    tree.check_invariants()?;
    let descending: Vec<i32> = model.keys().rev().copied().collect();
    assert_eq!(tree.keys()?, descending);
    let mut cursor = tree.cursor_desc()?;
    let mut ascending = Vec::new();
    while let Some(key) = cursor.next_key(&mut tree)? {
        ascending.push(key);
    }
    assert_eq!(ascending, model.keys().copied().collect::<Vec<_>>());
    Ok(())
}

#[test]
fn cursor_removal_drains_a_stored_tree() -> Result<()> {
    common::init_tracing();
    let store: Arc<dyn NodeStore> = Arc::new(MemoryNodeStore::new(3));
    let options = TreeOptions::default().page_size(3).max_cached_nodes(8);
    let mut tree = PersistentTree::<i32, i32>::create(TreeBacking::Store(Arc::clone(&store)), options.clone())?;
    for key in 0..300 {
        tree.put(key, -key)?;
    }
    tree.save()?;
    let rid = tree.rid();
    drop(tree);

    let mut tree = PersistentTree::<i32, i32>::load(TreeBacking::Store(store), rid, options)?;
    let mut cursor = tree.cursor()?;
    let mut kept = Vec::new();
    while let Some(key) = cursor.next_key(&mut tree)? {
        if key % 3 == 0 {
            assert_eq!(cursor.remove(&mut tree)?, -key);
        } else {
            kept.push(key);
        }
    }
    tree.check_invariants()?;
    assert_eq!(tree.keys()?, kept);
    tree.save()?;
    Ok(())
}
