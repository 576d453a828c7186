use std::cmp::Ordering;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::commit::CommitTicket;
use crate::types::{RecordId, RecordVersion, Result, TesseraError};

use super::backing::TreeBacking;
use super::codec::{KeyCodec, ValCodec};
use super::cursor::Direction;
use super::node::{Color, Comparator, Item, Node, Probe};
use super::stats::{TreeStats, TreeStatsSnapshot};
use super::table::{NodeRef, NodeTable};

pub(super) static NEXT_TREE_ID: AtomicU64 = AtomicU64::new(1);

/// Configuration knobs for a persistent tree.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeOptions {
    /// Maximum key/value pairs per node. Must be at least 2.
    pub page_size: usize,
    /// Clean, stored nodes kept resident between operations.
    pub max_cached_nodes: usize,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            page_size: 32,
            max_cached_nodes: 4096,
        }
    }
}

impl TreeOptions {
    /// Sets the node capacity.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Sets the resident node bound.
    pub fn max_cached_nodes(mut self, nodes: usize) -> Self {
        self.max_cached_nodes = nodes;
        self
    }

    pub(super) fn validate(&self) -> Result<()> {
        if self.page_size < 2 || self.page_size > i16::MAX as usize {
            return Err(TesseraError::Configuration(format!(
                "tree page size must be between 2 and {}, got {}",
                i16::MAX,
                self.page_size
            )));
        }
        Ok(())
    }
}

/// Natural order of `K`.
pub fn natural_order<K: Ord + 'static>() -> Comparator<K> {
    Arc::new(|a: &K, b: &K| a.cmp(b))
}

pub(super) struct MetaRecord {
    pub rid: RecordId,
    pub version: RecordVersion,
    pub dirty: bool,
}

/// An ordered map stored as a red-black tree of fat nodes.
///
/// Nodes are faulted in from the backing store on first touch and their keys
/// and values are decoded one at a time when compared or returned. Mutations
/// are tracked in a dirty set and written by [`PersistentTree::save`].
/// The tree is not internally synchronized; share it through
/// [`super::SharedTree`].
pub struct PersistentTree<K, V> {
    pub(super) id: u64,
    pub(super) backing: TreeBacking,
    pub(super) options: TreeOptions,
    pub(super) cmp: Comparator<K>,
    pub(super) table: NodeTable<K, V>,
    pub(super) root: Option<NodeRef>,
    pub(super) size: u64,
    pub(super) meta: MetaRecord,
    pub(super) pending_deletes: Vec<(RecordId, RecordVersion)>,
    pub(super) mod_count: u64,
    pub(super) stats: Arc<TreeStats>,
    pub(super) commit_ticket: Option<CommitTicket>,
}

impl<K: KeyCodec, V: ValCodec> PersistentTree<K, V> {
    pub(super) fn empty(backing: TreeBacking, options: TreeOptions, cmp: Comparator<K>) -> Self {
        Self {
            id: NEXT_TREE_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            backing,
            options,
            cmp,
            table: NodeTable::new(),
            root: None,
            size: 0,
            meta: MetaRecord {
                rid: RecordId::INVALID,
                version: RecordVersion::default(),
                dirty: false,
            },
            pending_deletes: Vec::new(),
            mod_count: 0,
            stats: Arc::new(TreeStats::default()),
            commit_ticket: None,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> u64 {
        self.size
    }

    /// Returns true when the tree holds no entries.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Node capacity.
    pub fn page_size(&self) -> usize {
        self.options.page_size
    }

    /// Address of the metadata record; invalid for in-memory trees.
    pub fn rid(&self) -> RecordId {
        self.meta.rid
    }

    /// How the tree stores its nodes.
    pub fn backing(&self) -> &TreeBacking {
        &self.backing
    }

    /// Structural modification counter.
    pub fn mod_count(&self) -> u64 {
        self.mod_count
    }

    /// Nodes whose content is currently resident.
    pub fn resident_nodes(&self) -> usize {
        self.table.resident_len()
    }

    /// Returns true when changes are waiting for a save.
    pub fn is_dirty(&self) -> bool {
        self.meta.dirty || self.table.has_dirty() || !self.pending_deletes.is_empty()
    }

    /// Counters for this tree.
    pub fn stats(&self) -> TreeStatsSnapshot {
        self.stats.snapshot()
    }

    /// Shared handle to the live counters.
    pub fn stats_handle(&self) -> Arc<TreeStats> {
        Arc::clone(&self.stats)
    }

    pub(super) fn compare(&self, a: &K, b: &K) -> Ordering {
        (self.cmp)(a, b)
    }

    /// Resident content of `r`, faulting it in when needed.
    pub(super) fn node(&mut self, r: NodeRef) -> Result<&mut Node<K, V>> {
        if self.table.is_loaded(r) {
            self.table.touch(r);
        } else {
            self.fault_in(r)?;
        }
        self.table.node_mut(r)
    }

    /// Drops excess clean nodes. Runs only between public operations so no
    /// caller ever holds a reference into an evicted node.
    pub(super) fn after_operation(&mut self) {
        if self.backing.store().is_some() {
            self.table
                .evict(self.options.max_cached_nodes, &self.stats);
        }
    }

    /// Returns the value stored under `key`.
    pub fn get(&mut self, key: &K) -> Result<Option<V>> {
        let result = self.lookup(key);
        self.after_operation();
        result
    }

    fn lookup(&mut self, key: &K) -> Result<Option<V>> {
        let Some((n, idx)) = self.find(key)? else {
            return Ok(None);
        };
        let stats = Arc::clone(&self.stats);
        Ok(Some(self.node(n)?.value(idx, &stats)?.clone()))
    }

    /// Returns true when `key` is present. Values are not decoded.
    pub fn contains_key(&mut self, key: &K) -> Result<bool> {
        let result = self.find(key).map(|pos| pos.is_some());
        self.after_operation();
        result
    }

    /// Inserts or replaces `key`, returning the previous value.
    pub fn put(&mut self, key: K, value: V) -> Result<Option<V>> {
        let result = self.insert(key, value);
        self.after_operation();
        result
    }

    /// Removes `key`, returning its value.
    pub fn remove(&mut self, key: &K) -> Result<Option<V>> {
        let result = match self.find(key) {
            Ok(Some((n, idx))) => self.remove_at(n, idx).map(Some),
            Ok(None) => Ok(None),
            Err(err) => Err(err),
        };
        self.after_operation();
        result
    }

    /// Smallest key.
    pub fn first_key(&mut self) -> Result<Option<K>> {
        let result = match self.root {
            Some(root) => {
                let first = self.leftmost(root)?;
                self.key_at(first, 0).map(Some)
            }
            None => Ok(None),
        };
        self.after_operation();
        result
    }

    /// Largest key.
    pub fn last_key(&mut self) -> Result<Option<K>> {
        let result = match self.root {
            Some(root) => {
                let last = self.rightmost(root)?;
                let idx = self.node(last)?.len().saturating_sub(1);
                self.key_at(last, idx).map(Some)
            }
            None => Ok(None),
        };
        self.after_operation();
        result
    }

    /// Every entry in key order.
    pub fn entries(&mut self) -> Result<Vec<(K, V)>> {
        let mut cursor = self.cursor()?;
        let mut out = Vec::with_capacity(self.size as usize);
        while let Some(entry) = cursor.next(self)? {
            out.push(entry);
        }
        Ok(out)
    }

    /// Every key in order. Values are not decoded.
    pub fn keys(&mut self) -> Result<Vec<K>> {
        let mut cursor = self.cursor()?;
        let mut out = Vec::with_capacity(self.size as usize);
        while let Some(key) = cursor.next_key(self)? {
            out.push(key);
        }
        Ok(out)
    }

    pub(super) fn key_at(&mut self, n: NodeRef, idx: usize) -> Result<K> {
        let stats = Arc::clone(&self.stats);
        Ok(self.node(n)?.key(idx, &stats)?.clone())
    }

    pub(super) fn item_at(&mut self, n: NodeRef, idx: usize) -> Result<(K, V)> {
        let stats = Arc::clone(&self.stats);
        let node = self.node(n)?;
        let key = node.key(idx, &stats)?.clone();
        let value = node.value(idx, &stats)?.clone();
        Ok((key, value))
    }

    /// Node and index holding `key`.
    pub(super) fn find(&mut self, key: &K) -> Result<Option<(NodeRef, usize)>> {
        let cmp = Arc::clone(&self.cmp);
        let stats = Arc::clone(&self.stats);
        let mut cur = self.root;
        while let Some(n) = cur {
            let node = self.node(n)?;
            cur = match node.probe(key, &cmp, &stats)? {
                Probe::Found(idx) => return Ok(Some((n, idx))),
                Probe::Left => node.left,
                Probe::Right => node.right,
                Probe::Between(_) => None,
            };
        }
        Ok(None)
    }

    /// Position of the smallest key not less than `key`.
    pub(super) fn ceiling(&mut self, key: &K) -> Result<Option<(NodeRef, usize)>> {
        let cmp = Arc::clone(&self.cmp);
        let stats = Arc::clone(&self.stats);
        let mut best = None;
        let mut cur = self.root;
        while let Some(n) = cur {
            let node = self.node(n)?;
            cur = match node.probe(key, &cmp, &stats)? {
                Probe::Found(idx) | Probe::Between(idx) => return Ok(Some((n, idx))),
                Probe::Left => {
                    best = Some((n, 0));
                    node.left
                }
                Probe::Right => node.right,
            };
        }
        Ok(best)
    }

    /// Position of the largest key not greater than `key`.
    pub(super) fn floor(&mut self, key: &K) -> Result<Option<(NodeRef, usize)>> {
        let cmp = Arc::clone(&self.cmp);
        let stats = Arc::clone(&self.stats);
        let mut best = None;
        let mut cur = self.root;
        while let Some(n) = cur {
            let node = self.node(n)?;
            cur = match node.probe(key, &cmp, &stats)? {
                Probe::Found(idx) => return Ok(Some((n, idx))),
                Probe::Between(idx) => return Ok(Some((n, idx - 1))),
                Probe::Left => node.left,
                Probe::Right => {
                    best = Some((n, node.len() - 1));
                    node.right
                }
            };
        }
        Ok(best)
    }

    /// Position after (or before) `pos` in key order.
    pub(super) fn step(
        &mut self,
        (n, idx): (NodeRef, usize),
        direction: Direction,
    ) -> Result<Option<(NodeRef, usize)>> {
        match direction {
            Direction::Ascending => {
                if idx + 1 < self.node(n)?.len() {
                    return Ok(Some((n, idx + 1)));
                }
                Ok(self.successor(n)?.map(|s| (s, 0)))
            }
            Direction::Descending => {
                if idx > 0 {
                    return Ok(Some((n, idx - 1)));
                }
                match self.predecessor(n)? {
                    Some(p) => {
                        let len = self.node(p)?.len();
                        Ok(Some((p, len - 1)))
                    }
                    None => Ok(None),
                }
            }
        }
    }

    fn insert(&mut self, key: K, value: V) -> Result<Option<V>> {
        let cmp = Arc::clone(&self.cmp);
        let stats = Arc::clone(&self.stats);
        let page_size = self.options.page_size;
        let Some(mut cur) = self.root else {
            let mut node = Node::single(key, value);
            node.color = Color::Black;
            let r = self.table.insert_fresh(node);
            self.replace_root(Some(r))?;
            self.grew();
            return Ok(None);
        };
        loop {
            let node = self.node(cur)?;
            match node.probe(&key, &cmp, &stats)? {
                Probe::Found(idx) => {
                    let previous = node.value(idx, &stats)?.clone();
                    node.set_value(idx, value)?;
                    self.table.mark_dirty(cur);
                    return Ok(Some(previous));
                }
                Probe::Left => match node.left {
                    Some(left) => cur = left,
                    None => {
                        if node.len() < page_size {
                            node.items.insert(0, Item::fresh(key, value));
                            self.table.mark_dirty(cur);
                        } else {
                            let fresh = self.table.insert_fresh(Node::single(key, value));
                            self.set_left(cur, Some(fresh))?;
                            self.fix_after_insertion(fresh)?;
                        }
                        break;
                    }
                },
                Probe::Right => match node.right {
                    Some(right) => cur = right,
                    None => {
                        if node.len() < page_size {
                            node.items.push(Item::fresh(key, value));
                            self.table.mark_dirty(cur);
                        } else {
                            let fresh = self.table.insert_fresh(Node::single(key, value));
                            self.set_right(cur, Some(fresh))?;
                            self.fix_after_insertion(fresh)?;
                        }
                        break;
                    }
                },
                Probe::Between(idx) => {
                    if node.len() < page_size {
                        node.items.insert(idx, Item::fresh(key, value));
                        self.table.mark_dirty(cur);
                    } else {
                        self.split_insert(cur, idx, Item::fresh(key, value))?;
                    }
                    break;
                }
            }
        }
        self.grew();
        Ok(None)
    }

    /// Splits the full node `n` at `page_size / 2`, places `item` at `idx`,
    /// and links the upper half as the in-order successor of `n`.
    fn split_insert(&mut self, n: NodeRef, idx: usize, item: Item<K, V>) -> Result<()> {
        let half = self.options.page_size / 2;
        let node = self.node(n)?;
        let mut upper = node.items.split_off(half);
        if idx <= half {
            node.items.insert(idx, item);
        } else {
            upper.insert(idx - half, item);
        }
        self.table.mark_dirty(n);
        let fresh = self.table.insert_fresh(Node::from_items(upper));
        match self.right_of(Some(n))? {
            None => self.set_right(n, Some(fresh))?,
            Some(right) => {
                let leftmost = self.leftmost(right)?;
                self.set_left(leftmost, Some(fresh))?;
            }
        }
        TreeStats::bump(&self.stats.splits);
        self.fix_after_insertion(fresh)
    }

    /// Removes the item at `idx` of `n`, dropping the node once it is empty.
    pub(super) fn remove_at(&mut self, n: NodeRef, idx: usize) -> Result<V> {
        let stats = Arc::clone(&self.stats);
        let node = self.node(n)?;
        if idx >= node.len() {
            return Err(TesseraError::Corruption(format!(
                "remove of item {idx} from a node of {}",
                node.len()
            )));
        }
        let item = node.items.remove(idx);
        let emptied = node.items.is_empty();
        self.table.mark_dirty(n);
        if emptied {
            self.delete_node(n)?;
        }
        self.shrank();
        item.into_value(&stats)
    }

    fn grew(&mut self) {
        self.size += 1;
        self.mod_count += 1;
        self.meta.dirty = true;
    }

    fn shrank(&mut self) {
        self.size = self.size.saturating_sub(1);
        self.mod_count += 1;
        self.meta.dirty = true;
    }

    /// Unlinks the empty node `p`. A node with two children first takes over
    /// the items of its in-order successor, which is unlinked instead.
    fn delete_node(&mut self, p: NodeRef) -> Result<()> {
        let mut p = p;
        if self.left_of(Some(p))?.is_some() {
            if let Some(right) = self.right_of(Some(p))? {
                let successor = self.leftmost(right)?;
                let items = std::mem::take(&mut self.node(successor)?.items);
                self.node(p)?.items = items;
                self.table.mark_dirty(p);
                self.table.mark_dirty(successor);
                p = successor;
            }
        }

        let replacement = match self.left_of(Some(p))? {
            Some(left) => Some(left),
            None => self.right_of(Some(p))?,
        };
        let parent = self.table.parent(p);
        if let Some(replacement) = replacement {
            match parent {
                None => self.replace_root(Some(replacement))?,
                Some(pp) => {
                    if self.left_of(Some(pp))? == Some(p) {
                        self.set_left(pp, Some(replacement))?;
                    } else {
                        self.set_right(pp, Some(replacement))?;
                    }
                }
            }
            if self.color_of(Some(p))? == Color::Black {
                self.fix_after_deletion(replacement)?;
            }
        } else if parent.is_none() {
            self.replace_root(None)?;
        } else {
            if self.color_of(Some(p))? == Color::Black {
                self.fix_after_deletion(p)?;
            }
            if let Some(pp) = self.table.parent(p) {
                if self.left_of(Some(pp))? == Some(p) {
                    self.set_left(pp, None)?;
                } else if self.right_of(Some(pp))? == Some(p) {
                    self.set_right(pp, None)?;
                }
            }
        }
        self.discard(p);
        Ok(())
    }

    /// Forgets a node and queues its record for deletion at the next save.
    pub(super) fn discard(&mut self, r: NodeRef) {
        if let Some(slot) = self.table.remove(r) {
            if slot.rid.is_valid() {
                self.pending_deletes.push((slot.rid, slot.version));
            }
        }
    }

    pub(super) fn leftmost(&mut self, mut n: NodeRef) -> Result<NodeRef> {
        while let Some(left) = self.node(n)?.left {
            n = left;
        }
        Ok(n)
    }

    pub(super) fn rightmost(&mut self, mut n: NodeRef) -> Result<NodeRef> {
        while let Some(right) = self.node(n)?.right {
            n = right;
        }
        Ok(n)
    }

    fn successor(&mut self, n: NodeRef) -> Result<Option<NodeRef>> {
        if let Some(right) = self.right_of(Some(n))? {
            return self.leftmost(right).map(Some);
        }
        let mut child = n;
        let mut parent = self.table.parent(n);
        while let Some(p) = parent {
            if self.right_of(Some(p))? != Some(child) {
                break;
            }
            child = p;
            parent = self.table.parent(p);
        }
        Ok(parent)
    }

    fn predecessor(&mut self, n: NodeRef) -> Result<Option<NodeRef>> {
        if let Some(left) = self.left_of(Some(n))? {
            return self.rightmost(left).map(Some);
        }
        let mut child = n;
        let mut parent = self.table.parent(n);
        while let Some(p) = parent {
            if self.left_of(Some(p))? != Some(child) {
                break;
            }
            child = p;
            parent = self.table.parent(p);
        }
        Ok(parent)
    }

    fn parent_of(&self, n: Option<NodeRef>) -> Option<NodeRef> {
        n.and_then(|n| self.table.parent(n))
    }

    fn left_of(&mut self, n: Option<NodeRef>) -> Result<Option<NodeRef>> {
        match n {
            Some(n) => Ok(self.node(n)?.left),
            None => Ok(None),
        }
    }

    fn right_of(&mut self, n: Option<NodeRef>) -> Result<Option<NodeRef>> {
        match n {
            Some(n) => Ok(self.node(n)?.right),
            None => Ok(None),
        }
    }

    fn color_of(&mut self, n: Option<NodeRef>) -> Result<Color> {
        match n {
            Some(n) => Ok(self.node(n)?.color),
            None => Ok(Color::Black),
        }
    }

    fn set_color(&mut self, n: Option<NodeRef>, color: Color) -> Result<()> {
        if let Some(n) = n {
            let node = self.node(n)?;
            if node.color != color {
                node.color = color;
                self.table.mark_dirty(n);
            }
        }
        Ok(())
    }

    fn set_left(&mut self, n: NodeRef, child: Option<NodeRef>) -> Result<()> {
        let node = self.node(n)?;
        if node.left != child {
            node.left = child;
            self.table.mark_dirty(n);
        }
        if let Some(child) = child {
            self.table.set_parent(child, Some(n))?;
        }
        Ok(())
    }

    fn set_right(&mut self, n: NodeRef, child: Option<NodeRef>) -> Result<()> {
        let node = self.node(n)?;
        if node.right != child {
            node.right = child;
            self.table.mark_dirty(n);
        }
        if let Some(child) = child {
            self.table.set_parent(child, Some(n))?;
        }
        Ok(())
    }

    pub(super) fn replace_root(&mut self, root: Option<NodeRef>) -> Result<()> {
        if self.root != root {
            self.root = root;
            self.meta.dirty = true;
        }
        if let Some(root) = root {
            self.table.set_parent(root, None)?;
        }
        Ok(())
    }

    fn rotate_left(&mut self, p: Option<NodeRef>) -> Result<()> {
        let Some(p) = p else { return Ok(()) };
        let Some(r) = self.right_of(Some(p))? else {
            return Ok(());
        };
        let inner = self.left_of(Some(r))?;
        self.set_right(p, inner)?;
        match self.table.parent(p) {
            None => self.replace_root(Some(r))?,
            Some(pp) => {
                if self.left_of(Some(pp))? == Some(p) {
                    self.set_left(pp, Some(r))?;
                } else {
                    self.set_right(pp, Some(r))?;
                }
            }
        }
        self.set_left(r, Some(p))?;
        TreeStats::bump(&self.stats.rotations);
        Ok(())
    }

    fn rotate_right(&mut self, p: Option<NodeRef>) -> Result<()> {
        let Some(p) = p else { return Ok(()) };
        let Some(l) = self.left_of(Some(p))? else {
            return Ok(());
        };
        let inner = self.right_of(Some(l))?;
        self.set_left(p, inner)?;
        match self.table.parent(p) {
            None => self.replace_root(Some(l))?,
            Some(pp) => {
                if self.right_of(Some(pp))? == Some(p) {
                    self.set_right(pp, Some(l))?;
                } else {
                    self.set_left(pp, Some(l))?;
                }
            }
        }
        self.set_right(l, Some(p))?;
        TreeStats::bump(&self.stats.rotations);
        Ok(())
    }

    fn fix_after_insertion(&mut self, x: NodeRef) -> Result<()> {
        let mut x = Some(x);
        self.set_color(x, Color::Red)?;
        while x.is_some() && x != self.root {
            let parent = self.parent_of(x);
            if self.color_of(parent)? != Color::Red {
                break;
            }
            let grand = self.parent_of(parent);
            if parent == self.left_of(grand)? {
                let uncle = self.right_of(grand)?;
                if self.color_of(uncle)? == Color::Red {
                    self.set_color(parent, Color::Black)?;
                    self.set_color(uncle, Color::Black)?;
                    self.set_color(grand, Color::Red)?;
                    x = grand;
                } else {
                    if x == self.right_of(parent)? {
                        x = parent;
                        self.rotate_left(x)?;
                    }
                    let parent = self.parent_of(x);
                    let grand = self.parent_of(parent);
                    self.set_color(parent, Color::Black)?;
                    self.set_color(grand, Color::Red)?;
                    self.rotate_right(grand)?;
                }
            } else {
                let uncle = self.left_of(grand)?;
                if self.color_of(uncle)? == Color::Red {
                    self.set_color(parent, Color::Black)?;
                    self.set_color(uncle, Color::Black)?;
                    self.set_color(grand, Color::Red)?;
                    x = grand;
                } else {
                    if x == self.left_of(parent)? {
                        x = parent;
                        self.rotate_right(x)?;
                    }
                    let parent = self.parent_of(x);
                    let grand = self.parent_of(parent);
                    self.set_color(parent, Color::Black)?;
                    self.set_color(grand, Color::Red)?;
                    self.rotate_left(grand)?;
                }
            }
        }
        let root = self.root;
        self.set_color(root, Color::Black)
    }

    fn fix_after_deletion(&mut self, x: NodeRef) -> Result<()> {
        let mut x = Some(x);
        while x != self.root && self.color_of(x)? == Color::Black {
            let parent = self.parent_of(x);
            if parent.is_none() {
                break;
            }
            if x == self.left_of(parent)? {
                let mut sibling = self.right_of(parent)?;
                if self.color_of(sibling)? == Color::Red {
                    self.set_color(sibling, Color::Black)?;
                    self.set_color(parent, Color::Red)?;
                    self.rotate_left(parent)?;
                    sibling = self.right_of(self.parent_of(x))?;
                }
                let near = self.left_of(sibling)?;
                let far = self.right_of(sibling)?;
                if self.color_of(near)? == Color::Black && self.color_of(far)? == Color::Black {
                    self.set_color(sibling, Color::Red)?;
                    x = self.parent_of(x);
                } else {
                    if self.color_of(far)? == Color::Black {
                        self.set_color(near, Color::Black)?;
                        self.set_color(sibling, Color::Red)?;
                        self.rotate_right(sibling)?;
                        sibling = self.right_of(self.parent_of(x))?;
                    }
                    let parent = self.parent_of(x);
                    let parent_color = self.color_of(parent)?;
                    self.set_color(sibling, parent_color)?;
                    self.set_color(parent, Color::Black)?;
                    let far = self.right_of(sibling)?;
                    self.set_color(far, Color::Black)?;
                    self.rotate_left(parent)?;
                    x = self.root;
                }
            } else {
                let mut sibling = self.left_of(parent)?;
                if self.color_of(sibling)? == Color::Red {
                    self.set_color(sibling, Color::Black)?;
                    self.set_color(parent, Color::Red)?;
                    self.rotate_right(parent)?;
                    sibling = self.left_of(self.parent_of(x))?;
                }
                let near = self.right_of(sibling)?;
                let far = self.left_of(sibling)?;
                if self.color_of(near)? == Color::Black && self.color_of(far)? == Color::Black {
                    self.set_color(sibling, Color::Red)?;
                    x = self.parent_of(x);
                } else {
                    if self.color_of(far)? == Color::Black {
                        self.set_color(near, Color::Black)?;
                        self.set_color(sibling, Color::Red)?;
                        self.rotate_left(sibling)?;
                        sibling = self.left_of(self.parent_of(x))?;
                    }
                    let parent = self.parent_of(x);
                    let parent_color = self.color_of(parent)?;
                    self.set_color(sibling, parent_color)?;
                    self.set_color(parent, Color::Black)?;
                    let far = self.left_of(sibling)?;
                    self.set_color(far, Color::Black)?;
                    self.rotate_right(parent)?;
                    x = self.root;
                }
            }
        }
        self.set_color(x, Color::Black)
    }
}
