use std::cmp::Ordering;
use std::ops::Bound;

use crate::types::{Result, TesseraError};

use super::codec::{KeyCodec, ValCodec};
use super::definition::PersistentTree;
use super::table::NodeRef;

/// Iteration order of a cursor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    /// Smallest key first.
    Ascending,
    /// Largest key first.
    Descending,
}

/// A position in a tree's key order.
///
/// The cursor borrows nothing; each step takes the tree explicitly and
/// fails with [`TesseraError::ConcurrentModification`] when the tree was
/// structurally modified by anything other than [`TreeCursor::remove`].
pub struct TreeCursor<K> {
    tree_id: u64,
    next: Option<(NodeRef, usize)>,
    last: Option<K>,
    expected_mod_count: u64,
    direction: Direction,
    end: Bound<K>,
}

impl<K: KeyCodec> TreeCursor<K> {
    /// Iteration order.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Returns the next entry, or `None` once the cursor is exhausted.
    pub fn next<V: ValCodec>(&mut self, tree: &mut PersistentTree<K, V>) -> Result<Option<(K, V)>> {
        let Some(pos) = self.position(tree)? else {
            return Ok(None);
        };
        let entry = tree.item_at(pos.0, pos.1);
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tree.after_operation();
                return Err(err);
            }
        };
        let result = self.advance(tree, pos, &entry.0).map(|more| more.then_some(entry));
        tree.after_operation();
        result
    }

    /// Returns the next key without decoding its value.
    pub fn next_key<V: ValCodec>(&mut self, tree: &mut PersistentTree<K, V>) -> Result<Option<K>> {
        let Some(pos) = self.position(tree)? else {
            return Ok(None);
        };
        let result = match tree.key_at(pos.0, pos.1) {
            Ok(key) => self
                .advance(tree, pos, &key)
                .map(|more| more.then_some(key)),
            Err(err) => Err(err),
        };
        tree.after_operation();
        result
    }

    /// Removes the entry most recently returned and keeps iterating from the
    /// entry that followed it.
    pub fn remove<V: ValCodec>(&mut self, tree: &mut PersistentTree<K, V>) -> Result<V> {
        self.check(tree)?;
        let last = self
            .last
            .take()
            .ok_or(TesseraError::Invalid("cursor has no current entry to remove"))?;
        let resume = match self.next {
            Some((n, idx)) => Some(tree.key_at(n, idx)?),
            None => None,
        };
        let value = tree.remove(&last)?.ok_or_else(|| {
            TesseraError::Corruption("entry returned by the cursor is missing".into())
        })?;
        self.next = match resume {
            Some(key) => tree.find(&key)?,
            None => None,
        };
        self.expected_mod_count = tree.mod_count;
        tree.after_operation();
        Ok(value)
    }

    fn check<V>(&self, tree: &PersistentTree<K, V>) -> Result<()> {
        if tree.id != self.tree_id {
            return Err(TesseraError::Invalid("cursor belongs to another tree"));
        }
        if tree.mod_count != self.expected_mod_count {
            return Err(TesseraError::ConcurrentModification(
                "tree was modified outside the cursor",
            ));
        }
        Ok(())
    }

    fn position<V>(&self, tree: &PersistentTree<K, V>) -> Result<Option<(NodeRef, usize)>> {
        self.check(tree)?;
        Ok(self.next)
    }

    /// Moves past `pos` whose key is `key`. Returns false, leaving the cursor
    /// exhausted, when `key` lies beyond the end bound.
    fn advance<V: ValCodec>(
        &mut self,
        tree: &mut PersistentTree<K, V>,
        pos: (NodeRef, usize),
        key: &K,
    ) -> Result<bool> {
        if self.beyond_end(tree, key) {
            self.next = None;
            return Ok(false);
        }
        self.next = tree.step(pos, self.direction)?;
        self.last = Some(key.clone());
        Ok(true)
    }

    fn beyond_end<V: ValCodec>(&self, tree: &PersistentTree<K, V>, key: &K) -> bool {
        let past = match self.direction {
            Direction::Ascending => Ordering::Greater,
            Direction::Descending => Ordering::Less,
        };
        match &self.end {
            Bound::Unbounded => false,
            Bound::Included(end) => tree.compare(key, end) == past,
            Bound::Excluded(end) => tree.compare(key, end) != past.reverse(),
        }
    }
}

impl<K: KeyCodec, V: ValCodec> PersistentTree<K, V> {
    fn open_cursor(
        &self,
        start: Option<(NodeRef, usize)>,
        direction: Direction,
        end: Bound<K>,
    ) -> TreeCursor<K> {
        TreeCursor {
            tree_id: self.id,
            next: start,
            last: None,
            expected_mod_count: self.mod_count,
            direction,
            end,
        }
    }

    /// Cursor over all entries in ascending key order.
    pub fn cursor(&mut self) -> Result<TreeCursor<K>> {
        let start = match self.root {
            Some(root) => Some((self.leftmost(root)?, 0)),
            None => None,
        };
        Ok(self.open_cursor(start, Direction::Ascending, Bound::Unbounded))
    }

    /// Cursor over all entries in descending key order.
    pub fn cursor_desc(&mut self) -> Result<TreeCursor<K>> {
        let start = match self.root {
            Some(root) => {
                let last = self.rightmost(root)?;
                let len = self.node(last)?.len();
                Some((last, len - 1))
            }
            None => None,
        };
        Ok(self.open_cursor(start, Direction::Descending, Bound::Unbounded))
    }

    /// Ascending cursor over the keys within `lo..hi`.
    pub fn range(&mut self, lo: Bound<K>, hi: Bound<K>) -> Result<TreeCursor<K>> {
        let start = match &lo {
            Bound::Unbounded => match self.root {
                Some(root) => Some((self.leftmost(root)?, 0)),
                None => None,
            },
            Bound::Included(key) => self.ceiling(key)?,
            Bound::Excluded(key) => match self.ceiling(key)? {
                Some(pos) => {
                    let found = self.key_at(pos.0, pos.1)?;
                    if self.compare(&found, key) == Ordering::Equal {
                        self.step(pos, Direction::Ascending)?
                    } else {
                        Some(pos)
                    }
                }
                None => None,
            },
        };
        Ok(self.open_cursor(start, Direction::Ascending, hi))
    }

    /// Descending cursor starting at the largest key not greater than `key`.
    pub fn seek_desc(&mut self, key: &K) -> Result<TreeCursor<K>> {
        let start = self.floor(key)?;
        Ok(self.open_cursor(start, Direction::Descending, Bound::Unbounded))
    }
}
