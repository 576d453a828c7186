use std::cmp::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::types::{Result, TesseraError};

use super::codec::{KeyCodec, ValCodec};
use super::definition::PersistentTree;
use super::node::Color;
use super::table::NodeRef;

/// Shape of a tree that passed [`PersistentTree::check_invariants`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TreeReport {
    /// Entries counted while walking.
    pub entries: u64,
    /// Nodes visited.
    pub nodes: usize,
    /// Black nodes on every root-to-leaf path.
    pub black_height: usize,
    /// Longest root-to-leaf path in nodes.
    pub depth: usize,
}

fn violation(message: String) -> TesseraError {
    TesseraError::Corruption(message)
}

impl<K: KeyCodec, V: ValCodec> PersistentTree<K, V> {
    /// Walks the whole tree, loading every node, and verifies the red-black
    /// rules, key order, parent links, node fill and the entry count.
    pub fn check_invariants(&mut self) -> Result<TreeReport> {
        let mut report = TreeReport::default();
        let mut previous: Option<K> = None;
        if let Some(root) = self.root {
            if self.node(root)?.color != Color::Black {
                return Err(violation("root is red".into()));
            }
            report.black_height = self.walk(root, None, 1, &mut report, &mut previous)?;
        }
        if report.entries != self.size {
            return Err(violation(format!(
                "tree reports {} entries but holds {}",
                self.size, report.entries
            )));
        }
        self.after_operation();
        debug!(
            entries = report.entries,
            nodes = report.nodes,
            depth = report.depth,
            "tree.check"
        );
        Ok(report)
    }

    fn walk(
        &mut self,
        n: NodeRef,
        parent: Option<(NodeRef, Color)>,
        depth: usize,
        report: &mut TreeReport,
        previous: &mut Option<K>,
    ) -> Result<usize> {
        if self.table.parent(n) != parent.map(|(p, _)| p) {
            return Err(violation(format!("node {n:?} has a stale parent link")));
        }
        let page_size = self.options.page_size;
        let node = self.node(n)?;
        let (color, left, right, len) = (node.color, node.left, node.right, node.len());
        if len == 0 || len > page_size {
            return Err(violation(format!("node {n:?} holds {len} items")));
        }
        if color == Color::Red && matches!(parent, Some((_, Color::Red))) {
            return Err(violation(format!("red node {n:?} has a red parent")));
        }
        report.nodes += 1;
        report.depth = report.depth.max(depth);

        let left_height = match left {
            Some(l) => self.walk(l, Some((n, color)), depth + 1, report, previous)?,
            None => 1,
        };
        let stats = Arc::clone(&self.stats);
        for idx in 0..len {
            let key = self.node(n)?.key(idx, &stats)?.clone();
            if let Some(prev) = previous.as_ref() {
                if self.compare(prev, &key) != Ordering::Less {
                    return Err(violation(format!("keys out of order in node {n:?}")));
                }
            }
            *previous = Some(key);
        }
        report.entries += len as u64;
        let right_height = match right {
            Some(r) => self.walk(r, Some((n, color)), depth + 1, report, previous)?,
            None => 1,
        };
        if left_height != right_height {
            return Err(violation(format!(
                "node {n:?} has black heights {left_height} and {right_height}"
            )));
        }
        Ok(left_height + usize::from(color == Color::Black))
    }
}
