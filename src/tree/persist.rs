use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use crate::commit::CommitTicket;
use crate::primitives::bytes::{buf, put};
use crate::types::{RecordId, RecordVersion, Result, TesseraError, VersionCheck, RECORD_ID_LEN};

use super::backing::{NodeStore, TreeBacking};
use super::codec::{KeyCodec, ValCodec};
use super::definition::{natural_order, MetaRecord, PersistentTree, TreeOptions};
use super::node::{Comparator, NodeImage};
use super::stats::TreeStats;
use super::table::NodeRef;

const META_FORMAT: u8 = 1;

/// Decoded metadata record.
struct TreeMeta {
    page_size: usize,
    size: u64,
    root: RecordId,
    key_codec: String,
    value_codec: String,
}

impl TreeMeta {
    fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(32 + RECORD_ID_LEN);
        put::u8(&mut out, META_FORMAT);
        put::i16(&mut out, self.page_size as i16);
        put::i64(&mut out, self.size as i64);
        self.root.encode(&mut out);
        put::len_prefixed(&mut out, self.key_codec.as_bytes())?;
        put::len_prefixed(&mut out, self.value_codec.as_bytes())?;
        Ok(out)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cur = buf::Cursor::new(bytes);
        let format = cur.u8()?;
        if format != META_FORMAT {
            return Err(TesseraError::Corruption(format!(
                "unknown tree metadata format {format}"
            )));
        }
        let page_size = cur.i16()?;
        let size = cur.i64()?;
        if page_size < 2 || size < 0 {
            return Err(TesseraError::Corruption(format!(
                "tree metadata reports page size {page_size} and {size} entries"
            )));
        }
        let root = RecordId::decode(cur.take(RECORD_ID_LEN)?)?;
        let key_codec = codec_name(cur.len_prefixed()?)?;
        let value_codec = codec_name(cur.len_prefixed()?)?;
        Ok(Self {
            page_size: page_size as usize,
            size: size as u64,
            root,
            key_codec,
            value_codec,
        })
    }
}

fn codec_name(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| TesseraError::Serialization("codec name is not UTF-8".into()))
}

impl<K: KeyCodec + Ord, V: ValCodec> PersistentTree<K, V> {
    /// Creates an empty tree ordered by `K`'s natural order. Persistent
    /// backings allocate and write the metadata record immediately.
    pub fn create(backing: TreeBacking, options: TreeOptions) -> Result<Self> {
        Self::create_with_comparator(backing, options, natural_order())
    }

    /// Opens the tree whose metadata lives at `rid`.
    pub fn load(backing: TreeBacking, rid: RecordId, options: TreeOptions) -> Result<Self> {
        Self::load_with_comparator(backing, rid, options, natural_order())
    }
}

impl<K: KeyCodec, V: ValCodec> PersistentTree<K, V> {
    /// Creates an empty tree ordered by `cmp`.
    pub fn create_with_comparator(
        backing: TreeBacking,
        options: TreeOptions,
        cmp: Comparator<K>,
    ) -> Result<Self> {
        options.validate()?;
        let mut tree = Self::empty(backing, options, cmp);
        if let Some(store) = tree.backing.store().cloned() {
            tree.meta.rid = store.create_address()?;
            tree.meta.dirty = true;
            tree.write_meta(store.as_ref())?;
        }
        debug!(
            rid = %tree.meta.rid,
            backing = tree.backing.kind(),
            page_size = tree.options.page_size,
            "tree.create"
        );
        Ok(tree)
    }

    /// Opens the tree at `rid` ordered by `cmp`. Only the metadata record is
    /// read; nodes are faulted in as operations reach them.
    pub fn load_with_comparator(
        backing: TreeBacking,
        rid: RecordId,
        options: TreeOptions,
        cmp: Comparator<K>,
    ) -> Result<Self> {
        options.validate()?;
        let store = backing
            .store()
            .cloned()
            .ok_or(TesseraError::Invalid("an in-memory tree has nothing to load"))?;
        let raw = store
            .load(rid)?
            .ok_or_else(|| TesseraError::NotFound(format!("tree metadata {rid}")))?;
        let meta = TreeMeta::decode(&raw.bytes)?;
        if meta.page_size != options.page_size {
            return Err(TesseraError::Configuration(format!(
                "tree {rid} was built with page size {} but {} is configured",
                meta.page_size, options.page_size
            )));
        }
        if meta.key_codec != K::CODEC_ID || meta.value_codec != V::CODEC_ID {
            return Err(TesseraError::Configuration(format!(
                "tree {rid} stores {}/{} entries, not {}/{}",
                meta.key_codec,
                meta.value_codec,
                K::CODEC_ID,
                V::CODEC_ID
            )));
        }

        let mut tree = Self::empty(backing, options, cmp);
        tree.meta = MetaRecord {
            rid,
            version: raw.version,
            dirty: false,
        };
        tree.size = meta.size;
        if meta.root.is_valid() {
            tree.root = Some(tree.table.attach(meta.root, None));
        }
        debug!(%rid, size = tree.size, root = %meta.root, "tree.load");
        Ok(tree)
    }

    pub(crate) fn set_commit_ticket(&mut self, ticket: CommitTicket) {
        self.commit_ticket = Some(ticket);
    }

    /// Reads the stored content of `r` into the node table.
    pub(super) fn fault_in(&mut self, r: NodeRef) -> Result<()> {
        let rid = self.table.slot(r)?.rid;
        let Some(store) = self.backing.store().cloned() else {
            return Err(TesseraError::Corruption(format!(
                "in-memory node {r:?} has no content"
            )));
        };
        if !rid.is_valid() {
            return Err(TesseraError::Corruption(format!(
                "node {r:?} was never stored and is not resident"
            )));
        }
        let raw = match store.load(rid) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                return Err(load_failed(rid, TesseraError::NotFound(format!("record {rid}"))))
            }
            Err(err) => return Err(load_failed(rid, err)),
        };
        let image = NodeImage::decode(&raw.bytes).map_err(|err| load_failed(rid, err))?;
        if image.page_size != self.options.page_size {
            return Err(TesseraError::Configuration(format!(
                "node {rid} has page size {} but the tree uses {}",
                image.page_size, self.options.page_size
            )));
        }
        if image.keys.is_empty() || image.keys.len() > self.options.page_size {
            return Err(load_failed(
                rid,
                TesseraError::Corruption(format!("node holds {} items", image.keys.len())),
            ));
        }
        let left = image
            .left
            .is_valid()
            .then(|| self.table.attach(image.left, Some(r)));
        let right = image
            .right
            .is_valid()
            .then(|| self.table.attach(image.right, Some(r)));
        self.table.install(r, image.into_node(left, right), raw.version)?;
        TreeStats::bump(&self.stats.node_loads);
        trace!(%rid, version = %raw.version, "tree.node_load");
        Ok(())
    }

    /// Writes dirty nodes, pending deletions and the metadata record.
    pub fn save(&mut self) -> Result<()> {
        let result = self.flush(true);
        self.after_operation();
        result
    }

    /// Like [`PersistentTree::save`] but leaves the metadata record alone.
    pub fn lazy_save(&mut self) -> Result<()> {
        let result = self.flush(false);
        self.after_operation();
        result
    }

    /// Makes the current state durable the way the backing prescribes:
    /// nothing for memory trees, a full save for store trees, and a lazy save
    /// plus a scheduled background commit for batched trees.
    pub fn commit_changes(&mut self) -> Result<()> {
        let committer = match &self.backing {
            TreeBacking::Memory => return Ok(()),
            TreeBacking::Store(_) => return self.save(),
            TreeBacking::Batched { committer, .. } => committer.clone(),
        };
        match self.commit_ticket {
            Some(ticket) => {
                self.lazy_save()?;
                committer.schedule(ticket)
            }
            None => self.save(),
        }
    }

    fn flush(&mut self, write_meta: bool) -> Result<()> {
        let Some(store) = self.backing.store().cloned() else {
            return Ok(());
        };
        let dirty = self.table.dirty_refs();
        for &r in &dirty {
            if !self.table.slot(r)?.rid.is_valid() {
                let rid = store
                    .create_address()
                    .map_err(|err| TesseraError::node_save(RecordId::INVALID, err))?;
                self.table.assign_rid(r, rid, RecordVersion::default())?;
            }
        }

        let page_size = self.options.page_size;
        let stats = Arc::clone(&self.stats);
        for &r in &dirty {
            let (left, right) = {
                let node = self.table.node_mut(r)?;
                (node.left, node.right)
            };
            let left = self.rid_of(left)?;
            let right = self.rid_of(right)?;
            let (rid, version) = {
                let slot = self.table.slot(r)?;
                (slot.rid, slot.version)
            };
            let bytes = self.table.node_mut(r)?.encode(page_size, left, right, &stats)?;
            let saved = store
                .save(rid, &bytes, VersionCheck::Exact(version))
                .map_err(|err| {
                    error!(%rid, error = %err, "tree.node_save_failed");
                    TesseraError::node_save(rid, err)
                })?;
            self.table.set_version(r, saved)?;
            self.table.mark_clean(r);
            TreeStats::bump(&stats.node_saves);
        }

        self.flush_deletes(store.as_ref())?;
        if write_meta && self.meta.dirty {
            self.write_meta(store.as_ref())?;
        }
        debug!(
            rid = %self.meta.rid,
            nodes = dirty.len(),
            meta = write_meta,
            "tree.save"
        );
        Ok(())
    }

    fn flush_deletes(&mut self, store: &dyn NodeStore) -> Result<()> {
        while let Some((rid, version)) = self.pending_deletes.pop() {
            match store.delete(rid, VersionCheck::Exact(version)) {
                Ok(true) => TreeStats::bump(&self.stats.node_deletes),
                Ok(false) => warn!(%rid, "tree.delete.missing"),
                Err(err) => {
                    self.pending_deletes.push((rid, version));
                    return Err(TesseraError::node_save(rid, err));
                }
            }
        }
        Ok(())
    }

    fn rid_of(&self, r: Option<NodeRef>) -> Result<RecordId> {
        match r {
            Some(r) => Ok(self.table.slot(r)?.rid),
            None => Ok(RecordId::INVALID),
        }
    }

    fn write_meta(&mut self, store: &dyn NodeStore) -> Result<()> {
        let meta = TreeMeta {
            page_size: self.options.page_size,
            size: self.size,
            root: self.rid_of(self.root)?,
            key_codec: K::CODEC_ID.to_string(),
            value_codec: V::CODEC_ID.to_string(),
        };
        let bytes = meta.encode()?;
        self.meta.version = store.save(self.meta.rid, &bytes, VersionCheck::Exact(self.meta.version))?;
        self.meta.dirty = false;
        Ok(())
    }

    /// Removes every entry. Stored nodes are queued for deletion at the next
    /// save; the tree itself stays usable.
    pub fn clear(&mut self) -> Result<()> {
        if self.backing.store().is_some() {
            let mut stack: Vec<NodeRef> = self.root.into_iter().collect();
            while let Some(r) = stack.pop() {
                let node = self.node(r)?;
                stack.extend(node.left);
                stack.extend(node.right);
                let slot = self.table.slot(r)?;
                if slot.rid.is_valid() {
                    self.pending_deletes.push((slot.rid, slot.version));
                }
            }
        }
        self.table.clear();
        self.root = None;
        self.size = 0;
        self.mod_count += 1;
        self.meta.dirty = true;
        debug!(rid = %self.meta.rid, "tree.clear");
        Ok(())
    }

    /// Deletes every node record and the metadata record.
    pub fn delete(mut self) -> Result<()> {
        self.clear()?;
        if let Some(committer) = self.backing.committer() {
            if let Some(ticket) = self.commit_ticket.take() {
                committer.unregister(ticket);
            }
        }
        let Some(store) = self.backing.store().cloned() else {
            return Ok(());
        };
        self.flush_deletes(store.as_ref())?;
        store.delete(self.meta.rid, VersionCheck::Exact(self.meta.version))?;
        self.meta.dirty = false;
        debug!(rid = %self.meta.rid, "tree.delete");
        Ok(())
    }

    /// Drops the content of every clean, stored node. Dirty nodes stay
    /// resident until saved. Returns the number of nodes dropped.
    pub fn unload(&mut self) -> Result<usize> {
        if self.backing.store().is_none() {
            return Ok(0);
        }
        let dropped = self.table.evict(0, &self.stats);
        debug!(
            rid = %self.meta.rid,
            dropped,
            resident = self.table.resident_len(),
            known = self.table.len(),
            "tree.unload"
        );
        Ok(dropped)
    }
}

fn load_failed(rid: RecordId, err: TesseraError) -> TesseraError {
    error!(%rid, error = %err, "tree.node_load_failed");
    TesseraError::node_load(rid, err)
}
