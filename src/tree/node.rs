use std::cmp::Ordering;
use std::sync::atomic::AtomicU64;

use crate::primitives::bytes::{buf, put};
use crate::types::{RecordId, Result, TesseraError, RECORD_ID_LEN};

use super::codec::{KeyCodec, ValCodec};
use super::stats::TreeStats;
use super::table::NodeRef;

/// Key order used by a tree.
pub type Comparator<K> = std::sync::Arc<dyn Fn(&K, &K) -> Ordering + Send + Sync>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Color {
    Red,
    Black,
}

/// A key or value held in decoded form, serialized form, or both.
///
/// Loaded nodes start with bytes only; mutation drops the bytes so the next
/// flush re-serializes from the value.
pub(crate) struct Lazy<T> {
    value: Option<T>,
    raw: Option<Vec<u8>>,
}

impl<T> Lazy<T> {
    pub fn fresh(value: T) -> Self {
        Self {
            value: Some(value),
            raw: None,
        }
    }

    pub fn encoded(raw: Vec<u8>) -> Self {
        Self {
            value: None,
            raw: Some(raw),
        }
    }

    #[cfg(test)]
    pub fn is_decoded(&self) -> bool {
        self.value.is_some()
    }

    fn get(
        &mut self,
        decode: impl FnOnce(&[u8]) -> Result<T>,
        decodes: &AtomicU64,
    ) -> Result<&T> {
        if self.value.is_none() {
            let raw = self.raw.as_deref().ok_or_else(|| {
                TesseraError::Corruption("tree item holds neither a value nor its bytes".into())
            })?;
            let decoded = decode(raw)?;
            TreeStats::bump(decodes);
            self.value = Some(decoded);
        }
        self.value.as_ref().ok_or_else(|| {
            TesseraError::Corruption("tree item lost its decoded value".into())
        })
    }

    fn raw(&mut self, encode: impl FnOnce(&T, &mut Vec<u8>), encodes: &AtomicU64) -> Result<&[u8]> {
        if self.raw.is_none() {
            if let Some(value) = &self.value {
                let mut out = Vec::new();
                encode(value, &mut out);
                TreeStats::bump(encodes);
                self.raw = Some(out);
            }
        }
        self.raw.as_deref().ok_or_else(|| {
            TesseraError::Corruption("tree item holds neither a value nor its bytes".into())
        })
    }

    fn replace(&mut self, value: T) {
        self.value = Some(value);
        self.raw = None;
    }
}

/// One key/value pair inside a node.
pub(crate) struct Item<K, V> {
    pub key: Lazy<K>,
    pub value: Lazy<V>,
}

impl<K, V> Item<K, V> {
    pub fn fresh(key: K, value: V) -> Self {
        Self {
            key: Lazy::fresh(key),
            value: Lazy::fresh(value),
        }
    }
}

impl<K: KeyCodec, V: ValCodec> Item<K, V> {
    /// Consumes the item, decoding its value if needed.
    pub fn into_value(mut self, stats: &TreeStats) -> Result<V> {
        self.value.get(V::decode_val, &stats.value_decodes)?;
        self.value
            .value
            .ok_or_else(|| TesseraError::Corruption("tree item lost its decoded value".into()))
    }
}

/// Where a key falls relative to a node's items.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Probe {
    /// Smaller than every item.
    Left,
    /// Larger than every item.
    Right,
    /// Equal to the item at this index.
    Found(usize),
    /// Strictly between two items; the index is the insertion point.
    Between(usize),
}

/// A fat red-black node: up to `page_size` sorted items plus child links.
pub(crate) struct Node<K, V> {
    pub items: Vec<Item<K, V>>,
    pub color: Color,
    pub left: Option<NodeRef>,
    pub right: Option<NodeRef>,
}

impl<K: KeyCodec, V: ValCodec> Node<K, V> {
    /// A red node holding one freshly inserted pair.
    pub fn single(key: K, value: V) -> Self {
        Self {
            items: vec![Item::fresh(key, value)],
            color: Color::Red,
            left: None,
            right: None,
        }
    }

    /// A red node taking over `items` (the upper half of a split).
    pub fn from_items(items: Vec<Item<K, V>>) -> Self {
        Self {
            items,
            color: Color::Red,
            left: None,
            right: None,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn key(&mut self, idx: usize, stats: &TreeStats) -> Result<&K> {
        let item = self.item_mut(idx)?;
        item.key.get(K::decode_key, &stats.key_decodes)
    }

    pub fn value(&mut self, idx: usize, stats: &TreeStats) -> Result<&V> {
        let item = self.item_mut(idx)?;
        item.value.get(V::decode_val, &stats.value_decodes)
    }

    pub fn set_value(&mut self, idx: usize, value: V) -> Result<()> {
        self.item_mut(idx)?.value.replace(value);
        Ok(())
    }

    fn item_mut(&mut self, idx: usize) -> Result<&mut Item<K, V>> {
        let len = self.items.len();
        self.items.get_mut(idx).ok_or_else(|| {
            TesseraError::Corruption(format!("item {idx} requested from a node of {len}"))
        })
    }

    /// Locates `key` among the items, decoding only the keys it compares.
    pub fn probe(&mut self, key: &K, cmp: &Comparator<K>, stats: &TreeStats) -> Result<Probe> {
        let Some(last) = self.items.len().checked_sub(1) else {
            return Err(TesseraError::Corruption("empty tree node".into()));
        };
        match cmp(key, self.key(0, stats)?) {
            Ordering::Less => return Ok(Probe::Left),
            Ordering::Equal => return Ok(Probe::Found(0)),
            Ordering::Greater => {}
        }
        if last == 0 {
            return Ok(Probe::Right);
        }
        match cmp(key, self.key(last, stats)?) {
            Ordering::Greater => return Ok(Probe::Right),
            Ordering::Equal => return Ok(Probe::Found(last)),
            Ordering::Less => {}
        }
        let (mut lo, mut hi) = (1, last);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match cmp(key, self.key(mid, stats)?) {
                Ordering::Equal => return Ok(Probe::Found(mid)),
                Ordering::Less => hi = mid,
                Ordering::Greater => lo = mid + 1,
            }
        }
        Ok(Probe::Between(lo))
    }

    /// Serializes the node, encoding only items changed since the last flush.
    pub fn encode(
        &mut self,
        page_size: usize,
        left: RecordId,
        right: RecordId,
        stats: &TreeStats,
    ) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(2 * RECORD_ID_LEN + 8 + self.items.len() * 16);
        put::i16(&mut out, page_size as i16);
        left.encode(&mut out);
        right.encode(&mut out);
        put::bool(&mut out, self.color == Color::Black);
        put::i16(&mut out, self.items.len() as i16);
        for item in &mut self.items {
            put::len_prefixed(&mut out, item.key.raw(K::encode_key, &stats.key_encodes)?)?;
        }
        for item in &mut self.items {
            put::len_prefixed(&mut out, item.value.raw(V::encode_val, &stats.value_encodes)?)?;
        }
        Ok(out)
    }
}

/// Structural decode of a node record; keys and values stay serialized.
pub(crate) struct NodeImage {
    pub page_size: usize,
    pub left: RecordId,
    pub right: RecordId,
    pub color: Color,
    pub keys: Vec<Vec<u8>>,
    pub values: Vec<Vec<u8>>,
}

impl NodeImage {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cur = buf::Cursor::new(bytes);
        let page_size = cur.i16()?;
        let left = RecordId::decode(cur.take(RECORD_ID_LEN)?)?;
        let right = RecordId::decode(cur.take(RECORD_ID_LEN)?)?;
        let color = if cur.bool()? { Color::Black } else { Color::Red };
        let count = cur.i16()?;
        if page_size < 2 || count < 0 {
            return Err(TesseraError::Corruption(format!(
                "node header reports page size {page_size} and {count} items"
            )));
        }
        let mut keys = Vec::with_capacity(count as usize);
        for _ in 0..count {
            keys.push(cur.len_prefixed()?.to_vec());
        }
        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            values.push(cur.len_prefixed()?.to_vec());
        }
        if cur.remaining() != 0 {
            return Err(TesseraError::Serialization(format!(
                "{} trailing bytes after tree node",
                cur.remaining()
            )));
        }
        Ok(Self {
            page_size: page_size as usize,
            left,
            right,
            color,
            keys,
            values,
        })
    }

    pub fn into_node<K, V>(self, left: Option<NodeRef>, right: Option<NodeRef>) -> Node<K, V> {
        let items = self
            .keys
            .into_iter()
            .zip(self.values)
            .map(|(key, value)| Item {
                key: Lazy::encoded(key),
                value: Lazy::encoded(value),
            })
            .collect();
        Node {
            items,
            color: self.color,
            left,
            right,
        }
    }
}
