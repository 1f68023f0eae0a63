//! Chained Hash Index with Progressive Resizing
//!
//! The primary key index. Entries live in a slab arena and are threaded
//! into singly linked bucket chains by handle, so moving an entry from one
//! table to another only rewrites a couple of links.
//!
//! ## Progressive Resizing
//!
//! ```text
//!   insert ──> load factor >= 8 ?
//!                   │ yes (and no resize pending)
//!                   ▼
//!   ┌──────────────┐          ┌──────────────┐
//!   │ newer (2N)   │ <─ 128 ──│ older (N)    │   a bounded slice of chain
//!   │              │  per op  │              │   entries moves on every
//!   └──────────────┘          └──────────────┘   insert / lookup / pop
//! ```
//!
//! While both tables exist, lookups and pops probe both. Once the older
//! table is drained it is dropped.
//!
//! Hashing and equality are supplied by the caller: every operation takes a
//! precomputed hash code plus a predicate over the stored payload.

use slab::Slab;
use std::hash::{DefaultHasher, Hasher};
use std::ops::{Index, IndexMut};

/// Capacity of the primary table when it is first allocated.
const INITIAL_CAPACITY: usize = 4;

/// A resize starts once `size / buckets` reaches this value.
const MAX_LOAD_FACTOR: usize = 8;

/// Number of chain entries migrated per operation while resizing.
const RESIZING_WORK: usize = 128;

/// Hashes a byte string the way every index in the crate expects.
#[inline]
pub fn hash_bytes(data: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write(data);
    hasher.finish()
}

/// Stable handle to an entry stored in a [`HashIndex`].
///
/// Handles survive resizing and chain reordering. A handle is invalidated
/// when its entry is popped and may be reused by a later insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainId(usize);

#[derive(Debug)]
struct Node<T> {
    next: Option<ChainId>,
    hcode: u64,
    value: T,
}

/// One fixed-size table of bucket heads.
#[derive(Debug, Default)]
struct Table {
    slots: Vec<Option<ChainId>>,
    mask: usize,
    size: usize,
}

impl Table {
    fn with_capacity(n: usize) -> Self {
        debug_assert!(n.is_power_of_two());
        Self {
            slots: vec![None; n],
            mask: n - 1,
            size: 0,
        }
    }

    #[inline]
    fn is_allocated(&self) -> bool {
        !self.slots.is_empty()
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn link<T>(&mut self, nodes: &mut Slab<Node<T>>, id: ChainId) {
        let pos = (nodes[id.0].hcode as usize) & self.mask;
        nodes[id.0].next = self.slots[pos];
        self.slots[pos] = Some(id);
        self.size += 1;
    }

    /// Finds a matching node, returning its bucket, its predecessor in the
    /// chain and the node itself.
    fn find<T>(
        &self,
        nodes: &Slab<Node<T>>,
        hcode: u64,
        eq: &mut impl FnMut(&T) -> bool,
    ) -> Option<(usize, Option<ChainId>, ChainId)> {
        if !self.is_allocated() {
            return None;
        }

        let pos = (hcode as usize) & self.mask;
        let mut prev = None;
        let mut cur = self.slots[pos];
        while let Some(id) = cur {
            let node = &nodes[id.0];
            if node.hcode == hcode && eq(&node.value) {
                return Some((pos, prev, id));
            }
            prev = Some(id);
            cur = node.next;
        }
        None
    }

    fn unlink<T>(
        &mut self,
        nodes: &mut Slab<Node<T>>,
        pos: usize,
        prev: Option<ChainId>,
        id: ChainId,
    ) {
        let next = nodes[id.0].next.take();
        match prev {
            Some(prev) => nodes[prev.0].next = next,
            None => self.slots[pos] = next,
        }
        self.size -= 1;
    }
}

/// A hashtable that grows without stop-the-world rehashing.
#[derive(Debug)]
pub struct HashIndex<T> {
    nodes: Slab<Node<T>>,
    newer: Table,
    older: Table,
    migrate_pos: usize,
}

impl<T> Default for HashIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HashIndex<T> {
    /// Creates an empty index. No table is allocated until the first insert.
    pub fn new() -> Self {
        Self {
            nodes: Slab::new(),
            newer: Table::default(),
            older: Table::default(),
            migrate_pos: 0,
        }
    }

    /// Number of live entries across both tables.
    #[inline]
    pub fn size(&self) -> usize {
        self.newer.size + self.older.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Returns true while an older table is still being drained.
    #[inline]
    pub fn is_resizing(&self) -> bool {
        self.older.is_allocated()
    }

    /// Bucket count of the primary table.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.newer.capacity()
    }

    /// Inserts a new entry and returns its handle.
    ///
    /// Uniqueness is the caller's concern: look the key up first.
    pub fn insert(&mut self, hcode: u64, value: T) -> ChainId {
        if !self.newer.is_allocated() {
            self.newer = Table::with_capacity(INITIAL_CAPACITY);
        }

        let id = ChainId(self.nodes.insert(Node {
            next: None,
            hcode,
            value,
        }));
        self.newer.link(&mut self.nodes, id);

        if !self.is_resizing() {
            let load_factor = self.newer.size / self.newer.capacity();
            if load_factor >= MAX_LOAD_FACTOR {
                self.start_resizing();
            }
        }
        self.help_resizing();
        id
    }

    /// Finds the entry with `hcode` for which `eq` holds.
    pub fn lookup(&mut self, hcode: u64, mut eq: impl FnMut(&T) -> bool) -> Option<ChainId> {
        self.help_resizing();
        self.newer
            .find(&self.nodes, hcode, &mut eq)
            .or_else(|| self.older.find(&self.nodes, hcode, &mut eq))
            .map(|(_, _, id)| id)
    }

    /// Removes the matching entry and hands back its payload.
    pub fn pop(&mut self, hcode: u64, mut eq: impl FnMut(&T) -> bool) -> Option<T> {
        self.help_resizing();

        let found = if let Some((pos, prev, id)) = self.newer.find(&self.nodes, hcode, &mut eq) {
            self.newer.unlink(&mut self.nodes, pos, prev, id);
            id
        } else {
            let (pos, prev, id) = self.older.find(&self.nodes, hcode, &mut eq)?;
            self.older.unlink(&mut self.nodes, pos, prev, id);
            id
        };

        Some(self.nodes.remove(found.0).value)
    }

    /// Returns the payload behind a handle, if the handle is still live.
    #[inline]
    pub fn get(&self, id: ChainId) -> Option<&T> {
        self.nodes.get(id.0).map(|n| &n.value)
    }

    #[inline]
    pub fn get_mut(&mut self, id: ChainId) -> Option<&mut T> {
        self.nodes.get_mut(id.0).map(|n| &mut n.value)
    }

    /// Hash code the entry was inserted with.
    #[inline]
    pub fn hcode(&self, id: ChainId) -> Option<u64> {
        self.nodes.get(id.0).map(|n| n.hcode)
    }

    /// Iterates every live entry, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (ChainId, &T)> + '_ {
        self.nodes.iter().map(|(key, node)| (ChainId(key), &node.value))
    }

    fn start_resizing(&mut self) {
        debug_assert!(!self.is_resizing());
        let doubled = Table::with_capacity(self.newer.capacity() * 2);
        self.older = std::mem::replace(&mut self.newer, doubled);
        self.migrate_pos = 0;
    }

    fn help_resizing(&mut self) {
        if !self.is_resizing() {
            return;
        }

        let mut work = 0;
        while work < RESIZING_WORK && self.older.size > 0 {
            let pos = self.migrate_pos;
            let Some(id) = self.older.slots[pos] else {
                self.migrate_pos = (pos + 1) & self.older.mask;
                continue;
            };

            self.older.unlink(&mut self.nodes, pos, None, id);
            self.newer.link(&mut self.nodes, id);
            work += 1;
        }

        if self.older.size == 0 {
            self.older = Table::default();
        }
    }
}

impl<T> Index<ChainId> for HashIndex<T> {
    type Output = T;

    fn index(&self, id: ChainId) -> &T {
        &self.nodes[id.0].value
    }
}

impl<T> IndexMut<ChainId> for HashIndex<T> {
    fn index_mut(&mut self, id: ChainId) -> &mut T {
        &mut self.nodes[id.0].value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(i: usize) -> String {
        format!("key:{}", i)
    }

    fn insert(index: &mut HashIndex<String>, k: String) -> ChainId {
        index.insert(hash_bytes(k.as_bytes()), k)
    }

    fn lookup(index: &mut HashIndex<String>, k: &str) -> Option<ChainId> {
        index.lookup(hash_bytes(k.as_bytes()), |v| v == k)
    }

    fn pop(index: &mut HashIndex<String>, k: &str) -> Option<String> {
        index.pop(hash_bytes(k.as_bytes()), |v| v == k)
    }

    #[test]
    fn test_lazy_allocation() {
        let mut index: HashIndex<String> = HashIndex::new();
        assert_eq!(index.capacity(), 0);
        assert!(lookup(&mut index, "missing").is_none());
        assert!(pop(&mut index, "missing").is_none());

        insert(&mut index, key(0));
        assert_eq!(index.capacity(), 4);
        assert_eq!(index.size(), 1);
    }

    #[test]
    fn test_insert_lookup_pop() {
        let mut index = HashIndex::new();

        let id = insert(&mut index, "name".to_string());
        assert_eq!(lookup(&mut index, "name"), Some(id));
        assert_eq!(index[id], "name");

        assert_eq!(pop(&mut index, "name"), Some("name".to_string()));
        assert!(lookup(&mut index, "name").is_none());
        assert!(index.get(id).is_none());
        assert!(index.is_empty());
    }

    #[test]
    fn test_forty_keys_across_first_resize() {
        let mut index = HashIndex::new();

        for i in 0..40 {
            insert(&mut index, key(i));
            for j in 0..=i {
                assert!(lookup(&mut index, &key(j)).is_some(), "lost {}", key(j));
            }
            assert_eq!(index.size(), i + 1);
        }

        // 32 entries in 4 buckets crossed the threshold; the old table
        // was small enough to drain within the same operation.
        assert!(index.capacity() >= 8);
        for _ in 0..4 {
            lookup(&mut index, "anything");
        }
        assert!(!index.is_resizing());
    }

    #[test]
    fn test_migration_spans_operations() {
        let mut index = HashIndex::new();

        for i in 0..256 {
            insert(&mut index, key(i));
        }

        // 256 entries in 32 buckets: doubles to 64, only 128 migrate now.
        assert!(index.is_resizing());
        assert_eq!(index.capacity(), 64);
        assert_eq!(index.size(), 256);

        // Entries still in the old table are reachable.
        for i in 0..256 {
            assert!(lookup(&mut index, &key(i)).is_some());
        }
        assert!(!index.is_resizing());
        assert_eq!(index.size(), 256);
    }

    #[test]
    fn test_pop_during_resize() {
        let mut index = HashIndex::new();
        for i in 0..256 {
            insert(&mut index, key(i));
        }
        assert!(index.is_resizing());

        // Pops interleave with the pending migration.
        for i in (0..256).step_by(2) {
            assert_eq!(pop(&mut index, &key(i)), Some(key(i)));
        }
        assert_eq!(index.size(), 128);
        for i in 0..256 {
            assert_eq!(lookup(&mut index, &key(i)).is_some(), i % 2 == 1);
        }
    }

    #[test]
    fn test_handles_survive_resize() {
        let mut index = HashIndex::new();
        let ids: Vec<_> = (0..600).map(|i| insert(&mut index, key(i))).collect();

        for (i, id) in ids.iter().enumerate() {
            assert_eq!(index[*id], key(i));
        }
    }

    #[test]
    fn test_colliding_hash_codes() {
        let mut index = HashIndex::new();
        index.insert(7, "a".to_string());
        index.insert(7, "b".to_string());
        index.insert(7, "c".to_string());

        assert!(index.lookup(7, |v| v == "b").is_some());
        assert_eq!(index.pop(7, |v| v == "b"), Some("b".to_string()));
        assert!(index.lookup(7, |v| v == "b").is_none());
        assert!(index.lookup(7, |v| v == "a").is_some());
        assert!(index.lookup(7, |v| v == "c").is_some());
        assert_eq!(index.size(), 2);
    }
}
