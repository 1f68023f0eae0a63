//! Keyspace
//!
//! Ties the primary [`HashIndex`], the [`ExpiryHeap`] and the disposal pool
//! together. Every path that removes an entry goes through here so that an
//! entry is never left behind in one structure after leaving another:
//!
//! ```text
//!          ┌──────────────────────────┐
//!          │ HashIndex<Entry>         │  owns the entry
//!          └──────┬───────────────────┘
//!                 │ ChainId (stable handle)
//!          ┌──────▼───────────────────┐
//!          │ ExpiryHeap<ChainId>      │  heap_pos back-reference on Entry
//!          └──────────────────────────┘
//! ```
//!
//! Time is passed in explicitly as milliseconds on a monotonic clock, which
//! keeps expiration deterministic under test.

use crate::pool::DisposalPool;
use crate::storage::hash::{hash_bytes, ChainId, HashIndex};
use crate::storage::heap::ExpiryHeap;
use crate::storage::zset::ZSet;
use bytes::Bytes;
use tracing::{debug, trace};

/// Sorted collections above this size are torn down on the disposal pool.
pub const LARGE_CONTAINER_SIZE: usize = 10_000;

/// Handle to a live entry.
pub type EntryId = ChainId;

/// A stored value.
#[derive(Debug)]
pub enum Value {
    Str(Bytes),
    Int(i64),
    Dbl(f64),
    ZSet(Box<ZSet>),
}

impl Value {
    /// Name of the value's type, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Int(_) => "integer",
            Value::Dbl(_) => "double",
            Value::ZSet(_) => "zset",
        }
    }
}

/// A key and its value.
#[derive(Debug)]
pub struct Entry {
    pub key: Bytes,
    pub value: Value,
    /// Position of this entry's item in the expiry heap, if it has a TTL.
    heap_pos: Option<usize>,
}

impl Entry {
    pub fn new(key: Bytes, value: Value) -> Self {
        Self {
            key,
            value,
            heap_pos: None,
        }
    }

    #[inline]
    pub fn has_ttl(&self) -> bool {
        self.heap_pos.is_some()
    }
}

/// Callback keeping `Entry::heap_pos` in sync with heap relocations.
fn track(db: &mut HashIndex<Entry>) -> impl FnMut(EntryId, usize) + '_ {
    move |id, pos| {
        if let Some(entry) = db.get_mut(id) {
            entry.heap_pos = Some(pos);
        }
    }
}

/// All key-value state of the server.
#[derive(Debug)]
pub struct Keyspace {
    db: HashIndex<Entry>,
    ttl: ExpiryHeap<EntryId>,
    disposal: DisposalPool,
    expired_total: u64,
}

impl Keyspace {
    /// Wraps an existing (normally empty) index.
    pub fn new(db: HashIndex<Entry>, disposal: DisposalPool) -> Self {
        Self {
            db,
            ttl: ExpiryHeap::new(),
            disposal,
            expired_total: 0,
        }
    }

    /// Number of keys.
    #[inline]
    pub fn len(&self) -> usize {
        self.db.size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    /// Number of keys carrying a TTL.
    #[inline]
    pub fn ttl_len(&self) -> usize {
        self.ttl.len()
    }

    /// Keys removed by expiration so far.
    #[inline]
    pub fn expired_total(&self) -> u64 {
        self.expired_total
    }

    pub fn lookup(&mut self, key: &[u8]) -> Option<EntryId> {
        self.db.lookup(hash_bytes(key), |e| e.key == key)
    }

    #[inline]
    pub fn entry(&self, id: EntryId) -> Option<&Entry> {
        self.db.get(id)
    }

    #[inline]
    pub fn entry_mut(&mut self, id: EntryId) -> Option<&mut Entry> {
        self.db.get_mut(id)
    }

    /// Stores a new key. The caller has checked that it is absent.
    pub fn insert(&mut self, key: Bytes, value: Value) -> EntryId {
        let hcode = hash_bytes(&key);
        self.db.insert(hcode, Entry::new(key, value))
    }

    /// Deletes `key`, returning true if it existed.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        match self.lookup(key) {
            Some(id) => {
                self.remove(id);
                true
            }
            None => false,
        }
    }

    /// Removes an entry from every structure it is linked into.
    pub fn remove(&mut self, id: EntryId) {
        let Some((key, heap_pos)) = self.db.get(id).map(|e| (e.key.clone(), e.heap_pos)) else {
            return;
        };

        if let Some(pos) = heap_pos {
            self.ttl.remove(pos, track(&mut self.db));
        }
        let Some(hcode) = self.db.hcode(id) else {
            return;
        };
        if let Some(entry) = self.db.pop(hcode, |e| e.key == key) {
            self.dispose(entry);
        }
    }

    /// Sets a TTL of `ttl_ms` from `now`; a negative TTL clears it.
    pub fn set_ttl(&mut self, id: EntryId, ttl_ms: i64, now: u64) {
        let Some(heap_pos) = self.db.get(id).map(|e| e.heap_pos) else {
            return;
        };

        if ttl_ms < 0 {
            if let Some(pos) = heap_pos {
                self.ttl.remove(pos, track(&mut self.db));
                self.db[id].heap_pos = None;
            }
            return;
        }

        let expires_at = now.saturating_add(ttl_ms as u64);
        match heap_pos {
            Some(pos) => self.ttl.set(pos, expires_at, track(&mut self.db)),
            None => {
                self.ttl.push(expires_at, id, track(&mut self.db));
            }
        }
    }

    /// Clears the TTL of `id`. Returns true if there was one.
    pub fn persist(&mut self, id: EntryId) -> bool {
        let had_ttl = self.db.get(id).is_some_and(Entry::has_ttl);
        if had_ttl {
            self.set_ttl(id, -1, 0);
        }
        had_ttl
    }

    /// Remaining time to live in milliseconds.
    pub fn ttl_remaining(&self, id: EntryId, now: u64) -> Option<u64> {
        let pos = self.db.get(id)?.heap_pos?;
        let item = self.ttl.get(pos)?;
        Some(item.expires_at.saturating_sub(now))
    }

    /// Earliest scheduled expiration.
    pub fn next_expiry(&self) -> Option<u64> {
        self.ttl.peek().map(|item| item.expires_at)
    }

    /// Removes up to `limit` entries whose TTL is due at `now`.
    pub fn expire_due(&mut self, now: u64, limit: usize) -> usize {
        let mut expired = 0;
        while expired < limit {
            let Some(item) = self.ttl.peek().copied() else {
                break;
            };
            if item.expires_at > now {
                break;
            }
            match self.db.get(item.owner) {
                Some(entry) => {
                    trace!(key = ?entry.key, "Expiring key");
                    self.remove(item.owner);
                }
                // Orphaned item; drop it so the scan cannot stall.
                None => {
                    self.ttl.pop(track(&mut self.db));
                }
            }
            expired += 1;
        }

        self.expired_total += expired as u64;
        expired
    }

    /// Every key, in no particular order.
    pub fn keys(&self) -> Vec<Bytes> {
        self.db.iter().map(|(_, e)| e.key.clone()).collect()
    }

    fn dispose(&self, entry: Entry) {
        match entry.value {
            Value::ZSet(zset) if zset.len() > LARGE_CONTAINER_SIZE => {
                debug!(members = zset.len(), "Handing large zset to disposal pool");
                self.disposal.submit(move || drop(zset));
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyspace() -> Keyspace {
        Keyspace::new(HashIndex::new(), DisposalPool::new(1).unwrap())
    }

    fn str_value(s: &str) -> Value {
        Value::Str(Bytes::from(s.to_string()))
    }

    #[test]
    fn test_insert_lookup_delete() {
        let mut ks = keyspace();
        let id = ks.insert(Bytes::from("name"), str_value("tide"));
        assert_eq!(ks.lookup(b"name"), Some(id));
        assert_eq!(ks.len(), 1);

        assert!(ks.delete(b"name"));
        assert!(!ks.delete(b"name"));
        assert!(ks.lookup(b"name").is_none());
        assert!(ks.is_empty());
    }

    #[test]
    fn test_ttl_expires_on_virtual_clock() {
        let mut ks = keyspace();
        let now = 1_000;
        let id = ks.insert(Bytes::from("a"), str_value("1"));
        ks.set_ttl(id, 100, now);
        assert_eq!(ks.ttl_len(), 1);
        assert_eq!(ks.next_expiry(), Some(1_100));

        assert_eq!(ks.expire_due(now + 50, 100), 0);
        assert!(ks.lookup(b"a").is_some());

        assert_eq!(ks.expire_due(now + 150, 100), 1);
        assert!(ks.lookup(b"a").is_none());
        assert_eq!(ks.ttl_len(), 0);
        assert_eq!(ks.expired_total(), 1);
    }

    #[test]
    fn test_ttl_update_and_clear() {
        let mut ks = keyspace();
        let id = ks.insert(Bytes::from("k"), str_value("v"));

        ks.set_ttl(id, 500, 0);
        assert_eq!(ks.ttl_remaining(id, 100), Some(400));

        ks.set_ttl(id, 50, 0);
        assert_eq!(ks.ttl_remaining(id, 0), Some(50));
        assert_eq!(ks.ttl_len(), 1);

        assert!(ks.persist(id));
        assert!(!ks.persist(id));
        assert_eq!(ks.ttl_remaining(id, 0), None);
        assert_eq!(ks.ttl_len(), 0);
        assert_eq!(ks.expire_due(u64::MAX, 10), 0);
    }

    #[test]
    fn test_delete_unlinks_heap_item() {
        let mut ks = keyspace();
        for i in 0..50u64 {
            let id = ks.insert(Bytes::from(format!("k{}", i)), Value::Int(i as i64));
            ks.set_ttl(id, (i * 13 % 50) as i64, 0);
        }
        for i in (0..50).step_by(2) {
            assert!(ks.delete(format!("k{}", i).as_bytes()));
        }
        assert_eq!(ks.ttl_len(), 25);

        // Every surviving heap item still resolves to its owner.
        assert_eq!(ks.expire_due(u64::MAX, usize::MAX), 25);
        assert!(ks.is_empty());
        assert_eq!(ks.ttl_len(), 0);
    }

    #[test]
    fn test_expire_due_respects_limit() {
        let mut ks = keyspace();
        for i in 0..10 {
            let id = ks.insert(Bytes::from(format!("k{}", i)), Value::Int(i));
            ks.set_ttl(id, 1, 0);
        }
        assert_eq!(ks.expire_due(10, 4), 4);
        assert_eq!(ks.len(), 6);
        assert_eq!(ks.next_expiry(), Some(1));
        assert_eq!(ks.expire_due(10, 100), 6);
    }

    fn zset_of(n: usize) -> Value {
        let mut zset = ZSet::new();
        for i in 0..n {
            zset.insert(Bytes::from(format!("m{}", i)), i as f64);
        }
        Value::ZSet(Box::new(zset))
    }

    #[test]
    fn test_large_zset_disposed_off_thread() {
        use std::sync::mpsc;
        use std::time::Duration;

        let mut ks = keyspace();
        let id = ks.insert(Bytes::from("big"), zset_of(LARGE_CONTAINER_SIZE + 1));
        ks.set_ttl(id, 10, 0);
        ks.insert(Bytes::from("small"), zset_of(10));

        // Park the only worker so queued work stays visible.
        let (started_tx, started_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        ks.disposal.submit(move || {
            let _ = started_tx.send(());
            let _ = gate_rx.recv();
        });
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert!(ks.delete(b"big"));
        assert!(ks.lookup(b"big").is_none());
        assert_eq!(ks.ttl_len(), 0);
        assert_eq!(ks.disposal.pending(), 1);

        // Small collections are dropped inline.
        assert!(ks.delete(b"small"));
        assert_eq!(ks.disposal.pending(), 1);

        // The worker runs tasks in order, so the marker runs after the zset drop.
        let (done_tx, done_rx) = mpsc::channel();
        ks.disposal.submit(move || {
            let name = std::thread::current().name().unwrap_or("").to_string();
            let _ = done_tx.send(name);
        });
        gate_tx.send(()).unwrap();

        let ran_on = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(ran_on.starts_with("disposal-"));
        assert_eq!(ks.disposal.pending(), 0);
    }

    #[test]
    fn test_keys_lists_everything() {
        let mut ks = keyspace();
        for k in ["a", "b", "c"] {
            ks.insert(Bytes::from(k), str_value(k));
        }
        let mut keys = ks.keys();
        keys.sort();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }
}
