//! Storage Module
//!
//! The in-memory data structures behind the server. Everything here is
//! mutated from the event-loop thread only, so nothing is locked.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Keyspace                             │
//! │  ┌──────────────────┐   ┌──────────────────┐                │
//! │  │ HashIndex<Entry> │◄──│ ExpiryHeap       │  TTL ordering  │
//! │  │ (primary index)  │   │ (min-heap)       │                │
//! │  └────────┬─────────┘   └──────────────────┘                │
//! │           │ Value::ZSet                                     │
//! │  ┌────────▼─────────┐                                       │
//! │  │ ZSet             │  AvlTree (order) + HashIndex (names)  │
//! │  └──────────────────┘                                       │
//! └─────────────────────────────────────────────────────────────┘
//!                            │ large values
//!                            ▼
//!                     DisposalPool (worker threads)
//! ```
//!
//! ## Example
//!
//! ```
//! use tidekv::pool::DisposalPool;
//! use tidekv::storage::{HashIndex, Keyspace, Value};
//! use bytes::Bytes;
//!
//! let mut ks = Keyspace::new(HashIndex::new(), DisposalPool::new(1).unwrap());
//!
//! let id = ks.insert(Bytes::from("session"), Value::Str(Bytes::from("abc123")));
//! ks.set_ttl(id, 100, 0);
//!
//! assert_eq!(ks.expire_due(50, 100), 0);
//! assert_eq!(ks.expire_due(150, 100), 1);
//! assert!(ks.lookup(b"session").is_none());
//! ```

pub mod avl;
pub mod hash;
pub mod heap;
pub mod keyspace;
pub mod zset;

// Re-export commonly used types
pub use avl::AvlTree;
pub use hash::{hash_bytes, ChainId, HashIndex};
pub use heap::{ExpiryHeap, HeapItem};
pub use keyspace::{Entry, EntryId, Keyspace, Value, LARGE_CONTAINER_SIZE};
pub use zset::{ZMember, ZSet};
