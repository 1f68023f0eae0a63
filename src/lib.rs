//! # TideKV - An Event-Loop Driven In-Memory Key-Value Server
//!
//! TideKV serves scalars and sorted sets over a compact length-prefixed
//! binary protocol. One thread owns all data and every client socket; a
//! small worker pool exists only to tear down large values off that thread.
//!
//! ## Features
//!
//! - **Single-threaded core**: no locks on any index
//! - **Progressive rehashing**: hash table growth is spread across operations
//! - **Order statistics**: AVL-backed sorted sets with O(log n) rank and offset
//! - **Heap-driven TTLs**: expiration cost scales with keys due, not keys held
//! - **Idle eviction**: oldest-first via an O(1) linked list
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              TideKV                                     │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │ mio Poll    │───>│ Connection  │───>│  Command    │                  │
//! │  │ + Listener  │    │ (state      │    │  Handler    │                  │
//! │  └─────────────┘    │  machine)   │    └──────┬──────┘                  │
//! │                     └─────────────┘           │                         │
//! │                                               ▼                         │
//! │  ┌─────────────┐    ┌──────────────────────────────────────────────┐   │
//! │  │  IdleList   │    │                 Keyspace                     │   │
//! │  │ (eviction)  │    │  HashIndex ◄── ExpiryHeap     ZSet (AVL+Hash)│   │
//! │  └─────────────┘    └──────────────────────┬───────────────────────┘   │
//! │                                            │ large values               │
//! │                     ┌──────────────────────▼──────────────────────────┐ │
//! │                     │           DisposalPool (worker threads)         │ │
//! │                     └─────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use tidekv::connection::{ConnectionEngine, EngineConfig};
//! use tidekv::pool::DisposalPool;
//! use tidekv::storage::HashIndex;
//!
//! fn main() -> anyhow::Result<()> {
//!     let listener = std::net::TcpListener::bind(("127.0.0.1", tidekv::DEFAULT_PORT))?;
//!     let pool = DisposalPool::new(4)?;
//!
//!     let engine = ConnectionEngine::new(listener, HashIndex::new(), pool, EngineConfig::default())?;
//!     engine.run()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: framing and tagged response values
//! - [`storage`]: hash index, AVL tree, expiry heap, sorted sets, keyspace
//! - [`commands`]: command dispatch
//! - [`connection`]: event loop, connection state machine, idle list
//! - [`pool`]: background disposal workers

pub mod commands;
pub mod connection;
pub mod pool;
pub mod protocol;
pub mod storage;

// Re-export commonly used types for convenience
pub use commands::CommandHandler;
pub use connection::{ConnectionEngine, EngineConfig, EngineError, ShutdownHandle};
pub use pool::DisposalPool;
pub use protocol::{FrameError, WireValue};
pub use storage::{HashIndex, Keyspace};

/// The default port TideKV listens on
pub const DEFAULT_PORT: u16 = 1234;

/// The default host TideKV binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of TideKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
