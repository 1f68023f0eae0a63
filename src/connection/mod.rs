//! Connection Module
//!
//! Owns every client socket and drives them from a single thread.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   ConnectionEngine                          │
//! │                                                             │
//! │  mio::Poll ──► ready tokens ──► Connection::drive()         │
//! │     ▲                                │                      │
//! │     │                                ▼                      │
//! │  listener        parse_request ─► CommandHandler ─► wbuf    │
//! │  (1 accept                                                  │
//! │   per turn)       Keyspace::expire_due()                    │
//! │                   IdleList head ─► evict                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Non-blocking I/O**: edge-triggered readiness via `mio`
//! - **Pipelining**: buffered requests are answered one after another
//! - **Idle eviction**: O(1) oldest-first through the [`IdleList`]
//! - **Statistics**: connection, command and byte counters

pub mod engine;
pub mod idle;

// Re-export commonly used types
pub use engine::{
    ConnState, Connection, ConnectionEngine, ConnectionError, EngineConfig, EngineError,
    EngineStats, ShutdownHandle,
};
pub use idle::IdleList;
