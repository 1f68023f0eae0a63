//! Command Module
//!
//! Turns parsed requests into responses.
//!
//! ## Architecture
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────────┐
//! │ parse_request   │  (protocol module)
//! └────────┬────────┘
//!          │ Vec<Bytes>
//!          ▼
//! ┌─────────────────┐
//! │ CommandHandler  │  (this module)
//! │                 │
//! │  - Dispatch     │
//! │  - Validate     │
//! │  - Execute      │
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ Keyspace        │  (storage module)
//! └─────────────────┘
//! ```
//!
//! ## Supported Commands
//!
//! - Scalars: `get`, `set`, `del`, `keys`, `incrby`, `incrbyfloat`
//! - Expiration: `pexpire`, `pttl`, `persist`
//! - Sorted sets: `zadd`, `zrem`, `zscore`, `zrank`, `zquery`
//! - Server: `ping`, `dbsize`

pub mod handler;

pub use handler::CommandHandler;
