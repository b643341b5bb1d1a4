//! Retro Store - Local persistence
//!
//! Persistence is best-effort write-through: failed reads and parses are
//! treated as empty state and failed writes are logged, never fatal.

pub mod kv;
pub mod snapshot;

pub use kv::*;
pub use snapshot::*;
