//! Retro Wire - Session message protocol
//!
//! Four message kinds travel over a link:
//! - `sync-labels` and `heartbeat`: moderator to contributor
//! - `submit-note` and `presence`: contributor to moderator
//!
//! Payloads are JSON objects tagged by a `type` field.

pub mod message;

pub use message::*;

/// Maximum encoded message size accepted from a peer
pub const MAX_FRAME_SIZE: usize = 64 * 1024;
