//! Retro Transport Layer - identity-addressed peer links
//!
//! This crate provides:
//! - The `Transport` capability the session endpoints are written against
//! - Link lifecycle events (incoming, open, data, close, error)
//! - A TCP transport resolving identities through a rendezvous server
//! - An in-process rendezvous network for tests and demos

pub mod link;
pub mod memory;
pub mod rendezvous;
pub mod tcp;

pub use link::*;
pub use memory::{MemoryNetwork, MemoryTransport, NetworkStats};
pub use rendezvous::{RendezvousHandle, RendezvousServer};
pub use tcp::{TcpTransport, MAX_LINK_FRAME};
