//! Retro Core - Fundamental types and primitives
//!
//! This crate defines the core types used throughout the retro board session layer:
//! - Identifiers (SessionCode, PeerId, ParticipantId, NoteId, TaskId)
//! - Time primitives (Timestamp)
//! - Session models (notes, tasks, participants, category labels)
//! - Error types

pub mod id;
pub mod time;
pub mod models;
pub mod error;

pub use id::*;
pub use time::*;
pub use models::*;
pub use error::*;
