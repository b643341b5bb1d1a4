//! Retro Board - Moderator session state and display aggregation
//!
//! This crate holds everything the moderator owns:
//! - `SessionState`: notes, tasks, labels, language and reveal flag
//! - `Roster`: participants with readiness and last-seen times
//! - `IdeaAggregator`: groups notes by normalized content for display

pub mod aggregate;
pub mod roster;
pub mod state;

pub use aggregate::*;
pub use roster::*;
pub use state::*;
