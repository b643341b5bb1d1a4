//! Retro Runtime - Session endpoints and event loop
//!
//! Endpoints are sans-IO state machines over a [`Transport`]:
//! 1. Drain transport events (link open/data/close/error)
//! 2. Decode and dispatch messages
//! 3. Fire due timers (heartbeat, reconnect)
//! 4. Sweep stale participants (moderator)
//!
//! Every step takes an explicit `now`, so the same endpoints run under the
//! tokio [`Driver`] and under a simulated clock.
//!
//! [`Transport`]: retro_transport::Transport

pub mod config;
pub mod contributor;
pub mod driver;
pub mod logging;
pub mod moderator;
pub mod timer;

pub use config::*;
pub use contributor::*;
pub use driver::*;
pub use logging::*;
pub use moderator::*;
pub use timer::*;
