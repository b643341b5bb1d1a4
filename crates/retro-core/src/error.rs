//! Error types for the retro session layer

use thiserror::Error;

/// Core retro board errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetroError {
    // Identity errors
    #[error("Invalid session code: {0:?}")]
    InvalidSessionCode(String),

    #[error("Session code {0} is already hosted by another moderator")]
    IdentityTaken(String),

    // Submission errors
    #[error("Not connected to a moderator")]
    NotConnected,

    #[error("Note content is empty")]
    EmptyContent,

    #[error("No category selected")]
    NoCategory,

    // Wire errors
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    // Persistence errors
    #[error("Storage error: {0}")]
    Storage(String),

    // Runtime errors
    #[error("Session endpoint has shut down")]
    Shutdown,
}

impl RetroError {
    /// Whether the error means the moderator role must not be entered
    pub fn is_identity_collision(&self) -> bool {
        matches!(self, RetroError::IdentityTaken(_))
    }
}

/// Result type for retro operations
pub type RetroResult<T> = Result<T, RetroError>;
