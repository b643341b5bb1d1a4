//! Identity types for the retro session layer
//!
//! A session is addressed by a short human-shared code. The moderator's
//! network identity is derived from that code; contributors use random
//! ephemeral identities.

use std::fmt;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{RetroError, RetroResult};

/// Maximum length of a session code
pub const MAX_SESSION_CODE_LEN: usize = 10;

/// Length of generated ephemeral identities
const EPHEMERAL_ID_LEN: usize = 9;

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

/// Session code - the join code shared between moderator and contributors.
///
/// Case-insensitive on input, always stored uppercase.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionCode(String);

impl SessionCode {
    /// Parse and normalize a user-entered code.
    ///
    /// Surrounding whitespace is ignored. The remaining text must be
    /// 1..=10 ASCII alphanumeric characters.
    pub fn parse(input: &str) -> RetroResult<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty()
            || trimmed.chars().count() > MAX_SESSION_CODE_LEN
            || !trimmed.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(RetroError::InvalidSessionCode(input.to_string()));
        }
        Ok(SessionCode(trimmed.to_ascii_uppercase()))
    }

    /// Generate a random four digit code (1000..=9999)
    pub fn generate() -> Self {
        let n: u16 = rand::thread_rng().gen_range(1000..=9999);
        SessionCode(n.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SessionCode {
    type Error = RetroError;

    fn try_from(value: String) -> RetroResult<Self> {
        SessionCode::parse(&value)
    }
}

impl From<SessionCode> for String {
    fn from(code: SessionCode) -> Self {
        code.0
    }
}

impl fmt::Debug for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Code({})", self.0)
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Network identity on the rendezvous service
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    /// Stable moderator identity: prefix + uppercased session code
    pub fn moderator(prefix: &str, code: &SessionCode) -> Self {
        PeerId(format!("{}{}", prefix, code.as_str()))
    }

    /// Fresh random identity for a contributor connection
    pub fn ephemeral() -> Self {
        PeerId(random_token(EPHEMERAL_ID_LEN))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Peer({})", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Participant identity as announced in presence messages
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        ParticipantId(id.into())
    }

    pub fn generate() -> Self {
        ParticipantId(random_token(EPHEMERAL_ID_LEN))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&PeerId> for ParticipantId {
    fn from(peer: &PeerId) -> Self {
        ParticipantId(peer.as_str().to_string())
    }
}

impl fmt::Debug for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Participant({})", self.0)
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Note identity - assigned by the moderator on receipt
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NoteId(pub u64);

impl NoteId {
    #[inline]
    pub fn new(id: u64) -> Self {
        NoteId(id)
    }
}

impl fmt::Debug for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Note({})", self.0)
    }
}

impl fmt::Display for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task identity - assigned by the moderator
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl TaskId {
    #[inline]
    pub fn new(id: u64) -> Self {
        TaskId(id)
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
