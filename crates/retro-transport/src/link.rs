//! Transport capability and link events

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

use retro_core::{PeerId, RetroError};

/// Handle for one point-to-point link
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Debug for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Link({})", self.0)
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport-level failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Identity {0} is already bound on the rendezvous service")]
    IdentityTaken(PeerId),

    #[error("Peer {0} is not reachable")]
    PeerUnavailable(PeerId),

    #[error("Link {0} is closed")]
    LinkClosed(LinkId),

    #[error("No identity bound")]
    NotBound,

    #[error("Rendezvous service unavailable: {0}")]
    Rendezvous(String),

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

impl From<TransportError> for RetroError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::IdentityTaken(peer) => RetroError::IdentityTaken(peer.to_string()),
            other => RetroError::Transport(other.to_string()),
        }
    }
}

/// Link lifecycle events, delivered in order per transport
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// A remote peer opened a link to our identity
    Incoming { link: LinkId, remote: PeerId },
    /// The link is ready to carry data
    Open { link: LinkId },
    /// A payload arrived on the link
    Data { link: LinkId, payload: Bytes },
    /// The link is gone
    Close { link: LinkId },
    /// A link (or the identity, when `link` is `None`) failed
    Error {
        link: Option<LinkId>,
        error: TransportError,
    },
}

impl TransportEvent {
    pub fn link(&self) -> Option<LinkId> {
        match self {
            TransportEvent::Incoming { link, .. }
            | TransportEvent::Open { link }
            | TransportEvent::Data { link, .. }
            | TransportEvent::Close { link } => Some(*link),
            TransportEvent::Error { link, .. } => *link,
        }
    }
}

/// The peer-to-peer capability consumed by session endpoints.
///
/// Links are ordered and reliable. All calls are non-blocking; results of
/// `connect` arrive later as events.
pub trait Transport {
    /// Bind a network identity, replacing any previous one.
    /// `None` requests a fresh ephemeral identity.
    fn bind(&mut self, identity: Option<PeerId>) -> TransportResult<PeerId>;

    /// Currently bound identity
    fn identity(&self) -> Option<&PeerId>;

    /// Open a link to a remote identity
    fn connect(&mut self, remote: &PeerId) -> TransportResult<LinkId>;

    /// Send a payload on an open link
    fn send(&mut self, link: LinkId, payload: Bytes) -> TransportResult<()>;

    /// Close one link
    fn close(&mut self, link: LinkId);

    /// Close every link and release the identity
    fn destroy(&mut self);

    /// Next pending event, if any
    fn poll_event(&mut self) -> Option<TransportEvent>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn bind(&mut self, identity: Option<PeerId>) -> TransportResult<PeerId> {
        (**self).bind(identity)
    }

    fn identity(&self) -> Option<&PeerId> {
        (**self).identity()
    }

    fn connect(&mut self, remote: &PeerId) -> TransportResult<LinkId> {
        (**self).connect(remote)
    }

    fn send(&mut self, link: LinkId, payload: Bytes) -> TransportResult<()> {
        (**self).send(link, payload)
    }

    fn close(&mut self, link: LinkId) {
        (**self).close(link)
    }

    fn destroy(&mut self) {
        (**self).destroy()
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        (**self).poll_event()
    }
}
