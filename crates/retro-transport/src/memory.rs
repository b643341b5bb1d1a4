//! In-process rendezvous network
//!
//! `MemoryNetwork` plays the role of the rendezvous service plus the direct
//! links between peers. Every `MemoryTransport` created from it owns one
//! event queue; links are reliable and ordered per direction.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use retro_core::PeerId;

use crate::{LinkId, Transport, TransportError, TransportEvent, TransportResult};

/// Delivery counters for the whole network
#[derive(Clone, Debug, Default)]
pub struct NetworkStats {
    pub links_opened: u64,
    pub links_closed: u64,
    pub payloads_delivered: u64,
    pub payloads_dropped: u64,
}

#[derive(Debug)]
struct LinkEnds {
    initiator: u64,
    acceptor: u64,
    initiator_peer: PeerId,
    acceptor_peer: PeerId,
}

impl LinkEnds {
    fn other(&self, key: u64) -> Option<(u64, &PeerId)> {
        if key == self.initiator {
            Some((self.acceptor, &self.acceptor_peer))
        } else if key == self.acceptor {
            Some((self.initiator, &self.initiator_peer))
        } else {
            None
        }
    }

    fn peer_of(&self, key: u64) -> Option<&PeerId> {
        if key == self.initiator {
            Some(&self.initiator_peer)
        } else if key == self.acceptor {
            Some(&self.acceptor_peer)
        } else {
            None
        }
    }
}

#[derive(Debug, Default)]
struct NetworkInner {
    next_key: u64,
    next_link: u64,
    /// identity -> owning transport
    bindings: HashMap<PeerId, u64>,
    queues: HashMap<u64, VecDeque<TransportEvent>>,
    links: HashMap<LinkId, LinkEnds>,
    /// Peers whose traffic vanishes without a close
    silent: HashSet<PeerId>,
    stats: NetworkStats,
}

impl NetworkInner {
    fn push(&mut self, key: u64, event: TransportEvent) {
        self.queues.entry(key).or_default().push_back(event);
    }

    fn close_link(&mut self, link: LinkId) -> bool {
        let Some(ends) = self.links.remove(&link) else {
            return false;
        };
        self.stats.links_closed += 1;
        self.push(ends.initiator, TransportEvent::Close { link });
        self.push(ends.acceptor, TransportEvent::Close { link });
        true
    }
}

/// Shared rendezvous network
#[derive(Clone, Debug, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        MemoryNetwork::default()
    }

    /// Create an unbound transport attached to this network
    pub fn transport(&self) -> MemoryTransport {
        let mut inner = self.inner.lock();
        inner.next_key += 1;
        let key = inner.next_key;
        inner.queues.insert(key, VecDeque::new());
        MemoryTransport {
            key,
            identity: None,
            network: self.clone(),
        }
    }

    /// Whether an identity is currently bound
    pub fn is_bound(&self, peer: &PeerId) -> bool {
        self.inner.lock().bindings.contains_key(peer)
    }

    /// Number of open links
    pub fn link_count(&self) -> usize {
        self.inner.lock().links.len()
    }

    /// Links touching a peer
    pub fn links_of(&self, peer: &PeerId) -> Vec<LinkId> {
        let inner = self.inner.lock();
        let mut links: Vec<LinkId> = inner
            .links
            .iter()
            .filter(|(_, ends)| &ends.initiator_peer == peer || &ends.acceptor_peer == peer)
            .map(|(id, _)| *id)
            .collect();
        links.sort();
        links
    }

    /// Break a link, delivering a close to both ends
    pub fn sever(&self, link: LinkId) -> bool {
        let closed = self.inner.lock().close_link(link);
        if closed {
            tracing::debug!(%link, "memory link severed");
        }
        closed
    }

    /// Break every link of a peer
    pub fn sever_peer(&self, peer: &PeerId) -> usize {
        let links = self.links_of(peer);
        links.into_iter().filter(|link| self.sever(*link)).count()
    }

    /// Silently drop all traffic to and from a peer without closing its
    /// links, as an abrupt network loss would
    pub fn set_silent(&self, peer: &PeerId, silent: bool) {
        let mut inner = self.inner.lock();
        if silent {
            inner.silent.insert(peer.clone());
        } else {
            inner.silent.remove(peer);
        }
    }

    pub fn stats(&self) -> NetworkStats {
        self.inner.lock().stats.clone()
    }
}

/// One endpoint's view of the network
#[derive(Debug)]
pub struct MemoryTransport {
    key: u64,
    identity: Option<PeerId>,
    network: MemoryNetwork,
}

impl MemoryTransport {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    /// Number of events waiting to be polled
    pub fn pending_events(&self) -> usize {
        self.network
            .inner
            .lock()
            .queues
            .get(&self.key)
            .map_or(0, VecDeque::len)
    }
}

impl Transport for MemoryTransport {
    fn bind(&mut self, identity: Option<PeerId>) -> TransportResult<PeerId> {
        if self.identity.is_some() {
            self.destroy();
        }

        let mut inner = self.network.inner.lock();
        let peer = match identity {
            Some(peer) => {
                if inner.bindings.contains_key(&peer) {
                    return Err(TransportError::IdentityTaken(peer));
                }
                peer
            }
            None => loop {
                let candidate = PeerId::ephemeral();
                if !inner.bindings.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        inner.bindings.insert(peer.clone(), self.key);
        drop(inner);

        tracing::trace!(peer = %peer, "memory identity bound");
        self.identity = Some(peer.clone());
        Ok(peer)
    }

    fn identity(&self) -> Option<&PeerId> {
        self.identity.as_ref()
    }

    fn connect(&mut self, remote: &PeerId) -> TransportResult<LinkId> {
        let local = self.identity.clone().ok_or(TransportError::NotBound)?;

        let mut inner = self.network.inner.lock();
        inner.next_link += 1;
        let link = LinkId(inner.next_link);

        let Some(&acceptor) = inner.bindings.get(remote) else {
            inner.push(
                self.key,
                TransportEvent::Error {
                    link: Some(link),
                    error: TransportError::PeerUnavailable(remote.clone()),
                },
            );
            return Ok(link);
        };

        inner.links.insert(
            link,
            LinkEnds {
                initiator: self.key,
                acceptor,
                initiator_peer: local.clone(),
                acceptor_peer: remote.clone(),
            },
        );
        inner.stats.links_opened += 1;
        inner.push(
            acceptor,
            TransportEvent::Incoming {
                link,
                remote: local,
            },
        );
        inner.push(acceptor, TransportEvent::Open { link });
        inner.push(self.key, TransportEvent::Open { link });
        Ok(link)
    }

    fn send(&mut self, link: LinkId, payload: Bytes) -> TransportResult<()> {
        let mut inner = self.network.inner.lock();
        let Some(ends) = inner.links.get(&link) else {
            return Err(TransportError::LinkClosed(link));
        };
        let Some((target, target_peer)) = ends.other(self.key) else {
            return Err(TransportError::LinkClosed(link));
        };
        let sender_silent = ends
            .peer_of(self.key)
            .map_or(false, |peer| inner.silent.contains(peer));
        let dropped = sender_silent || inner.silent.contains(target_peer);

        if dropped {
            inner.stats.payloads_dropped += 1;
            return Ok(());
        }
        inner.stats.payloads_delivered += 1;
        inner.push(target, TransportEvent::Data { link, payload });
        Ok(())
    }

    fn close(&mut self, link: LinkId) {
        let mut inner = self.network.inner.lock();
        let owned = inner
            .links
            .get(&link)
            .map_or(false, |ends| ends.other(self.key).is_some());
        if owned {
            inner.close_link(link);
        }
    }

    fn destroy(&mut self) {
        let Some(peer) = self.identity.take() else {
            return;
        };

        let mut inner = self.network.inner.lock();
        let owned: Vec<LinkId> = inner
            .links
            .iter()
            .filter(|(_, ends)| ends.other(self.key).is_some())
            .map(|(id, _)| *id)
            .collect();

        for link in owned {
            if let Some(ends) = inner.links.remove(&link) {
                inner.stats.links_closed += 1;
                if let Some((other, _)) = ends.other(self.key) {
                    inner.push(other, TransportEvent::Close { link });
                }
            }
        }

        inner.bindings.remove(&peer);
        if let Some(queue) = inner.queues.get_mut(&self.key) {
            queue.clear();
        }
        tracing::trace!(peer = %peer, "memory identity released");
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.network
            .inner
            .lock()
            .queues
            .get_mut(&self.key)
            .and_then(VecDeque::pop_front)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.destroy();
        self.network.inner.lock().queues.remove(&self.key);
    }
}
