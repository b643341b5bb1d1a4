//! TCP transport
//!
//! Every bound identity owns a listener whose address is registered with a
//! [`RendezvousServer`](crate::RendezvousServer). Links are plain TCP
//! connections carrying length-prefixed frames; the first frame from the
//! dialing side is its identity.
//!
//! Only `bind` waits on the network: the rendezvous must confirm the
//! registration so a collision surfaces as `IdentityTaken`. When the
//! rendezvous server runs inside the same process, use a multi-threaded
//! runtime.

use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::net::{SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use retro_core::PeerId;

use crate::rendezvous::{read_bounded_line, RendezvousReply, RendezvousRequest};
use crate::{LinkId, Transport, TransportError, TransportEvent, TransportResult};

/// Largest payload carried on a link
pub const MAX_LINK_FRAME: usize = 1024 * 1024;

/// Bound on rendezvous round trips and peer dials
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Time a dialing peer has to announce itself
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

const EPHEMERAL_ATTEMPTS: usize = 4;

struct LinkEntry {
    outbound: mpsc::UnboundedSender<Bytes>,
    /// Dropping the entry ends the link task
    _cancel: oneshot::Sender<()>,
}

#[derive(Default)]
struct LinkTable {
    closed: bool,
    entries: HashMap<LinkId, LinkEntry>,
}

/// State shared between a binding and its background tasks
struct Shared {
    identity: PeerId,
    rendezvous: SocketAddr,
    events: mpsc::UnboundedSender<TransportEvent>,
    links: Mutex<LinkTable>,
    next_link: Arc<AtomicU64>,
}

type LinkChannels = (mpsc::UnboundedReceiver<Bytes>, oneshot::Receiver<()>);

impl Shared {
    fn push(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn allocate(&self) -> LinkId {
        LinkId(self.next_link.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Register a link, `None` once the binding is gone
    fn open_link(&self, link: LinkId) -> Option<LinkChannels> {
        let mut links = self.links.lock();
        if links.closed {
            return None;
        }
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (cancel, cancel_rx) = oneshot::channel();
        links.entries.insert(
            link,
            LinkEntry {
                outbound,
                _cancel: cancel,
            },
        );
        Some((outbound_rx, cancel_rx))
    }

    fn push_if_live(&self, link: LinkId, event: TransportEvent) {
        let links = self.links.lock();
        if links.entries.contains_key(&link) {
            self.push(event);
        }
    }

    fn remove(&self, link: LinkId) -> bool {
        self.links.lock().entries.remove(&link).is_some()
    }

    /// The link ended on its own
    fn finish(&self, link: LinkId) {
        if self.remove(link) {
            tracing::debug!(%link, "tcp link closed");
            self.push(TransportEvent::Close { link });
        }
    }

    fn shut(&self) {
        let mut links = self.links.lock();
        links.closed = true;
        links.entries.clear();
    }
}

struct Binding {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.shared.shut();
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Transport over TCP with identities resolved through a rendezvous server
pub struct TcpTransport {
    runtime: Handle,
    rendezvous: SocketAddr,
    listen_addr: SocketAddr,
    next_link: Arc<AtomicU64>,
    binding: Option<Binding>,
}

impl TcpTransport {
    /// Transport driven by the current tokio runtime
    pub fn new(rendezvous: SocketAddr) -> TransportResult<Self> {
        let runtime = Handle::try_current().map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(Self::with_runtime(rendezvous, runtime))
    }

    pub fn with_runtime(rendezvous: SocketAddr, runtime: Handle) -> Self {
        TcpTransport {
            runtime,
            rendezvous,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            next_link: Arc::new(AtomicU64::new(0)),
            binding: None,
        }
    }

    /// Listen for links on `addr`. The bound address is advertised as is,
    /// so it must be reachable by peers.
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn rendezvous(&self) -> SocketAddr {
        self.rendezvous
    }

    /// Address of the link listener while bound
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.binding.as_ref().map(|b| b.local_addr)
    }

    /// Links registered on the current binding, open or dialing
    pub fn link_count(&self) -> usize {
        self.binding
            .as_ref()
            .map_or(0, |b| b.shared.links.lock().entries.len())
    }

    fn register_ephemeral(&self, addr: SocketAddr) -> TransportResult<(PeerId, StdTcpStream)> {
        for _ in 0..EPHEMERAL_ATTEMPTS {
            let id = PeerId::ephemeral();
            match blocking(|| register(self.rendezvous, &id, addr)) {
                Ok(control) => return Ok((id, control)),
                Err(TransportError::IdentityTaken(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(TransportError::Rendezvous(
            "no free ephemeral identity".to_string(),
        ))
    }
}

impl Transport for TcpTransport {
    fn bind(&mut self, identity: Option<PeerId>) -> TransportResult<PeerId> {
        self.destroy();

        let listener = StdTcpListener::bind(self.listen_addr)?;
        let local_addr = listener.local_addr()?;
        let (identity, control) = match identity {
            Some(id) => {
                let control = blocking(|| register(self.rendezvous, &id, local_addr))?;
                (id, control)
            }
            None => self.register_ephemeral(local_addr)?,
        };

        listener.set_nonblocking(true)?;
        control.set_nonblocking(true)?;
        let _guard = self.runtime.enter();
        let listener = TcpListener::from_std(listener)?;
        let control = TcpStream::from_std(control)?;

        let (events_tx, events) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            identity: identity.clone(),
            rendezvous: self.rendezvous,
            events: events_tx,
            links: Mutex::new(LinkTable::default()),
            next_link: Arc::clone(&self.next_link),
        });
        let tasks = vec![
            self.runtime.spawn(accept_links(Arc::clone(&shared), listener)),
            self.runtime.spawn(hold_registration(Arc::clone(&shared), control)),
        ];

        tracing::debug!(peer = %identity, addr = %local_addr, "tcp identity bound");
        self.binding = Some(Binding {
            shared,
            local_addr,
            events,
            tasks,
        });
        Ok(identity)
    }

    fn identity(&self) -> Option<&PeerId> {
        self.binding.as_ref().map(|b| &b.shared.identity)
    }

    fn connect(&mut self, remote: &PeerId) -> TransportResult<LinkId> {
        let binding = self.binding.as_ref().ok_or(TransportError::NotBound)?;
        let shared = Arc::clone(&binding.shared);
        let link = shared.allocate();
        let (outbound, cancel) = shared.open_link(link).ok_or(TransportError::NotBound)?;

        self.runtime.spawn(outgoing_link(
            shared,
            link,
            remote.clone(),
            outbound,
            cancel,
        ));
        Ok(link)
    }

    fn send(&mut self, link: LinkId, payload: Bytes) -> TransportResult<()> {
        let binding = self.binding.as_ref().ok_or(TransportError::NotBound)?;
        if payload.len() > MAX_LINK_FRAME {
            return Err(TransportError::PayloadTooLarge(payload.len()));
        }
        let links = binding.shared.links.lock();
        let entry = links
            .entries
            .get(&link)
            .ok_or(TransportError::LinkClosed(link))?;
        entry
            .outbound
            .send(payload)
            .map_err(|_| TransportError::LinkClosed(link))
    }

    fn close(&mut self, link: LinkId) {
        let Some(binding) = &self.binding else {
            return;
        };
        if binding.shared.remove(link) {
            tracing::debug!(%link, "tcp link closed locally");
            binding.shared.push(TransportEvent::Close { link });
        }
    }

    fn destroy(&mut self) {
        if let Some(binding) = self.binding.take() {
            tracing::debug!(peer = %binding.shared.identity, "tcp identity released");
        }
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.binding.as_mut()?.events.try_recv().ok()
    }
}

/// Run a blocking exchange without stalling other tasks on this worker
fn blocking<R>(f: impl FnOnce() -> R) -> R {
    let multi_thread = Handle::try_current()
        .map_or(false, |h| h.runtime_flavor() == RuntimeFlavor::MultiThread);
    if multi_thread {
        tokio::task::block_in_place(f)
    } else {
        f()
    }
}

fn rendezvous_error(err: io::Error) -> TransportError {
    TransportError::Rendezvous(err.to_string())
}

/// Register `id` at `addr`. The returned stream holds the registration.
fn register(rendezvous: SocketAddr, id: &PeerId, addr: SocketAddr) -> TransportResult<StdTcpStream> {
    let mut stream =
        StdTcpStream::connect_timeout(&rendezvous, CONNECT_TIMEOUT).map_err(rendezvous_error)?;
    stream
        .set_read_timeout(Some(CONNECT_TIMEOUT))
        .map_err(rendezvous_error)?;
    stream.set_nodelay(true).map_err(rendezvous_error)?;

    let request = RendezvousRequest::Register {
        id: id.clone(),
        addr,
    }
    .to_line()?;
    stream
        .write_all(request.as_bytes())
        .map_err(rendezvous_error)?;

    let mut line = String::new();
    io::BufReader::new(&stream)
        .read_line(&mut line)
        .map_err(rendezvous_error)?;

    match RendezvousReply::from_line(&line)? {
        RendezvousReply::Registered => {
            stream.set_read_timeout(None).map_err(rendezvous_error)?;
            Ok(stream)
        }
        RendezvousReply::Taken => Err(TransportError::IdentityTaken(id.clone())),
        other => Err(TransportError::Rendezvous(format!(
            "unexpected reply {other:?}"
        ))),
    }
}

async fn lookup(rendezvous: SocketAddr, id: &PeerId) -> TransportResult<SocketAddr> {
    let request = RendezvousRequest::Lookup { id: id.clone() }.to_line()?;
    let answer = match timeout(CONNECT_TIMEOUT, exchange(rendezvous, request)).await {
        Ok(Ok(Some(line))) => line,
        Ok(Ok(None)) => {
            return Err(TransportError::Rendezvous(
                "closed without reply".to_string(),
            ))
        }
        Ok(Err(e)) => return Err(rendezvous_error(e)),
        Err(_) => return Err(TransportError::Rendezvous("timed out".to_string())),
    };

    match RendezvousReply::from_line(&answer)? {
        RendezvousReply::Found { addr } => Ok(addr),
        RendezvousReply::NotFound => Err(TransportError::PeerUnavailable(id.clone())),
        other => Err(TransportError::Rendezvous(format!(
            "unexpected reply {other:?}"
        ))),
    }
}

async fn exchange(rendezvous: SocketAddr, request: String) -> io::Result<Option<String>> {
    let mut stream = TcpStream::connect(rendezvous).await?;
    stream.write_all(request.as_bytes()).await?;
    let mut reader = BufReader::new(stream);
    read_bounded_line(&mut reader).await
}

async fn dial(shared: &Shared, remote: &PeerId) -> TransportResult<TcpStream> {
    let addr = lookup(shared.rendezvous, remote).await?;
    let unavailable = || TransportError::PeerUnavailable(remote.clone());
    let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| unavailable())?
        .map_err(|_| unavailable())?;
    stream.set_nodelay(true)?;
    write_frame(&mut stream, shared.identity.as_str().as_bytes()).await?;
    Ok(stream)
}

async fn accept_links(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tokio::spawn(incoming_link(Arc::clone(&shared), stream, addr));
            }
            Err(e) => {
                tracing::warn!(error = %e, "tcp accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn hold_registration(shared: Arc<Shared>, control: TcpStream) {
    let mut reader = BufReader::new(control);
    while let Ok(Some(_)) = read_bounded_line(&mut reader).await {}
    tracing::warn!(peer = %shared.identity, "rendezvous registration lost");
    shared.push(TransportEvent::Error {
        link: None,
        error: TransportError::Rendezvous("registration lost".to_string()),
    });
}

async fn incoming_link(shared: Arc<Shared>, mut stream: TcpStream, addr: SocketAddr) {
    let hello = timeout(HANDSHAKE_TIMEOUT, read_frame(&mut stream)).await;
    let remote = match hello {
        Ok(Ok(Some(hello))) => match std::str::from_utf8(&hello) {
            Ok(id) if !id.is_empty() => PeerId::new(id),
            _ => {
                tracing::debug!(%addr, "rejecting link with invalid identity");
                return;
            }
        },
        _ => {
            tracing::debug!(%addr, "link handshake failed");
            return;
        }
    };
    if stream.set_nodelay(true).is_err() {
        return;
    }

    let link = shared.allocate();
    let Some((outbound, cancel)) = shared.open_link(link) else {
        return;
    };
    tracing::debug!(%link, peer = %remote, "incoming tcp link");
    shared.push(TransportEvent::Incoming { link, remote });
    shared.push(TransportEvent::Open { link });
    run_link(shared, link, stream, outbound, cancel).await;
}

async fn outgoing_link(
    shared: Arc<Shared>,
    link: LinkId,
    remote: PeerId,
    outbound: mpsc::UnboundedReceiver<Bytes>,
    mut cancel: oneshot::Receiver<()>,
) {
    let dialed = tokio::select! {
        _ = &mut cancel => return,
        dialed = dial(&shared, &remote) => dialed,
    };
    match dialed {
        Ok(stream) => {
            tracing::debug!(%link, peer = %remote, "tcp link open");
            shared.push_if_live(link, TransportEvent::Open { link });
            run_link(shared, link, stream, outbound, cancel).await;
        }
        Err(error) => {
            tracing::debug!(%link, peer = %remote, error = %error, "dial failed");
            if shared.remove(link) {
                shared.push(TransportEvent::Error {
                    link: Some(link),
                    error,
                });
            }
        }
    }
}

async fn run_link(
    shared: Arc<Shared>,
    link: LinkId,
    stream: TcpStream,
    outbound: mpsc::UnboundedReceiver<Bytes>,
    mut cancel: oneshot::Receiver<()>,
) {
    let (mut read, write) = stream.into_split();
    // ends once the entry, and with it the sender, is gone
    tokio::spawn(write_frames(link, write, outbound));

    loop {
        tokio::select! {
            _ = &mut cancel => break,
            frame = read_frame(&mut read) => match frame {
                Ok(Some(payload)) => shared.push(TransportEvent::Data { link, payload }),
                Ok(None) => {
                    shared.finish(link);
                    break;
                }
                Err(e) => {
                    tracing::debug!(%link, error = %e, "tcp link read failed");
                    shared.finish(link);
                    break;
                }
            },
        }
    }
}

async fn write_frames(
    link: LinkId,
    mut write: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(payload) = outbound.recv().await {
        if let Err(e) = write_frame(&mut write, &payload).await {
            tracing::debug!(%link, error = %e, "tcp link write failed");
            break;
        }
    }
    let _ = write.shutdown().await;
}

async fn write_frame<W: AsyncWrite + Unpin>(write: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    write.write_all(&len.to_be_bytes()).await?;
    write.write_all(payload).await
}

/// Next frame, `None` on a clean end of stream
async fn read_frame<R: AsyncRead + Unpin>(read: &mut R) -> io::Result<Option<Bytes>> {
    let mut header = [0u8; 4];
    match read.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_LINK_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes"),
        ));
    }
    let mut payload = vec![0u8; len];
    read.read_exact(&mut payload).await?;
    Ok(Some(Bytes::from(payload)))
}
