//! Identity rendezvous service
//!
//! Maps network identities to the address their owner listens on. A
//! registration lives as long as the registering connection stays open, so
//! a crashed or destroyed peer frees its identity without an explicit
//! unregister. The protocol is one JSON object per line:
//!
//! ```text
//! -> {"op":"register","id":"retro-app-D1","addr":"10.0.0.5:41000"}
//! <- {"status":"registered"}
//! -> {"op":"lookup","id":"retro-app-D1"}
//! <- {"status":"found","addr":"10.0.0.5:41000"}
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use retro_core::PeerId;

use crate::{TransportError, TransportResult};

/// Longest accepted request line
pub const MAX_REQUEST_LINE: usize = 4 * 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum RendezvousRequest {
    Register { id: PeerId, addr: SocketAddr },
    Lookup { id: PeerId },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum RendezvousReply {
    Registered,
    Taken,
    Found { addr: SocketAddr },
    NotFound,
    Invalid,
}

impl RendezvousRequest {
    /// JSON line including the terminating newline
    pub fn to_line(&self) -> TransportResult<String> {
        to_line(self)
    }
}

impl RendezvousReply {
    pub fn to_line(&self) -> TransportResult<String> {
        to_line(self)
    }

    pub fn from_line(line: &str) -> TransportResult<Self> {
        serde_json::from_str(line.trim())
            .map_err(|e| TransportError::Rendezvous(format!("bad reply: {e}")))
    }
}

fn to_line<T: Serialize>(value: &T) -> TransportResult<String> {
    let mut line = serde_json::to_string(value).map_err(|e| TransportError::Io(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

#[derive(Debug)]
struct Registration {
    addr: SocketAddr,
    session: u64,
}

#[derive(Debug, Default)]
struct Registry {
    entries: HashMap<PeerId, Registration>,
    next_session: u64,
}

impl Registry {
    fn register(&mut self, id: &PeerId, addr: SocketAddr) -> Option<u64> {
        if self.entries.contains_key(id) {
            return None;
        }
        self.next_session += 1;
        let session = self.next_session;
        self.entries.insert(id.clone(), Registration { addr, session });
        Some(session)
    }

    fn release(&mut self, id: &PeerId, session: u64) -> bool {
        match self.entries.get(id) {
            Some(reg) if reg.session == session => {
                self.entries.remove(id);
                true
            }
            _ => false,
        }
    }

    fn lookup(&self, id: &PeerId) -> Option<SocketAddr> {
        self.entries.get(id).map(|reg| reg.addr)
    }
}

/// TCP rendezvous server
pub struct RendezvousServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: Arc<Mutex<Registry>>,
}

impl RendezvousServer {
    /// Bind to a local address
    pub async fn bind(addr: SocketAddr) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(RendezvousServer {
            listener,
            local_addr,
            registry: Arc::new(Mutex::new(Registry::default())),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve on a background task
    pub fn spawn(self) -> RendezvousHandle {
        let local_addr = self.local_addr;
        let registry = Arc::clone(&self.registry);
        let task = tokio::spawn(self.run());
        RendezvousHandle {
            local_addr,
            registry,
            task,
        }
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) {
        tracing::info!(addr = %self.local_addr, "rendezvous listening");
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let registry = Arc::clone(&self.registry);
                    tokio::spawn(async move {
                        if let Err(e) = serve(stream, registry).await {
                            tracing::debug!(%peer, error = %e, "rendezvous connection failed");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "rendezvous accept failed");
                }
            }
        }
    }
}

/// A rendezvous server running in the background
pub struct RendezvousHandle {
    local_addr: SocketAddr,
    registry: Arc<Mutex<Registry>>,
    task: JoinHandle<()>,
}

impl RendezvousHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of identities currently registered
    pub fn registered(&self) -> usize {
        self.registry.lock().entries.len()
    }

    pub fn is_registered(&self, id: &PeerId) -> bool {
        self.registry.lock().entries.contains_key(id)
    }

    /// Stop accepting. Live registrations stay until their connections end.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for RendezvousHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(stream: TcpStream, registry: Arc<Mutex<Registry>>) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    let Some(line) = read_bounded_line(&mut reader).await? else {
        return Ok(());
    };
    let request: RendezvousRequest = match serde_json::from_str(line.trim()) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(error = %e, "invalid rendezvous request");
            return reply(&mut write, &RendezvousReply::Invalid).await;
        }
    };

    match request {
        RendezvousRequest::Lookup { id } => {
            let found = registry.lock().lookup(&id);
            let answer = match found {
                Some(addr) => RendezvousReply::Found { addr },
                None => RendezvousReply::NotFound,
            };
            reply(&mut write, &answer).await
        }
        RendezvousRequest::Register { id, addr } => {
            let session = registry.lock().register(&id, addr);
            let Some(session) = session else {
                tracing::debug!(peer = %id, "identity taken");
                return reply(&mut write, &RendezvousReply::Taken).await;
            };
            tracing::debug!(peer = %id, %addr, "identity registered");
            let held = reply(&mut write, &RendezvousReply::Registered).await;

            // the registration is held until the owner hangs up
            if held.is_ok() {
                while let Ok(Some(_)) = read_bounded_line(&mut reader).await {}
            }
            if registry.lock().release(&id, session) {
                tracing::debug!(peer = %id, "identity released");
            }
            held
        }
    }
}

async fn reply<W: AsyncWrite + Unpin>(write: &mut W, answer: &RendezvousReply) -> std::io::Result<()> {
    let line = answer
        .to_line()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    write.write_all(line.as_bytes()).await?;
    write.flush().await
}

/// One line, `None` at end of stream. Overlong lines are an error.
pub(crate) async fn read_bounded_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<String>> {
    let mut buf = Vec::new();
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            return Ok(if buf.is_empty() { None } else { Some(lossy(buf)) });
        }
        match chunk.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                buf.extend_from_slice(&chunk[..pos]);
                reader.consume(pos + 1);
                return Ok(Some(lossy(buf)));
            }
            None => {
                let len = chunk.len();
                buf.extend_from_slice(chunk);
                reader.consume(len);
            }
        }
        if buf.len() > MAX_REQUEST_LINE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "rendezvous line too long",
            ));
        }
    }
}

fn lossy(buf: Vec<u8>) -> String {
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_wire_format() {
        let req = RendezvousRequest::Register {
            id: PeerId::new("retro-app-D1"),
            addr: addr(4100),
        };
        assert_eq!(
            req.to_line().unwrap(),
            "{\"op\":\"register\",\"id\":\"retro-app-D1\",\"addr\":\"127.0.0.1:4100\"}\n"
        );
        assert_eq!(
            RendezvousReply::from_line("{\"status\":\"not-found\"}\n").unwrap(),
            RendezvousReply::NotFound
        );
        assert!(RendezvousReply::from_line("nope").is_err());
    }

    #[test]
    fn test_registry_release_is_session_scoped() {
        let mut registry = Registry::default();
        let id = PeerId::new("retro-app-D1");

        let first = registry.register(&id, addr(1)).unwrap();
        assert_eq!(registry.register(&id, addr(2)), None);
        assert!(registry.release(&id, first));

        let second = registry.register(&id, addr(3)).unwrap();
        // a stale session cannot release the new owner
        assert!(!registry.release(&id, first));
        assert_eq!(registry.lookup(&id), Some(addr(3)));
        assert!(registry.release(&id, second));
        assert_eq!(registry.lookup(&id), None);
    }

    #[tokio::test]
    async fn test_server_answers_lookup_and_invalid() {
        let server = RendezvousServer::bind(addr(0)).await.unwrap().spawn();

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let line = RendezvousRequest::Lookup {
            id: PeerId::new("nobody"),
        }
        .to_line()
        .unwrap();
        stream.write_all(line.as_bytes()).await.unwrap();
        let mut reader = BufReader::new(stream);
        let answer = read_bounded_line(&mut reader).await.unwrap().unwrap();
        assert_eq!(RendezvousReply::from_line(&answer).unwrap(), RendezvousReply::NotFound);

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        stream.write_all(b"garbage\n").await.unwrap();
        let mut reader = BufReader::new(stream);
        let answer = read_bounded_line(&mut reader).await.unwrap().unwrap();
        assert_eq!(RendezvousReply::from_line(&answer).unwrap(), RendezvousReply::Invalid);
    }
}
