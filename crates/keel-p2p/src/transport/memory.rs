//! In-memory transport for tests and demos.
//!
//! A [`MemoryNetwork`] is a process-local hub of named nodes. Each node gets
//! a [`MemoryTransport`]; dialing another node's name produces a pair of
//! connected [`Connection`]s whose streams are backed by in-process duplex
//! pipes. There is no real handshake: the hub already knows every node's
//! public key, so connections come up authenticated.

use ed25519_dalek::VerifyingKey;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use crate::error::{P2pError, Result};
use crate::transport::{Connection, Endpoint, Protocol, RawStream, StreamId, Transport};

/// Protocol tag of the memory transport.
pub const MEMORY_PROTOCOL: &str = "memory";

/// Buffer size of each in-memory stream.
const STREAM_BUFFER: usize = 64 * 1024;

/// Backlog of not-yet-accepted inbound connections per node.
const ACCEPT_BACKLOG: usize = 32;

struct NodeEntry {
    key: VerifyingKey,
    accept_tx: mpsc::Sender<MemoryConnection>,
}

/// A process-local hub connecting named [`MemoryTransport`]s.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    nodes: Arc<Mutex<HashMap<String, NodeEntry>>>,
}

impl MemoryNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node and returns its transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is already taken.
    pub fn create_transport(
        &self,
        name: impl Into<String>,
        key: VerifyingKey,
    ) -> Result<MemoryTransport> {
        let name = name.into();
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);

        let mut nodes = self.nodes.lock();
        if nodes.contains_key(&name) {
            return Err(P2pError::Transport(format!(
                "memory node {name:?} already exists"
            )));
        }
        nodes.insert(name.clone(), NodeEntry { key, accept_tx });
        drop(nodes);

        Ok(MemoryTransport {
            name,
            key,
            network: self.clone(),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            closed: AtomicBool::new(false),
        })
    }

    fn unregister(&self, name: &str) {
        self.nodes.lock().remove(name);
    }
}

/// Transport for one node on a [`MemoryNetwork`].
pub struct MemoryTransport {
    name: String,
    key: VerifyingKey,
    network: MemoryNetwork,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MemoryConnection>>,
    closed: AtomicBool,
}

impl Transport for MemoryTransport {
    fn protocol(&self) -> Protocol {
        Protocol::from(MEMORY_PROTOCOL)
    }

    fn listen_endpoint(&self) -> Option<Endpoint> {
        Some(Endpoint {
            protocol: self.protocol(),
            address: self.name.clone(),
            port: None,
        })
    }

    fn accept(&self) -> BoxFuture<'_, Result<Box<dyn Connection>>> {
        Box::pin(async move {
            let mut rx = self.accept_rx.lock().await;
            match rx.recv().await {
                Some(conn) => Ok(Box::new(conn) as Box<dyn Connection>),
                None => Err(P2pError::Transport("memory transport closed".into())),
            }
        })
    }

    fn dial(&self, endpoint: &Endpoint) -> BoxFuture<'_, Result<Box<dyn Connection>>> {
        let endpoint = endpoint.clone();
        Box::pin(async move {
            if self.closed.load(Ordering::Acquire) {
                return Err(P2pError::ShuttingDown);
            }

            let (remote_key, accept_tx) = {
                let nodes = self.network.nodes.lock();
                let entry = nodes.get(&endpoint.address).ok_or_else(|| {
                    P2pError::Transport(format!("unknown memory node {:?}", endpoint.address))
                })?;
                (entry.key, entry.accept_tx.clone())
            };

            let core = Arc::new(ConnCore::default());
            let dialer = MemoryConnection {
                core: Arc::clone(&core),
                side: Side::A,
                remote_key,
                remote_name: endpoint.address.clone(),
            };
            let acceptor = MemoryConnection {
                core,
                side: Side::B,
                remote_key: self.key,
                remote_name: self.name.clone(),
            };

            accept_tx.send(acceptor).await.map_err(|_| {
                P2pError::Transport(format!("memory node {:?} stopped accepting", endpoint.address))
            })?;

            Ok(Box::new(dialer) as Box<dyn Connection>)
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::Release);
            self.network.unregister(&self.name);
            Ok(())
        })
    }
}

/// Which end of the connection pair this handle is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    A,
    B,
}

#[derive(Default)]
struct StreamSlot {
    a: Option<DuplexStream>,
    b: Option<DuplexStream>,
}

#[derive(Default)]
struct ConnCore {
    streams: Mutex<HashMap<StreamId, StreamSlot>>,
    closed: AtomicBool,
}

/// One side of an in-memory connection pair.
pub struct MemoryConnection {
    core: Arc<ConnCore>,
    side: Side,
    remote_key: VerifyingKey,
    remote_name: String,
}

impl Connection for MemoryConnection {
    fn remote_public_key(&self) -> VerifyingKey {
        self.remote_key
    }

    fn remote_endpoint(&self) -> Endpoint {
        Endpoint {
            protocol: Protocol::from(MEMORY_PROTOCOL),
            address: self.remote_name.clone(),
            port: None,
        }
    }

    fn take_stream(&self, id: StreamId) -> BoxFuture<'_, Result<RawStream>> {
        let result = if self.core.closed.load(Ordering::Acquire) {
            Err(P2pError::Transport("connection closed".into()))
        } else {
            let mut streams = self.core.streams.lock();
            let slot = streams.entry(id).or_insert_with(|| {
                let (a, b) = tokio::io::duplex(STREAM_BUFFER);
                StreamSlot {
                    a: Some(a),
                    b: Some(b),
                }
            });
            let half = match self.side {
                Side::A => slot.a.take(),
                Side::B => slot.b.take(),
            };
            half.map(|stream| Box::new(stream) as RawStream).ok_or_else(|| {
                P2pError::Transport(format!("stream {id} already taken"))
            })
        };
        Box::pin(async move { result })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.core.closed.store(true, Ordering::Release);
            // Dropping the untaken halves EOFs any streams the remote holds.
            self.core.streams.lock().clear();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn key() -> VerifyingKey {
        SigningKey::generate(&mut OsRng).verifying_key()
    }

    async fn connected_pair(
        network: &MemoryNetwork,
    ) -> (Box<dyn Connection>, Box<dyn Connection>) {
        let a = network.create_transport("a", key()).expect("transport a");
        let b = network.create_transport("b", key()).expect("transport b");

        let endpoint = b.listen_endpoint().expect("endpoint");
        let (dialed, accepted) = tokio::join!(a.dial(&endpoint), b.accept());
        (dialed.expect("dial"), accepted.expect("accept"))
    }

    #[test]
    fn duplicate_node_name_is_rejected() {
        let network = MemoryNetwork::new();
        network.create_transport("a", key()).expect("first");
        assert!(network.create_transport("a", key()).is_err());
    }

    #[tokio::test]
    async fn dial_unknown_node_fails() {
        let network = MemoryNetwork::new();
        let a = network.create_transport("a", key()).expect("transport");
        let endpoint = Endpoint {
            protocol: Protocol::from(MEMORY_PROTOCOL),
            address: "nope".into(),
            port: None,
        };
        assert!(a.dial(&endpoint).await.is_err());
    }

    #[tokio::test]
    async fn streams_carry_bytes_both_ways() {
        let network = MemoryNetwork::new();
        let (dialer, acceptor) = connected_pair(&network).await;

        let mut d = dialer.take_stream(StreamId(1)).await.expect("stream");
        let mut a = acceptor.take_stream(StreamId(1)).await.expect("stream");

        d.write_all(b"ping").await.expect("write");
        let mut buf = [0u8; 4];
        a.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"ping");

        a.write_all(b"pong").await.expect("write");
        d.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn stream_can_only_be_taken_once_per_side() {
        let network = MemoryNetwork::new();
        let (dialer, _acceptor) = connected_pair(&network).await;

        let _first = dialer.take_stream(StreamId(7)).await.expect("first take");
        assert!(dialer.take_stream(StreamId(7)).await.is_err());
    }

    #[tokio::test]
    async fn close_eofs_remote_streams() {
        let network = MemoryNetwork::new();
        let (dialer, acceptor) = connected_pair(&network).await;

        let mut d = dialer.take_stream(StreamId(1)).await.expect("stream");
        acceptor.close().await.expect("close");

        let mut buf = [0u8; 1];
        let n = d.read(&mut buf).await.expect("read");
        assert_eq!(n, 0, "expected EOF after remote close");
    }

    #[tokio::test]
    async fn remote_keys_are_exchanged() {
        let network = MemoryNetwork::new();
        let key_a = key();
        let key_b = key();
        let a = network.create_transport("a", key_a).expect("transport a");
        let b = network.create_transport("b", key_b).expect("transport b");

        let endpoint = b.listen_endpoint().expect("endpoint");
        let (dialed, accepted) = tokio::join!(a.dial(&endpoint), b.accept());
        let dialed = dialed.expect("dial");
        let accepted = accepted.expect("accept");

        assert_eq!(dialed.remote_public_key(), key_b);
        assert_eq!(accepted.remote_public_key(), key_a);
    }
}
