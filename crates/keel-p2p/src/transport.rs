//! Transport contracts.
//!
//! A [`Transport`] produces authenticated [`Connection`]s, and each
//! connection multiplexes byte [`RawStream`]s identified by a [`StreamId`].
//! The router is written entirely against these traits; swapping the wire
//! protocol means implementing them, nothing more.
//!
//! The [`memory`] submodule provides a process-local transport used in tests
//! and demos.

use ed25519_dalek::VerifyingKey;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

pub mod memory;

/// Protocol tag naming a transport, e.g. `tcp` or `memory`.
///
/// Addresses carry a protocol as their URL scheme; the router uses it to
/// pick which registered transport dials an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Protocol(String);

impl Protocol {
    /// Returns the tag as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Protocol {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A dialable network location produced by resolving a [`PeerAddress`].
///
/// [`PeerAddress`]: crate::peer::PeerAddress
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Which transport this endpoint belongs to.
    pub protocol: Protocol,
    /// IP address or transport-opaque name.
    pub address: String,
    /// Port, where the transport uses one.
    pub port: Option<u16>,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.address)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

/// Identifier of a byte stream within a connection.
///
/// Channel IDs map directly onto stream IDs, so each channel gets its own
/// stream on every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u8);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Marker trait for the byte streams a connection hands out.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// An owned, bidirectional byte stream belonging to a connection.
pub type RawStream = Box<dyn AsyncStream>;

/// A transport: listens for inbound connections and dials outbound ones.
///
/// Implementations are object-safe so the router can hold a heterogeneous
/// set of transports behind `dyn Transport`.
pub trait Transport: Send + Sync {
    /// The protocol tag this transport serves.
    fn protocol(&self) -> Protocol;

    /// The endpoint this transport listens on, if it is listening.
    fn listen_endpoint(&self) -> Option<Endpoint>;

    /// Waits for the next inbound connection.
    fn accept(&self) -> BoxFuture<'_, Result<Box<dyn Connection>>>;

    /// Dials an endpoint, returning an authenticated connection.
    fn dial(&self, endpoint: &Endpoint) -> BoxFuture<'_, Result<Box<dyn Connection>>>;

    /// Stops listening and releases transport resources.
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

/// An authenticated connection to a single remote peer.
pub trait Connection: Send + Sync {
    /// The public key the remote authenticated with.
    fn remote_public_key(&self) -> VerifyingKey;

    /// The endpoint on the far side of this connection.
    fn remote_endpoint(&self) -> Endpoint;

    /// Takes ownership of the stream with the given ID.
    ///
    /// Each stream can be taken exactly once per side; a second take for
    /// the same ID is an error. Both sides may take a stream ID at any time
    /// during the connection's life, which is how channels opened after
    /// connection setup retrofit their streams.
    fn take_stream(&self, id: StreamId) -> BoxFuture<'_, Result<RawStream>>;

    /// Closes the connection and all its streams.
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}
