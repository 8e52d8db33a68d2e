//! Peer identity and lifecycle types.
//!
//! This module defines the types the rest of the stack uses to talk about
//! peers:
//! - [`PeerId`]: unique identifier, derived from Ed25519 public keys
//! - [`PeerStatus`] / [`PeerPriority`]: lifecycle and scheduling class
//! - [`PeerAddress`]: URL-like locator, resolved into transport [`Endpoint`]s
//! - [`PeerUpdate`] / [`PeerError`]: the control-plane values exchanged
//!   between the router and reactors

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::P2pError;
use crate::transport::{Endpoint, Protocol};

/// Unique identifier for a peer in the network.
///
/// A `PeerId` is derived from an Ed25519 public key. The bytes stored are the
/// raw 32-byte key, displayed as base58 for human readability. The ID is
/// stable and immutable once assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId {
    bytes: [u8; 32],
}

impl PeerId {
    /// Creates a `PeerId` from an Ed25519 public key.
    #[must_use]
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        Self {
            bytes: key.to_bytes(),
        }
    }

    /// Creates a `PeerId` from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// Returns the raw bytes of the peer ID.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(&self.bytes).into_string())
    }
}

impl FromStr for PeerId {
    type Err = P2pError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = bs58::decode(s)
            .into_vec()
            .map_err(|e| P2pError::InvalidAddress(format!("bad peer id {s:?}: {e}")))?;
        let bytes: [u8; 32] = decoded
            .try_into()
            .map_err(|_| P2pError::InvalidAddress(format!("peer id {s:?} is not 32 bytes")))?;
        Ok(Self { bytes })
    }
}

/// Lifecycle status of a peer.
///
/// `Up` and `Down` cycle freely as connections come and go; `Removed` and
/// `Banned` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    /// Known peer we have not yet contacted.
    New,
    /// Peer with an active connection.
    Up,
    /// Peer we are temporarily disconnected from.
    Down,
    /// Peer which has been removed.
    Removed,
    /// Peer banned for misbehavior.
    Banned,
}

impl PeerStatus {
    /// Returns true if the status can never change again.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Removed | Self::Banned)
    }
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Up => "up",
            Self::Down => "down",
            Self::Removed => "removed",
            Self::Banned => "banned",
        };
        f.write_str(s)
    }
}

/// Scheduling class of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PeerPriority {
    /// Ordinary peer.
    Normal,
    /// Validator peer.
    Validator,
    /// Peer we always try to stay connected to.
    Persistent,
}

/// A peer address, given as a URL-like locator.
///
/// Addresses are how peers are expressed in configuration and peer exchange;
/// they are resolved into one or more [`Endpoint`]s before dialing. The
/// scheme selects the transport, and an optional user-info component carries
/// the expected [`PeerId`], checked against the public key the connection
/// authenticates with: `tcp://<peer-id>@host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    /// Protocol tag selecting a transport.
    pub protocol: Protocol,
    /// Expected peer identity, if the locator names one.
    pub peer_id: Option<PeerId>,
    /// Host: an IP address, DNS name, or transport-opaque name.
    pub host: String,
    /// Port, where the transport uses one.
    pub port: Option<u16>,
}

impl PeerAddress {
    /// Resolves this address into a set of dialable endpoints.
    ///
    /// DNS names expand into one endpoint per resolved IP; IP and
    /// transport-opaque hosts resolve to a single endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if DNS resolution fails.
    pub async fn resolve(&self) -> crate::error::Result<Vec<Endpoint>> {
        if self.host.parse::<IpAddr>().is_ok() {
            return Ok(vec![Endpoint {
                protocol: self.protocol.clone(),
                address: self.host.clone(),
                port: self.port,
            }]);
        }

        let Some(port) = self.port else {
            // No port and not an IP: the host is a transport-opaque name.
            return Ok(vec![Endpoint {
                protocol: self.protocol.clone(),
                address: self.host.clone(),
                port: None,
            }]);
        };

        let addrs = tokio::net::lookup_host((self.host.as_str(), port))
            .await
            .map_err(|e| P2pError::InvalidAddress(format!("resolving {self}: {e}")))?;

        Ok(addrs
            .map(|addr| Endpoint {
                protocol: self.protocol.clone(),
                address: addr.ip().to_string(),
                port: Some(addr.port()),
            })
            .collect())
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.protocol)?;
        if let Some(id) = &self.peer_id {
            write!(f, "{id}@")?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

impl FromStr for PeerAddress {
    type Err = P2pError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed =
            url::Url::parse(s).map_err(|e| P2pError::InvalidAddress(format!("{s:?}: {e}")))?;

        let host = match parsed.host_str() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => return Err(P2pError::InvalidAddress(format!("{s:?}: missing host"))),
        };

        let peer_id = match parsed.username() {
            "" => None,
            user => Some(user.parse::<PeerId>()?),
        };

        Ok(Self {
            protocol: Protocol::from(parsed.scheme()),
            peer_id,
            host,
            port: parsed.port(),
        })
    }
}

/// Everything the router tracks about a peer.
///
/// `Peer` records are owned exclusively by the router's peer store; reactors
/// only ever observe [`PeerId`] and [`PeerStatus`] via [`PeerUpdate`]s.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Stable identity.
    pub id: PeerId,
    /// Current lifecycle status.
    pub status: PeerStatus,
    /// Scheduling class.
    pub priority: PeerPriority,
    /// Known addresses, from configuration or peer exchange.
    pub addresses: Vec<PeerAddress>,
    /// Resolved endpoints by address.
    pub endpoints: HashMap<PeerAddress, Vec<Endpoint>>,
}

impl Peer {
    /// Creates a fresh record for a peer we have not contacted yet.
    #[must_use]
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            status: PeerStatus::New,
            priority: PeerPriority::Normal,
            addresses: Vec::new(),
            endpoints: HashMap::new(),
        }
    }

    /// Adds an address if it is not already known.
    pub fn add_address(&mut self, address: PeerAddress) {
        if !self.addresses.contains(&address) {
            self.addresses.push(address);
        }
    }

    /// Records resolved endpoints for an address, keeping any already known.
    pub fn add_endpoints(&mut self, address: PeerAddress, endpoints: Vec<Endpoint>) {
        let known = self.endpoints.entry(address).or_default();
        for endpoint in endpoints {
            if !known.contains(&endpoint) {
                known.push(endpoint);
            }
        }
    }

    /// Merges another record for the same peer into this one.
    ///
    /// Merging is additive: addresses and resolved endpoints are unioned,
    /// never discarded, and a terminal status is never regressed.
    pub fn merge(&mut self, other: Peer) {
        debug_assert_eq!(self.id, other.id);
        for address in other.addresses {
            self.add_address(address);
        }
        for (address, endpoints) in other.endpoints {
            self.add_endpoints(address, endpoints);
        }
        self.priority = self.priority.max(other.priority);
        if !self.status.is_terminal() && other.status.is_terminal() {
            self.status = other.status;
        }
    }
}

/// A point-in-time peer status transition, published by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerUpdate {
    /// The peer that changed status.
    pub peer_id: PeerId,
    /// The new status.
    pub status: PeerStatus,
}

/// Action a reactor requests the router to take for a misbehaving peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAction {
    /// Log only.
    None,
    /// Close the peer's connection.
    Disconnect,
    /// Ban the peer and close its connection.
    Ban,
}

/// A reactor's verdict on a peer's bad behavior, consumed by the router.
#[derive(Debug, Clone)]
pub struct PeerError {
    /// The peer that misbehaved.
    pub peer_id: PeerId,
    /// What went wrong.
    pub reason: String,
    /// The action the reactor requests.
    pub action: PeerAction,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn make_peer_id() -> PeerId {
        let signing_key = SigningKey::generate(&mut OsRng);
        PeerId::from_public_key(&signing_key.verifying_key())
    }

    // ========== PeerId Tests ==========

    #[test]
    fn peer_id_from_public_key_is_deterministic() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let key = signing_key.verifying_key();

        assert_eq!(PeerId::from_public_key(&key), PeerId::from_public_key(&key));
    }

    #[test]
    fn peer_id_display_roundtrips_through_from_str() {
        let id = make_peer_id();
        let parsed: PeerId = id.to_string().parse().expect("parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn peer_id_rejects_short_encodings() {
        assert!("3yZe7d".parse::<PeerId>().is_err());
        assert!("not base58 !!".parse::<PeerId>().is_err());
    }

    // ========== PeerStatus Tests ==========

    #[test]
    fn terminal_statuses() {
        assert!(PeerStatus::Removed.is_terminal());
        assert!(PeerStatus::Banned.is_terminal());
        assert!(!PeerStatus::New.is_terminal());
        assert!(!PeerStatus::Up.is_terminal());
        assert!(!PeerStatus::Down.is_terminal());
    }

    // ========== PeerAddress Tests ==========

    #[test]
    fn address_parses_scheme_host_port() {
        let addr: PeerAddress = "tcp://10.0.0.1:26656".parse().expect("parse");
        assert_eq!(addr.protocol, Protocol::from("tcp"));
        assert_eq!(addr.host, "10.0.0.1");
        assert_eq!(addr.port, Some(26656));
        assert!(addr.peer_id.is_none());
    }

    #[test]
    fn address_parses_peer_id_hint() {
        let id = make_peer_id();
        let addr: PeerAddress = format!("tcp://{id}@validator.example.com:26656")
            .parse()
            .expect("parse");
        assert_eq!(addr.peer_id, Some(id));
        assert_eq!(addr.host, "validator.example.com");
    }

    #[test]
    fn address_display_roundtrips() {
        let id = make_peer_id();
        let text = format!("memory://{id}@node-a");
        let addr: PeerAddress = text.parse().expect("parse");
        assert_eq!(addr.to_string(), text);
    }

    #[test]
    fn address_rejects_missing_host() {
        assert!("tcp://".parse::<PeerAddress>().is_err());
    }

    #[tokio::test]
    async fn resolve_ip_host_yields_single_endpoint() {
        let addr: PeerAddress = "tcp://127.0.0.1:26656".parse().expect("parse");
        let endpoints = addr.resolve().await.expect("resolve");
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].address, "127.0.0.1");
        assert_eq!(endpoints[0].port, Some(26656));
    }

    #[tokio::test]
    async fn resolve_opaque_host_passes_through() {
        let addr: PeerAddress = "memory://node-a".parse().expect("parse");
        let endpoints = addr.resolve().await.expect("resolve");
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].address, "node-a");
        assert_eq!(endpoints[0].port, None);
    }

    // ========== Peer Merge Tests ==========

    #[test]
    fn merge_unions_addresses_and_endpoints() {
        let id = make_peer_id();
        let addr_a: PeerAddress = "tcp://10.0.0.1:26656".parse().expect("parse");
        let addr_b: PeerAddress = "tcp://10.0.0.2:26656".parse().expect("parse");

        let mut peer = Peer::new(id);
        peer.add_address(addr_a.clone());
        peer.add_endpoints(
            addr_a.clone(),
            vec![Endpoint {
                protocol: Protocol::from("tcp"),
                address: "10.0.0.1".into(),
                port: Some(26656),
            }],
        );

        let mut other = Peer::new(id);
        other.add_address(addr_b.clone());
        other.add_address(addr_a.clone());

        peer.merge(other);
        assert_eq!(peer.addresses.len(), 2);
        // Existing resolved endpoints are preserved across merges.
        assert_eq!(peer.endpoints[&addr_a].len(), 1);
    }

    #[test]
    fn merge_never_regresses_terminal_status() {
        let id = make_peer_id();
        let mut peer = Peer::new(id);
        peer.status = PeerStatus::Banned;

        let mut other = Peer::new(id);
        other.status = PeerStatus::Up;
        peer.merge(other);

        assert_eq!(peer.status, PeerStatus::Banned);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn peer_id_from_bytes_roundtrip(bytes in prop::array::uniform32(any::<u8>())) {
                let id = PeerId::from_bytes(bytes);
                prop_assert_eq!(*id.as_bytes(), bytes);
            }

            #[test]
            fn peer_id_display_parses_back(bytes in prop::array::uniform32(any::<u8>())) {
                let id = PeerId::from_bytes(bytes);
                let parsed: PeerId = id.to_string().parse().expect("parse");
                prop_assert_eq!(id, parsed);
            }
        }
    }
}
