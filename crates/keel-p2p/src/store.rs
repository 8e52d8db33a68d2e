//! Peer store: the router's registry of known peers.

use std::collections::HashMap;

use crate::peer::{Peer, PeerId, PeerStatus};

/// Registry of all peers the router knows about.
///
/// The store is owned exclusively by the router. Records are merged, never
/// blindly overwritten, so addresses learned from one source are not lost
/// when the same peer shows up from another. Terminal statuses (`Removed`,
/// `Banned`) are sticky: once set they cannot be changed again.
#[derive(Debug, Default)]
pub struct PeerStore {
    peers: HashMap<PeerId, Peer>,
}

impl PeerStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of known peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Returns true if no peers are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Looks up a peer record.
    #[must_use]
    pub fn get(&self, id: &PeerId) -> Option<&Peer> {
        self.peers.get(id)
    }

    /// Returns the status of a peer, if known.
    #[must_use]
    pub fn status(&self, id: &PeerId) -> Option<PeerStatus> {
        self.peers.get(id).map(|p| p.status)
    }

    /// Returns true if the peer has been banned.
    #[must_use]
    pub fn is_banned(&self, id: &PeerId) -> bool {
        self.status(id) == Some(PeerStatus::Banned)
    }

    /// Adds a peer record, merging it into any existing record for the
    /// same peer. Returns a reference to the stored record.
    pub fn merge(&mut self, peer: Peer) -> &Peer {
        let entry = self
            .peers
            .entry(peer.id)
            .or_insert_with(|| Peer::new(peer.id));
        entry.merge(peer);
        entry
    }

    /// Transitions a peer to a new status.
    ///
    /// Returns the new status if the transition was applied, or `None` if
    /// the peer is unknown or already in a terminal status. Transitioning
    /// an unknown peer never creates a record.
    pub fn set_status(&mut self, id: &PeerId, status: PeerStatus) -> Option<PeerStatus> {
        let peer = self.peers.get_mut(id)?;
        if peer.status.is_terminal() {
            return None;
        }
        peer.status = status;
        Some(status)
    }

    /// Forgets a peer entirely, returning its record.
    ///
    /// Unlike a `Banned` status this is not sticky: a removed peer that
    /// shows up again starts over as `New`.
    pub fn remove(&mut self, id: &PeerId) -> Option<Peer> {
        self.peers.remove(id)
    }

    /// Iterates over all peer records.
    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }
}
