//! Error types for keel-p2p.

use thiserror::Error;

use crate::channel::ChannelId;
use crate::peer::PeerId;
use crate::transport::Protocol;

/// Errors that can occur in P2P operations.
#[derive(Debug, Error)]
pub enum P2pError {
    /// Transport-level failure (dial, accept or stream).
    #[error("transport error: {0}")]
    Transport(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote presented a public key that does not match the expected peer.
    #[error("handshake mismatch: expected peer {expected}, got {actual}")]
    HandshakeMismatch {
        /// The peer we intended to reach.
        expected: PeerId,
        /// The peer the connection authenticated as.
        actual: PeerId,
    },

    /// The channel ID is already open.
    #[error("channel {0} is already open")]
    ChannelIdInUse(ChannelId),

    /// The channel (or the router behind it) has been closed.
    #[error("channel closed")]
    ChannelClosed,

    /// No transport is registered for the endpoint's protocol tag.
    #[error("no transport for protocol {0}")]
    UnknownProtocol(Protocol),

    /// The peer is banned and may not be contacted.
    #[error("peer {0} is banned")]
    PeerBanned(PeerId),

    /// A connection to this peer already exists.
    #[error("already connected to peer {0}")]
    AlreadyConnected(PeerId),

    /// A peer address could not be parsed or resolved.
    #[error("invalid peer address: {0}")]
    InvalidAddress(String),

    /// An outbound message exceeds the channel's declared maximum size.
    #[error("message of {size} bytes exceeds channel maximum of {max}")]
    MessageTooLarge {
        /// Encoded message size.
        size: usize,
        /// The channel's declared maximum.
        max: usize,
    },

    /// Payload encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// The envelope's routing fields are inconsistent.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(&'static str),

    /// The router is shutting down.
    #[error("router is shutting down")]
    ShuttingDown,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, P2pError>;
