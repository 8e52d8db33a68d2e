//! Peer-to-peer substrate for keel nodes.
//!
//! The crate is split along one hard boundary: the [`Router`] owns all
//! connections and peer state, and reactors (the protocol state machines
//! living in other crates) only ever see typed [`Channel`]s, a stream of
//! [`PeerUpdate`]s, and a queue for [`PeerError`] verdicts. Reactors never
//! hold connections and the router never decodes messages.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use keel_p2p::{
//!     Channel, ChannelDescriptor, ChannelId, Envelope, Router, RouterConfig,
//! };
//! use keel_p2p::transport::memory::MemoryNetwork;
//! use keel_p2p::transport::Transport;
//!
//! # #[derive(serde::Serialize, serde::Deserialize)]
//! # struct MyMessage(u64);
//! # async fn run(key: ed25519_dalek::VerifyingKey) -> keel_p2p::Result<()> {
//! let network = MemoryNetwork::new();
//! let transport = network.create_transport("local", key)?;
//! let router = Router::new(
//!     RouterConfig::default(),
//!     vec![Arc::new(transport) as Arc<dyn Transport>],
//! );
//!
//! let channel: Channel<MyMessage> = router
//!     .open_channel(ChannelDescriptor::new(ChannelId(0x01), "my-protocol"))
//!     .await?;
//! channel.send(Envelope::broadcast(MyMessage(42))).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod channel;
pub mod error;
pub mod peer;
pub mod router;
pub mod store;
pub mod transport;

pub use channel::{
    Channel, ChannelDescriptor, ChannelId, ChannelMessage, ChannelSender, Envelope, InboundError,
    LoopbackHarness, Wrapper,
};
pub use error::{P2pError, Result};
pub use peer::{
    Peer, PeerAction, PeerAddress, PeerError, PeerId, PeerPriority, PeerStatus, PeerUpdate,
};
pub use router::{Router, RouterConfig};
pub use store::PeerStore;
pub use transport::{Connection, Endpoint, Protocol, StreamId, Transport};
