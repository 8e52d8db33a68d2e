//! Typed channels.
//!
//! A channel is a named, typed lane over every peer connection. Reactors
//! exchange [`Envelope`]s of their message type; the channel encodes them to
//! bytes and hands erased frames to the router, which owns delivery. Inbound
//! frames are decoded back into envelopes tagged with the sender's
//! [`PeerId`].

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::{P2pError, Result};
use crate::peer::PeerId;
use crate::transport::StreamId;

/// Identifier of a channel, unique within a router.
///
/// Channel IDs map one-to-one onto transport stream IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u8);

impl ChannelId {
    /// The stream ID this channel occupies on every connection.
    #[must_use]
    pub const fn stream_id(self) -> StreamId {
        StreamId(self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Default maximum encoded message size: 1 MiB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default depth of the per-channel inbound and per-peer outbound queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 128;

/// Static description of a channel: its ID, name and limits.
#[derive(Debug, Clone)]
pub struct ChannelDescriptor {
    /// The channel's ID.
    pub id: ChannelId,
    /// Human-readable name used in logs.
    pub name: &'static str,
    /// Maximum encoded message size in bytes. Outbound messages above this
    /// are rejected at send; inbound frames above it are dropped.
    pub max_message_size: usize,
    /// Depth of the channel's bounded queues.
    pub queue_capacity: usize,
    /// Relative priority among channels. Advisory metadata; queues are
    /// FIFO per channel.
    pub priority: u8,
}

impl ChannelDescriptor {
    /// Creates a descriptor with default limits.
    #[must_use]
    pub const fn new(id: ChannelId, name: &'static str) -> Self {
        Self {
            id,
            name,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            priority: 0,
        }
    }

    /// Sets the maximum encoded message size.
    #[must_use]
    pub const fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// Sets the queue depth.
    #[must_use]
    pub const fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Sets the relative priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

/// Marker for types that can travel over a channel.
///
/// Blanket-implemented for anything serde can move and tokio can send.
pub trait ChannelMessage: Serialize + DeserializeOwned + Send + 'static {}

impl<T: Serialize + DeserializeOwned + Send + 'static> ChannelMessage for T {}

/// A container message type that wraps an inner message type.
///
/// Channels carry exactly one message type; reactors that define several
/// inner types give the channel a wrapper enum and convert at the edges.
pub trait Wrapper<I>: ChannelMessage + From<I> {
    /// Unwraps the inner message, or returns `self` if this variant does
    /// not carry one.
    fn try_unwrap(self) -> std::result::Result<I, Self>
    where
        Self: Sized;
}

/// A message together with its routing metadata.
///
/// Exactly one of `to` and `broadcast` must be set on outbound envelopes.
/// On inbound envelopes `from` names the sender and the routing fields are
/// clear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope<M> {
    /// Sender, set on inbound envelopes.
    pub from: Option<PeerId>,
    /// Target peer, for point-to-point sends.
    pub to: Option<PeerId>,
    /// Send to all live peers instead of one.
    pub broadcast: bool,
    /// The message itself.
    pub message: M,
}

impl<M> Envelope<M> {
    /// An envelope addressed to a single peer.
    #[must_use]
    pub const fn to(peer: PeerId, message: M) -> Self {
        Self {
            from: None,
            to: Some(peer),
            broadcast: false,
            message,
        }
    }

    /// An envelope addressed to all live peers.
    #[must_use]
    pub const fn broadcast(message: M) -> Self {
        Self {
            from: None,
            to: None,
            broadcast: true,
            message,
        }
    }

    /// Maps the message, keeping the routing metadata.
    pub fn map<N>(self, f: impl FnOnce(M) -> N) -> Envelope<N> {
        Envelope {
            from: self.from,
            to: self.to,
            broadcast: self.broadcast,
            message: f(self.message),
        }
    }
}

/// An inbound frame the typed layer could not decode.
///
/// Carries the sender so the reactor can report the peer to the router.
#[derive(Debug, Error)]
#[error("bad message from {from}: {error}")]
pub struct InboundError {
    /// The peer whose frame failed to decode.
    pub from: PeerId,
    /// The decode failure.
    pub error: P2pError,
}

/// An inbound payload, already attributed to its sender.
#[derive(Debug, Clone)]
pub(crate) struct InboundFrame {
    pub(crate) from: PeerId,
    pub(crate) payload: Bytes,
}

/// An outbound payload plus routing metadata, handed to the router.
#[derive(Debug, Clone)]
pub(crate) struct OutboundFrame {
    pub(crate) to: Option<PeerId>,
    pub(crate) broadcast: bool,
    pub(crate) payload: Bytes,
}

/// Runs a cleanup closure when the channel is dropped.
pub(crate) struct ChannelCloser(Option<Box<dyn FnOnce() + Send + Sync>>);

impl ChannelCloser {
    pub(crate) fn new(f: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self(Some(Box::new(f)))
    }
}

impl Drop for ChannelCloser {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

/// Cloneable sending half of a channel.
pub struct ChannelSender<M> {
    descriptor: ChannelDescriptor,
    outbound_tx: mpsc::Sender<OutboundFrame>,
    _marker: PhantomData<fn(M)>,
}

impl<M> Clone for ChannelSender<M> {
    fn clone(&self) -> Self {
        Self {
            descriptor: self.descriptor.clone(),
            outbound_tx: self.outbound_tx.clone(),
            _marker: PhantomData,
        }
    }
}

impl<M: ChannelMessage> ChannelSender<M> {
    /// Sends an envelope.
    ///
    /// # Errors
    ///
    /// Fails if the envelope's routing fields are inconsistent, the encoded
    /// message exceeds the channel's size limit, encoding fails, or the
    /// router has shut down.
    pub async fn send(&self, envelope: Envelope<M>) -> Result<()> {
        if envelope.to.is_some() == envelope.broadcast {
            return Err(P2pError::InvalidEnvelope(
                "exactly one of to and broadcast must be set",
            ));
        }

        let encoded =
            bincode::serialize(&envelope.message).map_err(|e| P2pError::Codec(e.to_string()))?;
        if encoded.len() > self.descriptor.max_message_size {
            return Err(P2pError::MessageTooLarge {
                size: encoded.len(),
                max: self.descriptor.max_message_size,
            });
        }

        let frame = OutboundFrame {
            to: envelope.to,
            broadcast: envelope.broadcast,
            payload: Bytes::from(encoded),
        };
        self.outbound_tx
            .send(frame)
            .await
            .map_err(|_| P2pError::ChannelClosed)
    }

    /// Sends a message to a single peer.
    pub async fn send_to(&self, peer: PeerId, message: M) -> Result<()> {
        self.send(Envelope::to(peer, message)).await
    }

    /// Sends a message to all live peers.
    pub async fn broadcast(&self, message: M) -> Result<()> {
        self.send(Envelope::broadcast(message)).await
    }

    /// Wraps an inner message into the channel's container and sends it.
    pub async fn send_wrapped<I>(&self, envelope: Envelope<I>) -> Result<()>
    where
        M: Wrapper<I>,
    {
        self.send(envelope.map(M::from)).await
    }
}

/// A typed channel handle held by a reactor.
///
/// Dropping the channel releases its ID, so it can be opened again.
pub struct Channel<M> {
    descriptor: ChannelDescriptor,
    inbound_rx: mpsc::Receiver<InboundFrame>,
    sender: ChannelSender<M>,
    _closer: Option<ChannelCloser>,
}

impl<M> fmt::Debug for Channel<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl<M: ChannelMessage> Channel<M> {
    pub(crate) fn new(
        descriptor: ChannelDescriptor,
        inbound_rx: mpsc::Receiver<InboundFrame>,
        outbound_tx: mpsc::Sender<OutboundFrame>,
        closer: Option<ChannelCloser>,
    ) -> Self {
        let sender = ChannelSender {
            descriptor: descriptor.clone(),
            outbound_tx,
            _marker: PhantomData,
        };
        Self {
            descriptor,
            inbound_rx,
            sender,
            _closer: closer,
        }
    }

    /// The channel's descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &ChannelDescriptor {
        &self.descriptor
    }

    /// Returns a cloneable sender for this channel.
    #[must_use]
    pub fn sender(&self) -> ChannelSender<M> {
        self.sender.clone()
    }

    /// Sends an envelope. See [`ChannelSender::send`].
    pub async fn send(&self, envelope: Envelope<M>) -> Result<()> {
        self.sender.send(envelope).await
    }

    /// Wraps an inner message into the channel's container and sends it.
    pub async fn send_wrapped<I>(&self, envelope: Envelope<I>) -> Result<()>
    where
        M: Wrapper<I>,
    {
        self.sender.send_wrapped(envelope).await
    }

    /// Closes the channel, releasing its ID. Equivalent to dropping it.
    pub fn close(self) {}

    /// Receives the next inbound envelope.
    ///
    /// Returns `None` once the router has shut down. A frame that fails to
    /// decode yields an [`InboundError`] naming the sender; the channel
    /// stays usable.
    pub async fn recv(&mut self) -> Option<std::result::Result<Envelope<M>, InboundError>> {
        let frame = self.inbound_rx.recv().await?;
        match bincode::deserialize::<M>(&frame.payload) {
            Ok(message) => Some(Ok(Envelope {
                from: Some(frame.from),
                to: None,
                broadcast: false,
                message,
            })),
            Err(e) => Some(Err(InboundError {
                from: frame.from,
                error: P2pError::Codec(e.to_string()),
            })),
        }
    }

    /// Creates a channel not attached to any router, for testing.
    ///
    /// The returned [`LoopbackHarness`] plays the router's part: it injects
    /// inbound frames and observes outbound ones.
    #[must_use]
    pub fn loopback(descriptor: ChannelDescriptor) -> (Self, LoopbackHarness) {
        let (inbound_tx, inbound_rx) = mpsc::channel(descriptor.queue_capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(descriptor.queue_capacity);
        let channel = Self::new(descriptor, inbound_rx, outbound_tx, None);
        let harness = LoopbackHarness {
            inbound_tx,
            outbound_rx,
        };
        (channel, harness)
    }
}

/// The router's side of a [`Channel::loopback`] pair.
pub struct LoopbackHarness {
    inbound_tx: mpsc::Sender<InboundFrame>,
    outbound_rx: mpsc::Receiver<OutboundFrame>,
}

impl LoopbackHarness {
    /// Injects a typed message as if `from` had sent it.
    pub async fn inject<M: ChannelMessage>(&self, from: PeerId, message: &M) -> Result<()> {
        let payload =
            bincode::serialize(message).map_err(|e| P2pError::Codec(e.to_string()))?;
        self.inject_raw(from, Bytes::from(payload)).await
    }

    /// Injects a raw payload as if `from` had sent it.
    pub async fn inject_raw(&self, from: PeerId, payload: Bytes) -> Result<()> {
        self.inbound_tx
            .send(InboundFrame { from, payload })
            .await
            .map_err(|_| P2pError::ChannelClosed)
    }

    /// Waits for the next outbound envelope and decodes it.
    ///
    /// Returns `None` once the channel is dropped.
    pub async fn next_outbound<M: ChannelMessage>(&mut self) -> Option<Envelope<M>> {
        let frame = self.outbound_rx.recv().await?;
        let message = bincode::deserialize(&frame.payload).ok()?;
        Some(Envelope {
            from: None,
            to: frame.to,
            broadcast: frame.broadcast,
            message,
        })
    }
}
