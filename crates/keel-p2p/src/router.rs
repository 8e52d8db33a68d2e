//! The message router.
//!
//! The router owns every peer connection and all peer state. Reactors talk
//! to it through three narrow surfaces:
//!
//! - typed [`Channel`]s opened with [`Router::open_channel`]
//! - a [`PeerUpdate`] broadcast subscribed with [`Router::peer_updates`]
//! - a [`PeerError`] queue obtained from [`Router::peer_errors`], through
//!   which reactors request disconnects and bans
//!
//! Internally the router runs one accept loop per transport, two stream
//! tasks per (peer, channel) pair, and one routing task per channel. All
//! queues are bounded; when one is full the new frame is dropped and the
//! drop is logged, so a slow peer or reactor never blocks the rest of the
//! node.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::AbortHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::channel::{
    Channel, ChannelCloser, ChannelDescriptor, ChannelId, ChannelMessage, InboundFrame,
    OutboundFrame,
};
use crate::error::{P2pError, Result};
use crate::peer::{Peer, PeerAction, PeerAddress, PeerError, PeerId, PeerStatus, PeerUpdate};
use crate::store::PeerStore;
use crate::transport::{Connection, Endpoint, Protocol, Transport};

/// Absolute cap on a wire frame, independent of any channel's limit.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// How long a single dial attempt may take.
    pub dial_timeout: Duration,
    /// Capacity of the peer-update broadcast. Subscribers that fall more
    /// than this many updates behind observe a lag instead of blocking the
    /// router.
    pub update_capacity: usize,
    /// Capacity of the peer-error queue.
    pub error_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
            update_capacity: 128,
            error_capacity: 64,
        }
    }
}

impl RouterConfig {
    /// Sets the dial timeout.
    #[must_use]
    pub const fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Sets the peer-update broadcast capacity.
    #[must_use]
    pub const fn with_update_capacity(mut self, capacity: usize) -> Self {
        self.update_capacity = capacity;
        self
    }

    /// Sets the peer-error queue capacity.
    #[must_use]
    pub const fn with_error_capacity(mut self, capacity: usize) -> Self {
        self.error_capacity = capacity;
        self
    }
}

struct ChannelEntry {
    descriptor: ChannelDescriptor,
    inbound_tx: mpsc::Sender<InboundFrame>,
    routing_abort: AbortHandle,
}

struct ConnChannel {
    out_tx: mpsc::Sender<Bytes>,
    tasks: [AbortHandle; 2],
}

struct ConnHandle {
    conn: Arc<dyn Connection>,
    channels: HashMap<ChannelId, ConnChannel>,
}

struct RouterInner {
    config: RouterConfig,
    transports: HashMap<Protocol, Arc<dyn Transport>>,
    store: Mutex<PeerStore>,
    channels: Mutex<HashMap<ChannelId, ChannelEntry>>,
    conns: Mutex<HashMap<PeerId, ConnHandle>>,
    updates_tx: broadcast::Sender<PeerUpdate>,
    errors_tx: mpsc::Sender<PeerError>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<AbortHandle>>,
}

/// Handle to a running router. Cheap to clone.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    /// Starts a router over the given transports.
    ///
    /// One accept loop is spawned per transport, so this must be called
    /// from within a tokio runtime.
    #[must_use]
    pub fn new(config: RouterConfig, transports: Vec<Arc<dyn Transport>>) -> Self {
        let (updates_tx, _) = broadcast::channel(config.update_capacity);
        let (errors_tx, mut errors_rx) = mpsc::channel(config.error_capacity);
        let (shutdown_tx, _) = watch::channel(false);

        let transports: HashMap<Protocol, Arc<dyn Transport>> = transports
            .into_iter()
            .map(|t| (t.protocol(), t))
            .collect();

        let inner = Arc::new(RouterInner {
            config,
            transports,
            store: Mutex::new(PeerStore::new()),
            channels: Mutex::new(HashMap::new()),
            conns: Mutex::new(HashMap::new()),
            updates_tx,
            errors_tx,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();

        // One accept loop per transport.
        for transport in inner.transports.values() {
            let transport = Arc::clone(transport);
            let weak = Arc::downgrade(&inner);
            let mut shutdown_rx = inner.shutdown_tx.subscribe();
            let task = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        res = transport.accept() => match res {
                            Ok(conn) => {
                                let Some(inner) = weak.upgrade() else { break };
                                let conn: Arc<dyn Connection> = Arc::from(conn);
                                if let Err(e) =
                                    RouterInner::install_connection(&inner, conn).await
                                {
                                    debug!(error = %e, "rejected inbound connection");
                                }
                            }
                            Err(e) => {
                                debug!(error = %e, "accept failed, stopping accept loop");
                                break;
                            }
                        },
                        _ = shutdown_rx.changed() => break,
                    }
                }
            });
            tasks.push(task.abort_handle());
        }

        // Peer-error consumer: turns reactor verdicts into router actions.
        {
            let weak = Arc::downgrade(&inner);
            let task = tokio::spawn(async move {
                while let Some(report) = errors_rx.recv().await {
                    let Some(inner) = weak.upgrade() else { break };
                    inner.handle_peer_error(report);
                }
            });
            tasks.push(task.abort_handle());
        }

        *inner.tasks.lock() = tasks;
        Self { inner }
    }

    /// Opens a typed channel.
    ///
    /// The channel's stream is attached to every current connection and to
    /// every connection established later. Channel IDs are exclusive while
    /// the channel is alive; dropping the channel releases the ID. Note
    /// that a connection keeps a stream ID taken even after the channel is
    /// dropped, so a reopened channel only attaches to connections made
    /// after the reopen.
    ///
    /// # Errors
    ///
    /// Fails if the ID is already open or the router is shutting down.
    pub async fn open_channel<M: ChannelMessage>(
        &self,
        descriptor: ChannelDescriptor,
    ) -> Result<Channel<M>> {
        if *self.inner.shutdown_tx.borrow() {
            return Err(P2pError::ShuttingDown);
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(descriptor.queue_capacity);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundFrame>(descriptor.queue_capacity);

        {
            let mut channels = self.inner.channels.lock();
            if channels.contains_key(&descriptor.id) {
                return Err(P2pError::ChannelIdInUse(descriptor.id));
            }

            let channel_id = descriptor.id;
            let weak = Arc::downgrade(&self.inner);
            let routing = tokio::spawn(async move {
                while let Some(frame) = outbound_rx.recv().await {
                    let Some(inner) = weak.upgrade() else { break };
                    inner.route_frame(channel_id, frame);
                }
            });

            channels.insert(
                descriptor.id,
                ChannelEntry {
                    descriptor: descriptor.clone(),
                    inbound_tx: inbound_tx.clone(),
                    routing_abort: routing.abort_handle(),
                },
            );
        }

        // Retrofit the channel onto connections that already exist.
        let existing: Vec<(PeerId, Arc<dyn Connection>)> = self
            .inner
            .conns
            .lock()
            .iter()
            .map(|(id, handle)| (*id, Arc::clone(&handle.conn)))
            .collect();
        for (peer, conn) in existing {
            if let Err(e) =
                RouterInner::attach_channel(&self.inner, peer, &conn, &descriptor, inbound_tx.clone())
                    .await
            {
                debug!(%peer, channel = %descriptor.id, error = %e, "failed to attach channel");
            }
        }

        info!(channel = %descriptor.id, name = descriptor.name, "channel open");

        let closer = ChannelCloser::new({
            let weak = Arc::downgrade(&self.inner);
            let id = descriptor.id;
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.release_channel(id);
                }
            }
        });
        Ok(Channel::new(descriptor, inbound_rx, outbound_tx, Some(closer)))
    }

    /// Records a peer address without connecting.
    ///
    /// The address must carry a peer ID. If the peer was previously
    /// unknown, a `New` update is published.
    ///
    /// # Errors
    ///
    /// Fails if the address names no peer ID.
    pub fn add_peer(&self, address: PeerAddress) -> Result<PeerId> {
        let Some(id) = address.peer_id else {
            return Err(P2pError::InvalidAddress(format!(
                "{address} does not name a peer id"
            )));
        };
        let newly_known = {
            let mut store = self.inner.store.lock();
            let newly_known = store.status(&id).is_none();
            let mut record = Peer::new(id);
            record.add_address(address);
            store.merge(record);
            newly_known
        };
        if newly_known {
            self.inner.publish(PeerUpdate {
                peer_id: id,
                status: PeerStatus::New,
            });
        }
        Ok(id)
    }

    /// Dials a peer address and installs the connection.
    ///
    /// The address is resolved to endpoints, which are tried in order. If
    /// the address names a peer ID, the key the remote authenticates with
    /// must match it.
    ///
    /// # Errors
    ///
    /// Fails if the peer is banned, resolution yields nothing, or every
    /// endpoint dial fails.
    pub async fn connect(&self, address: PeerAddress) -> Result<PeerId> {
        if *self.inner.shutdown_tx.borrow() {
            return Err(P2pError::ShuttingDown);
        }
        if let Some(expected) = address.peer_id {
            if self.inner.store.lock().is_banned(&expected) {
                return Err(P2pError::PeerBanned(expected));
            }
        }

        let endpoints = address.resolve().await?;
        if endpoints.is_empty() {
            return Err(P2pError::InvalidAddress(format!(
                "{address} resolved to no endpoints"
            )));
        }

        let mut last_err = P2pError::Transport(format!("no dialable endpoints for {address}"));
        for endpoint in endpoints {
            match self.dial_endpoint(&address, &endpoint).await {
                Ok(peer) => return Ok(peer),
                Err(e) => {
                    debug!(%endpoint, error = %e, "dial failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn dial_endpoint(&self, address: &PeerAddress, endpoint: &Endpoint) -> Result<PeerId> {
        let transport = self
            .inner
            .transports
            .get(&endpoint.protocol)
            .ok_or_else(|| P2pError::UnknownProtocol(endpoint.protocol.clone()))?;

        let conn = tokio::time::timeout(self.inner.config.dial_timeout, transport.dial(endpoint))
            .await
            .map_err(|_| P2pError::Transport(format!("dial timeout for {endpoint}")))??;

        let actual = PeerId::from_public_key(&conn.remote_public_key());
        if let Some(expected) = address.peer_id {
            if expected != actual {
                let _ = conn.close().await;
                return Err(P2pError::HandshakeMismatch { expected, actual });
            }
        }

        let newly_known = {
            let mut store = self.inner.store.lock();
            let newly_known = store.status(&actual).is_none();
            let mut record = Peer::new(actual);
            record.add_address(address.clone());
            record.add_endpoints(address.clone(), vec![endpoint.clone()]);
            store.merge(record);
            newly_known
        };
        if newly_known {
            self.inner.publish(PeerUpdate {
                peer_id: actual,
                status: PeerStatus::New,
            });
        }

        let conn: Arc<dyn Connection> = Arc::from(conn);
        RouterInner::install_connection(&self.inner, conn).await
    }

    /// Closes the connection to a peer, marking it `Down`.
    pub fn disconnect(&self, peer: PeerId) {
        self.inner.disconnect_peer(peer);
    }

    /// Removes a peer: closes its connection, publishes `Removed`, and
    /// forgets its record. Unlike a ban, the peer may come back later.
    pub fn remove_peer(&self, peer: PeerId) {
        self.inner.drop_connection(peer);
        self.inner.transition(peer, PeerStatus::Removed);
        self.inner.store.lock().remove(&peer);
        info!(%peer, "peer removed");
    }

    /// Bans a peer: closes its connection and refuses future ones.
    pub fn ban(&self, peer: PeerId) {
        self.inner.ban_peer(peer);
    }

    /// Returns the current status of a peer, if known.
    #[must_use]
    pub fn peer_status(&self, peer: &PeerId) -> Option<PeerStatus> {
        self.inner.store.lock().status(peer)
    }

    /// Subscribes to peer status updates.
    ///
    /// Subscribe before triggering connections, or early updates may be
    /// missed. A subscriber that falls behind sees
    /// [`broadcast::error::RecvError::Lagged`] and should resync from
    /// [`Router::peer_status`] rather than treat it as fatal.
    #[must_use]
    pub fn peer_updates(&self) -> broadcast::Receiver<PeerUpdate> {
        self.inner.updates_tx.subscribe()
    }

    /// Returns the queue through which reactors report peer misbehavior.
    #[must_use]
    pub fn peer_errors(&self) -> mpsc::Sender<PeerError> {
        self.inner.errors_tx.clone()
    }

    /// Returns a shutdown signal that flips to `true` when the router
    /// stops.
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown_tx.subscribe()
    }

    /// Shuts the router down: stops accepting, closes every connection and
    /// channel, and closes the transports. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.shutdown_tx.send_replace(true) {
            return;
        }
        info!("router shutting down");

        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }

        let channel_ids: Vec<ChannelId> = self.inner.channels.lock().keys().copied().collect();
        for id in channel_ids {
            self.inner.release_channel(id);
        }

        let peers: Vec<PeerId> = self.inner.conns.lock().keys().copied().collect();
        let mut conns = Vec::new();
        for peer in peers {
            if let Some(handle) = self.inner.conns.lock().remove(&peer) {
                for cc in handle.channels.into_values() {
                    for task in cc.tasks {
                        task.abort();
                    }
                }
                conns.push(handle.conn);
            }
        }
        for conn in conns {
            let _ = conn.close().await;
        }

        for transport in self.inner.transports.values() {
            let _ = transport.close().await;
        }
    }
}

impl RouterInner {
    fn publish(&self, update: PeerUpdate) {
        // A send error only means no subscribers right now.
        let _ = self.updates_tx.send(update);
    }

    /// Installs an authenticated connection: admission checks, store
    /// bookkeeping, status updates, and stream attachment for every open
    /// channel.
    async fn install_connection(
        inner: &Arc<Self>,
        conn: Arc<dyn Connection>,
    ) -> Result<PeerId> {
        let peer = PeerId::from_public_key(&conn.remote_public_key());

        let banned = inner.store.lock().is_banned(&peer);
        if banned {
            let _ = conn.close().await;
            return Err(P2pError::PeerBanned(peer));
        }

        let duplicate = {
            let mut conns = inner.conns.lock();
            if conns.contains_key(&peer) {
                true
            } else {
                conns.insert(
                    peer,
                    ConnHandle {
                        conn: Arc::clone(&conn),
                        channels: HashMap::new(),
                    },
                );
                false
            }
        };
        if duplicate {
            let _ = conn.close().await;
            return Err(P2pError::AlreadyConnected(peer));
        }

        let newly_known = {
            let mut store = inner.store.lock();
            let newly_known = store.status(&peer).is_none();
            store.merge(Peer::new(peer));
            store.set_status(&peer, PeerStatus::Up);
            newly_known
        };
        if newly_known {
            inner.publish(PeerUpdate {
                peer_id: peer,
                status: PeerStatus::New,
            });
        }
        inner.publish(PeerUpdate {
            peer_id: peer,
            status: PeerStatus::Up,
        });
        info!(%peer, endpoint = %conn.remote_endpoint(), "peer up");

        let open_channels: Vec<(ChannelDescriptor, mpsc::Sender<InboundFrame>)> = inner
            .channels
            .lock()
            .values()
            .map(|entry| (entry.descriptor.clone(), entry.inbound_tx.clone()))
            .collect();
        for (descriptor, inbound_tx) in open_channels {
            if let Err(e) =
                Self::attach_channel(inner, peer, &conn, &descriptor, inbound_tx).await
            {
                debug!(%peer, channel = %descriptor.id, error = %e, "failed to attach channel");
            }
        }

        Ok(peer)
    }

    /// Takes the channel's stream on a connection and spawns its read and
    /// write tasks.
    async fn attach_channel(
        inner: &Arc<Self>,
        peer: PeerId,
        conn: &Arc<dyn Connection>,
        descriptor: &ChannelDescriptor,
        inbound_tx: mpsc::Sender<InboundFrame>,
    ) -> Result<()> {
        let stream = conn.take_stream(descriptor.id.stream_id()).await?;
        let (read_half, write_half) = tokio::io::split(stream);

        let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(descriptor.queue_capacity);

        let write_task = tokio::spawn(async move {
            let mut framed = FramedWrite::new(write_half, frame_codec());
            while let Some(payload) = out_rx.recv().await {
                if let Err(e) = framed.send(payload).await {
                    debug!(error = %e, "stream write failed");
                    break;
                }
            }
        });

        let channel_id = descriptor.id;
        let max_message_size = descriptor.max_message_size;
        let weak = Arc::downgrade(inner);
        let read_task = tokio::spawn(async move {
            let mut framed = FramedRead::new(read_half, frame_codec());
            loop {
                match framed.next().await {
                    Some(Ok(bytes)) => {
                        if bytes.len() > max_message_size {
                            warn!(
                                %peer,
                                channel = %channel_id,
                                size = bytes.len(),
                                max = max_message_size,
                                "dropping oversized frame"
                            );
                            continue;
                        }
                        let frame = InboundFrame {
                            from: peer,
                            payload: bytes.freeze(),
                        };
                        if inbound_tx.try_send(frame).is_err() {
                            warn!(%peer, channel = %channel_id, "inbound queue full, dropping frame");
                        }
                    }
                    Some(Err(e)) => {
                        debug!(%peer, channel = %channel_id, error = %e, "stream read failed");
                        break;
                    }
                    None => break,
                }
            }
            // EOF or read failure means the connection is gone.
            if let Some(inner) = weak.upgrade() {
                inner.disconnect_peer(peer);
            }
        });

        let conn_channel = ConnChannel {
            out_tx,
            tasks: [read_task.abort_handle(), write_task.abort_handle()],
        };
        let mut conns = inner.conns.lock();
        if let Some(handle) = conns.get_mut(&peer) {
            handle.channels.insert(channel_id, conn_channel);
        } else {
            // Connection vanished while we were attaching.
            for task in conn_channel.tasks {
                task.abort();
            }
        }
        Ok(())
    }

    /// Delivers one outbound frame to its target queues. Full queues drop
    /// the frame rather than block.
    fn route_frame(&self, channel_id: ChannelId, frame: OutboundFrame) {
        let conns = self.conns.lock();
        if frame.broadcast {
            for (peer, handle) in conns.iter() {
                if let Some(cc) = handle.channels.get(&channel_id) {
                    if cc.out_tx.try_send(frame.payload.clone()).is_err() {
                        warn!(%peer, channel = %channel_id, "outbound queue full, dropping frame");
                    }
                }
            }
        } else if let Some(to) = frame.to {
            match conns.get(&to).and_then(|h| h.channels.get(&channel_id)) {
                Some(cc) => {
                    if cc.out_tx.try_send(frame.payload).is_err() {
                        warn!(peer = %to, channel = %channel_id, "outbound queue full, dropping frame");
                    }
                }
                None => {
                    debug!(peer = %to, channel = %channel_id, "dropping frame for unconnected peer");
                }
            }
        } else {
            debug!(channel = %channel_id, "dropping frame with no destination");
        }
    }

    fn handle_peer_error(&self, report: PeerError) {
        match report.action {
            PeerAction::None => {
                debug!(peer = %report.peer_id, reason = %report.reason, "peer error");
            }
            PeerAction::Disconnect => {
                warn!(peer = %report.peer_id, reason = %report.reason, "disconnecting peer");
                self.disconnect_peer(report.peer_id);
            }
            PeerAction::Ban => {
                warn!(peer = %report.peer_id, reason = %report.reason, "banning peer");
                self.ban_peer(report.peer_id);
            }
        }
    }

    fn disconnect_peer(&self, peer: PeerId) {
        if self.drop_connection(peer) {
            self.transition(peer, PeerStatus::Down);
            info!(%peer, "peer down");
        }
    }

    fn ban_peer(&self, peer: PeerId) {
        self.drop_connection(peer);
        self.store.lock().merge(Peer::new(peer));
        self.transition(peer, PeerStatus::Banned);
    }

    /// Tears down the peer's connection state. Returns true if a
    /// connection existed. Safe to call from multiple stream tasks; only
    /// the first caller wins.
    fn drop_connection(&self, peer: PeerId) -> bool {
        let Some(handle) = self.conns.lock().remove(&peer) else {
            return false;
        };
        for cc in handle.channels.into_values() {
            for task in cc.tasks {
                task.abort();
            }
        }
        let conn = handle.conn;
        tokio::spawn(async move {
            let _ = conn.close().await;
        });
        true
    }

    /// Applies a status transition and publishes it, unless the peer is
    /// unknown or already terminal.
    fn transition(&self, peer: PeerId, status: PeerStatus) {
        let applied = self.store.lock().set_status(&peer, status);
        if applied.is_some() {
            self.publish(PeerUpdate {
                peer_id: peer,
                status,
            });
        }
    }

    /// Frees a channel ID: stops its routing task and the per-connection
    /// stream tasks.
    fn release_channel(&self, id: ChannelId) {
        if let Some(entry) = self.channels.lock().remove(&id) {
            entry.routing_abort.abort();
        }
        let mut conns = self.conns.lock();
        for handle in conns.values_mut() {
            if let Some(cc) = handle.channels.remove(&id) {
                for task in cc.tasks {
                    task.abort();
                }
            }
        }
        debug!(channel = %id, "channel released");
    }
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
