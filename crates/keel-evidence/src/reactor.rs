//! The evidence gossip reactor.
//!
//! One reactor per node. It receives evidence batches from peers, feeds
//! them into the pool, and runs one broadcast task per live peer that walks
//! the pending list with its own [`Cursor`]. Broadcast tasks are keyed by
//! peer ID and cancelled the moment the peer goes down, so a flapping peer
//! never accumulates stale tasks.
//!
//! Misbehavior (undecodable payloads, invalid evidence) is reported to the
//! router as a [`PeerError`] asking for a disconnect; the reactor itself
//! never touches connections.

use keel_p2p::{
    Channel, ChannelDescriptor, ChannelId, ChannelSender, Envelope, PeerAction, PeerError, PeerId,
    PeerStatus, PeerUpdate, Router, Wrapper,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::pending::Cursor;
use crate::pool::EvidencePool;
use crate::types::{Evidence, EvidenceList, EvidenceMessage};

/// Channel ID of the evidence gossip protocol.
pub const EVIDENCE_CHANNEL_ID: ChannelId = ChannelId(0x38);

/// Largest encoded evidence message accepted on the wire: 1 MiB.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Relative priority of the evidence channel.
pub const EVIDENCE_CHANNEL_PRIORITY: u8 = 5;

/// Descriptor of the evidence channel.
#[must_use]
pub fn evidence_channel_descriptor() -> ChannelDescriptor {
    ChannelDescriptor::new(EVIDENCE_CHANNEL_ID, "evidence")
        .with_max_message_size(MAX_MESSAGE_SIZE)
        .with_priority(EVIDENCE_CHANNEL_PRIORITY)
}

/// Broadcast tuning.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// How long a broadcast task waits at the tail of the pending list
    /// before replaying it from the head.
    pub broadcast_interval: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            broadcast_interval: Duration::from_secs(10),
        }
    }
}

impl BroadcastConfig {
    /// Sets the broadcast interval.
    #[must_use]
    pub const fn with_broadcast_interval(mut self, interval: Duration) -> Self {
        self.broadcast_interval = interval;
        self
    }
}

/// The evidence reactor. Consumed by [`run`](Self::run).
pub struct EvidenceReactor<P: EvidencePool> {
    pool: Arc<P>,
    config: BroadcastConfig,
    channel: Channel<EvidenceMessage>,
    sender: ChannelSender<EvidenceMessage>,
    updates: broadcast::Receiver<PeerUpdate>,
    errors: mpsc::Sender<PeerError>,
    shutdown: watch::Receiver<bool>,
    broadcast_tasks: HashMap<PeerId, AbortHandle>,
}

impl<P: EvidencePool> EvidenceReactor<P> {
    /// Creates a reactor from its raw parts.
    #[must_use]
    pub fn new(
        pool: Arc<P>,
        config: BroadcastConfig,
        channel: Channel<EvidenceMessage>,
        updates: broadcast::Receiver<PeerUpdate>,
        errors: mpsc::Sender<PeerError>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let sender = channel.sender();
        Self {
            pool,
            config,
            channel,
            sender,
            updates,
            errors,
            shutdown,
            broadcast_tasks: HashMap::new(),
        }
    }

    /// Opens the evidence channel on a router and wires the reactor to it.
    ///
    /// Call before connecting to peers, so no status update is missed.
    ///
    /// # Errors
    ///
    /// Fails if the evidence channel cannot be opened.
    pub async fn attach(
        router: &Router,
        pool: Arc<P>,
        config: BroadcastConfig,
    ) -> keel_p2p::Result<Self> {
        let channel = router.open_channel(evidence_channel_descriptor()).await?;
        Ok(Self::new(
            pool,
            config,
            channel,
            router.peer_updates(),
            router.peer_errors(),
            router.shutdown_signal(),
        ))
    }

    /// Runs the reactor until the channel closes or shutdown is signalled.
    pub async fn run(mut self) {
        info!("evidence reactor started");
        loop {
            tokio::select! {
                inbound = self.channel.recv() => match inbound {
                    Some(Ok(envelope)) => self.handle_message(envelope).await,
                    Some(Err(err)) => {
                        self.report(err.from, format!("undecodable evidence message: {err}"))
                            .await;
                    }
                    None => break,
                },
                update = self.updates.recv() => match update {
                    Ok(update) => self.handle_update(update),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "lagged behind peer updates");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        for (_, task) in self.broadcast_tasks.drain() {
            task.abort();
        }
        info!("evidence reactor stopped");
    }

    async fn handle_message(&mut self, envelope: Envelope<EvidenceMessage>) {
        let Some(from) = envelope.from else { return };
        let list = match envelope.message.try_unwrap() {
            Ok(list) => list,
            Err(_) => {
                self.report(from, "unhandled evidence message type").await;
                return;
            }
        };

        // One bad record earns one disconnect report; the rest of the
        // batch is still processed.
        let mut reported = false;
        for evidence in list.0 {
            match self.pool.add_evidence(evidence) {
                Ok(true) => debug!(peer = %from, "evidence accepted"),
                Ok(false) => {}
                Err(e) => {
                    if !reported {
                        self.report(from, format!("sent invalid evidence: {e}")).await;
                        reported = true;
                    }
                }
            }
        }
    }

    fn handle_update(&mut self, update: PeerUpdate) {
        match update.status {
            PeerStatus::New | PeerStatus::Up => self.start_broadcast(update.peer_id),
            PeerStatus::Down | PeerStatus::Removed | PeerStatus::Banned => {
                self.stop_broadcast(update.peer_id);
            }
        }
    }

    fn start_broadcast(&mut self, peer: PeerId) {
        if self.broadcast_tasks.contains_key(&peer) {
            return;
        }
        let cursor = self.pool.pending().cursor();
        let sender = self.sender.clone();
        let interval = self.config.broadcast_interval;
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(broadcast_to_peer(peer, cursor, sender, interval, shutdown));
        self.broadcast_tasks.insert(peer, task.abort_handle());
        debug!(%peer, "evidence broadcast started");
    }

    fn stop_broadcast(&mut self, peer: PeerId) {
        if let Some(task) = self.broadcast_tasks.remove(&peer) {
            task.abort();
            debug!(%peer, "evidence broadcast stopped");
        }
    }

    async fn report(&self, peer: PeerId, reason: impl Into<String>) {
        let report = PeerError {
            peer_id: peer,
            reason: reason.into(),
            action: PeerAction::Disconnect,
        };
        if self.errors.send(report).await.is_err() {
            warn!("router error queue closed");
        }
    }
}

/// Walks the pending list for one peer, sending each entry in its own
/// single-element batch. At the tail it waits for new evidence or, after
/// the broadcast interval, replays the list from the head so a peer that
/// missed a record eventually gets it again.
async fn broadcast_to_peer(
    peer: PeerId,
    mut cursor: Cursor<Evidence>,
    sender: ChannelSender<EvidenceMessage>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let evidence = loop {
            if let Some(ev) = cursor.value() {
                break ev;
            }
            if let Some(ev) = cursor.advance() {
                break ev;
            }
            tokio::select! {
                () = cursor.next_available() => {}
                _ = shutdown.wait_for(|s| *s) => return,
            }
        };

        let message = EvidenceMessage::from(EvidenceList(vec![(*evidence).clone()]));
        if sender.send_to(peer, message).await.is_err() {
            debug!(%peer, "evidence channel closed, stopping broadcast");
            return;
        }

        tokio::select! {
            () = cursor.next_available() => { cursor.advance(); }
            () = tokio::time::sleep(interval) => cursor.reset(),
            _ = shutdown.wait_for(|s| *s) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::MemoryPool;
    use keel_p2p::LoopbackHarness;
    use tokio::task::JoinHandle;
    use tokio::time::{timeout, Instant};

    fn evidence(height: u64) -> Evidence {
        Evidence::new(height, height * 1_000, vec![height as u8; 16])
    }

    fn invalid_evidence() -> Evidence {
        let mut ev = evidence(1);
        ev.hash[0] ^= 0xff;
        ev
    }

    fn peer(seed: u8) -> PeerId {
        PeerId::from_bytes([seed; 32])
    }

    struct Harness {
        pool: Arc<MemoryPool>,
        updates_tx: broadcast::Sender<PeerUpdate>,
        errors_rx: mpsc::Receiver<PeerError>,
        shutdown_tx: watch::Sender<bool>,
        wire: LoopbackHarness,
        reactor: JoinHandle<()>,
    }

    impl Harness {
        fn peer_up(&self, id: PeerId) {
            self.updates_tx
                .send(PeerUpdate {
                    peer_id: id,
                    status: PeerStatus::Up,
                })
                .expect("reactor subscribed");
        }

        fn peer_down(&self, id: PeerId) {
            self.updates_tx
                .send(PeerUpdate {
                    peer_id: id,
                    status: PeerStatus::Down,
                })
                .expect("reactor subscribed");
        }

        async fn next_outbound(&mut self) -> Envelope<EvidenceMessage> {
            timeout(Duration::from_secs(60), self.wire.next_outbound())
                .await
                .expect("timed out waiting for outbound")
                .expect("channel closed")
        }
    }

    fn spawn_reactor() -> Harness {
        let pool = Arc::new(MemoryPool::new());
        let (channel, wire) = Channel::loopback(evidence_channel_descriptor());
        let (updates_tx, updates_rx) = broadcast::channel(16);
        let (errors_tx, errors_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let reactor = EvidenceReactor::new(
            Arc::clone(&pool),
            BroadcastConfig::default(),
            channel,
            updates_rx,
            errors_tx,
            shutdown_rx,
        );
        let reactor = tokio::spawn(reactor.run());

        Harness {
            pool,
            updates_tx,
            errors_rx,
            shutdown_tx,
            wire,
            reactor,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pending_evidence_reaches_a_new_peer() {
        let mut h = spawn_reactor();
        let p1 = peer(1);
        let ev = evidence(5);

        h.pool.add_evidence(ev.clone()).expect("add");
        h.peer_up(p1);

        let out = h.next_outbound().await;
        assert_eq!(out.to, Some(p1));
        assert_eq!(out.message, EvidenceMessage::from(EvidenceList(vec![ev])));
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_evidence_is_sent_without_waiting_for_the_interval() {
        let mut h = spawn_reactor();
        let p1 = peer(1);
        let first = evidence(1);
        let second = evidence(2);

        h.pool.add_evidence(first.clone()).expect("add");
        h.peer_up(p1);
        let out = h.next_outbound().await;
        assert_eq!(out.message, EvidenceMessage::from(EvidenceList(vec![first])));

        h.pool.add_evidence(second.clone()).expect("add");
        let out = h.next_outbound().await;
        assert_eq!(
            out.message,
            EvidenceMessage::from(EvidenceList(vec![second]))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn the_list_is_replayed_after_the_interval() {
        let mut h = spawn_reactor();
        let p1 = peer(1);
        let ev = evidence(3);

        h.pool.add_evidence(ev.clone()).expect("add");
        h.peer_up(p1);
        h.next_outbound().await;

        let before = Instant::now();
        let out = h.next_outbound().await;
        assert!(before.elapsed() >= BroadcastConfig::default().broadcast_interval);
        assert_eq!(out.to, Some(p1));
        assert_eq!(out.message, EvidenceMessage::from(EvidenceList(vec![ev])));
    }

    #[tokio::test(start_paused = true)]
    async fn each_live_peer_has_its_own_broadcast() {
        let mut h = spawn_reactor();
        let (p1, p2) = (peer(1), peer(2));
        let ev = evidence(4);

        h.pool.add_evidence(ev.clone()).expect("add");
        h.peer_up(p1);
        h.peer_up(p2);

        let mut targets = vec![
            h.next_outbound().await.to.expect("target"),
            h.next_outbound().await.to.expect("target"),
        ];
        targets.sort_unstable_by_key(|id| *id.as_bytes());
        assert_eq!(targets, vec![p1, p2]);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_down_cancels_its_broadcast() {
        let mut h = spawn_reactor();
        let p1 = peer(1);

        h.pool.add_evidence(evidence(1)).expect("add");
        h.peer_up(p1);
        h.next_outbound().await;

        h.peer_down(p1);
        tokio::time::sleep(Duration::from_millis(10)).await;

        h.pool.add_evidence(evidence(2)).expect("add");
        let silent = timeout(
            Duration::from_secs(60),
            h.wire.next_outbound::<EvidenceMessage>(),
        )
        .await;
        assert!(silent.is_err(), "broadcast kept running after peer down");
    }

    #[tokio::test(start_paused = true)]
    async fn losing_one_peer_does_not_stop_delivery_to_another() {
        let mut h = spawn_reactor();
        let (p1, p2) = (peer(1), peer(2));

        h.peer_up(p1);
        h.peer_up(p2);
        h.peer_down(p2);
        tokio::time::sleep(Duration::from_millis(10)).await;

        h.pool.add_evidence(evidence(1)).expect("add");

        // Everything from here on goes to p1 only.
        let out = h.next_outbound().await;
        assert_eq!(out.to, Some(p1));
        let out = h.next_outbound().await;
        assert_eq!(out.to, Some(p1));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_record_earns_one_disconnect_and_the_rest_is_kept() {
        let mut h = spawn_reactor();
        let from = peer(9);

        let batch = EvidenceMessage::from(EvidenceList(vec![
            invalid_evidence(),
            evidence(1),
            evidence(2),
        ]));
        h.wire.inject(from, &batch).await.expect("inject");

        let report = timeout(Duration::from_secs(5), h.errors_rx.recv())
            .await
            .expect("timeout")
            .expect("report");
        assert_eq!(report.peer_id, from);
        assert_eq!(report.action, PeerAction::Disconnect);

        timeout(Duration::from_secs(5), async {
            while h.pool.pending().len() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("valid records should still be pooled");

        assert!(h.errors_rx.try_recv().is_err(), "only one report per batch");
    }

    #[tokio::test(start_paused = true)]
    async fn garbage_payload_is_escalated_to_the_router() {
        let mut h = spawn_reactor();
        let from = peer(8);

        h.wire
            .inject_raw(from, bytes::Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]))
            .await
            .expect("inject");

        let report = timeout(Duration::from_secs(5), h.errors_rx.recv())
            .await
            .expect("timeout")
            .expect("report");
        assert_eq!(report.peer_id, from);
        assert_eq!(report.action, PeerAction::Disconnect);
    }

    #[tokio::test(start_paused = true)]
    async fn gossiped_evidence_is_deduplicated() {
        let mut h = spawn_reactor();
        let from = peer(7);
        let ev = evidence(6);

        let batch = EvidenceMessage::from(EvidenceList(vec![ev.clone(), ev]));
        h.wire.inject(from, &batch).await.expect("inject");

        timeout(Duration::from_secs(5), async {
            while h.pool.pending().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("evidence pooled");
        assert_eq!(h.pool.pending().len(), 1);
        assert!(h.errors_rx.try_recv().is_err(), "duplicates are not an offense");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_signal_stops_the_reactor() {
        let h = spawn_reactor();
        h.shutdown_tx.send(true).expect("signal");
        timeout(Duration::from_secs(5), h.reactor)
            .await
            .expect("timeout")
            .expect("join");
    }
}
