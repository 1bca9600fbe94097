//! Per-space replication sessions over a shared messenger.
//!
//! The [`SpaceReplicator`] tracks which spaces the local peer is interested
//! in and keeps at most one replication connection per space. Outbound sync
//! frames go through a bounded queue and a forwarding task that envelopes
//! them for the shared messenger; inbound envelopes are demultiplexed by
//! service id and handed to the matching connection. Traffic for spaces this
//! peer does not replicate is dropped without feedback to the sender.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use bytes::Bytes;
use futures_lite::future::Boxed as BoxedFuture;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, trace, warn};

use crate::{
    keys::{CollectionId, PublicKey, SpaceId},
    metrics::Metrics,
    proto::{self, Envelope, SpaceFrame},
};

/// Capacity of the outbound frame queue per connection.
pub const SEND_QUEUE_CAP: usize = 64;
/// Capacity of the inbound frame queue per connection.
pub const RECV_QUEUE_CAP: usize = 64;
/// Capacity of the replicator event channel.
const EVENT_CAP: usize = 64;

/// Transport the replicator sends envelopes through.
///
/// The returned futures must not borrow the receiver; implementors clone
/// shared state into them.
pub trait Messenger: Send + Sync + 'static {
    /// Send one envelope to the connected peer.
    fn send(&self, envelope: Envelope) -> BoxedFuture<anyhow::Result<()>>;
}

/// Peer context a replicator attaches to.
#[derive(Clone, derive_more::Debug)]
pub struct ReplicatorContext {
    /// Shared messenger for the peer connection.
    #[debug("Messenger")]
    pub messenger: Arc<dyn Messenger>,
    /// Local identity key, stamped on outbound envelopes.
    pub identity_key: PublicKey,
    /// Local device key, stamped on outbound envelopes.
    pub device_key: PublicKey,
}

/// Errors of the replicator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicatorError {
    /// The outbound queue for a space is full.
    #[error("outbound queue for space {space_id} is full")]
    QueueFull {
        /// The space whose queue is full.
        space_id: SpaceId,
    },
    /// The connection for a space is closed.
    #[error("connection for space {space_id} is closed")]
    Closed {
        /// The space whose connection closed.
        space_id: SpaceId,
    },
}

/// Events emitted by a [`SpaceReplicator`].
#[derive(Debug)]
pub enum ReplicatorEvent {
    /// A replication connection for a space was opened.
    ///
    /// Carries the connection handle; the consumer drives sync sessions
    /// through it.
    ConnectionOpened {
        /// The space the connection belongs to.
        space_id: SpaceId,
        /// Handle for sending and receiving sync frames.
        connection: ReplicatorConnection,
    },
    /// The replication connection for a space was closed.
    ConnectionClosed {
        /// The space whose connection closed.
        space_id: SpaceId,
    },
}

/// Handle to one per-space replication connection.
///
/// Sending is non-blocking against a bounded queue; a full queue surfaces as
/// [`ReplicatorError::QueueFull`] so the caller can apply backpressure to the
/// sync session instead of buffering unboundedly.
#[derive(Debug)]
pub struct ReplicatorConnection {
    space_id: SpaceId,
    outbound_tx: mpsc::Sender<Bytes>,
    inbound_rx: mpsc::Receiver<Bytes>,
}

impl ReplicatorConnection {
    /// The space this connection replicates.
    pub fn space_id(&self) -> SpaceId {
        self.space_id
    }

    /// Whether a document living in `space_id` should be advertised on
    /// this connection.
    ///
    /// True only for the connection's own space; interest in other spaces
    /// never leaks across a connection.
    pub fn should_advertise(&self, space_id: &SpaceId) -> bool {
        *space_id == self.space_id
    }

    /// Whether documents of `collection` should be synced on this
    /// connection.
    pub fn should_sync_collection(&self, collection: &CollectionId) -> bool {
        collection.space_id == self.space_id
    }

    /// Queue one sync frame for sending.
    pub fn send(&self, frame: Bytes) -> Result<(), ReplicatorError> {
        self.outbound_tx.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => ReplicatorError::QueueFull {
                space_id: self.space_id,
            },
            mpsc::error::TrySendError::Closed(_) => ReplicatorError::Closed {
                space_id: self.space_id,
            },
        })
    }

    /// Receive the next inbound sync frame.
    ///
    /// Returns `None` once the connection is closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbound_rx.recv().await
    }
}

/// Delay sequence for resending a frame after a messenger failure.
///
/// Doubles from [`Backoff::INITIAL`] up to [`Backoff::MAX`]; after
/// [`Backoff::MAX_ATTEMPTS`] failed sends the connection is closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    /// First retry delay.
    pub const INITIAL: Duration = Duration::from_millis(100);
    /// Retry delay cap.
    pub const MAX: Duration = Duration::from_secs(10);
    /// Retries before the connection is abandoned.
    pub const MAX_ATTEMPTS: u32 = 8;

    /// The next delay, or `None` when the attempts are exhausted.
    pub fn next(self) -> Option<(Duration, Backoff)> {
        if self.attempt >= Self::MAX_ATTEMPTS {
            return None;
        }
        let delay = Self::INITIAL
            .saturating_mul(1u32 << self.attempt.min(30))
            .min(Self::MAX);
        Some((
            delay,
            Backoff {
                attempt: self.attempt + 1,
            },
        ))
    }
}

#[derive(derive_more::Debug)]
struct ConnectionState {
    outbound_tx: mpsc::Sender<Bytes>,
    inbound_tx: mpsc::Sender<Bytes>,
    #[debug(skip)]
    task: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct Inner {
    ctx: Option<ReplicatorContext>,
    interested: HashSet<SpaceId>,
    connections: HashMap<SpaceId, ConnectionState>,
}

/// Manages replication connections for the spaces this peer is interested in.
#[derive(Clone, derive_more::Debug)]
pub struct SpaceReplicator {
    #[debug(skip)]
    inner: Arc<Mutex<Inner>>,
    #[debug(skip)]
    events_tx: mpsc::Sender<ReplicatorEvent>,
    metrics: Arc<Metrics>,
}

impl SpaceReplicator {
    /// Create a replicator and the receiver for its events.
    pub fn new(metrics: Arc<Metrics>) -> (Self, mpsc::Receiver<ReplicatorEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAP);
        let replicator = SpaceReplicator {
            inner: Arc::new(Mutex::new(Inner::default())),
            events_tx,
            metrics,
        };
        (replicator, events_rx)
    }

    /// Attach a peer connection and open connections for every interested
    /// space.
    ///
    /// Connections from a previous attachment are stale and get closed
    /// before the new ones open.
    pub async fn connect(&self, ctx: ReplicatorContext) {
        let (stale, pending) = {
            let mut inner = self.inner.lock().expect("poisoned");
            for state in inner.connections.values() {
                state.task.abort();
            }
            let stale: Vec<SpaceId> = inner.connections.drain().map(|(id, _)| id).collect();
            inner.ctx = Some(ctx);
            let pending: Vec<SpaceId> = inner.interested.iter().copied().collect();
            (stale, pending)
        };
        for space_id in stale {
            self.metrics.connections_closed.inc();
            self.events_tx
                .send(ReplicatorEvent::ConnectionClosed { space_id })
                .await
                .ok();
        }
        for space_id in pending {
            self.open_connection(space_id).await;
        }
    }

    /// Detach from the peer and close all connections.
    pub async fn disconnect(&self) {
        let closed: Vec<SpaceId> = {
            let mut inner = self.inner.lock().expect("poisoned");
            inner.ctx = None;
            for state in inner.connections.values() {
                state.task.abort();
            }
            inner.connections.drain().map(|(space_id, _)| space_id).collect()
        };
        for space_id in closed {
            self.metrics.connections_closed.inc();
            self.events_tx
                .send(ReplicatorEvent::ConnectionClosed { space_id })
                .await
                .ok();
        }
    }

    /// Declare interest in a space and open its connection if a peer is
    /// attached.
    ///
    /// At most one connection per space is kept; declaring interest in a
    /// space that is already connected is a no-op.
    pub async fn connect_to_space(&self, space_id: SpaceId) {
        let open = {
            let mut inner = self.inner.lock().expect("poisoned");
            inner.interested.insert(space_id);
            inner.ctx.is_some() && !inner.connections.contains_key(&space_id)
        };
        if open {
            self.open_connection(space_id).await;
        }
    }

    /// Withdraw interest in a space and close its connection.
    pub async fn disconnect_from_space(&self, space_id: SpaceId) {
        let closed = {
            let mut inner = self.inner.lock().expect("poisoned");
            inner.interested.remove(&space_id);
            if let Some(state) = inner.connections.remove(&space_id) {
                state.task.abort();
                true
            } else {
                false
            }
        };
        if closed {
            self.metrics.connections_closed.inc();
            self.events_tx
                .send(ReplicatorEvent::ConnectionClosed { space_id })
                .await
                .ok();
        }
    }

    /// Whether this peer is interested in replicating `space_id`.
    ///
    /// Interest is peer-wide and independent of connectivity. Whether a
    /// given document or collection belongs on a given connection is
    /// decided by the connection-scoped predicates on
    /// [`ReplicatorConnection`].
    pub fn is_interested(&self, space_id: &SpaceId) -> bool {
        self.inner
            .lock()
            .expect("poisoned")
            .interested
            .contains(space_id)
    }

    /// Demultiplex one inbound envelope.
    ///
    /// Envelopes for foreign protocols, unknown spaces, or with a payload
    /// that contradicts their service id are dropped without feedback.
    pub fn handle_message(&self, envelope: &Envelope) {
        let Some(space_id) = proto::parse_service_id(&envelope.service_id) else {
            trace!(service_id = %envelope.service_id, "dropping envelope for foreign service");
            self.metrics.frames_dropped.inc();
            return;
        };
        let frame = match SpaceFrame::decode(&envelope.payload) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(%space_id, %err, "dropping undecodable frame");
                self.metrics.frames_dropped.inc();
                return;
            }
        };
        if frame.space_id != space_id {
            debug!(%space_id, frame_space = %frame.space_id, "dropping frame with mismatched space");
            self.metrics.frames_dropped.inc();
            return;
        }
        let inner = self.inner.lock().expect("poisoned");
        let Some(state) = inner.connections.get(&space_id) else {
            debug!(%space_id, "dropping frame for space without connection");
            self.metrics.frames_dropped.inc();
            return;
        };
        match state.inbound_tx.try_send(frame.payload) {
            Ok(()) => {
                self.metrics.frames_recv.inc();
            }
            Err(_) => {
                warn!(%space_id, "inbound queue full, dropping frame");
                self.metrics.frames_dropped.inc();
            }
        }
    }

    async fn open_connection(&self, space_id: SpaceId) {
        let (outbound_tx, outbound_rx) = mpsc::channel(SEND_QUEUE_CAP);
        let (inbound_tx, inbound_rx) = mpsc::channel(RECV_QUEUE_CAP);
        let connection = {
            let mut inner = self.inner.lock().expect("poisoned");
            let Some(ctx) = inner.ctx.clone() else {
                return;
            };
            let task = tokio::spawn(forward(
                space_id,
                outbound_rx,
                ctx,
                Arc::downgrade(&self.inner),
                self.events_tx.clone(),
                self.metrics.clone(),
            ));
            inner.connections.insert(
                space_id,
                ConnectionState {
                    outbound_tx: outbound_tx.clone(),
                    inbound_tx,
                    task,
                },
            );
            ReplicatorConnection {
                space_id,
                outbound_tx,
                inbound_rx,
            }
        };
        debug!(%space_id, "replication connection opened");
        self.metrics.connections_opened.inc();
        self.events_tx
            .send(ReplicatorEvent::ConnectionOpened {
                space_id,
                connection,
            })
            .await
            .ok();
    }
}

/// Forwarding loop for one connection: envelope each queued frame and send
/// it, retrying with backoff. Exhausting the backoff closes the connection.
async fn forward(
    space_id: SpaceId,
    mut outbound_rx: mpsc::Receiver<Bytes>,
    ctx: ReplicatorContext,
    inner: Weak<Mutex<Inner>>,
    events_tx: mpsc::Sender<ReplicatorEvent>,
    metrics: Arc<Metrics>,
) {
    while let Some(frame) = outbound_rx.recv().await {
        let payload = match (SpaceFrame {
            space_id,
            payload: frame,
        })
        .encode()
        {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%space_id, %err, "failed to encode frame, skipping");
                metrics.frames_dropped.inc();
                continue;
            }
        };
        let envelope = Envelope {
            service_id: proto::service_id(&space_id),
            identity_key: ctx.identity_key,
            device_key: ctx.device_key,
            payload,
        };
        let mut backoff = Backoff::default();
        loop {
            match ctx.messenger.send(envelope.clone()).await {
                Ok(()) => {
                    metrics.frames_sent.inc();
                    break;
                }
                Err(err) => match backoff.next() {
                    Some((delay, next)) => {
                        debug!(%space_id, %err, ?delay, "send failed, backing off");
                        tokio::time::sleep(delay).await;
                        backoff = next;
                    }
                    None => {
                        warn!(%space_id, %err, "send retries exhausted, closing connection");
                        if let Some(inner) = inner.upgrade() {
                            inner.lock().expect("poisoned").connections.remove(&space_id);
                        }
                        metrics.connections_closed.inc();
                        events_tx
                            .send(ReplicatorEvent::ConnectionClosed { space_id })
                            .await
                            .ok();
                        return;
                    }
                },
            }
        }
    }
}
