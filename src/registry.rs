//! Local document proxies and the write-back scheduler.
//!
//! A [`ProxyRegistry`] fronts a remote [`DataService`] for the documents a
//! client holds locally. Local mutations land on a per-document change queue
//! and mark the document dirty; a scheduler task coalesces dirty
//! notifications and flushes at a bounded frequency. Each flush is two
//! ordered phases: the subscription set is reconciled first, then queued
//! changes go out as one write batch, so the service never receives writes
//! for documents it was not told about. Inbound updates arrive on the
//! service's subscription stream and are applied to the local replicas.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use futures_lite::{StreamExt, stream::Boxed as BoxedStream};
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tracing::{debug, trace, warn};

use crate::{keys::DocumentId, metrics::Metrics};

/// A local CRDT document replica.
///
/// Local mutations are reported to the registry through
/// [`DocHandle::record_change`] as encoded updates; the registry itself only
/// applies remote updates and exports snapshots.
pub trait CrdtDoc: Send + 'static {
    /// Apply one remote update to the local replica.
    fn apply_remote(&mut self, update: &[u8]) -> anyhow::Result<()>;
    /// Export the full document state.
    fn snapshot(&self) -> Vec<u8>;
}

/// Constructs CRDT replicas for the registry.
pub trait DocFactory: Send + Sync + 'static {
    /// An empty replica.
    fn create(&self) -> Box<dyn CrdtDoc>;
    /// A replica initialized from an exported snapshot.
    fn import(&self, snapshot: &[u8]) -> anyhow::Result<Box<dyn CrdtDoc>>;
}

/// One document's contribution to a write batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocWrite {
    /// The document the updates belong to.
    pub document_id: DocumentId,
    /// Whether this is the first write for a document created locally.
    pub is_new: bool,
    /// Queued updates, oldest first.
    pub updates: Vec<Bytes>,
}

/// A batch of queued changes flushed in one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBatch {
    /// Per-document writes, ordered by document id.
    pub writes: Vec<DocWrite>,
}

/// One inbound update delivered on the subscription stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocUpdate {
    /// The updated document.
    pub document_id: DocumentId,
    /// Encoded update.
    pub update: Bytes,
}

/// Remote service the registry reconciles against.
pub trait DataService: Send + Sync + 'static {
    /// Reconcile the subscription set.
    fn update_subscription(
        &self,
        added: Vec<DocumentId>,
        removed: Vec<DocumentId>,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
    /// Write one batch of queued changes.
    fn write(&self, batch: WriteBatch) -> impl Future<Output = anyhow::Result<()>> + Send;
    /// Stream of updates for subscribed documents.
    fn subscribe(&self) -> BoxedStream<DocUpdate>;
    /// Close the subscription for good.
    fn close_subscription(&self) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Flush rate limiting.
#[derive(Debug, Clone, Copy)]
pub struct FlushConfig {
    /// Upper bound on flushes per second.
    pub max_flushes_per_sec: u32,
}

impl Default for FlushConfig {
    fn default() -> Self {
        FlushConfig {
            max_flushes_per_sec: 10,
        }
    }
}

impl FlushConfig {
    /// Minimum interval between two flushes.
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(1) / self.max_flushes_per_sec.max(1)
    }
}

/// How long to wait before the next flush may run.
///
/// Zero when no flush happened yet or the interval has already passed.
pub fn next_flush_delay(
    now: Instant,
    last_flush: Option<Instant>,
    min_interval: Duration,
) -> Duration {
    match last_flush {
        None => Duration::ZERO,
        Some(last) => min_interval.saturating_sub(now.saturating_duration_since(last)),
    }
}

struct DocState {
    doc: Box<dyn CrdtDoc>,
    queue: VecDeque<Bytes>,
}

/// Pending work, cleared atomically when a flush snapshots it.
///
/// A document id is in at most one of `subscribe` and `unsubscribe`;
/// registering cancels a pending unsubscribe and vice versa. `fresh` marks
/// documents created locally, whose first write must be tagged as new.
#[derive(Default)]
struct Shared {
    docs: HashMap<DocumentId, DocState>,
    subscribe: HashSet<DocumentId>,
    unsubscribe: HashSet<DocumentId>,
    dirty: HashSet<DocumentId>,
    fresh: HashSet<DocumentId>,
}

/// Handle to one registered document.
///
/// Cheap to clone; all clones share the registry's queues.
#[derive(Clone, derive_more::Debug)]
pub struct DocHandle {
    id: DocumentId,
    #[debug(skip)]
    shared: Arc<Mutex<Shared>>,
    #[debug(skip)]
    dirty_tx: mpsc::Sender<()>,
}

impl DocHandle {
    /// The document id.
    pub fn id(&self) -> DocumentId {
        self.id
    }

    /// Queue one encoded local change and schedule a flush.
    pub fn record_change(&self, update: Bytes) {
        {
            let mut shared = self.shared.lock().expect("poisoned");
            let Some(state) = shared.docs.get_mut(&self.id) else {
                // Removed while the handle was still around.
                return;
            };
            state.queue.push_back(update);
            shared.dirty.insert(self.id);
        }
        // Capacity one; a full channel means a flush is already scheduled.
        self.dirty_tx.try_send(()).ok();
    }

    /// Snapshot of the replica, or `None` once the document is removed.
    pub fn snapshot(&self) -> Option<Vec<u8>> {
        let shared = self.shared.lock().expect("poisoned");
        shared.docs.get(&self.id).map(|state| state.doc.snapshot())
    }
}

/// Registry of local document proxies backed by a [`DataService`].
#[derive(derive_more::Debug)]
pub struct ProxyRegistry<S> {
    #[debug(skip)]
    shared: Arc<Mutex<Shared>>,
    #[debug("DataService")]
    service: Arc<S>,
    #[debug("DocFactory")]
    factory: Arc<dyn DocFactory>,
    #[debug(skip)]
    dirty_tx: mpsc::Sender<()>,
    #[debug(skip)]
    scheduler: JoinHandle<()>,
    #[debug(skip)]
    inbound: JoinHandle<()>,
    metrics: Arc<Metrics>,
}

impl<S: DataService> ProxyRegistry<S> {
    /// Create a registry, subscribe to the service and start the flush
    /// scheduler.
    pub fn new(
        service: Arc<S>,
        factory: Arc<dyn DocFactory>,
        config: FlushConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let shared: Arc<Mutex<Shared>> = Arc::default();
        let (dirty_tx, dirty_rx) = mpsc::channel(1);
        let scheduler = tokio::spawn(run_scheduler(
            dirty_rx,
            shared.clone(),
            service.clone(),
            config.min_interval(),
            metrics.clone(),
        ));
        let inbound = tokio::spawn(run_inbound(
            service.subscribe(),
            shared.clone(),
            metrics.clone(),
        ));
        ProxyRegistry {
            shared,
            service,
            factory,
            dirty_tx,
            scheduler,
            inbound,
            metrics,
        }
    }

    /// Create a new empty document.
    ///
    /// The document is tagged as new: its first flushed write tells the
    /// service this is a creation, not a modification.
    pub fn create(&self, id: DocumentId) -> DocHandle {
        self.insert(id, self.factory.create(), true)
    }

    /// Create a document from an exported snapshot. Tagged as new, like
    /// [`Self::create`].
    pub fn import(&self, id: DocumentId, snapshot: &[u8]) -> anyhow::Result<DocHandle> {
        let doc = self.factory.import(snapshot)?;
        Ok(self.insert(id, doc, true))
    }

    /// Get the handle for a document, registering it if unknown.
    ///
    /// An unknown document gets an empty replica and a pending subscription;
    /// its content arrives through the subscription stream.
    pub fn find(&self, id: DocumentId) -> DocHandle {
        let known = self
            .shared
            .lock()
            .expect("poisoned")
            .docs
            .contains_key(&id);
        if known {
            DocHandle {
                id,
                shared: self.shared.clone(),
                dirty_tx: self.dirty_tx.clone(),
            }
        } else {
            self.insert(id, self.factory.create(), false)
        }
    }

    /// Remove a document and schedule its unsubscription.
    ///
    /// The handle is evicted immediately; queued changes that were not
    /// flushed yet are dropped with it.
    pub fn remove(&self, id: DocumentId) {
        {
            let mut shared = self.shared.lock().expect("poisoned");
            shared.docs.remove(&id);
            shared.dirty.remove(&id);
            shared.fresh.remove(&id);
            if !shared.subscribe.remove(&id) {
                shared.unsubscribe.insert(id);
            }
        }
        self.dirty_tx.try_send(()).ok();
    }

    /// Ids of all registered documents, sorted.
    pub fn handles(&self) -> Vec<DocumentId> {
        let mut ids: Vec<DocumentId> = self
            .shared
            .lock()
            .expect("poisoned")
            .docs
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Flush all pending work now, bypassing the scheduler.
    pub async fn flush(&self) -> anyhow::Result<()> {
        flush_once(&self.shared, self.service.as_ref(), &self.metrics).await
    }

    /// Flush outstanding work and close the service subscription.
    pub async fn close(self) -> anyhow::Result<()> {
        self.scheduler.abort();
        self.inbound.abort();
        flush_once(&self.shared, self.service.as_ref(), &self.metrics).await?;
        self.service.close_subscription().await
    }

    fn insert(&self, id: DocumentId, doc: Box<dyn CrdtDoc>, is_new: bool) -> DocHandle {
        {
            let mut shared = self.shared.lock().expect("poisoned");
            shared.docs.insert(
                id,
                DocState {
                    doc,
                    queue: VecDeque::new(),
                },
            );
            if !shared.unsubscribe.remove(&id) {
                shared.subscribe.insert(id);
            }
            if is_new {
                shared.fresh.insert(id);
            }
        }
        self.dirty_tx.try_send(()).ok();
        DocHandle {
            id,
            shared: self.shared.clone(),
            dirty_tx: self.dirty_tx.clone(),
        }
    }
}

async fn run_inbound(
    mut updates: BoxedStream<DocUpdate>,
    shared: Arc<Mutex<Shared>>,
    metrics: Arc<Metrics>,
) {
    while let Some(update) = updates.next().await {
        let mut shared = shared.lock().expect("poisoned");
        match shared.docs.get_mut(&update.document_id) {
            Some(state) => {
                if let Err(err) = state.doc.apply_remote(&update.update) {
                    warn!(document = %update.document_id, %err, "failed to apply remote update");
                }
            }
            None => {
                // The subscription update announcing the document may still
                // be in flight, or the document was just removed.
                debug!(document = %update.document_id, "dropping update for unknown document");
                metrics.updates_dropped.inc();
            }
        }
    }
}

async fn run_scheduler<S: DataService>(
    mut dirty_rx: mpsc::Receiver<()>,
    shared: Arc<Mutex<Shared>>,
    service: Arc<S>,
    min_interval: Duration,
    metrics: Arc<Metrics>,
) {
    let mut last_flush: Option<Instant> = None;
    while dirty_rx.recv().await.is_some() {
        let delay = next_flush_delay(Instant::now(), last_flush, min_interval);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        // Anything queued while waiting goes into this flush.
        while dirty_rx.try_recv().is_ok() {}
        if let Err(err) = flush_once(&shared, service.as_ref(), &metrics).await {
            warn!(%err, "flush failed, keeping pending state for the next run");
        }
        last_flush = Some(Instant::now());
    }
}

/// One flush: reconcile the subscription, then send queued changes.
///
/// Pending state is snapshotted and cleared under the lock before any await;
/// mutations racing with the flush re-mark their documents for the next run.
/// On a service error the snapshot is merged back.
async fn flush_once<S: DataService>(
    shared: &Mutex<Shared>,
    service: &S,
    metrics: &Metrics,
) -> anyhow::Result<()> {
    let (added, removed, writes) = {
        let mut guard = shared.lock().expect("poisoned");
        let shared = &mut *guard;
        let mut added: Vec<DocumentId> = shared.subscribe.drain().collect();
        let mut removed: Vec<DocumentId> = shared.unsubscribe.drain().collect();
        added.sort_unstable();
        removed.sort_unstable();
        let mut dirty: Vec<DocumentId> = shared.dirty.drain().collect();
        dirty.sort_unstable();
        let mut writes = Vec::new();
        for id in dirty {
            let Some(state) = shared.docs.get_mut(&id) else {
                continue;
            };
            let updates: Vec<Bytes> = state.queue.drain(..).collect();
            if updates.is_empty() {
                continue;
            }
            writes.push(DocWrite {
                document_id: id,
                is_new: shared.fresh.remove(&id),
                updates,
            });
        }
        (added, removed, writes)
    };

    if added.is_empty() && removed.is_empty() && writes.is_empty() {
        trace!("nothing to flush");
        return Ok(());
    }

    if !added.is_empty() || !removed.is_empty() {
        if let Err(err) = service
            .update_subscription(added.clone(), removed.clone())
            .await
        {
            restore(shared, added, removed, writes);
            return Err(err);
        }
    }
    if !writes.is_empty() {
        if let Err(err) = service
            .write(WriteBatch {
                writes: writes.clone(),
            })
            .await
        {
            restore(shared, Vec::new(), Vec::new(), writes);
            return Err(err);
        }
    }
    metrics.registry_flushes.inc();
    Ok(())
}

fn restore(
    shared: &Mutex<Shared>,
    added: Vec<DocumentId>,
    removed: Vec<DocumentId>,
    writes: Vec<DocWrite>,
) {
    let mut guard = shared.lock().expect("poisoned");
    let shared = &mut *guard;
    shared.subscribe.extend(added);
    shared.unsubscribe.extend(removed);
    for write in writes {
        let Some(state) = shared.docs.get_mut(&write.document_id) else {
            continue;
        };
        for update in write.updates.into_iter().rev() {
            state.queue.push_front(update);
        }
        shared.dirty.insert(write.document_id);
        if write.is_new {
            shared.fresh.insert(write.document_id);
        }
    }
}
