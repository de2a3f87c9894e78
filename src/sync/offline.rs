//! Offline-first adapter over a local cache and a remote authority.
//!
//! Every write lands in the local adapter before the call returns, then is
//! appended to the [`SyncQueue`]. A write-order lock spans both steps, so the
//! queue holds mutations in exactly the order the local adapter applied
//! them. Draining replays the queue against the
//! remote oldest first and stops at the first rejection, so the remote never
//! observes mutations out of local order. A failed pass backs off
//! exponentially; a link coming back, a [`OfflineAdapter::tick`] after the
//! backoff, or the next write starts another pass.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connectivity::Connectivity;
use super::kv::{KeyValueStore, MemoryKeyValueStore};
use super::queue::{SyncOperation, SyncOperationType, SyncQueue};
use super::state::{Clock, SyncMachine, SyncState, SyncTrigger, SystemClock};
use crate::config::SyncConfig;
use crate::error::{StorageError, StorageResult};
use crate::query::{QueryOutcome, StorageQuery};
use crate::record::{NewRecord, Record, RecordPatch};
use crate::storage::{
    lock_err, CleanupReport, CollectionSchema, CollectionStats, QueryExplanation, StorageAdapter,
    StorageBackend, StoredVector, VectorPrimitives,
};

const EVENT_CAPACITY: usize = 256;

/// Observable sync activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    StateChanged {
        state: SyncState,
    },
    ConnectivityChanged {
        online: bool,
    },
    Enqueued {
        seq: u64,
        op_type: SyncOperationType,
        collection: String,
        id: String,
    },
    Acknowledged {
        seq: u64,
    },
    /// The remote rejected `seq`; it and every later entry stay queued.
    DrainHalted {
        seq: u64,
        error: String,
    },
    DrainCompleted {
        sent: usize,
    },
    CacheUpdated {
        collection: String,
        id: String,
    },
    CacheEvicted {
        collection: String,
        id: String,
    },
}

/// Snapshot of the sync layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,
    pub online: bool,
    pub pending: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_drain_at: Option<DateTime<Utc>>,
}

/// Result of one drain request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainOutcome {
    /// Entries the remote acknowledged in this pass.
    pub sent: usize,
    /// Entries still queued afterwards.
    pub remaining: usize,
    /// Sequence number of the entry the remote rejected.
    pub halted_at: Option<u64>,
    /// No pass ran: offline, already in flight, or backing off.
    pub skipped: bool,
}

#[derive(Debug, Default)]
struct DrainLog {
    last_error: Option<String>,
    last_drain_at: Option<DateTime<Utc>>,
}

pub(super) struct SyncCore<L: ?Sized, R: ?Sized> {
    pub(super) local: Arc<L>,
    pub(super) remote: Arc<R>,
    pub(super) queue: SyncQueue,
    /// Held across a local mutation and its enqueue, and across cache
    /// writes that consult the queue.
    pub(super) write_order: AsyncMutex<()>,
    pub(super) config: SyncConfig,
    connectivity: Connectivity,
    clock: Arc<dyn Clock>,
    machine: Mutex<SyncMachine>,
    log: Mutex<DrainLog>,
    events: broadcast::Sender<SyncEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl<L, R> SyncCore<L, R>
where
    L: StorageAdapter + ?Sized + 'static,
    R: StorageAdapter + ?Sized + 'static,
{
    pub(super) fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn state(&self) -> StorageResult<SyncState> {
        Ok(self.machine.lock().map_err(|_| lock_err("sync machine"))?.state())
    }

    fn fire(&self, trigger: SyncTrigger) -> StorageResult<Option<SyncState>> {
        let now = self.clock.now();
        let next = self
            .machine
            .lock()
            .map_err(|_| lock_err("sync machine"))?
            .fire(trigger, now);
        if let Some(state) = next {
            debug!(target: "polystore::sync", ?trigger, ?state, "sync state changed");
            self.emit(SyncEvent::StateChanged { state });
        }
        Ok(next)
    }

    pub(super) fn track(&self, task: JoinHandle<()>) {
        match self.tasks.lock() {
            Ok(mut tasks) => {
                tasks.retain(|t| !t.is_finished());
                tasks.push(task);
            }
            Err(_) => task.abort(),
        }
    }

    fn abort_tasks(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    async fn skipped(&self) -> DrainOutcome {
        DrainOutcome {
            remaining: self.queue.len().await,
            skipped: true,
            ..DrainOutcome::default()
        }
    }

    async fn drain(&self) -> StorageResult<DrainOutcome> {
        if !self.connectivity.is_online() || self.fire(SyncTrigger::DrainRequested)?.is_none() {
            return Ok(self.skipped().await);
        }
        if let Err(e) = self.remote.initialize().await {
            return self.halt(None, &e, 0).await;
        }
        self.fire(SyncTrigger::Connected)?;

        let mut sent = 0;
        while let Some(op) = self.queue.front().await {
            if let Err(e) = op.replay(self.remote.as_ref()).await {
                return self.halt(Some(op.seq), &e, sent).await;
            }
            if let Err(e) = self.queue.acknowledge(op.seq).await {
                warn!(target: "polystore::sync", seq = op.seq, error = %e, "acknowledged entry not persisted");
            }
            sent += 1;
            self.emit(SyncEvent::Acknowledged { seq: op.seq });
        }

        self.fire(SyncTrigger::DrainSucceeded)?;
        if let Ok(mut log) = self.log.lock() {
            log.last_error = None;
            log.last_drain_at = Some(self.clock.now());
        }
        self.emit(SyncEvent::DrainCompleted { sent });
        info!(target: "polystore::sync", sent, "sync queue drained");
        Ok(DrainOutcome {
            sent,
            remaining: self.queue.len().await,
            ..DrainOutcome::default()
        })
    }

    async fn halt(&self, seq: Option<u64>, error: &StorageError, sent: usize) -> StorageResult<DrainOutcome> {
        warn!(target: "polystore::sync", ?seq, sent, error = %error, "drain halted");
        self.fire(SyncTrigger::DrainFailed)?;
        if let Ok(mut log) = self.log.lock() {
            log.last_error = Some(error.to_string());
        }
        if let Some(seq) = seq {
            self.emit(SyncEvent::DrainHalted {
                seq,
                error: error.to_string(),
            });
        }
        Ok(DrainOutcome {
            sent,
            remaining: self.queue.len().await,
            halted_at: seq,
            skipped: false,
        })
    }

    async fn tick(&self) -> StorageResult<Option<DrainOutcome>> {
        match self.state()? {
            SyncState::BackingOff { .. } => {
                if self.fire(SyncTrigger::BackoffElapsed)?.is_none() {
                    return Ok(None);
                }
            }
            SyncState::Idle => {}
            SyncState::Connecting | SyncState::Draining => return Ok(None),
        }
        if !self.connectivity.is_online() || self.queue.is_empty().await {
            return Ok(None);
        }
        self.drain().await.map(Some)
    }

    async fn link_changed(&self, online: bool) {
        self.emit(SyncEvent::ConnectivityChanged { online });
        info!(target: "polystore::sync", online, "connectivity changed");
        if !online {
            return;
        }
        if let Err(e) = self.fire(SyncTrigger::LinkUp) {
            warn!(target: "polystore::sync", error = %e, "state update failed");
        }
        if let Err(e) = self.drain().await {
            warn!(target: "polystore::sync", error = %e, "reconnect drain failed");
        }
    }

    async fn enqueue(self: &Arc<Self>, op: SyncOperation) {
        let (op_type, collection, id) = (op.op_type, op.collection.clone(), op.id.clone());
        let (seq, persisted) = self.queue.enqueue(op).await;
        if let Err(e) = persisted {
            warn!(target: "polystore::sync", seq, error = %e, "queued mutation not persisted");
        }
        self.emit(SyncEvent::Enqueued {
            seq,
            op_type,
            collection,
            id,
        });
        if self.connectivity.is_online() {
            let core = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = core.drain().await {
                    warn!(target: "polystore::sync", error = %e, "background drain failed");
                }
            });
        }
    }
}

/// [`StorageAdapter`] that keeps working while the remote is unreachable.
///
/// Reads are served locally; a local miss while online falls through to the
/// remote and caches the result. Queries, stats and schema management only
/// touch the local adapter.
pub struct OfflineAdapter<L: ?Sized, R: ?Sized> {
    pub(super) core: Arc<SyncCore<L, R>>,
}

impl<L: ?Sized, R: ?Sized> Clone for OfflineAdapter<L, R> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<L: ?Sized, R: ?Sized> std::fmt::Debug for OfflineAdapter<L, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineAdapter")
            .field("queue", &self.core.queue)
            .field("online", &self.core.connectivity.is_online())
            .finish_non_exhaustive()
    }
}

/// Builder for [`OfflineAdapter`].
pub struct OfflineAdapterBuilder<L: ?Sized, R: ?Sized> {
    local: Arc<L>,
    remote: Arc<R>,
    store: Option<Arc<dyn KeyValueStore>>,
    connectivity: Connectivity,
    config: SyncConfig,
    clock: Arc<dyn Clock>,
}

impl<L, R> OfflineAdapterBuilder<L, R>
where
    L: StorageAdapter + ?Sized + 'static,
    R: StorageAdapter + ?Sized + 'static,
{
    /// Where the queue is persisted; in memory when unset.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }

    #[must_use]
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Loads the persisted queue and assembles the adapter. Background tasks
    /// only run after [`OfflineAdapter::start`].
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for bad sync settings, or a store read failure. A
    /// corrupt queue is not an error; it is reset and reported through
    /// [`SyncStatus::last_error`].
    pub async fn build(self) -> StorageResult<OfflineAdapter<L, R>> {
        let config = self.config.validate()?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryKeyValueStore::new()));
        let (queue, corruption) = SyncQueue::load(store, config.queue_key.clone()).await?;
        let machine = SyncMachine::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
        );
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(OfflineAdapter {
            core: Arc::new(SyncCore {
                local: self.local,
                remote: self.remote,
                queue,
                write_order: AsyncMutex::new(()),
                config,
                connectivity: self.connectivity,
                clock: self.clock,
                machine: Mutex::new(machine),
                log: Mutex::new(DrainLog {
                    last_error: corruption.map(|e| e.to_string()),
                    last_drain_at: None,
                }),
                events,
                tasks: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
            }),
        })
    }
}

impl<L, R> OfflineAdapter<L, R>
where
    L: StorageAdapter + ?Sized + 'static,
    R: StorageAdapter + ?Sized + 'static,
{
    #[must_use]
    pub fn builder(local: Arc<L>, remote: Arc<R>) -> OfflineAdapterBuilder<L, R> {
        OfflineAdapterBuilder {
            local,
            remote,
            store: None,
            connectivity: Connectivity::default(),
            config: SyncConfig::default(),
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn local(&self) -> &Arc<L> {
        &self.core.local
    }

    #[must_use]
    pub fn remote(&self) -> &Arc<R> {
        &self.core.remote
    }

    #[must_use]
    pub fn connectivity(&self) -> &Connectivity {
        &self.core.connectivity
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.core.events.subscribe()
    }

    /// Spawns the connectivity observer (and the retry timer when
    /// `retry_interval_ms` is set), then drains once if there is queued work
    /// and the link is up. Later calls do nothing.
    ///
    /// # Errors
    ///
    /// Only lock poisoning inside the initial drain.
    pub async fn start(&self) -> StorageResult<Option<DrainOutcome>> {
        if self.core.started.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        let mut rx = self.core.connectivity.subscribe();
        // Read before spawning so a transition right after start() is seen.
        let mut online = *rx.borrow_and_update();
        let weak: Weak<SyncCore<L, R>> = Arc::downgrade(&self.core);
        self.core.track(tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let now_online = *rx.borrow_and_update();
                if now_online == online {
                    continue;
                }
                online = now_online;
                let Some(core) = weak.upgrade() else { break };
                core.link_changed(online).await;
            }
        }));

        if let Some(ms) = self.core.config.retry_interval_ms {
            let weak = Arc::downgrade(&self.core);
            self.core.track(tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(ms));
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let Some(core) = weak.upgrade() else { break };
                    if let Err(e) = core.tick().await {
                        warn!(target: "polystore::sync", error = %e, "retry tick failed");
                    }
                }
            }));
        }

        if self.core.connectivity.is_online() && !self.core.queue.is_empty().await {
            info!(target: "polystore::sync", pending = self.core.queue.len().await, "draining queue left from last run");
            return self.core.drain().await.map(Some);
        }
        Ok(None)
    }

    /// Runs a drain pass now unless one is in flight, the link is down, or
    /// the backoff has not elapsed.
    ///
    /// # Errors
    ///
    /// Only lock poisoning. Remote failures are reported in the outcome.
    pub async fn drain(&self) -> StorageResult<DrainOutcome> {
        self.core.drain().await
    }

    /// Leaves an elapsed backoff and drains pending work. `None` when there
    /// was nothing to do.
    ///
    /// # Errors
    ///
    /// Only lock poisoning.
    pub async fn tick(&self) -> StorageResult<Option<DrainOutcome>> {
        self.core.tick().await
    }

    /// # Errors
    ///
    /// Only lock poisoning.
    pub async fn status(&self) -> StorageResult<SyncStatus> {
        let state = self.core.state()?;
        let (last_error, last_drain_at) = {
            let log = self.core.log.lock().map_err(|_| lock_err("sync log"))?;
            (log.last_error.clone(), log.last_drain_at)
        };
        Ok(SyncStatus {
            state,
            online: self.core.connectivity.is_online(),
            pending: self.core.queue.len().await,
            last_error,
            last_drain_at,
        })
    }

    pub async fn pending(&self) -> usize {
        self.core.queue.len().await
    }

    /// The queued operations, oldest first.
    pub async fn queued(&self) -> Vec<SyncOperation> {
        self.core.queue.snapshot().await
    }

    /// Stops background tasks. The adapter keeps serving calls.
    pub fn shutdown(&self) {
        self.core.abort_tasks();
        self.core.started.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl<L, R> StorageAdapter for OfflineAdapter<L, R>
where
    L: StorageAdapter + ?Sized + 'static,
    R: StorageAdapter + ?Sized + 'static,
{
    fn backend_name(&self) -> &'static str {
        "offline"
    }

    /// Initializes the local adapter; an unreachable remote is only logged.
    async fn initialize(&self) -> StorageResult<()> {
        self.core.local.initialize().await?;
        if self.core.connectivity.is_online() {
            if let Err(e) = self.core.remote.initialize().await {
                warn!(target: "polystore::sync", error = %e, "remote not ready, continuing offline");
            }
        }
        Ok(())
    }

    async fn create(&self, record: NewRecord) -> StorageResult<Record> {
        let _order = self.core.write_order.lock().await;
        let record = self.core.local.create(record).await?;
        self.core.enqueue(SyncOperation::create(&record)).await;
        Ok(record)
    }

    async fn read(&self, collection: &str, id: &str) -> StorageResult<Option<Record>> {
        if let Some(record) = self.core.local.read(collection, id).await? {
            return Ok(Some(record));
        }
        // A queued delete must not be undone by re-caching the remote copy.
        if !self.core.connectivity.is_online() || self.core.queue.has_pending(collection, id).await {
            return Ok(None);
        }
        match self.core.remote.read(collection, id).await {
            Ok(Some(record)) => {
                let _order = self.core.write_order.lock().await;
                if self.core.queue.has_pending(collection, id).await {
                    return Ok(None);
                }
                if let Err(e) = self.core.local.create(NewRecord::mirror(&record)).await {
                    debug!(target: "polystore::sync", collection, id, error = %e, "remote read not cached");
                }
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(target: "polystore::sync", collection, id, error = %e, "remote read failed");
                Ok(None)
            }
        }
    }

    async fn query(&self, query: &StorageQuery) -> StorageResult<QueryOutcome> {
        self.core.local.query(query).await
    }

    async fn update(&self, collection: &str, id: &str, patch: RecordPatch) -> StorageResult<Record> {
        let _order = self.core.write_order.lock().await;
        let record = self.core.local.update(collection, id, patch.clone()).await?;
        self.core
            .enqueue(SyncOperation::update(collection, id, &patch))
            .await;
        Ok(record)
    }

    /// Queues the remote delete even when the local cache did not hold the
    /// record.
    async fn delete(&self, collection: &str, id: &str) -> StorageResult<bool> {
        let _order = self.core.write_order.lock().await;
        let existed = self.core.local.delete(collection, id).await?;
        self.core.enqueue(SyncOperation::delete(collection, id)).await;
        Ok(existed)
    }

    /// Replaces the local copy in one step; the remote receives a delete
    /// followed by a create.
    async fn replace(&self, record: NewRecord) -> StorageResult<Record> {
        let _order = self.core.write_order.lock().await;
        let record = self.core.local.replace(record).await?;
        self.core
            .enqueue(SyncOperation::delete(&record.collection, &record.id))
            .await;
        self.core.enqueue(SyncOperation::create(&record)).await;
        Ok(record)
    }

    async fn list_collections(&self) -> StorageResult<Vec<String>> {
        self.core.local.list_collections().await
    }

    async fn collection_stats(&self, collection: &str) -> StorageResult<CollectionStats> {
        self.core.local.collection_stats(collection).await
    }

    async fn clear(&self, collection: &str) -> StorageResult<()> {
        self.core.local.clear(collection).await
    }

    async fn clear_all(&self) -> StorageResult<()> {
        self.core.local.clear_all().await
    }

    async fn truncate(&self, collection: &str) -> StorageResult<()> {
        self.core.local.truncate(collection).await
    }

    async fn ensure_schema(&self, collection: &str, schema: &CollectionSchema) -> StorageResult<()> {
        self.core.local.ensure_schema(collection, schema).await
    }

    async fn cleanup(&self) -> StorageResult<CleanupReport> {
        self.core.local.cleanup().await
    }

    async fn close(&self) -> StorageResult<()> {
        self.shutdown();
        if let Err(e) = self.core.remote.close().await {
            debug!(target: "polystore::sync", error = %e, "remote close failed");
        }
        self.core.local.close().await
    }

    async fn explain_query(&self, query: &StorageQuery) -> StorageResult<QueryExplanation> {
        self.core.local.explain_query(query).await
    }
}

#[async_trait]
impl<L, R> VectorPrimitives for OfflineAdapter<L, R>
where
    L: StorageBackend + ?Sized + 'static,
    R: StorageAdapter + ?Sized + 'static,
{
    async fn ensure_vector_storage(&self, collection: &str, dimensions: usize) -> StorageResult<()> {
        self.core.local.ensure_vector_storage(collection, dimensions).await
    }

    async fn store_vector(&self, collection: &str, vector: StoredVector) -> StorageResult<()> {
        self.core.local.store_vector(collection, vector).await
    }

    async fn get_all_vectors(&self, collection: &str) -> StorageResult<Vec<StoredVector>> {
        self.core.local.get_all_vectors(collection).await
    }

    async fn get_vector_count(&self, collection: &str) -> StorageResult<u64> {
        self.core.local.get_vector_count(collection).await
    }
}
