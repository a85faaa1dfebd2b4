//! Sync coordinator: owns the queue state, runs the dispatcher and exposes
//! the producer and observer API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::admission::{AdmissionController, AdmissionError, AdmissionOutcome, AdmissionReceipt, EnqueueRequest};
use crate::backoff::RetryPolicy;
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, EngineConfig};
use crate::conflict::{ConflictResolver, FieldMerger};
use crate::connectivity::ConnectivityMonitor;
use crate::dead_letter::{prepare_requeue, DeadLetterError, DeadLetterFilter, DeadLetterRecord};
use crate::dispatcher;
use crate::event::{EventBus, QueueStats, SyncEvent};
use crate::metrics::{bump, MetricsSnapshot, SyncMetrics};
use crate::model::{ItemId, MutationItem, Operation, Priority, UnixTimeMs};
use crate::queue::QueueState;
use crate::remote::RemoteStore;
use crate::state::ItemState;
use crate::storage::{LoadedState, QuarantinedRecord, QueueStorage, StorageError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("engine already shut down")]
    AlreadyShutDown,
}

/// What a user-facing sync indicator shows for one item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
    /// Never seen, evicted, or committed long enough ago to be forgotten.
    Unknown,
}

pub(crate) struct Shared {
    pub config: EngineConfig,
    pub state: Mutex<QueueState>,
    pub storage: Arc<dyn QueueStorage>,
    pub remote: Arc<dyn RemoteStore>,
    pub resolver: ConflictResolver,
    pub retry: RetryPolicy,
    pub admission: AdmissionController,
    pub clock: Arc<dyn Clock>,
    pub events: EventBus,
    pub metrics: SyncMetrics,
    pub connectivity: ConnectivityMonitor,
    pub wake: Notify,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl Shared {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn next_wake(&self) -> Option<UnixTimeMs> {
        let now = self.clock.now();
        self.state.lock().await.next_wake(now)
    }

    pub async fn stats(&self) -> QueueStats {
        let overflow = self.metrics.snapshot().evicted;
        self.state
            .lock()
            .await
            .stats(self.admission.max_queue_size(), overflow)
    }
}

pub struct SyncEngineBuilder {
    config: EngineConfig,
    storage: Arc<dyn QueueStorage>,
    remote: Arc<dyn RemoteStore>,
    connectivity: Option<ConnectivityMonitor>,
    clock: Option<Arc<dyn Clock>>,
    resolver_mergers: Vec<(String, Arc<dyn FieldMerger>)>,
    fallback_merger: Option<Arc<dyn FieldMerger>>,
    run_dispatcher: bool,
}

impl SyncEngineBuilder {
    pub fn connectivity(mut self, monitor: ConnectivityMonitor) -> Self {
        self.connectivity = Some(monitor);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn field_merger(mut self, entity_type: impl Into<String>, merger: Arc<dyn FieldMerger>) -> Self {
        self.resolver_mergers.push((entity_type.into(), merger));
        self
    }

    pub fn fallback_field_merger(mut self, merger: Arc<dyn FieldMerger>) -> Self {
        self.fallback_merger = Some(merger);
        self
    }

    /// Skips the background loop; dispatch only happens through
    /// [`SyncEngine::dispatch_pass`].
    pub fn manual_dispatch(mut self) -> Self {
        self.run_dispatcher = false;
        self
    }

    /// Loads persisted state and starts the dispatcher. Unreadable state is
    /// quarantined rather than failing startup; only invalid config errors.
    #[instrument(skip_all)]
    pub async fn init(self) -> Result<SyncEngine, EngineError> {
        self.config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let metrics = SyncMetrics::new();
        let now = clock.now();

        let loaded = match self.storage.load_all().await {
            Ok(loaded) => loaded,
            Err(e) => {
                bump(&metrics.storage_errors);
                error!(error = %e, "queue storage unreadable, starting empty");
                LoadedState {
                    quarantined: vec![QuarantinedRecord {
                        key: "load_all".into(),
                        reason: e.to_string(),
                        at: now,
                        raw: Vec::new(),
                    }],
                    ..LoadedState::default()
                }
            }
        };

        let (state, recovered) =
            QueueState::restore(loaded, self.config.committed_key_cache_size, now);
        for id in &recovered {
            if let Some(item) = state.items.get(id) {
                if let Err(e) = self.storage.update(item).await {
                    bump(&metrics.storage_errors);
                    warn!(item_id = %id, error = %e, "failed to persist recovered item");
                }
            }
        }
        metrics
            .quarantined
            .fetch_add(state.quarantined.len() as u64, Ordering::Relaxed);

        let mut resolver = ConflictResolver::new(
            self.config.default_conflict_strategy,
            self.config.conflict_policies.clone(),
        );
        for (entity_type, merger) in self.resolver_mergers {
            resolver = resolver.with_merger(entity_type, merger);
        }
        if let Some(merger) = self.fallback_merger {
            resolver = resolver.with_fallback_merger(merger);
        }

        info!(
            items = state.len(),
            dead_letters = state.dead_letters.len(),
            recovered = recovered.len(),
            quarantined = state.quarantined.len(),
            "sync engine initialised"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            retry: self.config.retry_policy(),
            admission: AdmissionController::new(&self.config),
            events: EventBus::new(self.config.event_channel_capacity),
            resolver,
            state: Mutex::new(state),
            storage: self.storage,
            remote: self.remote,
            clock,
            metrics,
            connectivity: self.connectivity.unwrap_or_default(),
            wake: Notify::new(),
            shutdown: shutdown_tx,
            closed: AtomicBool::new(false),
            config: self.config,
        });

        let handle = self
            .run_dispatcher
            .then(|| tokio::spawn(dispatcher::run(Arc::clone(&shared), shutdown_rx)));

        Ok(SyncEngine {
            shared,
            dispatcher: std::sync::Mutex::new(handle),
        })
    }
}

/// The engine instance. Construct once at startup and hand out references;
/// call [`SyncEngine::shutdown`] before the process exits.
pub struct SyncEngine {
    shared: Arc<Shared>,
    dispatcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn builder(
        config: EngineConfig,
        storage: Arc<dyn QueueStorage>,
        remote: Arc<dyn RemoteStore>,
    ) -> SyncEngineBuilder {
        SyncEngineBuilder {
            config,
            storage,
            remote,
            connectivity: None,
            clock: None,
            resolver_mergers: Vec::new(),
            fallback_merger: None,
            run_dispatcher: true,
        }
    }

    pub async fn init(
        config: EngineConfig,
        storage: Arc<dyn QueueStorage>,
        remote: Arc<dyn RemoteStore>,
        connectivity: ConnectivityMonitor,
    ) -> Result<Self, EngineError> {
        Self::builder(config, storage, remote)
            .connectivity(connectivity)
            .init()
            .await
    }

    pub async fn enqueue(
        &self,
        operation: Operation,
        entity_type: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        priority: Priority,
    ) -> Result<ItemId, AdmissionError> {
        self.submit(EnqueueRequest::new(operation, entity_type, payload, priority))
            .await
            .map(|receipt| receipt.item_id)
    }

    #[instrument(skip(self, request), fields(entity_type = %request.entity_type, priority = request.priority.as_str()))]
    pub async fn submit(&self, request: EnqueueRequest) -> Result<AdmissionReceipt, AdmissionError> {
        if self.shared.is_closed() {
            return Err(AdmissionError::ShutDown);
        }

        let shared = &self.shared;
        let mut state = shared.state.lock().await;
        let now = shared.clock.now();
        let (receipt, events) = shared
            .admission
            .admit(&mut state, shared.storage.as_ref(), &shared.metrics, request, now)
            .await?;
        drop(state);

        for event in events {
            shared.events.emit(event);
        }
        if matches!(
            receipt.outcome,
            AdmissionOutcome::Admitted | AdmissionOutcome::Merged
        ) {
            shared.wake.notify_one();
        }
        Ok(receipt)
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.shared.stats().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.shared.connectivity
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Live or dead-lettered item.
    pub async fn item(&self, id: &ItemId) -> Option<MutationItem> {
        let state = self.shared.state.lock().await;
        state
            .items
            .get(id)
            .or_else(|| state.dead_letters.get(id).map(|r| &r.item))
            .cloned()
    }

    pub async fn item_status(&self, id: &ItemId) -> SyncStatus {
        let state = self.shared.state.lock().await;
        if state.items.contains_key(id) {
            SyncStatus::Pending
        } else if state.dead_letters.contains(id) {
            SyncStatus::Failed
        } else if state.index.was_committed(id) {
            SyncStatus::Synced
        } else {
            SyncStatus::Unknown
        }
    }

    pub async fn list_dead_letters(&self, filter: &DeadLetterFilter) -> Vec<DeadLetterRecord> {
        self.shared.state.lock().await.dead_letters.list(filter)
    }

    /// Puts a dead item back in the queue with a fresh retry budget. Goes
    /// through the same capacity bound as a new admission.
    #[instrument(skip(self, id), fields(item_id = %id))]
    pub async fn requeue_dead_letter(&self, id: &ItemId) -> Result<ItemId, DeadLetterError> {
        if self.shared.is_closed() {
            return Err(DeadLetterError::ShutDown);
        }
        let shared = &self.shared;
        let mut state = shared.state.lock().await;
        let now = shared.clock.now();

        let record = state
            .dead_letters
            .get(id)
            .cloned()
            .ok_or_else(|| DeadLetterError::NotFound(id.clone()))?;
        if state.index.live_item(&record.item.idempotency_key).is_some() {
            return Err(DeadLetterError::KeyInUse(id.clone()));
        }

        let evicted = shared
            .admission
            .make_room(&mut state, shared.storage.as_ref(), &shared.metrics, record.item.priority, now)
            .await
            .map_err(|e| match e {
                AdmissionError::QueueFull { max } => DeadLetterError::QueueFull { max },
                AdmissionError::Storage(msg) => DeadLetterError::Storage(msg),
                AdmissionError::ShutDown => DeadLetterError::ShutDown,
                other => DeadLetterError::Storage(other.to_string()),
            })?;

        let item = prepare_requeue(&record, now);
        if let Err(e) = shared.storage.requeue_dead_letter(&item).await {
            bump(&shared.metrics.storage_errors);
            return Err(DeadLetterError::Storage(e.to_string()));
        }

        state.dead_letters.remove(id);
        state
            .index
            .insert_live(item.idempotency_key.clone(), item.id.clone(), item.payload_hash);
        state.items.insert(item.id.clone(), item.clone());
        drop(state);

        bump(&shared.metrics.requeued);
        info!(reason = %record.reason, "dead letter requeued");
        if let Some(victim) = evicted {
            shared.events.emit(SyncEvent::Evicted {
                item_id: victim.id,
                entity_type: victim.entity_type,
                priority: victim.priority,
                timestamp: now,
            });
        }
        shared.events.emit(SyncEvent::transition(
            &item,
            Some(ItemState::DeadLetter),
            now,
            Some("manual requeue".into()),
        ));
        shared.wake.notify_one();
        Ok(item.id)
    }

    /// Drops dead letters that died before `older_than`. Returns how many.
    #[instrument(skip(self))]
    pub async fn purge_dead_letters(&self, older_than: UnixTimeMs) -> Result<usize, DeadLetterError> {
        let shared = &self.shared;
        let mut state = shared.state.lock().await;
        let expired = state.dead_letters.expired(older_than);
        if expired.is_empty() {
            return Ok(0);
        }

        if let Err(e) = shared.storage.remove_dead_letters(&expired).await {
            bump(&shared.metrics.storage_errors);
            return Err(DeadLetterError::Storage(e.to_string()));
        }
        for id in &expired {
            state.dead_letters.remove(id);
        }
        drop(state);

        let now = shared.clock.now();
        for id in &expired {
            bump(&shared.metrics.purged);
            shared.events.emit(SyncEvent::Purged {
                item_id: id.clone(),
                timestamp: now,
            });
        }
        info!(purged = expired.len(), "dead letters purged");
        Ok(expired.len())
    }

    pub async fn quarantined(&self) -> Vec<QuarantinedRecord> {
        self.shared.state.lock().await.quarantined.clone()
    }

    /// Runs one dispatch pass now. Returns the number of attempts started.
    pub async fn dispatch_pass(&self) -> usize {
        if !self.shared.connectivity.is_online() {
            return 0;
        }
        dispatcher::dispatch_pass(&self.shared).await
    }

    /// Nudges the dispatcher, e.g. after advancing a manual clock.
    pub fn wake(&self) {
        self.shared.wake.notify_one();
    }

    /// Stops the dispatcher, abandoning in-flight sends, and flushes storage.
    /// Abandoned items are still `Dispatching` on disk and resume as `Queued`
    /// on the next start.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyShutDown);
        }
        let _ = self.shared.shutdown.send(true);

        let handle = self
            .dispatcher
            .lock()
            .map(|mut guard| guard.take())
            .unwrap_or(None);
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }

        self.shared.storage.persist_snapshot().await?;
        info!("sync engine shut down");
        Ok(())
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.dispatcher.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}
