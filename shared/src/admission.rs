//! Admission control: validation, deduplication and the capacity bound.

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::event::SyncEvent;
use crate::idempotency::{derive_key, payload_hash, KeyParts, Reservation};
use crate::metrics::{bump, SyncMetrics};
use crate::model::{DeviceId, IdempotencyKey, ItemId, MutationItem, Operation, PendingEdit, Priority, UnixTimeMs};
use crate::queue::QueueState;
use crate::state::ItemState;
use crate::storage::{QueueStorage, StorageError};

const MAX_RECORD_KEY_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("queue is full ({max} items) and nothing can be evicted")]
    QueueFull { max: usize },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("engine is shut down")]
    ShutDown,
}

impl From<StorageError> for AdmissionError {
    fn from(e: StorageError) -> Self {
        AdmissionError::Storage(e.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnqueueRequest {
    pub operation: Operation,
    pub entity_type: String,
    pub payload: Vec<u8>,
    pub priority: Priority,
    pub record_key: Option<String>,
    pub base_payload: Option<Vec<u8>>,
}

impl EnqueueRequest {
    pub fn new(
        operation: Operation,
        entity_type: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        priority: Priority,
    ) -> Self {
        Self {
            operation,
            entity_type: entity_type.into(),
            payload: payload.into(),
            priority,
            record_key: None,
            base_payload: None,
        }
    }

    /// Identifies the logical record so that later edits collapse into the
    /// pending item instead of queuing a second write.
    pub fn with_record_key(mut self, record_key: impl Into<String>) -> Self {
        self.record_key = Some(record_key.into());
        self
    }

    /// Remote copy the edit was made against, for field merges.
    pub fn with_base_payload(mut self, base: impl Into<Vec<u8>>) -> Self {
        self.base_payload = Some(base.into());
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdmissionOutcome {
    /// A new item was queued.
    Admitted,
    /// The payload of the live item with the same key was replaced.
    Merged,
    /// The live item is on the wire; the edit follows once it settles.
    Deferred,
    /// Identical to a live or recently committed item; nothing was queued.
    Duplicate,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdmissionReceipt {
    pub item_id: ItemId,
    pub outcome: AdmissionOutcome,
    pub evicted: Option<ItemId>,
}

pub(crate) struct AdmissionController {
    max_queue_size: usize,
    max_retries: u32,
    bucket_ms: u64,
    max_payload_bytes: usize,
    max_entity_type_len: usize,
    device_id: DeviceId,
}

impl AdmissionController {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            max_queue_size: config.max_queue_size,
            max_retries: config.max_retries,
            bucket_ms: config.idempotency_bucket_ms,
            max_payload_bytes: config.max_payload_bytes,
            max_entity_type_len: config.max_entity_type_len,
            device_id: config.device_id.clone(),
        }
    }

    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    pub fn validate(&self, request: &mut EnqueueRequest) -> Result<(), AdmissionError> {
        let entity_type = request.entity_type.trim();
        if entity_type.is_empty() {
            return Err(AdmissionError::InvalidInput("entity type cannot be empty".into()));
        }
        if entity_type.len() > self.max_entity_type_len {
            return Err(AdmissionError::InvalidInput(format!(
                "entity type exceeds {} bytes",
                self.max_entity_type_len
            )));
        }
        if entity_type.chars().any(char::is_control) {
            return Err(AdmissionError::InvalidInput(
                "entity type contains control characters".into(),
            ));
        }
        request.entity_type = entity_type.to_string();

        if request.payload.len() > self.max_payload_bytes {
            return Err(AdmissionError::InvalidInput(format!(
                "payload of {} bytes exceeds {} bytes",
                request.payload.len(),
                self.max_payload_bytes
            )));
        }
        if request.payload.is_empty() && request.operation != Operation::Delete {
            return Err(AdmissionError::InvalidInput(format!(
                "{} requires a payload",
                request.operation.as_str()
            )));
        }

        if let Some(record_key) = &request.record_key {
            if record_key.trim().is_empty() || record_key.len() > MAX_RECORD_KEY_LEN {
                return Err(AdmissionError::InvalidInput(format!(
                    "record key must be 1..={MAX_RECORD_KEY_LEN} bytes"
                )));
            }
        }
        Ok(())
    }

    pub fn key_for(&self, request: &EnqueueRequest, now: UnixTimeMs) -> IdempotencyKey {
        derive_key(KeyParts {
            entity_type: &request.entity_type,
            operation: request.operation,
            record_key: request.record_key.as_deref(),
            payload: &request.payload,
            at: now,
            bucket_ms: self.bucket_ms,
        })
    }

    /// Runs one admission against `state`. Storage is written before `state`
    /// changes; on error `state` is as it was, apart from an eviction that
    /// already reached storage. Returned events are for the caller to emit.
    pub async fn admit(
        &self,
        state: &mut QueueState,
        storage: &dyn QueueStorage,
        metrics: &SyncMetrics,
        mut request: EnqueueRequest,
        now: UnixTimeMs,
    ) -> Result<(AdmissionReceipt, Vec<SyncEvent>), AdmissionError> {
        self.validate(&mut request)?;

        let hash = payload_hash(&request.payload);
        let key = self.key_for(&request, now);
        let candidate = ItemId::generate();
        let mut events = Vec::new();

        let supersedes = match state.index.check_and_reserve(&key, hash, &candidate) {
            Reservation::DuplicateIdentical(existing) | Reservation::AlreadyCommitted(existing) => {
                bump(&metrics.duplicates_dropped);
                debug!(item_id = %existing, "duplicate submission dropped");
                return Ok((
                    AdmissionReceipt {
                        item_id: existing,
                        outcome: AdmissionOutcome::Duplicate,
                        evicted: None,
                    },
                    events,
                ));
            }
            Reservation::DuplicateConflicting(existing) => {
                return self
                    .merge_into(state, storage, metrics, existing, &key, request, hash, now)
                    .await;
            }
            Reservation::Supersedes(done) => Some(done),
            Reservation::New => None,
        };

        let evicted = match self.make_room(state, storage, metrics, request.priority, now).await {
            Ok(evicted) => evicted,
            Err(e) => {
                state.index.release(&key, &candidate);
                return Err(e);
            }
        };
        if let Some(item) = &evicted {
            events.push(SyncEvent::Evicted {
                item_id: item.id.clone(),
                entity_type: item.entity_type.clone(),
                priority: item.priority,
                timestamp: now,
            });
        }

        let item = MutationItem {
            id: candidate.clone(),
            idempotency_key: key.clone(),
            operation: request.operation,
            entity_type: request.entity_type,
            record_key: request.record_key,
            payload: request.payload,
            payload_hash: hash,
            base_payload: request.base_payload,
            priority: request.priority,
            local_version: supersedes.map_or(1, |done| done.local_version.saturating_add(1)),
            state: ItemState::Queued,
            retry_count: 0,
            max_retries: self.max_retries,
            conflict_count: 0,
            attempt_count: 0,
            created_at: now,
            updated_at: now,
            scheduled_at: now,
            device_id: self.device_id.clone(),
            last_error: None,
            pending_edit: None,
        };

        if let Err(e) = storage.append(&item).await {
            state.index.release(&key, &candidate);
            bump(&metrics.storage_errors);
            return Err(e.into());
        }

        bump(&metrics.enqueued);
        events.push(SyncEvent::transition(&item, None, now, None));
        state.items.insert(candidate.clone(), item);

        Ok((
            AdmissionReceipt {
                item_id: candidate,
                outcome: AdmissionOutcome::Admitted,
                evicted: evicted.map(|i| i.id),
            },
            events,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    async fn merge_into(
        &self,
        state: &mut QueueState,
        storage: &dyn QueueStorage,
        metrics: &SyncMetrics,
        existing: ItemId,
        key: &IdempotencyKey,
        request: EnqueueRequest,
        hash: crate::model::PayloadHash,
        now: UnixTimeMs,
    ) -> Result<(AdmissionReceipt, Vec<SyncEvent>), AdmissionError> {
        let Some(current) = state.items.get(&existing) else {
            // index and queue disagree; trust the queue
            state.index.release(key, &existing);
            return Err(AdmissionError::Storage(format!(
                "index points at missing item {existing}"
            )));
        };

        let mut next = current.clone();
        let mut events = Vec::new();
        let outcome = if next.state.is_in_flight() {
            next.pending_edit = Some(PendingEdit {
                payload: request.payload,
                payload_hash: hash,
                received_at: now,
            });
            AdmissionOutcome::Deferred
        } else {
            next.apply_edit(request.payload, hash, now);
            AdmissionOutcome::Merged
        };

        if let Err(e) = storage.update(&next).await {
            bump(&metrics.storage_errors);
            return Err(e.into());
        }

        state.index.update_hash(key, hash);
        match outcome {
            AdmissionOutcome::Deferred => {
                bump(&metrics.deferred_edits);
                debug!(item_id = %existing, "edit deferred until in-flight attempt settles");
            }
            _ => {
                bump(&metrics.merged);
                events.push(SyncEvent::Merged {
                    item_id: existing.clone(),
                    local_version: next.local_version,
                    timestamp: now,
                });
            }
        }
        state.items.insert(existing.clone(), next);

        Ok((
            AdmissionReceipt {
                item_id: existing,
                outcome,
                evicted: None,
            },
            events,
        ))
    }

    /// Frees one slot if the queue is at capacity, evicting per policy.
    pub async fn make_room(
        &self,
        state: &mut QueueState,
        storage: &dyn QueueStorage,
        metrics: &SyncMetrics,
        incoming: Priority,
        now: UnixTimeMs,
    ) -> Result<Option<MutationItem>, AdmissionError> {
        if state.len() < self.max_queue_size {
            return Ok(None);
        }

        let Some(victim_id) = state.eviction_candidate() else {
            bump(&metrics.rejected_full);
            warn!(
                max = self.max_queue_size,
                priority = incoming.as_str(),
                "queue full, admission refused"
            );
            return Err(AdmissionError::QueueFull {
                max: self.max_queue_size,
            });
        };

        if let Err(e) = storage.remove(&victim_id).await {
            bump(&metrics.storage_errors);
            return Err(e.into());
        }

        let victim = state.items.remove(&victim_id);
        if let Some(item) = &victim {
            state.index.release(&item.idempotency_key, &item.id);
            bump(&metrics.evicted);
            warn!(
                item_id = %item.id,
                entity_type = %item.entity_type,
                priority = item.priority.as_str(),
                age_ms = now.millis_since(item.created_at),
                "evicted queued item to admit new work"
            );
        }
        Ok(victim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn controller(max: usize) -> AdmissionController {
        let config = EngineConfig {
            max_queue_size: max,
            device_id: DeviceId::new("device-a").unwrap(),
            ..EngineConfig::default()
        };
        AdmissionController::new(&config)
    }

    struct Fixture {
        controller: AdmissionController,
        state: QueueState,
        storage: MemoryStorage,
        metrics: SyncMetrics,
    }

    impl Fixture {
        fn new(max: usize) -> Self {
            Self {
                controller: controller(max),
                state: QueueState::new(16),
                storage: MemoryStorage::new(),
                metrics: SyncMetrics::new(),
            }
        }

        async fn admit(&mut self, request: EnqueueRequest, now: u64) -> Result<AdmissionReceipt, AdmissionError> {
            self.controller
                .admit(&mut self.state, &self.storage, &self.metrics, request, UnixTimeMs(now))
                .await
                .map(|(receipt, _)| receipt)
        }
    }

    fn mood(payload: &str, priority: Priority) -> EnqueueRequest {
        EnqueueRequest::new(Operation::Create, "mood_entry", payload, priority)
    }

    #[tokio::test]
    async fn admits_and_persists() {
        let mut f = Fixture::new(10);
        let receipt = f.admit(mood(r#"{"mood_score":4}"#, Priority::Normal), 1).await.unwrap();

        assert_eq!(receipt.outcome, AdmissionOutcome::Admitted);
        let stored = f.storage.item(&receipt.item_id).unwrap();
        assert_eq!(stored.state, ItemState::Queued);
        assert_eq!(stored.local_version, 1);
        assert_eq!(f.state.len(), 1);
    }

    #[tokio::test]
    async fn identical_submissions_collapse() {
        let mut f = Fixture::new(10);
        let first = f.admit(mood(r#"{"a":1,"b":2}"#, Priority::Normal), 1).await.unwrap();
        let second = f.admit(mood(r#"{"b":2,"a":1}"#, Priority::Normal), 2).await.unwrap();

        assert_eq!(second.outcome, AdmissionOutcome::Duplicate);
        assert_eq!(second.item_id, first.item_id);
        assert_eq!(f.state.len(), 1);
        assert_eq!(f.metrics.snapshot().duplicates_dropped, 1);
    }

    #[tokio::test]
    async fn edits_to_one_record_merge() {
        let mut f = Fixture::new(10);
        let req = |v: u32| {
            EnqueueRequest::new(Operation::Update, "mood_entry", format!(r#"{{"mood_score":{v}}}"#), Priority::Normal)
                .with_record_key("entry-1")
        };
        let first = f.admit(req(3), 1).await.unwrap();
        let second = f.admit(req(4), 2).await.unwrap();
        let third = f.admit(req(5), 3).await.unwrap();

        assert_eq!(second.outcome, AdmissionOutcome::Merged);
        assert_eq!(third.item_id, first.item_id);
        let item = &f.state.items[&first.item_id];
        assert_eq!(item.local_version, 3);
        assert_eq!(item.payload, br#"{"mood_score":5}"#);
        assert_eq!(f.storage.item(&first.item_id).unwrap().local_version, 3);
    }

    #[tokio::test]
    async fn edit_during_flight_is_deferred() {
        let mut f = Fixture::new(10);
        let req = |v: u32| {
            EnqueueRequest::new(Operation::Update, "mood_entry", format!(r#"{{"v":{v}}}"#), Priority::Normal)
                .with_record_key("entry-1")
        };
        let first = f.admit(req(1), 1).await.unwrap();
        f.state.items.get_mut(&first.item_id).unwrap().state = ItemState::Dispatching;

        let second = f.admit(req(2), 2).await.unwrap();
        assert_eq!(second.outcome, AdmissionOutcome::Deferred);
        let item = &f.state.items[&first.item_id];
        assert_eq!(item.payload, br#"{"v":1}"#);
        assert_eq!(item.pending_edit.as_ref().unwrap().payload, br#"{"v":2}"#);
    }

    #[tokio::test]
    async fn full_queue_evicts_lowest_oldest() {
        let mut f = Fixture::new(2);
        let old_low = f.admit(mood(r#"{"n":1}"#, Priority::Low), 1).await.unwrap();
        f.admit(mood(r#"{"n":2}"#, Priority::Low), 2).await.unwrap();

        let receipt = f.admit(mood(r#"{"n":3}"#, Priority::High), 3).await.unwrap();
        assert_eq!(receipt.evicted, Some(old_low.item_id.clone()));
        assert_eq!(f.state.len(), 2);
        assert!(f.storage.item(&old_low.item_id).is_none());
        assert_eq!(f.metrics.snapshot().evicted, 1);
    }

    #[tokio::test]
    async fn saturated_critical_queue_refuses() {
        let mut f = Fixture::new(2);
        f.admit(mood(r#"{"n":1}"#, Priority::Critical), 1).await.unwrap();
        f.admit(mood(r#"{"n":2}"#, Priority::Critical), 2).await.unwrap();

        let err = f.admit(mood(r#"{"n":3}"#, Priority::Critical), 3).await.unwrap_err();
        assert_eq!(err, AdmissionError::QueueFull { max: 2 });
        assert_eq!(f.state.len(), 2);
        assert_eq!(f.state.index.live_len(), 2);
        assert_eq!(f.metrics.snapshot().evicted, 0);
    }

    #[tokio::test]
    async fn low_priority_evicts_any_non_critical_item() {
        let mut f = Fixture::new(1);
        let normal = f.admit(mood(r#"{"n":1}"#, Priority::Normal), 1).await.unwrap();
        let low = f.admit(mood(r#"{"n":2}"#, Priority::Low), 2).await.unwrap();
        assert_eq!(low.evicted, Some(normal.item_id));
        assert_eq!(f.state.len(), 1);
    }

    #[tokio::test]
    async fn invalid_input_rejected() {
        let mut f = Fixture::new(10);
        assert!(matches!(
            f.admit(mood("{}", Priority::Low).with_record_key(" "), 1).await,
            Err(AdmissionError::InvalidInput(_))
        ));
        let blank = EnqueueRequest::new(Operation::Create, "  ", "{}", Priority::Low);
        assert!(matches!(f.admit(blank, 1).await, Err(AdmissionError::InvalidInput(_))));
        let empty = EnqueueRequest::new(Operation::Create, "mood_entry", Vec::new(), Priority::Low);
        assert!(matches!(f.admit(empty, 1).await, Err(AdmissionError::InvalidInput(_))));
        let delete = EnqueueRequest::new(Operation::Delete, "mood_entry", Vec::new(), Priority::Low)
            .with_record_key("entry-1");
        assert!(f.admit(delete, 1).await.is_ok());
    }

    #[tokio::test]
    async fn storage_failure_leaves_state_untouched() {
        let mut f = Fixture::new(10);
        f.storage.set_fail_writes(true);
        let err = f.admit(mood("{}", Priority::Normal), 1).await.unwrap_err();
        assert!(matches!(err, AdmissionError::Storage(_)));
        assert_eq!(f.state.len(), 0);
        assert_eq!(f.state.index.live_len(), 0);
    }

    #[tokio::test]
    async fn replay_after_commit() {
        let mut f = Fixture::new(10);
        let req = || mood(r#"{"mood_score":4}"#, Priority::Normal).with_record_key("entry-1");
        let first = f.admit(req(), 1).await.unwrap();
        let item = f.state.items.remove(&first.item_id).unwrap();
        f.state.index.mark_committed(&item);

        let again = f.admit(req(), 2).await.unwrap();
        assert_eq!(again.outcome, AdmissionOutcome::Duplicate);

        let changed = mood(r#"{"mood_score":9}"#, Priority::Normal).with_record_key("entry-1");
        let next = f.admit(changed, 3).await.unwrap();
        assert_eq!(next.outcome, AdmissionOutcome::Admitted);
        assert_eq!(f.state.items[&next.item_id].local_version, 2);
    }
}
