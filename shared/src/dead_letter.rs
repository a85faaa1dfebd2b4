//! Permanently failed items, kept for inspection and manual retry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::model::{ItemId, MutationItem, Priority, UnixTimeMs};
use crate::remote::RemoteVersion;
use crate::state::ItemState;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeadLetterReason {
    MaxRetriesExceeded { retries: u32 },
    PermanentRejection { code: String, message: String },
    Irreconcilable { reason: String },
    ConflictLimitExceeded { rounds: u32 },
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxRetriesExceeded { retries } => write!(f, "gave up after {retries} retries"),
            Self::PermanentRejection { code, message } => {
                write!(f, "rejected by remote ({code}): {message}")
            }
            Self::Irreconcilable { reason } => write!(f, "irreconcilable conflict: {reason}"),
            Self::ConflictLimitExceeded { rounds } => {
                write!(f, "still conflicting after {rounds} resolution rounds")
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub item: MutationItem,
    pub reason: DeadLetterReason,
    pub dead_at: UnixTimeMs,
    /// Remote copy at the time of failure, attached for conflict review.
    pub remote: Option<RemoteVersion>,
}

impl DeadLetterRecord {
    pub fn id(&self) -> &ItemId {
        &self.item.id
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeadLetterFilter {
    pub entity_type: Option<String>,
    pub priority: Option<Priority>,
    pub dead_after: Option<UnixTimeMs>,
    pub dead_before: Option<UnixTimeMs>,
}

impl DeadLetterFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn entity_type(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: Some(entity_type.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &DeadLetterRecord) -> bool {
        self.entity_type
            .as_deref()
            .map_or(true, |t| record.item.entity_type == t)
            && self.priority.map_or(true, |p| record.item.priority == p)
            && self.dead_after.map_or(true, |t| record.dead_at >= t)
            && self.dead_before.map_or(true, |t| record.dead_at < t)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeadLetterError {
    #[error("no dead letter with id {0}")]
    NotFound(ItemId),

    #[error("a live item already carries idempotency key for {0}")]
    KeyInUse(ItemId),

    #[error("queue is full ({max} items)")]
    QueueFull { max: usize },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("engine is shut down")]
    ShutDown,
}

/// In-memory view of dead-lettered records. Persistence goes through
/// [`crate::storage::QueueStorage`]; this type only indexes and filters.
#[derive(Debug, Default)]
pub struct DeadLetterStore {
    records: BTreeMap<ItemId, DeadLetterRecord>,
}

impl DeadLetterStore {
    pub fn from_records(records: impl IntoIterator<Item = DeadLetterRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|r| (r.item.id.clone(), r))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &ItemId) -> Option<&DeadLetterRecord> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.records.contains_key(id)
    }

    pub fn store(&mut self, record: DeadLetterRecord) {
        self.records.insert(record.item.id.clone(), record);
    }

    /// Matching records, oldest failure first.
    pub fn list(&self, filter: &DeadLetterFilter) -> Vec<DeadLetterRecord> {
        let mut out: Vec<_> = self
            .records
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.dead_at.cmp(&b.dead_at).then_with(|| a.item.id.cmp(&b.item.id)));
        out
    }

    pub fn remove(&mut self, id: &ItemId) -> Option<DeadLetterRecord> {
        self.records.remove(id)
    }

    /// Ids of records that died strictly before `cutoff`.
    pub fn expired(&self, cutoff: UnixTimeMs) -> Vec<ItemId> {
        self.records
            .values()
            .filter(|r| r.dead_at < cutoff)
            .map(|r| r.item.id.clone())
            .collect()
    }
}

/// Resets a dead item for another round of delivery.
pub fn prepare_requeue(record: &DeadLetterRecord, now: UnixTimeMs) -> MutationItem {
    let mut item = record.item.clone();
    item.state = ItemState::Queued;
    item.retry_count = 0;
    item.conflict_count = 0;
    item.scheduled_at = now;
    item.updated_at = now;
    item.last_error = None;
    item
}
