//! Observer stream: one event per state transition plus periodic stats.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::model::{ItemId, MutationItem, Priority, UnixTimeMs};
use crate::state::ItemState;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TransitionEvent {
    pub item_id: ItemId,
    pub entity_type: String,
    /// `None` when the item was just admitted.
    pub from_state: Option<ItemState>,
    pub to_state: ItemState,
    pub timestamp: UnixTimeMs,
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PriorityCounts {
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl PriorityCounts {
    pub fn get(&self, priority: Priority) -> usize {
        match priority {
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
        }
    }

    fn slot(&mut self, priority: Priority) -> &mut usize {
        match priority {
            Priority::Critical => &mut self.critical,
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub queued: usize,
    pub dispatching: usize,
    pub conflict_check: usize,
    pub failed: usize,
    pub retry: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub size: usize,
    pub max_size: usize,
    pub utilization_percent: f64,
    pub overflow_count: u64,
    pub priority_counts: PriorityCounts,
    pub state_counts: StateCounts,
    pub dead_letter_count: usize,
    pub quarantined_count: usize,
}

impl QueueStats {
    pub fn collect<'a>(
        items: impl IntoIterator<Item = &'a MutationItem>,
        max_size: usize,
        overflow_count: u64,
    ) -> Self {
        let mut stats = Self {
            max_size,
            overflow_count,
            ..Self::default()
        };
        for item in items {
            stats.size += 1;
            *stats.priority_counts.slot(item.priority) += 1;
            match item.state {
                ItemState::Queued => stats.state_counts.queued += 1,
                ItemState::Dispatching => stats.state_counts.dispatching += 1,
                ItemState::ConflictCheck => stats.state_counts.conflict_check += 1,
                ItemState::Failed => stats.state_counts.failed += 1,
                ItemState::Retry => stats.state_counts.retry += 1,
                ItemState::Committed | ItemState::DeadLetter => {}
            }
        }
        stats.utilization_percent = if max_size == 0 {
            0.0
        } else {
            stats.size as f64 * 100.0 / max_size as f64
        };
        stats
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    Transition(TransitionEvent),
    /// A duplicate-conflicting submission replaced the payload of a live item.
    Merged {
        item_id: ItemId,
        local_version: u64,
        timestamp: UnixTimeMs,
    },
    /// Dropped to make room for a new admission.
    Evicted {
        item_id: ItemId,
        entity_type: String,
        priority: Priority,
        timestamp: UnixTimeMs,
    },
    Purged {
        item_id: ItemId,
        timestamp: UnixTimeMs,
    },
    Stats(QueueStats),
}

impl SyncEvent {
    pub fn transition(
        item: &MutationItem,
        from_state: Option<ItemState>,
        timestamp: UnixTimeMs,
        reason: Option<String>,
    ) -> Self {
        SyncEvent::Transition(TransitionEvent {
            item_id: item.id.clone(),
            entity_type: item.entity_type.clone(),
            from_state,
            to_state: item.state,
            timestamp,
            reason,
        })
    }
}

/// Fan-out of [`SyncEvent`]s. Slow subscribers lag and lose old events;
/// the engine never waits for them.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}
