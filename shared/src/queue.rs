//! In-memory queue state. Guarded by the engine's single mutex; every change
//! here is mirrored to storage by the caller before it becomes visible.

use std::collections::HashMap;

use crate::dead_letter::DeadLetterStore;
use crate::event::QueueStats;
use crate::idempotency::IdempotencyIndex;
use crate::model::{ItemId, MutationItem, UnixTimeMs};
use crate::state::ItemState;
use crate::storage::{LoadedState, QuarantinedRecord};

#[derive(Debug)]
pub(crate) struct QueueState {
    pub items: HashMap<ItemId, MutationItem>,
    pub index: IdempotencyIndex,
    pub dead_letters: DeadLetterStore,
    pub quarantined: Vec<QuarantinedRecord>,
}

impl QueueState {
    pub fn new(committed_key_cache_size: usize) -> Self {
        Self {
            items: HashMap::new(),
            index: IdempotencyIndex::new(committed_key_cache_size),
            dead_letters: DeadLetterStore::default(),
            quarantined: Vec::new(),
        }
    }

    /// Builds state from a load, resetting anything that was mid-attempt.
    /// Returns the ids whose state changed and must be written back.
    pub fn restore(
        loaded: LoadedState,
        committed_key_cache_size: usize,
        now: UnixTimeMs,
    ) -> (Self, Vec<ItemId>) {
        let mut state = Self::new(committed_key_cache_size);
        let mut recovered = Vec::new();

        for mut item in loaded.items {
            if !item.is_live() {
                continue;
            }
            let resumed = item.state.recovered();
            if resumed != item.state {
                item.state = resumed;
                item.updated_at = now;
                item.scheduled_at = item.scheduled_at.min(now);
                // the interrupted attempt is void, so a stashed edit can ride the next one
                item.apply_pending_edit(now);
                recovered.push(item.id.clone());
            }
            state.items.insert(item.id.clone(), item);
        }

        state.index.rebuild(state.items.values());
        state.dead_letters = DeadLetterStore::from_records(loaded.dead_letters);
        state.quarantined = loaded.quarantined;
        (state, recovered)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Highest priority first, FIFO within a tier, among items that are due.
    pub fn next_eligible(&self, now: UnixTimeMs) -> Option<&MutationItem> {
        self.items
            .values()
            .filter(|i| i.is_eligible(now))
            .min_by(|a, b| a.dispatch_order(b))
    }

    /// Earliest future `scheduled_at` among queued items.
    pub fn next_wake(&self, now: UnixTimeMs) -> Option<UnixTimeMs> {
        self.items
            .values()
            .filter(|i| i.state == ItemState::Queued && i.scheduled_at > now)
            .map(|i| i.scheduled_at)
            .min()
    }

    pub fn in_flight(&self) -> usize {
        self.items.values().filter(|i| i.state.is_in_flight()).count()
    }

    /// Lowest priority, then oldest, among items at rest. Critical items are
    /// never candidates.
    pub fn eviction_candidate(&self) -> Option<ItemId> {
        self.items
            .values()
            .filter(|i| i.state == ItemState::Queued && i.priority.is_evictable())
            .min_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| a.created_at.cmp(&b.created_at))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|i| i.id.clone())
    }

    pub fn stats(&self, max_size: usize, overflow_count: u64) -> QueueStats {
        let mut stats = QueueStats::collect(self.items.values(), max_size, overflow_count);
        stats.dead_letter_count = self.dead_letters.len();
        stats.quarantined_count = self.quarantined.len();
        stats
    }
}
