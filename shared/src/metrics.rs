use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct SyncMetrics {
    // Admission
    pub enqueued: AtomicU64,
    pub merged: AtomicU64,
    pub duplicates_dropped: AtomicU64,
    pub deferred_edits: AtomicU64,
    pub evicted: AtomicU64,
    pub rejected_full: AtomicU64,

    // Dispatch
    pub attempts: AtomicU64,
    pub committed: AtomicU64,
    pub conflicts: AtomicU64,
    pub transient_failures: AtomicU64,
    pub timeouts: AtomicU64,
    pub retries_scheduled: AtomicU64,
    pub dead_lettered: AtomicU64,

    // Dead letters
    pub requeued: AtomicU64,
    pub purged: AtomicU64,

    pub storage_errors: AtomicU64,
    pub quarantined: AtomicU64,
    pub invalid_transitions: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            enqueued: load(&self.enqueued),
            merged: load(&self.merged),
            duplicates_dropped: load(&self.duplicates_dropped),
            deferred_edits: load(&self.deferred_edits),
            evicted: load(&self.evicted),
            rejected_full: load(&self.rejected_full),
            attempts: load(&self.attempts),
            committed: load(&self.committed),
            conflicts: load(&self.conflicts),
            transient_failures: load(&self.transient_failures),
            timeouts: load(&self.timeouts),
            retries_scheduled: load(&self.retries_scheduled),
            dead_lettered: load(&self.dead_lettered),
            requeued: load(&self.requeued),
            purged: load(&self.purged),
            storage_errors: load(&self.storage_errors),
            quarantined: load(&self.quarantined),
            invalid_transitions: load(&self.invalid_transitions),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub enqueued: u64,
    pub merged: u64,
    pub duplicates_dropped: u64,
    pub deferred_edits: u64,
    pub evicted: u64,
    pub rejected_full: u64,
    pub attempts: u64,
    pub committed: u64,
    pub conflicts: u64,
    pub transient_failures: u64,
    pub timeouts: u64,
    pub retries_scheduled: u64,
    pub dead_lettered: u64,
    pub requeued: u64,
    pub purged: u64,
    pub storage_errors: u64,
    pub quarantined: u64,
    pub invalid_transitions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = SyncMetrics::new();
        bump(&metrics.enqueued);
        bump(&metrics.enqueued);
        bump(&metrics.evicted);
        let snap = metrics.snapshot();
        assert_eq!(snap.enqueued, 2);
        assert_eq!(snap.evicted, 1);
        assert_eq!(snap.committed, 0);
    }
}
