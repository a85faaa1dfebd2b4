//! The dispatch loop and the settlement of each network attempt.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::backoff::RetryDecision;
use crate::conflict::Resolution;
use crate::dead_letter::{DeadLetterReason, DeadLetterRecord};
use crate::engine::Shared;
use crate::event::SyncEvent;
use crate::idempotency::payload_hash;
use crate::metrics::bump;
use crate::model::{ItemId, MutationItem, Operation, UnixTimeMs};
use crate::queue::QueueState;
use crate::remote::{RemoteFailure, RemoteOutcome, RemoteVersion, WriteRequest};
use crate::state::ItemState;

/// Parks until something could make work eligible: connectivity, a new
/// admission, the earliest backoff deadline, or shutdown. Nothing is timed
/// while offline.
pub(crate) async fn run(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut online_rx = shared.connectivity.subscribe();
    let mut stats_tick = shared
        .config
        .stats_interval_ms
        .map(|ms| tokio::time::interval(Duration::from_millis(ms)));

    info!("dispatcher started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        let online = *online_rx.borrow_and_update();
        let next_wake = if online {
            dispatch_pass(&shared).await;
            shared.next_wake().await
        } else {
            None
        };
        let sleep_for = next_wake.map(|at| Duration::from_millis(at.millis_since(shared.clock.now())));

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            changed = online_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = shared.wake.notified() => {}
            _ = sleep_or_park(sleep_for) => {}
            _ = tick(&mut stats_tick), if online => {
                let stats = shared.stats().await;
                shared.events.emit(SyncEvent::Stats(stats));
            }
        }
    }
    info!("dispatcher stopped");
}

async fn sleep_or_park(duration: Option<Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Drains eligible items until the batch is spent, nothing is eligible, or
/// connectivity drops. Up to `worker_count` attempts run at once. Returns the
/// number of attempts started.
pub(crate) async fn dispatch_pass(shared: &Arc<Shared>) -> usize {
    let mut workers = JoinSet::new();
    let mut claimed = 0usize;

    loop {
        let can_claim = !shared.is_closed()
            && shared.connectivity.is_online()
            && claimed < shared.config.batch_size
            && workers.len() < shared.config.worker_count;

        if can_claim {
            if let Some(item) = claim_next(shared).await {
                claimed += 1;
                let shared = Arc::clone(shared);
                workers.spawn(async move { attempt(&shared, item).await });
                continue;
            }
        }

        if workers.join_next().await.is_none() {
            break;
        }
    }

    if claimed > 0 {
        debug!(claimed, "dispatch pass finished");
    }
    claimed
}

/// Moves the next eligible item to `Dispatching` and persists that before any
/// network call.
async fn claim_next(shared: &Shared) -> Option<MutationItem> {
    let mut state = shared.state.lock().await;
    let now = shared.clock.now();

    let mut item = state.next_eligible(now)?.clone();
    if let Err(e) = item.transition(ItemState::Dispatching, now) {
        bump(&shared.metrics.invalid_transitions);
        error!(item_id = %item.id, error = %e, "cannot claim item");
        return None;
    }
    item.attempt_count = item.attempt_count.saturating_add(1);

    if let Err(e) = shared.storage.update(&item).await {
        bump(&shared.metrics.storage_errors);
        error!(item_id = %item.id, error = %e, "failed to persist dispatch claim");
        if let Some(stuck) = state.items.get_mut(&item.id) {
            stuck.scheduled_at = now.add_millis(shared.retry.capped_delay(stuck.retry_count));
        }
        return None;
    }
    state.items.insert(item.id.clone(), item.clone());
    drop(state);

    bump(&shared.metrics.attempts);
    debug!(item_id = %item.id, priority = item.priority.as_str(), attempt = item.attempt_count, "dispatching");
    shared
        .events
        .emit(SyncEvent::transition(&item, Some(ItemState::Queued), now, None));
    Some(item)
}

async fn attempt(shared: &Shared, item: MutationItem) {
    let request = WriteRequest::from_item(&item);
    let outcome = match tokio::time::timeout(shared.config.send_timeout(), shared.remote.write(request)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            bump(&shared.metrics.timeouts);
            RemoteOutcome::Transient(RemoteFailure::timeout(shared.config.send_timeout_ms))
        }
    };
    settle(shared, &item.id, outcome).await;
}

/// Collected transitions of one settlement, emitted once the lock is gone.
struct Settlement {
    now: UnixTimeMs,
    events: Vec<SyncEvent>,
}

impl Settlement {
    fn step(&mut self, item: &mut MutationItem, to: ItemState, reason: Option<String>) -> bool {
        match item.transition(to, self.now) {
            Ok(from) => {
                self.events
                    .push(SyncEvent::transition(item, Some(from), self.now, reason));
                true
            }
            Err(_) => false,
        }
    }
}

pub(crate) async fn settle(shared: &Shared, id: &ItemId, outcome: RemoteOutcome) {
    let mut state = shared.state.lock().await;
    let now = shared.clock.now();

    let Some(item) = state.items.get(id).cloned() else {
        warn!(item_id = %id, "settled item is no longer queued");
        return;
    };
    if item.state != ItemState::Dispatching {
        bump(&shared.metrics.invalid_transitions);
        warn!(item_id = %id, state = %item.state, "settled item is not dispatching");
        return;
    }

    let mut settlement = Settlement {
        now,
        events: Vec::new(),
    };
    let transient = matches!(outcome, RemoteOutcome::Transient(_));
    let result = match outcome {
        RemoteOutcome::Committed { remote_version } => {
            on_committed(shared, &mut state, item, remote_version, &mut settlement).await
        }
        RemoteOutcome::Conflict(remote) => {
            on_conflict(shared, &mut state, item, remote, &mut settlement).await
        }
        RemoteOutcome::Transient(failure) => {
            on_transient(shared, &mut state, item, failure, &mut settlement).await
        }
        RemoteOutcome::Permanent(failure) => {
            let mut item = item;
            item.last_error = Some(failure.to_string());
            let reason = DeadLetterReason::PermanentRejection {
                code: failure.code,
                message: failure.message,
            };
            dead_letter(shared, &mut state, item, reason, None, &mut settlement).await
        }
    };

    if let Err(e) = result {
        // Storage still holds `Dispatching`, which restart recovery resets.
        // Until then keep the item alive in memory behind a backoff delay.
        bump(&shared.metrics.storage_errors);
        error!(item_id = %id, error = %e, "failed to persist settlement");
        if let Some(item) = state.items.get_mut(id) {
            item.state = ItemState::Queued;
            if transient {
                item.retry_count = item.retry_count.saturating_add(1);
            }
            item.scheduled_at = now.add_millis(shared.retry.capped_delay(item.retry_count));
        }
        settlement.events.clear();
    }
    drop(state);

    for event in settlement.events {
        shared.events.emit(event);
    }
}

async fn on_committed(
    shared: &Shared,
    state: &mut QueueState,
    mut item: MutationItem,
    remote_version: u64,
    settlement: &mut Settlement,
) -> Result<(), crate::storage::StorageError> {
    let now = settlement.now;
    let follow_up = item.pending_edit.take().map(|edit| {
        let mut next = item.clone();
        next.id = ItemId::generate();
        next.operation = match item.operation {
            Operation::Create => Operation::Update,
            op => op,
        };
        next.base_payload = Some(item.payload.clone());
        next.payload = edit.payload;
        next.payload_hash = edit.payload_hash;
        next.local_version = item.local_version.max(remote_version).saturating_add(1);
        next.state = ItemState::Queued;
        next.retry_count = 0;
        next.conflict_count = 0;
        next.attempt_count = 0;
        next.created_at = edit.received_at;
        next.updated_at = now;
        next.scheduled_at = now;
        next.last_error = None;
        next
    });

    // Queue the follow-up before dropping the committed item so a crash in
    // between re-sends (deduplicated remotely) instead of losing the edit.
    if let Some(next) = &follow_up {
        shared.storage.append(next).await?;
    }
    shared.storage.remove(&item.id).await?;

    settlement.step(
        &mut item,
        ItemState::Committed,
        Some(format!("remote version {remote_version}")),
    );
    state.items.remove(&item.id);
    state.index.mark_committed(&item);
    bump(&shared.metrics.committed);
    info!(item_id = %item.id, entity_type = %item.entity_type, remote_version, "committed");

    if let Some(next) = follow_up {
        state
            .index
            .insert_live(next.idempotency_key.clone(), next.id.clone(), next.payload_hash);
        settlement.events.push(SyncEvent::transition(
            &next,
            None,
            now,
            Some(format!("edit received while {} was in flight", item.id)),
        ));
        state.items.insert(next.id.clone(), next);
        bump(&shared.metrics.enqueued);
    }
    Ok(())
}

async fn on_conflict(
    shared: &Shared,
    state: &mut QueueState,
    mut item: MutationItem,
    remote: RemoteVersion,
    settlement: &mut Settlement,
) -> Result<(), crate::storage::StorageError> {
    bump(&shared.metrics.conflicts);
    settlement.step(
        &mut item,
        ItemState::ConflictCheck,
        Some(format!("remote holds version {}", remote.version)),
    );
    item.conflict_count = item.conflict_count.saturating_add(1);
    item.last_error = Some(format!(
        "version conflict: local {} vs remote {}",
        item.local_version, remote.version
    ));
    warn!(
        item_id = %item.id,
        local_version = item.local_version,
        remote_version = remote.version,
        round = item.conflict_count,
        "version conflict"
    );

    if item.conflict_count > shared.config.max_conflict_rounds {
        let reason = DeadLetterReason::ConflictLimitExceeded {
            rounds: item.conflict_count,
        };
        return dead_letter(shared, state, item, reason, Some(remote), settlement).await;
    }

    match shared.resolver.resolve(&item, &remote) {
        Resolution::Resolved {
            payload,
            operation,
            local_version,
            base_payload,
            winner,
        } => {
            item.payload_hash = payload_hash(&payload);
            item.payload = payload;
            item.operation = operation;
            item.local_version = local_version;
            item.base_payload = base_payload;
            item.apply_pending_edit(settlement.now);
            item.scheduled_at = settlement.now;
            settlement.step(
                &mut item,
                ItemState::Queued,
                Some(format!("resolved, {winner:?} wins")),
            );

            shared.storage.update(&item).await?;
            state.index.update_hash(&item.idempotency_key, item.payload_hash);
            state.items.insert(item.id.clone(), item);
            Ok(())
        }
        Resolution::Irreconcilable { reason } => {
            let reason = DeadLetterReason::Irreconcilable { reason };
            dead_letter(shared, state, item, reason, Some(remote), settlement).await
        }
    }
}

async fn on_transient(
    shared: &Shared,
    state: &mut QueueState,
    mut item: MutationItem,
    failure: RemoteFailure,
    settlement: &mut Settlement,
) -> Result<(), crate::storage::StorageError> {
    let now = settlement.now;
    bump(&shared.metrics.transient_failures);
    settlement.step(&mut item, ItemState::Failed, Some(failure.to_string()));
    item.last_error = Some(failure.to_string());

    let decision = shared.retry.decide(&item, now, &mut rand::thread_rng());
    item.retry_count = item.retry_count.saturating_add(1);

    match decision {
        RetryDecision::GiveUp => {
            let reason = DeadLetterReason::MaxRetriesExceeded {
                retries: item.retry_count,
            };
            dead_letter(shared, state, item, reason, None, settlement).await
        }
        RetryDecision::RetryAt(at) => {
            item.scheduled_at = at;
            item.apply_pending_edit(now);
            let delay = at.millis_since(now);
            settlement.step(&mut item, ItemState::Retry, Some(format!("retry in {delay}ms")));
            settlement.step(&mut item, ItemState::Queued, None);

            shared.storage.update(&item).await?;
            state.index.update_hash(&item.idempotency_key, item.payload_hash);
            state.items.insert(item.id.clone(), item);
            bump(&shared.metrics.retries_scheduled);
            warn!(error = %failure, retry_in_ms = delay, "transient failure, retry scheduled");
            Ok(())
        }
    }
}

async fn dead_letter(
    shared: &Shared,
    state: &mut QueueState,
    mut item: MutationItem,
    reason: DeadLetterReason,
    remote: Option<RemoteVersion>,
    settlement: &mut Settlement,
) -> Result<(), crate::storage::StorageError> {
    let now = settlement.now;
    let mut dead = item.clone();
    dead.state = ItemState::DeadLetter;
    dead.updated_at = now;
    let record = DeadLetterRecord {
        item: dead,
        reason: reason.clone(),
        dead_at: now,
        remote,
    };
    shared.storage.store_dead_letter(&record).await?;

    settlement.step(&mut item, ItemState::DeadLetter, Some(reason.to_string()));
    state.items.remove(&item.id);
    state.index.release(&item.idempotency_key, &item.id);
    state.dead_letters.store(record);
    bump(&shared.metrics.dead_lettered);
    warn!(item_id = %item.id, entity_type = %item.entity_type, %reason, "moved to dead letter");
    Ok(())
}
