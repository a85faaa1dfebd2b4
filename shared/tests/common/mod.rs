#![allow(dead_code)]

use async_trait::async_trait;
use mutation_sync::{
    ConnectivityMonitor, DeviceId, EngineConfig, IdempotencyKey, ManualClock, QueueStorage,
    RemoteOutcome, RemoteStore, RemoteVersion, SyncEngine, SyncEvent, UnixTimeMs, WriteRequest,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

pub const T0: UnixTimeMs = UnixTimeMs(1_700_000_000_000);

#[derive(Clone, Debug)]
pub struct StoredRecord {
    pub key: IdempotencyKey,
    pub version: u64,
    pub payload: Vec<u8>,
    pub updated_at: UnixTimeMs,
    pub device_id: DeviceId,
}

#[derive(Default)]
struct FakeState {
    records: HashMap<String, StoredRecord>,
    script: VecDeque<RemoteOutcome>,
    writes: Vec<WriteRequest>,
}

/// Versioned key/value backend. Accepts a write when its version is newer
/// than the stored one, treats a replay of the stored write as a no-op, and
/// reports a conflict otherwise. Scripted outcomes take precedence.
#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<FakeState>,
    gate: Option<Arc<Notify>>,
    gated_once: AtomicBool,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first write blocks until the returned handle is notified.
    pub fn gated() -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let remote = Self {
            gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (remote, gate)
    }

    pub fn script(&self, outcome: RemoteOutcome) {
        self.state.lock().unwrap().script.push_back(outcome);
    }

    pub fn seed(&self, record_key: &str, version: u64, payload: &str, updated_at: UnixTimeMs) {
        self.state.lock().unwrap().records.insert(
            record_key.to_string(),
            StoredRecord {
                key: IdempotencyKey::new("seeded").unwrap(),
                version,
                payload: payload.as_bytes().to_vec(),
                updated_at,
                device_id: DeviceId::new("device-remote").unwrap(),
            },
        );
    }

    pub fn writes(&self) -> Vec<WriteRequest> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn record(&self, record_key: &str) -> Option<StoredRecord> {
        self.state.lock().unwrap().records.get(record_key).cloned()
    }

    pub fn record_count(&self) -> usize {
        self.state.lock().unwrap().records.len()
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn write(&self, request: WriteRequest) -> RemoteOutcome {
        if let Some(gate) = &self.gate {
            if !self.gated_once.swap(true, Ordering::SeqCst) {
                gate.notified().await;
            }
        }

        let mut state = self.state.lock().unwrap();
        state.writes.push(request.clone());
        if let Some(outcome) = state.script.pop_front() {
            return outcome;
        }

        let record_key = request
            .record_key
            .clone()
            .unwrap_or_else(|| request.idempotency_key.to_string());
        if let Some(stored) = state.records.get(&record_key) {
            if stored.key == request.idempotency_key && stored.version == request.local_version {
                return RemoteOutcome::Committed {
                    remote_version: stored.version,
                };
            }
            if stored.version >= request.local_version {
                return RemoteOutcome::Conflict(RemoteVersion {
                    version: stored.version,
                    payload: Some(stored.payload.clone()),
                    updated_at: Some(stored.updated_at),
                    device_id: Some(stored.device_id.clone()),
                });
            }
        }

        state.records.insert(
            record_key,
            StoredRecord {
                key: request.idempotency_key.clone(),
                version: request.local_version,
                payload: request.payload.to_vec(),
                updated_at: UnixTimeMs::now(),
                device_id: request.device_id.clone(),
            },
        );
        RemoteOutcome::Committed {
            remote_version: request.local_version,
        }
    }
}

pub fn config() -> EngineConfig {
    EngineConfig {
        device_id: DeviceId::new("device-a").unwrap(),
        base_delay_ms: 100,
        max_delay_ms: 1_000,
        ..EngineConfig::default()
    }
}

/// Engine without a background loop, driven by `dispatch_pass` and a
/// hand-moved clock.
pub async fn manual_engine(
    config: EngineConfig,
    storage: Arc<dyn QueueStorage>,
    remote: Arc<FakeRemote>,
    clock: Arc<ManualClock>,
    online: bool,
) -> SyncEngine {
    SyncEngine::builder(config, storage, remote)
        .connectivity(ConnectivityMonitor::new(online))
        .clock(clock)
        .manual_dispatch()
        .init()
        .await
        .unwrap()
}

/// Waits for the first event matching `pred`.
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<SyncEvent>, mut pred: F) -> SyncEvent
where
    F: FnMut(&SyncEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
