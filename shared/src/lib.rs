//! Offline-first mutation sync.
//!
//! Local writes are admitted into a bounded, durable queue and delivered to
//! a remote store once connectivity allows. Each item carries an idempotency
//! key so retries and replays never double-apply, version conflicts are
//! resolved by last-write-wins or a field merge, and items that cannot be
//! delivered end up in an inspectable dead-letter store instead of being
//! dropped.
//!
//! ```text
//! enqueue -> admission -> storage -> dispatcher -> RemoteStore
//!                                        |-> conflict resolver
//!                                        |-> backoff
//!                                        `-> dead letters
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod admission;
pub mod backoff;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod connectivity;
pub mod crypto;
pub mod dead_letter;
mod dispatcher;
pub mod engine;
pub mod event;
pub mod idempotency;
pub mod metrics;
pub mod model;
mod queue;
pub mod remote;
pub mod state;
pub mod storage;

#[cfg(test)]
mod test_support;

pub use admission::{AdmissionError, AdmissionOutcome, AdmissionReceipt, EnqueueRequest};
pub use backoff::{RetryDecision, RetryPolicy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EngineConfig};
pub use conflict::{ConflictResolver, ConflictStrategy, FieldMerger, JsonFieldMerger, MergeOutcome, Resolution, Winner};
pub use connectivity::ConnectivityMonitor;
pub use crypto::{CryptoError, CryptoProvider, KeyRing, StoreContext};
pub use dead_letter::{DeadLetterError, DeadLetterFilter, DeadLetterReason, DeadLetterRecord};
pub use engine::{EngineError, SyncEngine, SyncEngineBuilder, SyncStatus};
pub use event::{PriorityCounts, QueueStats, StateCounts, SyncEvent, TransitionEvent};
pub use metrics::MetricsSnapshot;
pub use model::{DeviceId, IdempotencyKey, ItemId, MutationItem, Operation, PayloadHash, Priority, UnixTimeMs};
pub use remote::{ErrorCategory, RemoteFailure, RemoteOutcome, RemoteStore, RemoteVersion, WriteRequest};
pub use state::ItemState;
pub use storage::{FileStorage, LoadedState, MemoryStorage, QuarantinedRecord, QueueStorage, StorageError};
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use storage::SqliteStorage;
