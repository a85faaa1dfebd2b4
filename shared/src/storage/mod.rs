//! Durable queue store.
//!
//! Every mutating call is atomic with respect to process termination: after a
//! crash the backend holds either the old or the new state of the record,
//! never a torn write. Moves between the queue and the dead-letter collection
//! are a single atomic step.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::CryptoError;
use crate::dead_letter::DeadLetterRecord;
use crate::model::{ItemId, MutationItem, UnixTimeMs};

pub mod file;
pub mod memory;
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub mod sqlite;

pub use file::FileStorage;
pub use memory::MemoryStorage;
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use sqlite::SqliteStorage;

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Largest sealed snapshot a single-file backend writes or reads back.
pub const MAX_STORE_BYTES: usize = 100 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("corrupted store: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("unknown schema version: {0}")]
    UnknownSchema(u32),

    #[error("store too large: {size} bytes, max {max}")]
    StoreTooLarge { size: usize, max: usize },

    #[error("record not found: {0}")]
    NotFound(ItemId),

    #[error("database error: {0}")]
    Database(String),

    #[error("lock poisoned")]
    LockPoisoned,

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<ciborium::de::Error<std::io::Error>> for StorageError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StorageError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(e: tokio::task::JoinError) -> Self {
        StorageError::Unavailable(e.to_string())
    }
}

/// A record (or whole segment) that could not be read back. The raw bytes are
/// kept so the data can be recovered by hand.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantinedRecord {
    pub key: String,
    pub reason: String,
    pub at: UnixTimeMs,
    #[serde(with = "serde_bytes")]
    pub raw: Vec<u8>,
}

/// Everything recoverable from a backend at startup.
#[derive(Debug, Default)]
pub struct LoadedState {
    pub items: Vec<MutationItem>,
    pub dead_letters: Vec<DeadLetterRecord>,
    /// Records set aside during this or earlier loads.
    pub quarantined: Vec<QuarantinedRecord>,
}

#[async_trait]
pub trait QueueStorage: Send + Sync + 'static {
    /// Reads back all state. Unreadable records are quarantined, not returned
    /// as errors; `Err` means the backend itself could not be reached.
    async fn load_all(&self) -> Result<LoadedState, StorageError>;

    async fn append(&self, item: &MutationItem) -> Result<(), StorageError>;

    async fn update(&self, item: &MutationItem) -> Result<(), StorageError>;

    /// Removing an absent id is not an error.
    async fn remove(&self, id: &ItemId) -> Result<(), StorageError>;

    /// Removes the item from the queue and stores the record in one step.
    async fn store_dead_letter(&self, record: &DeadLetterRecord) -> Result<(), StorageError>;

    /// Removes the dead-letter record with `item.id` and appends `item` to
    /// the queue in one step.
    async fn requeue_dead_letter(&self, item: &MutationItem) -> Result<(), StorageError>;

    async fn remove_dead_letters(&self, ids: &[ItemId]) -> Result<(), StorageError>;

    /// Flushes any buffered state.
    async fn persist_snapshot(&self) -> Result<(), StorageError>;
}

pub(crate) fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out)?;
    Ok(out)
}

pub(crate) fn decode_cbor<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    Ok(ciborium::from_reader(bytes)?)
}
