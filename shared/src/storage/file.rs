//! Encrypted single-file snapshot backend.
//!
//! The file is a sealed CBOR envelope `{magic, schema_version, checksum,
//! payload}`. The payload holds one checksummed blob per record, so a damaged
//! record is set aside on load without losing its neighbours. A file that
//! cannot be opened at all is renamed to `<name>.corrupt-<ms>` and the store
//! starts empty. If that rename fails the store refuses writes, so the
//! unreadable file is never overwritten.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use super::{
    decode_cbor, encode_cbor, LoadedState, QuarantinedRecord, QueueStorage, StorageError,
    CURRENT_SCHEMA_VERSION, MAX_STORE_BYTES,
};
use crate::clock::{Clock, SystemClock};
use crate::crypto::{CryptoProvider, StoreContext};
use crate::dead_letter::DeadLetterRecord;
use crate::model::{ItemId, MutationItem, UnixTimeMs};

const STORE_MAGIC: &[u8; 4] = b"MSQS";
const STORE_NAME: &str = "mutation-queue";
const AAD_VERSION: u32 = 1;

#[derive(Serialize, Deserialize, Debug)]
struct StoreEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct SnapshotPayload {
    items: Vec<RecordBlob>,
    dead_letters: Vec<RecordBlob>,
    quarantined: Vec<QuarantinedRecord>,
}

#[derive(Serialize, Deserialize, Debug)]
struct RecordBlob {
    key: String,
    checksum: [u8; 32],
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
}

impl RecordBlob {
    fn seal<T: Serialize>(key: &ItemId, value: &T) -> Result<Self, StorageError> {
        let data = encode_cbor(value)?;
        Ok(Self {
            key: key.to_string(),
            checksum: *blake3::hash(&data).as_bytes(),
            data,
        })
    }

    fn open<T: serde::de::DeserializeOwned>(&self) -> Result<T, StorageError> {
        let actual = blake3::hash(&self.data);
        if actual.as_bytes() != &self.checksum {
            return Err(StorageError::IntegrityCheckFailed {
                expected: hex::encode(self.checksum),
                actual: actual.to_hex().to_string(),
            });
        }
        decode_cbor(&self.data)
    }
}

#[derive(Clone, Debug, Default)]
struct Snapshot {
    items: BTreeMap<ItemId, MutationItem>,
    dead_letters: BTreeMap<ItemId, DeadLetterRecord>,
    quarantined: Vec<QuarantinedRecord>,
}

struct FileInner {
    path: PathBuf,
    crypto: Arc<dyn CryptoProvider>,
    ctx: StoreContext,
    clock: Arc<dyn Clock>,
    max_bytes: usize,
    state: Mutex<Snapshot>,
    /// Set when an unreadable file could not be moved aside.
    frozen: AtomicBool,
}

#[derive(Clone)]
pub struct FileStorage {
    inner: Arc<FileInner>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>, crypto: Arc<dyn CryptoProvider>, ctx: StoreContext) -> Self {
        Self {
            inner: Arc::new(FileInner {
                path: path.into(),
                crypto,
                ctx,
                clock: Arc::new(SystemClock),
                max_bytes: MAX_STORE_BYTES,
                state: Mutex::new(Snapshot::default()),
                frozen: AtomicBool::new(false),
            }),
        }
    }

    /// Lowers the size cap. Writes that would exceed it fail, and a file
    /// larger than it is quarantined on load.
    #[must_use]
    pub fn with_max_bytes(self, max_bytes: usize) -> Self {
        self.reconfigure(|inner| inner.max_bytes = max_bytes.min(MAX_STORE_BYTES))
    }

    /// Clock used to stamp quarantine records and `.corrupt-<ms>` names.
    #[must_use]
    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        self.reconfigure(|inner| inner.clock = clock)
    }

    fn reconfigure(mut self, f: impl FnOnce(&mut FileInner)) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            f(inner);
        }
        self
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&FileInner) -> Result<T, StorageError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner)).await?
    }
}

impl FileInner {
    /// Applies `f` to a copy of the snapshot, writes it, and only then makes
    /// it the current state.
    fn mutate<F>(&self, f: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut Snapshot) -> Result<(), StorageError>,
    {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(format!(
                "unreadable {} could not be moved aside",
                self.path.display()
            )));
        }
        let mut state = self.state.lock().map_err(|_| StorageError::LockPoisoned)?;
        let mut next = state.clone();
        f(&mut next)?;
        self.write(&next)?;
        *state = next;
        Ok(())
    }

    fn aad(&self) -> Result<Vec<u8>, StorageError> {
        Ok(self.ctx.aad(STORE_NAME, AAD_VERSION)?)
    }

    fn seal(&self, snapshot: &Snapshot) -> Result<Vec<u8>, StorageError> {
        let payload = SnapshotPayload {
            items: snapshot
                .items
                .iter()
                .map(|(id, item)| RecordBlob::seal(id, item))
                .collect::<Result<_, _>>()?,
            dead_letters: snapshot
                .dead_letters
                .iter()
                .map(|(id, record)| RecordBlob::seal(id, record))
                .collect::<Result<_, _>>()?,
            quarantined: snapshot.quarantined.clone(),
        };
        self.seal_payload(&payload)
    }

    fn seal_payload(&self, payload: &SnapshotPayload) -> Result<Vec<u8>, StorageError> {
        let payload_bytes = encode_cbor(payload)?;
        let envelope = StoreEnvelope {
            magic: *STORE_MAGIC,
            schema_version: CURRENT_SCHEMA_VERSION,
            checksum: *blake3::hash(&payload_bytes).as_bytes(),
            payload: payload_bytes,
        };
        let envelope_bytes = encode_cbor(&envelope)?;
        Ok(self.crypto.encrypt(&envelope_bytes, &self.aad()?)?)
    }

    fn write(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let sealed = self.seal(snapshot)?;
        if sealed.len() > self.max_bytes {
            return Err(StorageError::StoreTooLarge {
                size: sealed.len(),
                max: self.max_bytes,
            });
        }
        self.write_bytes(&sealed)
    }

    fn write_bytes(&self, bytes: &[u8]) -> Result<(), StorageError> {
        let tmp_path = self.path.with_extension("tmp");

        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;

        std::fs::rename(&tmp_path, &self.path)?;

        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }

    fn unseal(&self, sealed: &[u8]) -> Result<SnapshotPayload, StorageError> {
        if sealed.is_empty() {
            return Err(StorageError::Corrupted {
                reason: "empty file",
            });
        }
        if sealed.len() > self.max_bytes {
            return Err(StorageError::StoreTooLarge {
                size: sealed.len(),
                max: self.max_bytes,
            });
        }

        let envelope_bytes = self.crypto.decrypt(sealed, &self.aad()?)?;
        let envelope: StoreEnvelope = decode_cbor(&envelope_bytes)?;

        if envelope.magic != *STORE_MAGIC {
            return Err(StorageError::Corrupted {
                reason: "invalid magic bytes",
            });
        }
        if envelope.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(StorageError::FutureSchema {
                found: envelope.schema_version,
                max: CURRENT_SCHEMA_VERSION,
            });
        }
        if envelope.schema_version != CURRENT_SCHEMA_VERSION {
            return Err(StorageError::UnknownSchema(envelope.schema_version));
        }

        let actual = blake3::hash(&envelope.payload);
        if actual.as_bytes() != &envelope.checksum {
            return Err(StorageError::IntegrityCheckFailed {
                expected: hex::encode(envelope.checksum),
                actual: actual.to_hex().to_string(),
            });
        }

        decode_cbor(&envelope.payload)
    }

    fn load(&self) -> Result<LoadedState, StorageError> {
        let now = self.clock.now();
        let sealed = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LoadedState::default());
            }
            Err(e) => return Err(e.into()),
        };

        let mut snapshot = Snapshot::default();
        match self.unseal(&sealed) {
            Ok(payload) => {
                snapshot.quarantined = payload.quarantined;
                for blob in payload.items {
                    match blob.open::<MutationItem>() {
                        Ok(item) => {
                            snapshot.items.insert(item.id.clone(), item);
                        }
                        Err(e) => snapshot.quarantined.push(quarantine_blob(blob, &e, now)),
                    }
                }
                for blob in payload.dead_letters {
                    match blob.open::<DeadLetterRecord>() {
                        Ok(record) => {
                            snapshot.dead_letters.insert(record.item.id.clone(), record);
                        }
                        Err(e) => snapshot.quarantined.push(quarantine_blob(blob, &e, now)),
                    }
                }
            }
            Err(e) => {
                let aside = match self.move_aside(now) {
                    Ok(aside) => aside,
                    Err(move_err) => {
                        self.frozen.store(true, Ordering::SeqCst);
                        error!(error = %e, rename_error = %move_err, "queue snapshot unreadable and could not be moved aside");
                        return Err(move_err);
                    }
                };
                error!(error = %e, moved_to = %aside.display(), "queue snapshot unreadable, starting empty");
                snapshot.quarantined.push(QuarantinedRecord {
                    key: aside.display().to_string(),
                    reason: e.to_string(),
                    at: now,
                    raw: Vec::new(),
                });
            }
        }

        info!(
            items = snapshot.items.len(),
            dead_letters = snapshot.dead_letters.len(),
            quarantined = snapshot.quarantined.len(),
            "queue snapshot loaded"
        );

        let loaded = LoadedState {
            items: snapshot.items.values().cloned().collect(),
            dead_letters: snapshot.dead_letters.values().cloned().collect(),
            quarantined: snapshot.quarantined.clone(),
        };
        *self.state.lock().map_err(|_| StorageError::LockPoisoned)? = snapshot;
        Ok(loaded)
    }

    fn move_aside(&self, now: UnixTimeMs) -> Result<PathBuf, StorageError> {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| STORE_NAME.to_string());
        let aside = self.path.with_file_name(format!("{name}.corrupt-{}", now.0));
        std::fs::rename(&self.path, &aside)?;
        Ok(aside)
    }
}

fn quarantine_blob(blob: RecordBlob, err: &StorageError, now: UnixTimeMs) -> QuarantinedRecord {
    warn!(key = %blob.key, error = %err, "quarantining unreadable record");
    QuarantinedRecord {
        key: blob.key,
        reason: err.to_string(),
        at: now,
        raw: blob.data,
    }
}

#[async_trait]
impl QueueStorage for FileStorage {
    async fn load_all(&self) -> Result<LoadedState, StorageError> {
        self.blocking(|inner| inner.load()).await
    }

    async fn append(&self, item: &MutationItem) -> Result<(), StorageError> {
        let item = item.clone();
        self.blocking(move |inner| {
            inner.mutate(|s| {
                s.items.insert(item.id.clone(), item);
                Ok(())
            })
        })
        .await
    }

    async fn update(&self, item: &MutationItem) -> Result<(), StorageError> {
        let item = item.clone();
        self.blocking(move |inner| {
            inner.mutate(|s| match s.items.get_mut(&item.id) {
                Some(slot) => {
                    *slot = item;
                    Ok(())
                }
                None => Err(StorageError::NotFound(item.id)),
            })
        })
        .await
    }

    async fn remove(&self, id: &ItemId) -> Result<(), StorageError> {
        let id = id.clone();
        self.blocking(move |inner| {
            inner.mutate(|s| {
                s.items.remove(&id);
                Ok(())
            })
        })
        .await
    }

    async fn store_dead_letter(&self, record: &DeadLetterRecord) -> Result<(), StorageError> {
        let record = record.clone();
        self.blocking(move |inner| {
            inner.mutate(|s| {
                s.items.remove(&record.item.id);
                s.dead_letters.insert(record.item.id.clone(), record);
                Ok(())
            })
        })
        .await
    }

    async fn requeue_dead_letter(&self, item: &MutationItem) -> Result<(), StorageError> {
        let item = item.clone();
        self.blocking(move |inner| {
            inner.mutate(|s| {
                if s.dead_letters.remove(&item.id).is_none() {
                    return Err(StorageError::NotFound(item.id));
                }
                s.items.insert(item.id.clone(), item);
                Ok(())
            })
        })
        .await
    }

    async fn remove_dead_letters(&self, ids: &[ItemId]) -> Result<(), StorageError> {
        let ids = ids.to_vec();
        self.blocking(move |inner| {
            inner.mutate(|s| {
                for id in &ids {
                    s.dead_letters.remove(id);
                }
                Ok(())
            })
        })
        .await
    }

    async fn persist_snapshot(&self) -> Result<(), StorageError> {
        self.blocking(|inner| inner.mutate(|_| Ok(()))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::crypto::KeyRing;
    use crate::dead_letter::DeadLetterReason;
    use crate::model::Priority;
    use crate::state::ItemState;
    use crate::test_support::sample_item;
    use tempfile::tempdir;

    fn crypto() -> Arc<dyn CryptoProvider> {
        Arc::new(KeyRing::single(&[3u8; 32]).unwrap())
    }

    fn ctx() -> StoreContext {
        StoreContext::new("user123", "device456")
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("queue.bin"), crypto(), ctx());
        let loaded = storage.load_all().await.unwrap();
        assert!(loaded.items.is_empty());
        assert!(loaded.quarantined.is_empty());
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.bin");
        let crypto = crypto();

        let storage = FileStorage::new(&path, Arc::clone(&crypto), ctx());
        storage.load_all().await.unwrap();
        let mut item = sample_item("a", Priority::High, 10);
        storage.append(&item).await.unwrap();
        item.state = ItemState::Dispatching;
        storage.update(&item).await.unwrap();
        storage
            .append(&sample_item("b", Priority::Low, 11))
            .await
            .unwrap();
        storage.remove(&ItemId::new("b").unwrap()).await.unwrap();

        let reopened = FileStorage::new(&path, crypto, ctx());
        let loaded = reopened.load_all().await.unwrap();
        assert_eq!(loaded.items.len(), 1);
        assert_eq!(loaded.items[0].state, ItemState::Dispatching);
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn dead_letters_persist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.bin");
        let storage = FileStorage::new(&path, crypto(), ctx());
        let item = sample_item("a", Priority::Normal, 1);
        storage.append(&item).await.unwrap();
        storage
            .store_dead_letter(&DeadLetterRecord {
                item,
                reason: DeadLetterReason::MaxRetriesExceeded { retries: 5 },
                dead_at: UnixTimeMs(9),
                remote: None,
            })
            .await
            .unwrap();

        let loaded = FileStorage::new(&path, crypto(), ctx()).load_all().await.unwrap();
        assert!(loaded.items.is_empty());
        assert_eq!(loaded.dead_letters.len(), 1);
    }

    #[tokio::test]
    async fn garbage_file_is_moved_aside() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.bin");
        std::fs::write(&path, b"definitely not a sealed envelope").unwrap();

        let storage = FileStorage::new(&path, crypto(), ctx());
        let loaded = storage.load_all().await.unwrap();

        assert!(loaded.items.is_empty());
        assert_eq!(loaded.quarantined.len(), 1);
        assert!(!path.exists());
        let aside: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("queue.bin.corrupt-"))
            .collect();
        assert_eq!(aside.len(), 1);

        // the store keeps working after quarantine
        storage
            .append(&sample_item("a", Priority::Normal, 1))
            .await
            .unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn wrong_context_is_quarantined() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.bin");
        let crypto = crypto();
        let storage = FileStorage::new(&path, Arc::clone(&crypto), ctx());
        storage
            .append(&sample_item("a", Priority::Normal, 1))
            .await
            .unwrap();

        let other = FileStorage::new(&path, crypto, StoreContext::new("user123", "elsewhere"));
        let loaded = other.load_all().await.unwrap();
        assert!(loaded.items.is_empty());
        assert_eq!(loaded.quarantined.len(), 1);
    }

    #[tokio::test]
    async fn single_bad_record_is_quarantined() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.bin");
        let storage = FileStorage::new(&path, crypto(), ctx());

        let good = sample_item("good", Priority::Normal, 1);
        let mut bad = RecordBlob::seal(&ItemId::new("bad").unwrap(), &sample_item("bad", Priority::Normal, 2)).unwrap();
        bad.data[0] ^= 0xFF;
        let payload = SnapshotPayload {
            items: vec![RecordBlob::seal(&good.id, &good).unwrap(), bad],
            dead_letters: Vec::new(),
            quarantined: Vec::new(),
        };
        let sealed = storage.inner.seal_payload(&payload).unwrap();
        std::fs::write(&path, sealed).unwrap();

        let loaded = storage.load_all().await.unwrap();
        assert_eq!(loaded.items.len(), 1);
        assert_eq!(loaded.items[0].id, good.id);
        assert_eq!(loaded.quarantined.len(), 1);
        assert_eq!(loaded.quarantined[0].key, "bad");

        // quarantine survives the next write
        storage.persist_snapshot().await.unwrap();
        let reloaded = FileStorage::new(&path, crypto(), ctx()).load_all().await.unwrap();
        assert_eq!(reloaded.quarantined.len(), 1);
    }

    #[tokio::test]
    async fn write_past_size_cap_is_refused_and_store_stays_loadable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.bin");
        let storage = FileStorage::new(&path, crypto(), ctx()).with_max_bytes(8 * 1024);
        storage.load_all().await.unwrap();

        let mut stored = 0;
        let mut refused = None;
        for n in 0..64 {
            let mut item = sample_item(&format!("item-{n}"), Priority::Normal, n);
            item.payload = vec![b'x'; 1024];
            match storage.append(&item).await {
                Ok(()) => stored += 1,
                Err(e) => {
                    refused = Some(e);
                    break;
                }
            }
        }
        assert!(stored > 0);
        assert!(matches!(
            refused,
            Some(StorageError::StoreTooLarge { max: 8192, .. })
        ));

        // the refused write changed nothing, on disk or in memory
        storage.persist_snapshot().await.unwrap();
        let reloaded = FileStorage::new(&path, crypto(), ctx())
            .with_max_bytes(8 * 1024)
            .load_all()
            .await
            .unwrap();
        assert_eq!(reloaded.items.len(), stored);
        assert!(reloaded.quarantined.is_empty());
    }

    #[tokio::test]
    async fn failed_move_aside_blocks_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.bin");
        std::fs::write(&path, b"definitely not a sealed envelope").unwrap();
        let clock = Arc::new(ManualClock::new(UnixTimeMs(42)));
        // a directory sitting on the quarantine name makes the rename fail
        let blocker = dir.path().join("queue.bin.corrupt-42");
        std::fs::create_dir(&blocker).unwrap();
        std::fs::write(blocker.join("keep"), b"x").unwrap();

        let storage = FileStorage::new(&path, crypto(), ctx()).with_clock(clock);
        assert!(storage.load_all().await.is_err());

        let result = storage.append(&sample_item("a", Priority::Normal, 1)).await;
        assert!(matches!(result, Err(StorageError::Unavailable(_))));
        assert_eq!(
            std::fs::read(&path).unwrap(),
            b"definitely not a sealed envelope"
        );
    }

    #[tokio::test]
    async fn requeue_of_unknown_record_fails_without_writing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.bin");
        let storage = FileStorage::new(&path, crypto(), ctx());
        let result = storage
            .requeue_dead_letter(&sample_item("a", Priority::Normal, 1))
            .await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
        assert!(!path.exists());
    }
}
