use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{LoadedState, QuarantinedRecord, QueueStorage, StorageError};
use crate::dead_letter::DeadLetterRecord;
use crate::model::{ItemId, MutationItem};

#[derive(Default)]
struct Records {
    items: HashMap<ItemId, MutationItem>,
    dead_letters: HashMap<ItemId, DeadLetterRecord>,
    quarantined: Vec<QuarantinedRecord>,
}

#[derive(Default)]
struct Inner {
    records: Mutex<Records>,
    fail_writes: AtomicBool,
    writes: AtomicU64,
}

/// Volatile backend. Clones share state, so a test can keep a handle and
/// "restart" an engine over the same records.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from pre-existing records, as if loaded from disk.
    pub fn seeded(items: Vec<MutationItem>, dead_letters: Vec<DeadLetterRecord>) -> Self {
        let storage = Self::new();
        if let Ok(mut records) = storage.inner.records.lock() {
            records.items = items.into_iter().map(|i| (i.id.clone(), i)).collect();
            records.dead_letters = dead_letters
                .into_iter()
                .map(|r| (r.item.id.clone(), r))
                .collect();
        }
        storage
    }

    /// Makes every subsequent write fail until switched off again.
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn write_count(&self) -> u64 {
        self.inner.writes.load(Ordering::SeqCst)
    }

    pub fn item(&self, id: &ItemId) -> Option<MutationItem> {
        self.lock().ok()?.items.get(id).cloned()
    }

    pub fn items(&self) -> Vec<MutationItem> {
        self.lock()
            .map(|r| r.items.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.lock()
            .map(|r| r.dead_letters.values().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Records>, StorageError> {
        self.inner.records.lock().map_err(|_| StorageError::LockPoisoned)
    }

    fn write(&self) -> Result<MutexGuard<'_, Records>, StorageError> {
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("injected write failure".into()));
        }
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        self.lock()
    }
}

#[async_trait]
impl QueueStorage for MemoryStorage {
    async fn load_all(&self) -> Result<LoadedState, StorageError> {
        let records = self.lock()?;
        Ok(LoadedState {
            items: records.items.values().cloned().collect(),
            dead_letters: records.dead_letters.values().cloned().collect(),
            quarantined: records.quarantined.clone(),
        })
    }

    async fn append(&self, item: &MutationItem) -> Result<(), StorageError> {
        self.write()?.items.insert(item.id.clone(), item.clone());
        Ok(())
    }

    async fn update(&self, item: &MutationItem) -> Result<(), StorageError> {
        let mut records = self.write()?;
        match records.items.get_mut(&item.id) {
            Some(slot) => {
                *slot = item.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound(item.id.clone())),
        }
    }

    async fn remove(&self, id: &ItemId) -> Result<(), StorageError> {
        self.write()?.items.remove(id);
        Ok(())
    }

    async fn store_dead_letter(&self, record: &DeadLetterRecord) -> Result<(), StorageError> {
        let mut records = self.write()?;
        records.items.remove(&record.item.id);
        records
            .dead_letters
            .insert(record.item.id.clone(), record.clone());
        Ok(())
    }

    async fn requeue_dead_letter(&self, item: &MutationItem) -> Result<(), StorageError> {
        let mut records = self.write()?;
        if records.dead_letters.remove(&item.id).is_none() {
            return Err(StorageError::NotFound(item.id.clone()));
        }
        records.items.insert(item.id.clone(), item.clone());
        Ok(())
    }

    async fn remove_dead_letters(&self, ids: &[ItemId]) -> Result<(), StorageError> {
        let mut records = self.write()?;
        for id in ids {
            records.dead_letters.remove(id);
        }
        Ok(())
    }

    async fn persist_snapshot(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dead_letter::DeadLetterReason;
    use crate::model::{Priority, UnixTimeMs};
    use crate::test_support::sample_item;

    #[tokio::test]
    async fn append_update_remove() {
        let storage = MemoryStorage::new();
        let mut item = sample_item("a", Priority::Normal, 1);

        storage.append(&item).await.unwrap();
        item.retry_count = 2;
        storage.update(&item).await.unwrap();
        assert_eq!(storage.item(&item.id).unwrap().retry_count, 2);

        storage.remove(&item.id).await.unwrap();
        assert!(storage.load_all().await.unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn update_of_missing_item_fails() {
        let storage = MemoryStorage::new();
        let item = sample_item("a", Priority::Normal, 1);
        assert!(matches!(
            storage.update(&item).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn dead_letter_moves_are_paired() {
        let storage = MemoryStorage::new();
        let item = sample_item("a", Priority::Normal, 1);
        storage.append(&item).await.unwrap();

        let record = DeadLetterRecord {
            item: item.clone(),
            reason: DeadLetterReason::Irreconcilable { reason: "x".into() },
            dead_at: UnixTimeMs(5),
            remote: None,
        };
        storage.store_dead_letter(&record).await.unwrap();
        let loaded = storage.load_all().await.unwrap();
        assert!(loaded.items.is_empty());
        assert_eq!(loaded.dead_letters.len(), 1);

        storage.requeue_dead_letter(&item).await.unwrap();
        let loaded = storage.load_all().await.unwrap();
        assert_eq!(loaded.items.len(), 1);
        assert!(loaded.dead_letters.is_empty());
    }

    #[tokio::test]
    async fn injected_failures() {
        let storage = MemoryStorage::new();
        storage.set_fail_writes(true);
        let item = sample_item("a", Priority::Normal, 1);
        assert!(storage.append(&item).await.is_err());

        storage.set_fail_writes(false);
        storage.append(&item).await.unwrap();
        assert_eq!(storage.write_count(), 1);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let storage = MemoryStorage::new();
        let other = storage.clone();
        storage
            .append(&sample_item("a", Priority::Low, 1))
            .await
            .unwrap();
        assert_eq!(other.items().len(), 1);
    }
}
