//! Idempotency keys and the index that enforces one live item per key.

use lru::LruCache;
use std::borrow::Cow;
use std::collections::HashMap;
use std::num::NonZeroUsize;

use crate::model::{IdempotencyKey, ItemId, MutationItem, Operation, PayloadHash, UnixTimeMs};

/// Canonical form used for hashing. JSON payloads are re-serialised with
/// sorted keys and no whitespace; anything else is hashed as-is.
pub fn normalize_payload(payload: &[u8]) -> Cow<'_, [u8]> {
    match serde_json::from_slice::<serde_json::Value>(payload) {
        Ok(value) => match serde_json::to_vec(&value) {
            Ok(canonical) => Cow::Owned(canonical),
            Err(_) => Cow::Borrowed(payload),
        },
        Err(_) => Cow::Borrowed(payload),
    }
}

pub fn payload_hash(payload: &[u8]) -> PayloadHash {
    PayloadHash::of(&normalize_payload(payload))
}

/// Inputs to [`derive_key`].
#[derive(Debug, Clone, Copy)]
pub struct KeyParts<'a> {
    pub entity_type: &'a str,
    pub operation: Operation,
    /// When present, identifies the logical record and replaces the payload
    /// in the key, so successive edits of one record share a key.
    pub record_key: Option<&'a str>,
    pub payload: &'a [u8],
    pub at: UnixTimeMs,
    pub bucket_ms: u64,
}

pub fn derive_key(parts: KeyParts<'_>) -> IdempotencyKey {
    let bucket = if parts.bucket_ms == 0 {
        0
    } else {
        parts.at.0 / parts.bucket_ms
    };

    let mut hasher = blake3::Hasher::new();
    hasher.update(b"mutation-sync/idempotency/v1");
    field(&mut hasher, parts.entity_type.as_bytes());
    field(&mut hasher, parts.operation.as_str().as_bytes());
    match parts.record_key {
        Some(record) => {
            hasher.update(&[1]);
            field(&mut hasher, record.as_bytes());
        }
        None => {
            hasher.update(&[0]);
            field(&mut hasher, &normalize_payload(parts.payload));
        }
    }
    hasher.update(&bucket.to_le_bytes());

    IdempotencyKey::from_digest(hasher.finalize())
}

fn field(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommittedKey {
    pub item_id: ItemId,
    pub payload_hash: PayloadHash,
    pub local_version: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reservation {
    /// Key unused; it is now reserved for the candidate id.
    New,
    /// Key was committed recently with a different payload. Reserved for the
    /// candidate, which must carry a version above the committed one.
    Supersedes(CommittedKey),
    DuplicateIdentical(ItemId),
    DuplicateConflicting(ItemId),
    /// Same payload was already delivered.
    AlreadyCommitted(ItemId),
}

#[derive(Clone, Debug)]
struct LiveEntry {
    item_id: ItemId,
    payload_hash: PayloadHash,
}

#[derive(Debug)]
pub struct IdempotencyIndex {
    live: HashMap<IdempotencyKey, LiveEntry>,
    committed: LruCache<IdempotencyKey, CommittedKey>,
}

impl IdempotencyIndex {
    pub fn new(committed_capacity: usize) -> Self {
        Self {
            live: HashMap::new(),
            committed: LruCache::new(
                NonZeroUsize::new(committed_capacity).unwrap_or(NonZeroUsize::MIN),
            ),
        }
    }

    pub fn check_and_reserve(
        &mut self,
        key: &IdempotencyKey,
        hash: PayloadHash,
        candidate: &ItemId,
    ) -> Reservation {
        if let Some(entry) = self.live.get(key) {
            return if entry.payload_hash == hash {
                Reservation::DuplicateIdentical(entry.item_id.clone())
            } else {
                Reservation::DuplicateConflicting(entry.item_id.clone())
            };
        }

        let outcome = match self.committed.get(key) {
            Some(done) if done.payload_hash == hash => {
                return Reservation::AlreadyCommitted(done.item_id.clone());
            }
            Some(done) => Reservation::Supersedes(done.clone()),
            None => Reservation::New,
        };

        self.live.insert(
            key.clone(),
            LiveEntry {
                item_id: candidate.clone(),
                payload_hash: hash,
            },
        );
        outcome
    }

    pub fn live_item(&self, key: &IdempotencyKey) -> Option<&ItemId> {
        self.live.get(key).map(|e| &e.item_id)
    }

    pub fn insert_live(&mut self, key: IdempotencyKey, item_id: ItemId, hash: PayloadHash) {
        self.live.insert(
            key,
            LiveEntry {
                item_id,
                payload_hash: hash,
            },
        );
    }

    pub fn update_hash(&mut self, key: &IdempotencyKey, hash: PayloadHash) {
        if let Some(entry) = self.live.get_mut(key) {
            entry.payload_hash = hash;
        }
    }

    /// Frees the key if it is still held by `item_id`.
    pub fn release(&mut self, key: &IdempotencyKey, item_id: &ItemId) {
        if self.live.get(key).is_some_and(|e| &e.item_id == item_id) {
            self.live.remove(key);
        }
    }

    pub fn mark_committed(&mut self, item: &MutationItem) {
        self.release(&item.idempotency_key, &item.id);
        self.committed.put(
            item.idempotency_key.clone(),
            CommittedKey {
                item_id: item.id.clone(),
                payload_hash: item.payload_hash,
                local_version: item.local_version,
            },
        );
    }

    /// Whether `item_id` is among the remembered commits. Does not touch
    /// recency.
    pub fn was_committed(&self, item_id: &ItemId) -> bool {
        self.committed.iter().any(|(_, done)| &done.item_id == item_id)
    }

    pub fn rebuild<'a>(&mut self, items: impl IntoIterator<Item = &'a MutationItem>) {
        self.live.clear();
        for item in items.into_iter().filter(|i| i.is_live()) {
            self.insert_live(item.idempotency_key.clone(), item.id.clone(), item.payload_hash);
        }
    }

    pub fn live_len(&self) -> usize {
        self.live.len()
    }
}
