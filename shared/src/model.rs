use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::state::{ItemState, StateError};

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    #[must_use]
    pub const fn add_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    #[must_use]
    pub const fn millis_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind}: {reason}")]
pub struct IdError {
    pub kind: &'static str,
    pub reason: String,
}

fn validate_token(kind: &'static str, value: &str, max_len: usize) -> Result<(), IdError> {
    if value.is_empty() {
        return Err(IdError {
            kind,
            reason: "cannot be empty".into(),
        });
    }
    if value.len() > max_len {
        return Err(IdError {
            kind,
            reason: format!("exceeds {max_len} characters"),
        });
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(IdError {
            kind,
            reason: "contains invalid characters (allowed: a-z, A-Z, 0-9, -, _)".into(),
        });
    }
    Ok(())
}

macro_rules! token_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal, $max:expr) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl $name {
            pub const MAX_LENGTH: usize = $max;

            pub fn new(id: impl Into<String>) -> Result<Self, IdError> {
                let id = id.into().trim().to_string();
                validate_token($kind, &id, Self::MAX_LENGTH)?;
                Ok(Self(id))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

token_id!(
    /// Process-unique item identifier, assigned at enqueue time.
    ItemId,
    "item id",
    128
);

token_id!(
    /// Deterministic key collapsing duplicate submissions of one logical write.
    IdempotencyKey,
    "idempotency key",
    128
);

token_id!(
    /// Stable per-installation identifier.
    DeviceId,
    "device id",
    128
);

impl ItemId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl IdempotencyKey {
    pub(crate) fn from_digest(digest: blake3::Hash) -> Self {
        Self(digest.to_hex().to_string())
    }
}

impl DeviceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// blake3 digest of a normalized payload
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadHash(pub [u8; 32]);

impl PayloadHash {
    pub fn of(normalized: &[u8]) -> Self {
        Self(*blake3::hash(normalized).as_bytes())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for PayloadHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PayloadHash({})", &self.to_hex()[..12])
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Dispatch tier. Variant order is the ordering: `Low < Normal < High < Critical`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Critical items are never chosen for overflow eviction.
    #[must_use]
    pub const fn is_evictable(self) -> bool {
        !matches!(self, Self::Critical)
    }
}

/// An edit that arrived while its item was on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingEdit {
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    pub payload_hash: PayloadHash,
    pub received_at: UnixTimeMs,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationItem {
    pub id: ItemId,
    pub idempotency_key: IdempotencyKey,
    pub operation: Operation,
    pub entity_type: String,
    pub record_key: Option<String>,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    pub payload_hash: PayloadHash,
    /// Remote copy the local edit started from, used by field merges.
    #[serde(default, with = "serde_bytes")]
    pub base_payload: Option<Vec<u8>>,
    pub priority: Priority,
    pub local_version: u64,
    pub state: ItemState,
    pub retry_count: u32,
    pub max_retries: u32,
    pub conflict_count: u32,
    pub attempt_count: u32,
    pub created_at: UnixTimeMs,
    pub updated_at: UnixTimeMs,
    pub scheduled_at: UnixTimeMs,
    pub device_id: DeviceId,
    pub last_error: Option<String>,
    pub pending_edit: Option<PendingEdit>,
}

impl MutationItem {
    pub fn is_live(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Queued and due.
    pub fn is_eligible(&self, now: UnixTimeMs) -> bool {
        self.state == ItemState::Queued && self.scheduled_at <= now
    }

    /// Higher priority first, then FIFO by creation time. The id breaks exact ties.
    pub fn dispatch_order(&self, other: &Self) -> std::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.id.cmp(&other.id))
    }

    /// Moves the item along the state machine, returning the state it left.
    pub fn transition(&mut self, to: ItemState, now: UnixTimeMs) -> Result<ItemState, StateError> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(StateError::InvalidTransition { from, to });
        }
        self.state = to;
        self.updated_at = now;
        Ok(from)
    }

    /// Replaces the payload with a newer local edit and bumps the version.
    pub fn apply_edit(&mut self, payload: Vec<u8>, payload_hash: PayloadHash, now: UnixTimeMs) {
        self.payload = payload;
        self.payload_hash = payload_hash;
        self.local_version = self.local_version.saturating_add(1);
        self.updated_at = now;
    }

    /// Folds a stashed in-flight edit into the item, if any.
    pub fn apply_pending_edit(&mut self, now: UnixTimeMs) -> bool {
        match self.pending_edit.take() {
            Some(edit) => {
                self.apply_edit(edit.payload, edit.payload_hash, now);
                true
            }
            None => false,
        }
    }
}
