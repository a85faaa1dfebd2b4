//! Contract with the backend that receives mutations.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::model::{DeviceId, IdempotencyKey, ItemId, MutationItem, Operation, UnixTimeMs};

/// One write attempt. The backend dedupes on `(idempotency_key, local_version)`
/// and rejects with [`RemoteOutcome::Conflict`] when `local_version` is stale.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteRequest {
    pub item_id: ItemId,
    pub idempotency_key: IdempotencyKey,
    pub operation: Operation,
    pub entity_type: String,
    pub record_key: Option<String>,
    pub payload: Bytes,
    pub local_version: u64,
    pub device_id: DeviceId,
}

impl WriteRequest {
    pub fn from_item(item: &MutationItem) -> Self {
        Self {
            item_id: item.id.clone(),
            idempotency_key: item.idempotency_key.clone(),
            operation: item.operation,
            entity_type: item.entity_type.clone(),
            record_key: item.record_key.clone(),
            payload: Bytes::copy_from_slice(&item.payload),
            local_version: item.local_version,
            device_id: item.device_id.clone(),
        }
    }
}

/// The copy the backend currently holds, reported on conflict.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteVersion {
    pub version: u64,
    /// `None` when the remote record was deleted.
    #[serde(default, with = "serde_bytes")]
    pub payload: Option<Vec<u8>>,
    pub updated_at: Option<UnixTimeMs>,
    pub device_id: Option<DeviceId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    Transient,
    RateLimited,
    ClientError,
    ServerError,
    NetworkError,
    Timeout,
    Conflict,
    Unknown,
}

impl ErrorCategory {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Transient
                | ErrorCategory::RateLimited
                | ErrorCategory::ServerError
                | ErrorCategory::NetworkError
                | ErrorCategory::Timeout
        )
    }

    /// Maps an HTTP-style status code. Unknown codes are not retried.
    pub fn from_status(status: u16) -> Self {
        match status {
            408 => ErrorCategory::Timeout,
            409 | 412 => ErrorCategory::Conflict,
            429 => ErrorCategory::RateLimited,
            400..=499 => ErrorCategory::ClientError,
            502..=504 => ErrorCategory::Transient,
            500..=599 => ErrorCategory::ServerError,
            _ => ErrorCategory::Unknown,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
    pub truncated: bool,
}

impl RemoteFailure {
    const MAX_MESSAGE_LENGTH: usize = 512;
    const MAX_CODE_LENGTH: usize = 64;

    pub fn new(category: ErrorCategory, code: impl Into<String>, message: impl Into<String>) -> Self {
        let mut message = message.into();
        let mut code = code.into();

        let truncated =
            message.len() > Self::MAX_MESSAGE_LENGTH || code.len() > Self::MAX_CODE_LENGTH;

        truncate_utf8_safe(&mut message, Self::MAX_MESSAGE_LENGTH);
        truncate_utf8_safe(&mut code, Self::MAX_CODE_LENGTH);

        Self {
            category,
            code,
            message,
            truncated,
        }
    }

    pub fn timeout(after_ms: u64) -> Self {
        Self::new(
            ErrorCategory::Timeout,
            "timeout",
            format!("no response after {after_ms}ms"),
        )
    }

    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }
}

impl std::fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} {}: {}", self.category, self.code, self.message)
    }
}

pub(crate) fn truncate_utf8_safe(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }

    let mut truncate_at = max_bytes;
    while truncate_at > 0 && !s.is_char_boundary(truncate_at) {
        truncate_at -= 1;
    }
    s.truncate(truncate_at);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteOutcome {
    Committed { remote_version: u64 },
    Conflict(RemoteVersion),
    Transient(RemoteFailure),
    Permanent(RemoteFailure),
}

impl RemoteOutcome {
    /// Classifies a failure by its category rather than by the caller's guess.
    pub fn failure(failure: RemoteFailure) -> Self {
        if failure.is_retryable() {
            RemoteOutcome::Transient(failure)
        } else {
            RemoteOutcome::Permanent(failure)
        }
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    async fn write(&self, request: WriteRequest) -> RemoteOutcome;
}
