use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use crate::backoff::RetryPolicy;
use crate::conflict::ConflictStrategy;
use crate::model::DeviceId;
use crate::storage::MAX_STORE_BYTES;

pub const MAX_WORKERS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Validation(String),

    #[error("config parse error: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_queue_size: usize,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub worker_count: usize,
    pub batch_size: usize,
    pub send_timeout_ms: u64,
    pub idempotency_bucket_ms: u64,
    pub max_payload_bytes: usize,
    pub max_entity_type_len: usize,
    pub max_conflict_rounds: u32,
    pub committed_key_cache_size: usize,
    pub event_channel_capacity: usize,
    pub stats_interval_ms: Option<u64>,
    pub default_conflict_strategy: ConflictStrategy,
    pub conflict_policies: HashMap<String, ConflictStrategy>,
    pub device_id: DeviceId,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 500,
            max_retries: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            worker_count: 2,
            batch_size: 64,
            send_timeout_ms: 30_000,
            idempotency_bucket_ms: 5 * 60 * 1000,
            max_payload_bytes: 1024 * 1024,
            max_entity_type_len: 64,
            max_conflict_rounds: 3,
            committed_key_cache_size: 1_024,
            event_channel_capacity: 256,
            stats_interval_ms: None,
            default_conflict_strategy: ConflictStrategy::LastWriteWins,
            conflict_policies: HashMap::new(),
            device_id: DeviceId::generate(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::Validation(msg.into()));

        if self.max_queue_size == 0 {
            return fail("max_queue_size must be > 0");
        }
        if self.max_retries == 0 {
            return fail("max_retries must be > 0");
        }
        if self.base_delay_ms == 0 {
            return fail("base_delay_ms must be > 0");
        }
        if self.max_delay_ms < self.base_delay_ms {
            return fail("max_delay_ms must be >= base_delay_ms");
        }
        if self.worker_count == 0 || self.worker_count > MAX_WORKERS {
            return Err(ConfigError::Validation(format!(
                "worker_count must be within 1..={MAX_WORKERS}"
            )));
        }
        if self.batch_size == 0 {
            return fail("batch_size must be > 0");
        }
        if self.send_timeout_ms == 0 {
            return fail("send_timeout_ms must be > 0");
        }
        if self.max_payload_bytes == 0 {
            return fail("max_payload_bytes must be > 0");
        }
        // an item can carry its payload, the base copy and one pending edit
        if self.max_payload_bytes.saturating_mul(3) > MAX_STORE_BYTES {
            return Err(ConfigError::Validation(format!(
                "max_payload_bytes must be <= {} so a single item fits the store",
                MAX_STORE_BYTES / 3
            )));
        }
        if self.max_entity_type_len == 0 {
            return fail("max_entity_type_len must be > 0");
        }
        if self.max_conflict_rounds == 0 {
            return fail("max_conflict_rounds must be > 0");
        }
        if self.event_channel_capacity == 0 {
            return fail("event_channel_capacity must be > 0");
        }
        if self.stats_interval_ms == Some(0) {
            return fail("stats_interval_ms must be > 0 when set");
        }
        if self.conflict_policies.keys().any(|k| k.trim().is_empty()) {
            return fail("conflict_policies keys must be non-empty entity types");
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.base_delay_ms, self.max_delay_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn strategy_for(&self, entity_type: &str) -> ConflictStrategy {
        self.conflict_policies
            .get(entity_type)
            .copied()
            .unwrap_or(self.default_conflict_strategy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = EngineConfig::from_json(
            r#"{
                "max_queue_size": 10,
                "device_id": "phone-1",
                "conflict_policies": { "thought_record": "field_merge" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.max_queue_size, 10);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.device_id.as_str(), "phone-1");
        assert_eq!(config.strategy_for("thought_record"), ConflictStrategy::FieldMerge);
        assert_eq!(config.strategy_for("mood_entry"), ConflictStrategy::LastWriteWins);
    }

    #[test]
    fn invalid_values_rejected() {
        let mut config = EngineConfig::default();
        config.worker_count = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.max_delay_ms = 10;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.stats_interval_ms = Some(0);
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.max_payload_bytes = 64 * 1024 * 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_json_is_parse_error() {
        assert!(matches!(
            EngineConfig::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            EngineConfig::from_json(r#"{"device_id": "has space"}"#),
            Err(ConfigError::Parse(_))
        ));
    }
}
