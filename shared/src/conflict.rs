//! Commit-time conflict resolution.
//!
//! Resolution is a pure function of the local item and the remote copy: the
//! same inputs always produce the same winner.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::model::{MutationItem, Operation};
use crate::remote::RemoteVersion;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    LastWriteWins,
    FieldMerge,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Winner {
    Local,
    Remote,
    Merged,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Re-dispatch with this content.
    Resolved {
        payload: Vec<u8>,
        operation: Operation,
        local_version: u64,
        /// The remote copy the new payload was derived from.
        base_payload: Option<Vec<u8>>,
        winner: Winner,
    },
    Irreconcilable { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged(Vec<u8>),
    Irreconcilable(String),
}

/// Entity-specific merge rules, supplied by the producer.
pub trait FieldMerger: Send + Sync {
    fn merge(&self, base: Option<&[u8]>, local: &[u8], remote: &[u8]) -> MergeOutcome;
}

/// Three-way merge over the top-level fields of JSON objects. A field keeps
/// the local value only if the remote did not change it since `base`; a
/// field changed differently on both sides cannot be merged. Without a base,
/// every field present on both sides with different values counts as a
/// conflict.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonFieldMerger;

impl JsonFieldMerger {
    fn object(bytes: &[u8], side: &str) -> Result<Map<String, Value>, String> {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(format!("{side} payload is not a JSON object")),
            Err(e) => Err(format!("{side} payload is not JSON: {e}")),
        }
    }
}

impl FieldMerger for JsonFieldMerger {
    fn merge(&self, base: Option<&[u8]>, local: &[u8], remote: &[u8]) -> MergeOutcome {
        let parsed = (|| {
            let base = match base {
                Some(b) => Self::object(b, "base")?,
                None => Map::new(),
            };
            Ok::<_, String>((base, Self::object(local, "local")?, Self::object(remote, "remote")?))
        })();
        let (base, local, remote) = match parsed {
            Ok(sides) => sides,
            Err(reason) => return MergeOutcome::Irreconcilable(reason),
        };

        let keys: BTreeSet<&String> = base.keys().chain(local.keys()).chain(remote.keys()).collect();
        let mut merged = Map::new();

        for key in keys {
            let (b, l, r) = (base.get(key), local.get(key), remote.get(key));
            let chosen = if l == r || l == b {
                r
            } else if r == b {
                l
            } else {
                return MergeOutcome::Irreconcilable(format!(
                    "field `{key}` changed on both sides"
                ));
            };
            if let Some(value) = chosen {
                merged.insert(key.clone(), value.clone());
            }
        }

        match serde_json::to_vec(&Value::Object(merged)) {
            Ok(bytes) => MergeOutcome::Merged(bytes),
            Err(e) => MergeOutcome::Irreconcilable(e.to_string()),
        }
    }
}

/// Per-entity strategy table plus the registered merge rules.
#[derive(Clone)]
pub struct ConflictResolver {
    default_strategy: ConflictStrategy,
    policies: HashMap<String, ConflictStrategy>,
    mergers: HashMap<String, Arc<dyn FieldMerger>>,
    fallback_merger: Option<Arc<dyn FieldMerger>>,
}

impl ConflictResolver {
    pub fn new(default_strategy: ConflictStrategy, policies: HashMap<String, ConflictStrategy>) -> Self {
        Self {
            default_strategy,
            policies,
            mergers: HashMap::new(),
            fallback_merger: None,
        }
    }

    pub fn with_merger(mut self, entity_type: impl Into<String>, merger: Arc<dyn FieldMerger>) -> Self {
        self.mergers.insert(entity_type.into(), merger);
        self
    }

    /// Used for field-merge entities with no merger of their own.
    pub fn with_fallback_merger(mut self, merger: Arc<dyn FieldMerger>) -> Self {
        self.fallback_merger = Some(merger);
        self
    }

    pub fn strategy_for(&self, entity_type: &str) -> ConflictStrategy {
        self.policies
            .get(entity_type)
            .copied()
            .unwrap_or(self.default_strategy)
    }

    pub fn resolve(&self, local: &MutationItem, remote: &RemoteVersion) -> Resolution {
        match self.strategy_for(&local.entity_type) {
            ConflictStrategy::LastWriteWins => last_write_wins(local, remote),
            ConflictStrategy::FieldMerge => {
                let merger = self
                    .mergers
                    .get(&local.entity_type)
                    .or(self.fallback_merger.as_ref());
                match merger {
                    Some(m) => field_merge(m.as_ref(), local, remote),
                    None => Resolution::Irreconcilable {
                        reason: format!("no field merger registered for `{}`", local.entity_type),
                    },
                }
            }
        }
    }
}

fn next_version(local: &MutationItem, remote: &RemoteVersion) -> u64 {
    local.local_version.max(remote.version).saturating_add(1)
}

/// Which side wrote last: remote edit time against local creation time,
/// then version, then device id. A full tie goes to the remote.
pub fn lww_winner(local: &MutationItem, remote: &RemoteVersion) -> Winner {
    let by_time = remote
        .updated_at
        .map_or(Ordering::Equal, |r| local.created_at.cmp(&r));
    let ordering = by_time
        .then_with(|| local.local_version.cmp(&remote.version))
        .then_with(|| match &remote.device_id {
            Some(device) => local.device_id.cmp(device),
            None => Ordering::Equal,
        });

    if ordering == Ordering::Greater {
        Winner::Local
    } else {
        Winner::Remote
    }
}

fn last_write_wins(local: &MutationItem, remote: &RemoteVersion) -> Resolution {
    let local_version = next_version(local, remote);
    match lww_winner(local, remote) {
        Winner::Local => {
            let operation = match (local.operation, &remote.payload) {
                (Operation::Create, Some(_)) => Operation::Update,
                (Operation::Update, None) => Operation::Create,
                (op, _) => op,
            };
            Resolution::Resolved {
                payload: local.payload.clone(),
                operation,
                local_version,
                base_payload: remote.payload.clone(),
                winner: Winner::Local,
            }
        }
        _ => {
            let (payload, operation) = match &remote.payload {
                Some(p) => (p.clone(), Operation::Update),
                None => (Vec::new(), Operation::Delete),
            };
            Resolution::Resolved {
                payload,
                operation,
                local_version,
                base_payload: remote.payload.clone(),
                winner: Winner::Remote,
            }
        }
    }
}

fn field_merge(merger: &dyn FieldMerger, local: &MutationItem, remote: &RemoteVersion) -> Resolution {
    let Some(remote_payload) = remote.payload.as_deref() else {
        return Resolution::Irreconcilable {
            reason: "record was deleted remotely".into(),
        };
    };
    if local.operation == Operation::Delete {
        return Resolution::Irreconcilable {
            reason: "local delete conflicts with remote edit".into(),
        };
    }

    match merger.merge(local.base_payload.as_deref(), &local.payload, remote_payload) {
        MergeOutcome::Merged(payload) => Resolution::Resolved {
            payload,
            operation: Operation::Update,
            local_version: next_version(local, remote),
            base_payload: Some(remote_payload.to_vec()),
            winner: Winner::Merged,
        },
        MergeOutcome::Irreconcilable(reason) => Resolution::Irreconcilable { reason },
    }
}
