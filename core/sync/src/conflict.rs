//! Conflict detection and resolution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use offsync_common::{RecordId, RecordKind};

use crate::record::OfflineRecord;

/// Canonical version of a record as held by the remote authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteVersion {
    pub payload: Value,
    pub modified_at: DateTime<Utc>,
    pub version: u64,
    /// Set when the remote rejected the local data on a business rule.
    #[serde(default)]
    pub rule_violation: Option<String>,
}

/// Nature of a divergence between local and remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides edited from a common version.
    DataVersion,
    /// Independent writes ordered by time.
    Timestamp,
    /// User-owned settings.
    UserPreference,
    /// Remote refused the local data.
    BusinessRule,
}

/// Which side prevailed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    LocalWins,
    RemoteWins,
    Merged,
}

/// Who made the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedBy {
    System,
    User,
    AutomatedAgent,
}

/// A detected divergence awaiting resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub record_id: RecordId,
    pub conflict_type: ConflictType,
    pub local_payload: Value,
    pub local_modified_at: DateTime<Utc>,
    pub remote: RemoteVersion,
    /// Common ancestor both sides edited from, when known.
    #[serde(default)]
    pub base_payload: Option<Value>,
    pub detected_at: DateTime<Utc>,
}

/// Immutable audit entry for a resolved conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub record_id: RecordId,
    pub conflict_type: ConflictType,
    pub local_payload: Value,
    pub remote_payload: Value,
    pub resolution: Resolution,
    pub resolved_payload: Value,
    /// Fields both sides changed; decided by modification time.
    pub overlapping_fields: Vec<String>,
    pub resolved_by: ResolvedBy,
    pub resolved_at: DateTime<Utc>,
}

/// Deterministic, per-type conflict policy.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    /// Detect whether the remote copy diverged from the local record.
    ///
    /// `base` is the payload at the record's base version, used for a
    /// three-way merge of data-version conflicts.
    pub fn detect(
        &self,
        local: &OfflineRecord,
        remote: &RemoteVersion,
        base: Option<&Value>,
        now: DateTime<Utc>,
    ) -> Option<Conflict> {
        if remote.rule_violation.is_none() && remote.payload == local.payload {
            return None;
        }

        let conflict_type = if remote.rule_violation.is_some() {
            ConflictType::BusinessRule
        } else if local.kind == RecordKind::ConfigurationChange {
            ConflictType::UserPreference
        } else if local.base_version.is_some_and(|base| remote.version > base) {
            ConflictType::DataVersion
        } else {
            ConflictType::Timestamp
        };

        Some(Conflict {
            record_id: local.id.clone(),
            conflict_type,
            local_payload: local.payload.clone(),
            local_modified_at: local.created_at,
            remote: remote.clone(),
            base_payload: base.cloned(),
            detected_at: now,
        })
    }

    /// Decide and build the resolution for a conflict.
    pub fn resolve(&self, conflict: &Conflict, now: DateTime<Utc>) -> ConflictResolution {
        let remote_newer = conflict.remote.modified_at > conflict.local_modified_at;

        let newer_side = || {
            if remote_newer {
                (Resolution::RemoteWins, conflict.remote.payload.clone(), Vec::new())
            } else {
                (Resolution::LocalWins, conflict.local_payload.clone(), Vec::new())
            }
        };

        let (resolution, resolved_payload, overlapping_fields) = match conflict.conflict_type {
            ConflictType::Timestamp => newer_side(),
            ConflictType::UserPreference => {
                (Resolution::LocalWins, conflict.local_payload.clone(), Vec::new())
            }
            ConflictType::BusinessRule => {
                (Resolution::RemoteWins, conflict.remote.payload.clone(), Vec::new())
            }
            ConflictType::DataVersion => {
                let merged = conflict.base_payload.as_ref().and_then(|base| {
                    merge_fields(base, &conflict.local_payload, &conflict.remote.payload, remote_newer)
                });
                match merged {
                    Some((merged, overlapping)) => (Resolution::Merged, merged, overlapping),
                    None => newer_side(),
                }
            }
        };

        ConflictResolution {
            record_id: conflict.record_id.clone(),
            conflict_type: conflict.conflict_type,
            local_payload: conflict.local_payload.clone(),
            remote_payload: conflict.remote.payload.clone(),
            resolution,
            resolved_payload,
            overlapping_fields,
            resolved_by: ResolvedBy::System,
            resolved_at: now,
        }
    }
}

/// Three-way field merge of two JSON objects against their common ancestor.
///
/// A field changed on one side only takes that side's value, removals
/// included. Fields changed differently on both sides go to the newer side
/// and are reported as overlapping. Returns `None` unless all three payloads
/// are objects.
fn merge_fields(
    base: &Value,
    local: &Value,
    remote: &Value,
    remote_newer: bool,
) -> Option<(Value, Vec<String>)> {
    let (base, local, remote) = (base.as_object()?, local.as_object()?, remote.as_object()?);

    let mut keys: Vec<&String> = local.keys().chain(remote.keys()).chain(base.keys()).collect();
    keys.sort();
    keys.dedup();

    let mut merged = Map::new();
    let mut overlapping = Vec::new();
    for key in keys {
        let (ancestor, ours, theirs) = (base.get(key), local.get(key), remote.get(key));
        let value = if ours == theirs || theirs == ancestor {
            ours
        } else if ours == ancestor {
            theirs
        } else {
            overlapping.push(key.clone());
            if remote_newer {
                theirs
            } else {
                ours
            }
        };
        if let Some(value) = value {
            merged.insert(key.clone(), value.clone());
        }
    }
    Some((Value::Object(merged), overlapping))
}
