//! Offline records and their sync audit history.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use offsync_common::{Priority, RecordId, RecordKind, RecordStatus, Result};

use crate::integrity::Checksum;
use crate::network::NetworkCondition;
use crate::optimizer::Technique;

/// Everything a caller supplies when submitting new data.
#[derive(Debug, Clone)]
pub struct RecordDraft {
    pub kind: RecordKind,
    pub payload: Value,
    pub priority: Priority,
    pub owner_id: Option<String>,
    pub device_id: String,
    /// Time to live from submission; the engine default applies when unset.
    pub ttl: Option<Duration>,
    /// Overrides the engine's default retry cap.
    pub max_retries: Option<u32>,
    /// Identifies "the same data" across submissions (delta baseline, conflicts).
    pub logical_key: Option<String>,
    /// Remote version this local edit was based on.
    pub base_version: Option<u64>,
}

impl RecordDraft {
    pub fn new(
        kind: RecordKind,
        payload: Value,
        priority: Priority,
        device_id: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            kind,
            payload,
            priority,
            owner_id: None,
            device_id: device_id.into(),
            ttl: Some(ttl),
            max_retries: None,
            logical_key: None,
            base_version: None,
        }
    }

    /// Draft that expires after the engine's default TTL.
    pub fn untimed(
        kind: RecordKind,
        payload: Value,
        priority: Priority,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            ttl: None,
            ..Self::new(kind, payload, priority, device_id, Duration::zero())
        }
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_logical_key(mut self, key: impl Into<String>) -> Self {
        self.logical_key = Some(key.into());
        self
    }

    pub fn with_base_version(mut self, version: u64) -> Self {
        self.base_version = Some(version);
        self
    }
}

/// Immutable audit entry for one sync attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncAttempt {
    pub at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
    /// Network snapshot when the attempt started.
    pub network: NetworkCondition,
    /// Whether the payload passed its integrity check.
    pub integrity_ok: bool,
    /// Bytes put on the wire (zero when nothing was sent).
    pub transmitted_bytes: u64,
    pub technique: Option<Technique>,
}

impl SyncAttempt {
    pub fn succeeded(
        at: DateTime<Utc>,
        duration_ms: u64,
        network: NetworkCondition,
        transmitted_bytes: u64,
        technique: Technique,
    ) -> Self {
        Self {
            at,
            success: true,
            error: None,
            duration_ms,
            network,
            integrity_ok: true,
            transmitted_bytes,
            technique: Some(technique),
        }
    }

    pub fn failed(
        at: DateTime<Utc>,
        error: impl Into<String>,
        duration_ms: u64,
        network: NetworkCondition,
        integrity_ok: bool,
    ) -> Self {
        Self {
            at,
            success: false,
            error: Some(error.into()),
            duration_ms,
            network,
            integrity_ok,
            transmitted_bytes: 0,
            technique: None,
        }
    }
}

/// A unit of client-generated data awaiting reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineRecord {
    pub id: RecordId,
    pub kind: RecordKind,
    pub payload: Value,
    pub logical_key: Option<String>,
    pub base_version: Option<u64>,
    pub device_id: String,
    pub owner_id: Option<String>,
    pub priority: Priority,
    /// Serialized payload size at creation. Never changes.
    size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: RecordStatus,
    /// Digest taken when the payload was captured or last rewritten by a merge.
    pub checksum: Checksum,
    pub attempts: Vec<SyncAttempt>,
    /// Attempts evicted by the history retention limit.
    pub dropped_attempts: u64,
    /// Remote version assigned on successful sync.
    pub synced_version: Option<u64>,
}

impl OfflineRecord {
    /// Build a pending record from a draft.
    pub fn from_draft(
        draft: RecordDraft,
        default_max_retries: u32,
        default_ttl: Duration,
        now: DateTime<Utc>,
        checksum: Checksum,
    ) -> Result<Self> {
        let size_bytes = payload_bytes(&draft.payload)?.len() as u64;
        Ok(Self {
            id: RecordId::generate(),
            kind: draft.kind,
            payload: draft.payload,
            logical_key: draft.logical_key,
            base_version: draft.base_version,
            device_id: draft.device_id,
            owner_id: draft.owner_id,
            priority: draft.priority,
            size_bytes,
            created_at: now,
            expires_at: now + draft.ttl.unwrap_or(default_ttl),
            retry_count: 0,
            max_retries: draft.max_retries.unwrap_or(default_max_retries),
            status: RecordStatus::Pending,
            checksum,
            attempts: Vec::new(),
            dropped_attempts: 0,
            synced_version: None,
        })
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    pub fn last_attempt(&self) -> Option<&SyncAttempt> {
        self.attempts.last()
    }

    pub fn summary(&self) -> RecordSummary {
        RecordSummary {
            id: self.id.clone(),
            kind: self.kind,
            priority: self.priority,
            status: self.status,
            owner_id: self.owner_id.clone(),
            size_bytes: self.size_bytes,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            created_at: self.created_at,
            expires_at: self.expires_at,
            attempt_count: self.attempts.len() as u64 + self.dropped_attempts,
            last_error: self.last_attempt().and_then(|a| a.error.clone()),
        }
    }
}

/// Serialized form of a payload, the bytes that checksums and sizes refer to.
pub fn payload_bytes(payload: &Value) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(payload)?)
}

/// Compact view of a record returned by the query API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSummary {
    pub id: RecordId,
    pub kind: RecordKind,
    pub priority: Priority,
    pub status: RecordStatus,
    pub owner_id: Option<String>,
    pub size_bytes: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub attempt_count: u64,
    pub last_error: Option<String>,
}

/// Filter for listing records. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub kind: Option<RecordKind>,
    pub status: Option<RecordStatus>,
    pub owner_id: Option<String>,
    pub priority: Option<Priority>,
}

impl RecordFilter {
    pub fn with_kind(mut self, kind: RecordKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_status(mut self, status: RecordStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn matches(&self, record: &OfflineRecord) -> bool {
        self.kind.map_or(true, |k| record.kind == k)
            && self.status.map_or(true, |s| record.status == s)
            && self.priority.map_or(true, |p| record.priority == p)
            && self
                .owner_id
                .as_ref()
                .map_or(true, |o| record.owner_id.as_ref() == Some(o))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::IntegrityChecker;
    use serde_json::json;

    fn draft() -> RecordDraft {
        RecordDraft::new(
            RecordKind::Transaction,
            json!({"amount": 42, "currency": "EUR"}),
            Priority::High,
            "device-1",
            Duration::hours(1),
        )
    }

    #[test]
    fn test_record_from_draft() {
        let now = Utc::now();
        let checker = IntegrityChecker::default();
        let d = draft().with_owner("user-7");
        let checksum = checker.checksum(&d.payload).unwrap();
        let record = OfflineRecord::from_draft(d, 3, chrono::Duration::hours(24), now, checksum).unwrap();

        assert_eq!(record.status, RecordStatus::Pending);
        assert_eq!(record.max_retries, 3);
        assert_eq!(record.expires_at, now + Duration::hours(1));
        assert_eq!(
            record.size_bytes(),
            serde_json::to_vec(&record.payload).unwrap().len() as u64
        );
        assert_eq!(record.owner_id.as_deref(), Some("user-7"));
    }

    #[test]
    fn test_untimed_draft_takes_default_ttl() {
        let now = Utc::now();
        let d = RecordDraft::untimed(RecordKind::UserAction, json!({"tap": 1}), Priority::Low, "device-1");
        assert!(d.ttl.is_none());
        let checksum = IntegrityChecker::default().checksum(&d.payload).unwrap();
        let record = OfflineRecord::from_draft(d, 3, Duration::minutes(90), now, checksum).unwrap();
        assert_eq!(record.expires_at, now + Duration::minutes(90));
    }

    #[test]
    fn test_filter_matching() {
        let checker = IntegrityChecker::default();
        let d = draft().with_owner("user-7");
        let checksum = checker.checksum(&d.payload).unwrap();
        let record = OfflineRecord::from_draft(d, 3, chrono::Duration::hours(24), Utc::now(), checksum).unwrap();

        assert!(RecordFilter::default().matches(&record));
        assert!(RecordFilter::default()
            .with_kind(RecordKind::Transaction)
            .with_owner("user-7")
            .matches(&record));
        assert!(!RecordFilter::default().with_owner("user-8").matches(&record));
        assert!(!RecordFilter::default()
            .with_status(RecordStatus::Synced)
            .matches(&record));
    }
}
