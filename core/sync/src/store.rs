//! Record store: the single source of truth for record state.
//!
//! All status changes go through [`RecordStore::transition`], which enforces
//! the record lifecycle. The store can be snapshotted to JSON and reloaded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

use offsync_common::{Error, RecordId, RecordStatus, Result};

use crate::integrity::Checksum;
use crate::record::{OfflineRecord, RecordFilter, SyncAttempt};

/// On-disk form of the store.
#[derive(Debug, Serialize, Deserialize)]
struct StoreSnapshot {
    records: Vec<OfflineRecord>,
}

/// Holds every record and its sync history.
#[derive(Debug)]
pub struct RecordStore {
    records: HashMap<RecordId, OfflineRecord>,
    max_records: usize,
    attempt_history_limit: usize,
}

impl RecordStore {
    /// Create an empty store.
    pub fn new(max_records: usize, attempt_history_limit: usize) -> Self {
        Self {
            records: HashMap::new(),
            max_records,
            attempt_history_limit: attempt_history_limit.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.max_records
    }

    /// Insert a new record as pending.
    ///
    /// # Errors
    /// - `CapacityExceeded` when the store is full
    /// - `InvalidInput` when the id is already present
    pub fn add(&mut self, mut record: OfflineRecord) -> Result<RecordId> {
        if self.is_full() {
            return Err(Error::CapacityExceeded(format!(
                "Record store holds {} records",
                self.records.len()
            )));
        }
        if self.records.contains_key(&record.id) {
            return Err(Error::InvalidInput(format!("Duplicate record id {}", record.id)));
        }
        record.status = RecordStatus::Pending;
        record.retry_count = 0;
        let id = record.id.clone();
        self.records.insert(id.clone(), record);
        Ok(id)
    }

    pub fn get(&self, id: &RecordId) -> Result<&OfflineRecord> {
        self.records
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("Record {}", id)))
    }

    #[cfg(test)]
    pub(crate) fn get_mut(&mut self, id: &RecordId) -> Result<&mut OfflineRecord> {
        self.records
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Record {}", id)))
    }

    /// Records matching the filter, oldest first.
    pub fn list(&self, filter: &RecordFilter) -> Vec<&OfflineRecord> {
        let mut out: Vec<&OfflineRecord> =
            self.records.values().filter(|r| filter.matches(r)).collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Move a record to a new status.
    ///
    /// # Errors
    /// - `InvalidTransition` when the lifecycle forbids the move
    pub fn transition(&mut self, id: &RecordId, next: RecordStatus) -> Result<RecordStatus> {
        let record = self.get_record_mut(id)?;
        let current = record.status;
        if !current.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                id: id.to_string(),
                from: current,
                to: next,
            });
        }
        record.status = next;
        debug!(record = %id, from = %current, to = %next, "Record transitioned");
        Ok(current)
    }

    /// Append an audit entry, evicting the oldest beyond the retention limit.
    pub fn append_attempt(&mut self, id: &RecordId, attempt: SyncAttempt) -> Result<()> {
        let limit = self.attempt_history_limit;
        let record = self.get_record_mut(id)?;
        if record.status.is_terminal() {
            return Err(Error::InvalidInput(format!(
                "Record {} is {} and takes no further attempts",
                id, record.status
            )));
        }
        record.attempts.push(attempt);
        if record.attempts.len() > limit {
            let excess = record.attempts.len() - limit;
            record.attempts.drain(..excess);
            record.dropped_attempts += excess as u64;
        }
        Ok(())
    }

    /// Count one more failed attempt against the retry budget.
    ///
    /// Returns the new retry count.
    pub fn record_retry(&mut self, id: &RecordId) -> Result<u32> {
        let record = self.get_record_mut(id)?;
        if record.retries_exhausted() {
            return Err(Error::InvalidInput(format!(
                "Record {} already used {} of {} retries",
                id, record.retry_count, record.max_retries
            )));
        }
        record.retry_count += 1;
        Ok(record.retry_count)
    }

    /// Replace the payload with a conflict resolution result.
    pub fn replace_payload(&mut self, id: &RecordId, payload: Value, checksum: Checksum) -> Result<()> {
        let record = self.get_record_mut(id)?;
        if record.status != RecordStatus::Syncing {
            return Err(Error::InvalidInput(format!(
                "Payload of {} can only change while syncing",
                id
            )));
        }
        record.payload = payload;
        record.checksum = checksum;
        Ok(())
    }

    pub fn set_synced_version(&mut self, id: &RecordId, version: u64) -> Result<()> {
        self.get_record_mut(id)?.synced_version = Some(version);
        Ok(())
    }

    /// Pending records whose TTL has passed.
    pub fn expired_pending(&self, now: DateTime<Utc>) -> Vec<RecordId> {
        self.records
            .values()
            .filter(|r| r.status == RecordStatus::Pending && r.is_expired_at(now))
            .map(|r| r.id.clone())
            .collect()
    }

    /// Remove old records in a removable state.
    ///
    /// With `only_terminal` set, only `synced` and `expired` records are
    /// eligible; otherwise `failed` records are removed too. Records that are
    /// pending or syncing are never purged.
    pub fn purge(&mut self, older_than: DateTime<Utc>, only_terminal: bool) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| {
            let removable = match r.status {
                RecordStatus::Synced | RecordStatus::Expired => true,
                RecordStatus::Failed => !only_terminal,
                RecordStatus::Pending | RecordStatus::Syncing => false,
            };
            !(removable && r.created_at < older_than)
        });
        let purged = before - self.records.len();
        if purged > 0 {
            info!("Purged {} records created before {}", purged, older_than);
        }
        purged
    }

    /// Count records by status.
    pub fn count_by_status(&self) -> HashMap<RecordStatus, usize> {
        let mut counts = HashMap::new();
        for record in self.records.values() {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn records(&self) -> impl Iterator<Item = &OfflineRecord> {
        self.records.values()
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        let snapshot = StoreSnapshot {
            records: self.list(&RecordFilter::default()).into_iter().cloned().collect(),
        };
        serde_json::to_string_pretty(&snapshot).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON.
    ///
    /// Records caught mid-sync are returned to pending.
    pub fn from_json(json: &str, max_records: usize, attempt_history_limit: usize) -> Result<Self> {
        let snapshot: StoreSnapshot =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        let mut store = Self::new(max_records.max(snapshot.records.len()), attempt_history_limit);
        for mut record in snapshot.records {
            if record.status == RecordStatus::Syncing {
                record.status = RecordStatus::Pending;
            }
            store.records.insert(record.id.clone(), record);
        }
        Ok(store)
    }

    /// Persist the store to disk.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = self.to_json()?;
        fs::write(path, json).await.map_err(Error::Io)
    }

    /// Load a store persisted with [`RecordStore::save`].
    pub async fn load(
        path: impl AsRef<Path>,
        max_records: usize,
        attempt_history_limit: usize,
    ) -> Result<Self> {
        let content = fs::read_to_string(path).await.map_err(Error::Io)?;
        Self::from_json(&content, max_records, attempt_history_limit)
    }

    fn get_record_mut(&mut self, id: &RecordId) -> Result<&mut OfflineRecord> {
        self.records
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Record {}", id)))
    }
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new(100_000, 50)
    }
}
