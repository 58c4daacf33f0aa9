//! Aggregate sync statistics over a time range.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use offsync_common::RecordStatus;

use crate::conflict::ConflictResolution;
use crate::record::OfflineRecord;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The window of length `span` ending at `now` (inclusive of `now`).
    pub fn last(span: Duration, now: DateTime<Utc>) -> Self {
        Self {
            start: now - span,
            end: now + Duration::milliseconds(1),
        }
    }

    /// Every representable instant.
    pub fn all() -> Self {
        Self {
            start: DateTime::<Utc>::MIN_UTC,
            end: DateTime::<Utc>::MAX_UTC,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

/// Sync statistics for the query API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncMetrics {
    /// Records that reached `synced` within the range.
    pub total_synced: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_sync_time_ms: f64,
    pub bandwidth_used_mb: f64,
    pub conflicts_resolved: u64,
    pub integrity_issues: u64,
    /// Successful attempts as a share of all attempts.
    pub efficiency_pct: f64,
}

impl SyncMetrics {
    /// Aggregate retained attempt history and the conflict log.
    pub fn compute<'a>(
        records: impl Iterator<Item = &'a OfflineRecord>,
        resolutions: &[ConflictResolution],
        range: TimeRange,
    ) -> Self {
        let mut metrics = SyncMetrics::default();
        let mut success_ms: u64 = 0;
        let mut bytes: u64 = 0;

        for record in records {
            let mut synced_in_range = false;
            for attempt in record.attempts.iter().filter(|a| range.contains(a.at)) {
                if attempt.success {
                    metrics.success_count += 1;
                    success_ms += attempt.duration_ms;
                    synced_in_range = true;
                } else {
                    metrics.failure_count += 1;
                }
                if !attempt.integrity_ok {
                    metrics.integrity_issues += 1;
                }
                bytes += attempt.transmitted_bytes;
            }
            if synced_in_range && record.status == RecordStatus::Synced {
                metrics.total_synced += 1;
            }
        }

        metrics.conflicts_resolved = resolutions
            .iter()
            .filter(|r| range.contains(r.resolved_at))
            .count() as u64;

        if metrics.success_count > 0 {
            metrics.avg_sync_time_ms = success_ms as f64 / metrics.success_count as f64;
        }
        let total = metrics.success_count + metrics.failure_count;
        if total > 0 {
            metrics.efficiency_pct = metrics.success_count as f64 * 100.0 / total as f64;
        }
        metrics.bandwidth_used_mb = bytes as f64 / (1024.0 * 1024.0);
        metrics
    }
}
