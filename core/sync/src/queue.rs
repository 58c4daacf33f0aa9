//! Priority-tiered sync queues.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

use offsync_common::{Error, Priority, RecordId, Result};

use crate::network::NetworkCondition;

/// When a queue becomes eligible for draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStrategy {
    /// Always due; the schedule is ignored.
    Immediate,
    /// Due on schedule, or as soon as a full batch is ready.
    Batch,
    /// Due strictly on schedule.
    Scheduled,
    /// Due on a schedule stretched by poor network quality.
    Adaptive,
}

/// Per-tier queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub strategy: QueueStrategy,
    pub max_batch_size: usize,
    pub interval_ms: u64,
    /// Share of the link bandwidth this tier may use, in (0, 1].
    pub bandwidth_allocation: f64,
    /// Maximum number of queued records.
    pub max_depth: usize,
}

impl QueueConfig {
    /// Defaults per tier: the more urgent, the shorter the interval.
    pub fn default_for(tier: Priority) -> Self {
        let (strategy, max_batch_size, interval_ms, bandwidth_allocation) = match tier {
            Priority::Critical => (QueueStrategy::Immediate, 5, 1_000, 0.4),
            Priority::High => (QueueStrategy::Batch, 10, 5_000, 0.3),
            Priority::Medium => (QueueStrategy::Scheduled, 25, 30_000, 0.2),
            Priority::Low => (QueueStrategy::Adaptive, 50, 120_000, 0.1),
        };
        Self {
            strategy,
            max_batch_size,
            interval_ms,
            bandwidth_allocation,
            max_depth: 10_000,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn validate(&self, tier: Priority) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(Error::InvalidInput(format!("{} queue batch size is zero", tier)));
        }
        if self.interval_ms == 0 {
            return Err(Error::InvalidInput(format!("{} queue interval is zero", tier)));
        }
        if !(self.bandwidth_allocation > 0.0 && self.bandwidth_allocation <= 1.0) {
            return Err(Error::InvalidInput(format!(
                "{} queue bandwidth allocation must be in (0, 1]",
                tier
            )));
        }
        if self.max_depth == 0 {
            return Err(Error::InvalidInput(format!("{} queue depth is zero", tier)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct QueueEntry {
    id: RecordId,
    not_before: Option<DateTime<Utc>>,
}

impl QueueEntry {
    fn ready(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map_or(true, |t| t <= now)
    }
}

/// Observable state of a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub tier: Priority,
    pub strategy: QueueStrategy,
    pub depth: usize,
    pub paused: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub next_sync: DateTime<Utc>,
}

/// FIFO queue holding ids of records of a single priority tier.
#[derive(Debug)]
pub struct SyncQueue {
    tier: Priority,
    config: QueueConfig,
    entries: VecDeque<QueueEntry>,
    last_sync: Option<DateTime<Utc>>,
    next_sync: DateTime<Utc>,
    paused: bool,
}

impl SyncQueue {
    /// Create a queue that is due right away.
    pub fn new(tier: Priority, config: QueueConfig, now: DateTime<Utc>) -> Self {
        Self {
            tier,
            config,
            entries: VecDeque::new(),
            last_sync: None,
            next_sync: now,
            paused: false,
        }
    }

    pub fn tier(&self) -> Priority {
        self.tier
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.config.max_depth
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.entries.iter().any(|e| &e.id == id)
    }

    /// Append a record id at the tail.
    ///
    /// # Errors
    /// - `CapacityExceeded` when the queue is at its depth limit
    /// - `InvalidInput` when the id is already queued
    pub fn enqueue(&mut self, id: RecordId, not_before: Option<DateTime<Utc>>) -> Result<()> {
        if self.is_full() {
            return Err(Error::CapacityExceeded(format!(
                "{} queue holds {} records",
                self.tier,
                self.entries.len()
            )));
        }
        if self.contains(&id) {
            return Err(Error::InvalidInput(format!("{} is already queued", id)));
        }
        self.entries.push_back(QueueEntry { id, not_before });
        Ok(())
    }

    /// Return an already accepted record to the tail, ignoring the depth limit.
    pub fn requeue(&mut self, id: RecordId, not_before: Option<DateTime<Utc>>) {
        if !self.contains(&id) {
            self.entries.push_back(QueueEntry { id, not_before });
        }
    }

    pub fn remove(&mut self, id: &RecordId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| &e.id != id);
        self.entries.len() != before
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if self.paused {
            return false;
        }
        match self.config.strategy {
            QueueStrategy::Immediate => true,
            QueueStrategy::Batch => {
                now >= self.next_sync
                    || self.entries.iter().filter(|e| e.ready(now)).count()
                        >= self.config.max_batch_size
            }
            QueueStrategy::Scheduled | QueueStrategy::Adaptive => now >= self.next_sync,
        }
    }

    /// Take up to one batch of ready ids in enqueue order.
    ///
    /// Returns nothing when the queue is paused or not yet due. Entries still
    /// in retry backoff keep their position.
    pub fn dequeue_batch(&mut self, now: DateTime<Utc>) -> Vec<RecordId> {
        if !self.is_due(now) {
            return Vec::new();
        }
        let mut batch = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if batch.len() < self.config.max_batch_size && entry.ready(now) {
                batch.push(entry.id);
            } else {
                kept.push_back(entry);
            }
        }
        self.entries = kept;
        batch
    }

    /// Advance the schedule from `now`.
    pub fn reschedule(
        &mut self,
        now: DateTime<Utc>,
        condition: &NetworkCondition,
        low_bandwidth_mbps: f64,
    ) {
        let interval = self.effective_interval(condition, low_bandwidth_mbps);
        self.last_sync = Some(now);
        self.next_sync = now
            + chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::zero());
    }

    /// Interval to the next cycle; adaptive queues back off on poor links.
    pub fn effective_interval(&self, condition: &NetworkCondition, low_bandwidth_mbps: f64) -> Duration {
        let base = self.config.interval();
        if self.config.strategy != QueueStrategy::Adaptive {
            return base;
        }
        if !condition.online {
            base * 4
        } else if condition.reliability < 70.0 || condition.bandwidth_mbps < low_bandwidth_mbps {
            base * 2
        } else {
            base
        }
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            tier: self.tier,
            strategy: self.config.strategy,
            depth: self.entries.len(),
            paused: self.paused,
            last_sync: self.last_sync,
            next_sync: self.next_sync,
        }
    }
}

/// The four tier queues.
#[derive(Debug)]
pub struct QueueSet {
    queues: [SyncQueue; 4],
}

impl QueueSet {
    pub fn new(configs: [QueueConfig; 4], now: DateTime<Utc>) -> Self {
        let [c, h, m, l] = configs;
        Self {
            queues: [
                SyncQueue::new(Priority::Critical, c, now),
                SyncQueue::new(Priority::High, h, now),
                SyncQueue::new(Priority::Medium, m, now),
                SyncQueue::new(Priority::Low, l, now),
            ],
        }
    }

    pub fn get(&self, tier: Priority) -> &SyncQueue {
        &self.queues[tier.rank() as usize]
    }

    pub fn get_mut(&mut self, tier: Priority) -> &mut SyncQueue {
        &mut self.queues[tier.rank() as usize]
    }

    /// Tier whose queue currently holds the id.
    pub fn locate(&self, id: &RecordId) -> Option<Priority> {
        self.queues.iter().find(|q| q.contains(id)).map(|q| q.tier)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncQueue> {
        self.queues.iter()
    }
}
