//! Sync orchestrator tying the store, queues, policies and endpoint together.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, info, warn};

use offsync_common::{Error, Priority, RecordId, RecordStatus, Result};

use crate::capability::CapabilityTable;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::conflict::{ConflictResolution, ConflictResolver, Resolution};
use crate::integrity::{IntegrityChecker, IntegrityDecision};
use crate::metrics::{SyncMetrics, TimeRange};
use crate::network::{NetworkCondition, NetworkConditionSource, NetworkMonitor};
use crate::optimizer::{BandwidthOptimizer, Technique};
use crate::policy::{DeviceState, PolicyEngine, SyncPolicy};
use crate::queue::{QueueSet, QueueStatus};
use crate::record::{OfflineRecord, RecordDraft, RecordFilter, RecordSummary, SyncAttempt};
use crate::remote::{RemoteEndpoint, TransmitRequest};
use crate::store::RecordStore;

/// Why a cycle made no attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// No policy approves the current conditions.
    NoActivePolicy,
    Offline,
    /// The active policy's priority floor excludes this tier.
    TierHeldBack,
    Paused,
    NotDue,
}

/// Outcome of one queue cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub tier: Priority,
    pub attempted: usize,
    pub synced: usize,
    pub requeued: usize,
    pub failed: usize,
    /// Records found past their TTL when claimed.
    pub expired: usize,
    pub conflicts: usize,
    pub skipped: Option<SkipReason>,
}

impl CycleReport {
    fn new(tier: Priority) -> Self {
        Self {
            tier,
            attempted: 0,
            synced: 0,
            requeued: 0,
            failed: 0,
            expired: 0,
            conflicts: 0,
            skipped: None,
        }
    }

    fn skipped(tier: Priority, reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::new(tier)
        }
    }

    fn tally(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Synced { conflict } => {
                self.attempted += 1;
                self.synced += 1;
                if conflict {
                    self.conflicts += 1;
                }
            }
            Outcome::Requeued => {
                self.attempted += 1;
                self.requeued += 1;
            }
            Outcome::Failed => {
                self.attempted += 1;
                self.failed += 1;
            }
            Outcome::Expired => self.expired += 1,
            Outcome::Skipped => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Synced { conflict: bool },
    Requeued,
    Failed,
    Expired,
    /// Record was no longer pending when its turn came.
    Skipped,
}

enum Claim {
    Claimed(OfflineRecord),
    Expired,
    NotPending,
}

/// Result of a successful exchange with the endpoint.
struct Delivery {
    version: u64,
    technique: Technique,
    transmitted_bytes: u64,
    resolution: Option<ConflictResolution>,
}

/// Network snapshot for an attempt plus the share of it the tier may use.
struct Link {
    observed: NetworkCondition,
    allocated: NetworkCondition,
}

/// Offline-first sync engine.
///
/// All state is behind async locks so the scheduler's per-queue tasks can
/// drive cycles concurrently. Lock order is queues before store; no lock is
/// held while awaiting the endpoint.
pub struct SyncEngine {
    store: RwLock<RecordStore>,
    queues: Mutex<QueueSet>,
    policies: RwLock<PolicyEngine>,
    device: RwLock<DeviceState>,
    conflicts: RwLock<Vec<ConflictResolution>>,
    monitor: NetworkMonitor,
    endpoint: Arc<dyn RemoteEndpoint>,
    clock: Arc<dyn Clock>,
    integrity: IntegrityChecker,
    optimizer: BandwidthOptimizer,
    resolver: ConflictResolver,
    capabilities: CapabilityTable,
    wakeups: [Notify; 4],
    config: EngineConfig,
}

impl SyncEngine {
    /// Build an engine with an empty store.
    pub fn new(
        config: EngineConfig,
        network: Arc<dyn NetworkConditionSource>,
        endpoint: Arc<dyn RemoteEndpoint>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let now = clock.now();

        Ok(Self {
            store: RwLock::new(RecordStore::new(
                config.max_records,
                config.attempt_history_limit,
            )),
            queues: Mutex::new(QueueSet::new(config.queues.to_array(), now)),
            policies: RwLock::new(PolicyEngine::new(config.policies.clone())?),
            device: RwLock::new(DeviceState::default()),
            conflicts: RwLock::new(Vec::new()),
            monitor: NetworkMonitor::new(network),
            endpoint,
            clock,
            integrity: IntegrityChecker::default(),
            optimizer: BandwidthOptimizer::new(config.low_bandwidth_mbps, config.delta_min_bytes),
            resolver: ConflictResolver::new(),
            capabilities: CapabilityTable::default_table(),
            wakeups: [Notify::new(), Notify::new(), Notify::new(), Notify::new()],
            config,
        })
    }

    /// Use a different integrity checker. Only valid before the first submit.
    pub fn with_integrity_checker(mut self, checker: IntegrityChecker) -> Self {
        self.integrity = checker;
        self
    }

    pub fn with_capabilities(mut self, table: CapabilityTable) -> Self {
        self.capabilities = table;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    pub fn endpoint_name(&self) -> &str {
        self.endpoint.name()
    }

    /// Accept a new record into the store and its tier's queue.
    ///
    /// # Errors
    /// - `InvalidInput` for an empty device id or a non-positive TTL
    /// - `CapacityExceeded` when the store or the tier's queue is full
    pub async fn submit(&self, draft: RecordDraft) -> Result<RecordId> {
        if draft.device_id.is_empty() {
            return Err(Error::InvalidInput("Device id cannot be empty".to_string()));
        }
        if draft.ttl.is_some_and(|ttl| ttl <= chrono::Duration::zero()) {
            return Err(Error::InvalidInput("TTL must be positive".to_string()));
        }

        let now = self.clock.now();
        let checksum = self.integrity.checksum(&draft.payload)?;
        let record = OfflineRecord::from_draft(
            draft,
            self.config.default_max_retries,
            self.config.default_ttl(),
            now,
            checksum,
        )?;
        let tier = record.priority;
        let kind = record.kind;

        let id = {
            let mut queues = self.queues.lock().await;
            let queue = queues.get_mut(tier);
            if queue.is_full() {
                return Err(Error::CapacityExceeded(format!(
                    "{} queue is at its depth limit of {}",
                    tier,
                    queue.config().max_depth
                )));
            }
            let id = self.store.write().await.add(record)?;
            queue.enqueue(id.clone(), None)?;
            id
        };

        info!(record = %id, %tier, ?kind, "Record submitted");
        self.wakeups[tier.rank() as usize].notify_one();
        Ok(id)
    }

    pub async fn get(&self, id: &RecordId) -> Result<OfflineRecord> {
        self.store.read().await.get(id).cloned()
    }

    /// Summaries of matching records, oldest first.
    pub async fn list(&self, filter: &RecordFilter) -> Vec<RecordSummary> {
        self.store
            .read()
            .await
            .list(filter)
            .into_iter()
            .map(OfflineRecord::summary)
            .collect()
    }

    pub async fn metrics(&self, range: TimeRange) -> SyncMetrics {
        let store = self.store.read().await;
        let conflicts = self.conflicts.read().await;
        SyncMetrics::compute(store.records(), &conflicts, range)
    }

    /// Retained conflict resolutions, oldest first.
    pub async fn conflict_log(&self) -> Vec<ConflictResolution> {
        self.conflicts.read().await.clone()
    }

    pub async fn queue_status(&self) -> Vec<QueueStatus> {
        self.queues.lock().await.iter().map(|q| q.status()).collect()
    }

    pub async fn pause_queue(&self, tier: Priority) {
        self.queues.lock().await.get_mut(tier).pause();
        info!(%tier, "Queue paused");
    }

    pub async fn resume_queue(&self, tier: Priority) {
        self.queues.lock().await.get_mut(tier).resume();
        info!(%tier, "Queue resumed");
        self.wakeups[tier.rank() as usize].notify_one();
    }

    /// Sync one pending record now, bypassing its queue's schedule.
    ///
    /// Still fails closed: nothing is sent while offline or without an
    /// active policy, and the record stays queued in that case.
    pub async fn force_sync(&self, id: &RecordId) -> Result<CycleReport> {
        let record = self.get(id).await?;
        if record.status != RecordStatus::Pending {
            return Err(Error::InvalidInput(format!(
                "Record {} is {} and cannot be force-synced",
                id, record.status
            )));
        }
        let tier = record.priority;

        let link = self.monitor.current();
        if !link.online {
            return Ok(CycleReport::skipped(tier, SkipReason::Offline));
        }
        let Some(policy) = self.active_policy(&link).await else {
            return Ok(CycleReport::skipped(tier, SkipReason::NoActivePolicy));
        };

        self.queues.lock().await.get_mut(tier).remove(id);
        debug!(record = %id, "Force sync requested");
        Ok(self.process_batch(tier, vec![id.clone()], &policy, link).await)
    }

    /// Remove terminal records created before the cutoff, along with their
    /// conflict log entries.
    pub async fn purge(&self, older_than: chrono::DateTime<chrono::Utc>) -> usize {
        let mut store = self.store.write().await;
        let purged = store.purge(older_than, true);
        if purged > 0 {
            self.conflicts
                .write()
                .await
                .retain(|entry| store.get(&entry.record_id).is_ok());
        }
        purged
    }

    pub async fn add_policy(&self, policy: SyncPolicy) -> Result<()> {
        self.policies.write().await.add_policy(policy)
    }

    pub async fn update_policy(&self, policy: SyncPolicy) -> Result<()> {
        self.policies.write().await.update_policy(policy)
    }

    pub async fn disable_policy(&self, name: &str) -> Result<()> {
        self.policies.write().await.disable_policy(name)
    }

    pub async fn enable_policy(&self, name: &str) -> Result<()> {
        self.policies.write().await.enable_policy(name)
    }

    pub async fn policies(&self) -> Vec<SyncPolicy> {
        self.policies.read().await.policies().to_vec()
    }

    pub async fn set_device_state(&self, state: DeviceState) {
        *self.device.write().await = state;
    }

    /// Take a fresh network sample.
    pub async fn sample_network(&self) -> NetworkCondition {
        self.monitor.sample().await
    }

    pub fn current_network(&self) -> NetworkCondition {
        self.monitor.current()
    }

    async fn active_policy(&self, condition: &NetworkCondition) -> Option<SyncPolicy> {
        let device = self.device.read().await.clone();
        let now = self.clock.now();
        self.policies
            .read()
            .await
            .active_policy(condition, &device, now)
            .cloned()
    }

    /// Drain one batch from a tier's queue if it is due.
    pub async fn run_cycle(&self, tier: Priority) -> Result<CycleReport> {
        let now = self.clock.now();
        let condition = self.monitor.current();
        let policy = self.active_policy(&condition).await;
        let low_bandwidth = self.optimizer.low_bandwidth_mbps();

        let batch = {
            let mut queues = self.queues.lock().await;
            let queue = queues.get_mut(tier);
            if queue.is_paused() {
                return Ok(CycleReport::skipped(tier, SkipReason::Paused));
            }
            if !queue.is_due(now) {
                return Ok(CycleReport::skipped(tier, SkipReason::NotDue));
            }

            let skip = if !condition.online {
                Some(SkipReason::Offline)
            } else {
                match &policy {
                    None => Some(SkipReason::NoActivePolicy),
                    Some(p) if !p.allows_tier(tier) => Some(SkipReason::TierHeldBack),
                    Some(_) => None,
                }
            };
            if let Some(reason) = skip {
                queue.reschedule(now, &condition, low_bandwidth);
                debug!(%tier, ?reason, "Cycle skipped");
                return Ok(CycleReport::skipped(tier, reason));
            }

            let batch = queue.dequeue_batch(now);
            queue.reschedule(now, &condition, low_bandwidth);
            batch
        };

        let Some(policy) = policy else {
            return Ok(CycleReport::skipped(tier, SkipReason::NoActivePolicy));
        };
        if batch.is_empty() {
            return Ok(CycleReport::new(tier));
        }

        let report = self.process_batch(tier, batch, &policy, condition).await;
        info!(
            %tier,
            policy = %policy.name,
            attempted = report.attempted,
            synced = report.synced,
            requeued = report.requeued,
            failed = report.failed,
            "Cycle completed"
        );
        Ok(report)
    }

    /// Run a cycle for every tier, most urgent first.
    pub async fn run_all_cycles(&self) -> Result<Vec<CycleReport>> {
        let mut reports = Vec::with_capacity(Priority::ALL.len());
        for tier in Priority::ALL {
            reports.push(self.run_cycle(tier).await?);
        }
        Ok(reports)
    }

    /// Expire pending records past their TTL and drop them from their queues.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let expired = {
            let mut queues = self.queues.lock().await;
            let mut store = self.store.write().await;
            let ids = store.expired_pending(now);
            for id in &ids {
                store.transition(id, RecordStatus::Expired)?;
                if let Some(tier) = queues.locate(id) {
                    queues.get_mut(tier).remove(id);
                }
            }
            ids
        };

        if !expired.is_empty() {
            info!("Expired {} pending records", expired.len());
        }
        Ok(expired.len())
    }

    /// Replace the record table, rebuilding queues from its pending records.
    ///
    /// Returns the number of records re-queued.
    pub async fn restore(&self, store: RecordStore) -> Result<usize> {
        let now = self.clock.now();
        let mut queues = self.queues.lock().await;
        let mut rebuilt = QueueSet::new(self.config.queues.to_array(), now);

        let pending: Vec<(RecordId, Priority)> = store
            .list(&RecordFilter::default().with_status(RecordStatus::Pending))
            .into_iter()
            .map(|r| (r.id.clone(), r.priority))
            .collect();
        for (id, tier) in &pending {
            rebuilt.get_mut(*tier).requeue(id.clone(), None);
        }

        *queues = rebuilt;
        *self.store.write().await = store;
        info!("Restored record store with {} pending records", pending.len());
        Ok(pending.len())
    }

    /// Load a saved record table and restore from it.
    pub async fn restore_from(&self, path: impl AsRef<Path>) -> Result<usize> {
        let store = RecordStore::load(
            path,
            self.config.max_records,
            self.config.attempt_history_limit,
        )
        .await?;
        self.restore(store).await
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.store.read().await.save(path).await
    }

    pub(crate) fn wakeup(&self, tier: Priority) -> &Notify {
        &self.wakeups[tier.rank() as usize]
    }

    async fn process_batch(
        &self,
        tier: Priority,
        batch: Vec<RecordId>,
        policy: &SyncPolicy,
        observed: NetworkCondition,
    ) -> CycleReport {
        let allocation = self.config.queues.get(tier).bandwidth_allocation;
        let link = Link {
            allocated: NetworkCondition {
                bandwidth_mbps: observed.bandwidth_mbps * allocation,
                ..observed.clone()
            },
            observed,
        };
        let concurrency = policy.actions.max_concurrent.max(1);

        let outcomes: Vec<Outcome> = stream::iter(batch)
            .map(|id| {
                let link = &link;
                async move {
                    match self.process_record(&id, tier, policy, link).await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            warn!(record = %id, "Sync bookkeeping failed: {}", e);
                            self.release(&id, tier).await;
                            Outcome::Skipped
                        }
                    }
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut report = CycleReport::new(tier);
        for outcome in outcomes {
            report.tally(outcome);
        }
        report
    }

    /// Put a record stranded in `syncing` back on its queue.
    async fn release(&self, id: &RecordId, tier: Priority) {
        let mut queues = self.queues.lock().await;
        let mut store = self.store.write().await;
        let stranded = store
            .get(id)
            .is_ok_and(|record| record.status == RecordStatus::Syncing);
        if !stranded {
            return;
        }
        match store.transition(id, RecordStatus::Pending) {
            Ok(_) => {
                queues.get_mut(tier).requeue(id.clone(), None);
                debug!(record = %id, "Stranded record released");
            }
            Err(e) => warn!(record = %id, "Could not release record: {}", e),
        }
    }

    /// Claim a pending record by moving it to `syncing`.
    async fn claim(&self, id: &RecordId) -> Result<Claim> {
        let now = self.clock.now();
        let mut store = self.store.write().await;
        let record = store.get(id)?;
        if record.status != RecordStatus::Pending {
            return Ok(Claim::NotPending);
        }
        if record.is_expired_at(now) {
            store.transition(id, RecordStatus::Expired)?;
            debug!(record = %id, "Record expired before its turn");
            return Ok(Claim::Expired);
        }
        store.transition(id, RecordStatus::Syncing)?;
        Ok(Claim::Claimed(store.get(id)?.clone()))
    }

    async fn process_record(
        &self,
        id: &RecordId,
        tier: Priority,
        policy: &SyncPolicy,
        link: &Link,
    ) -> Result<Outcome> {
        let record = match self.claim(id).await? {
            Claim::Claimed(record) => record,
            Claim::Expired => return Ok(Outcome::Expired),
            Claim::NotPending => return Ok(Outcome::Skipped),
        };
        let started = Instant::now();

        let decision = self
            .integrity
            .verify(&record, &record.checksum)
            .map(|report| {
                if !report.valid {
                    warn!(
                        record = %id,
                        corruption = report.corruption_level,
                        "Integrity check failed"
                    );
                }
                (report, self.integrity.decide(&report, self.config.repair_strategy))
            });

        match decision {
            Ok((_, IntegrityDecision::Proceed)) => {}
            Ok((report, IntegrityDecision::Retry)) => {
                let err = Error::IntegrityFailure(format!(
                    "{}% of payload blocks changed",
                    report.corruption_level
                ));
                return self.record_failure(&record, tier, policy, link, err, false, started).await;
            }
            Ok((report, IntegrityDecision::Discard)) => {
                let err = Error::IntegrityFailure(format!(
                    "{}% of payload blocks changed, discarded",
                    report.corruption_level
                ));
                return self.fail_permanently(&record, link, err, false, started).await;
            }
            Err(e) => {
                return self.fail_permanently(&record, link, e, false, started).await;
            }
        }

        match self.deliver(&record, policy, link).await {
            Ok(delivery) => self.commit(&record, delivery, link, started).await,
            Err(e) if e.is_retryable() => {
                self.record_failure(&record, tier, policy, link, e, true, started).await
            }
            Err(e) => self.fail_permanently(&record, link, e, true, started).await,
        }
    }

    /// Optimize, transmit, and reconcile with the remote copy.
    async fn deliver(&self, record: &OfflineRecord, policy: &SyncPolicy, link: &Link) -> Result<Delivery> {
        let optimized = self.optimizer.optimize(record, policy, &link.allocated)?;

        let base_version = record.base_version.or_else(|| {
            record
                .logical_key
                .as_deref()
                .and_then(|key| self.optimizer.baseline_version(key))
        });
        let request = TransmitRequest {
            record_id: record.id.clone(),
            kind: record.kind,
            logical_key: record.logical_key.clone(),
            body: optimized.body,
            technique: optimized.technique,
            delta_base_version: optimized.delta_base_version,
            base_version,
            checksum: record.checksum.digest.clone(),
            local_modified_at: record.created_at,
            encryption: policy.actions.encryption,
            network: link.allocated.clone(),
        };
        let key = request.storage_key();

        let response = self
            .guarded(&record.id, self.endpoint.transmit(request))
            .await?;

        let mut delivery = Delivery {
            version: response.version,
            technique: optimized.technique,
            transmitted_bytes: optimized.transmitted_size,
            resolution: None,
        };

        let Some(remote) = response.remote else {
            return Ok(delivery);
        };
        let now = self.clock.now();
        let ancestor = record
            .logical_key
            .as_deref()
            .zip(record.base_version)
            .and_then(|(key, version)| self.optimizer.baseline_payload(key, version));
        let Some(conflict) = self.resolver.detect(record, &remote, ancestor.as_ref(), now) else {
            return Ok(delivery);
        };

        let resolution = self.resolver.resolve(&conflict, now);
        debug!(
            record = %record.id,
            conflict = ?resolution.conflict_type,
            outcome = ?resolution.resolution,
            "Conflict resolved"
        );
        if resolution.resolution != Resolution::RemoteWins {
            delivery.version = self
                .guarded(
                    &record.id,
                    self.endpoint
                        .publish(&key, resolution.resolved_payload.clone(), now),
                )
                .await?;
        }
        delivery.resolution = Some(resolution);
        Ok(delivery)
    }

    /// Race an endpoint call against the timeout and loss of connectivity.
    async fn guarded<T, F>(&self, id: &RecordId, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send,
    {
        let timeout = self.config.transmit_timeout();
        let mut network = self.monitor.subscribe();
        let went_offline = async move {
            let _ = network.wait_for(|c| !c.online).await;
        };

        tokio::select! {
            result = call => result,
            _ = tokio::time::sleep(timeout) => Err(Error::Timeout(timeout.as_millis() as u64)),
            _ = went_offline => Err(Error::Cancelled(format!("network went offline while sending {}", id))),
        }
    }

    async fn commit(
        &self,
        record: &OfflineRecord,
        delivery: Delivery,
        link: &Link,
        started: Instant,
    ) -> Result<Outcome> {
        let now = self.clock.now();
        let id = &record.id;
        let conflict = delivery.resolution.is_some();

        let final_payload = match &delivery.resolution {
            Some(resolution) => resolution.resolved_payload.clone(),
            None => record.payload.clone(),
        };

        {
            let mut store = self.store.write().await;
            if final_payload != record.payload {
                let checksum = self.integrity.checksum(&final_payload)?;
                store.replace_payload(id, final_payload.clone(), checksum)?;
            }
            store.set_synced_version(id, delivery.version)?;
            store.append_attempt(
                id,
                SyncAttempt::succeeded(
                    now,
                    elapsed_ms(started),
                    link.observed.clone(),
                    delivery.transmitted_bytes,
                    delivery.technique,
                ),
            )?;
            store.transition(id, RecordStatus::Synced)?;
        }

        if let Some(key) = &record.logical_key {
            self.optimizer
                .record_baseline(key.clone(), delivery.version, final_payload);
        }
        if let Some(resolution) = delivery.resolution {
            let mut log = self.conflicts.write().await;
            log.push(resolution);
            let excess = log.len().saturating_sub(self.config.conflict_log_limit);
            log.drain(..excess);
        }

        debug!(record = %id, version = delivery.version, "Record synced");
        Ok(Outcome::Synced { conflict })
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_failure(
        &self,
        record: &OfflineRecord,
        tier: Priority,
        policy: &SyncPolicy,
        link: &Link,
        err: Error,
        integrity_ok: bool,
        started: Instant,
    ) -> Result<Outcome> {
        let now = self.clock.now();
        let id = &record.id;

        let retry_count = {
            let mut store = self.store.write().await;
            store.append_attempt(
                id,
                SyncAttempt::failed(
                    now,
                    err.to_string(),
                    elapsed_ms(started),
                    link.observed.clone(),
                    integrity_ok,
                ),
            )?;
            let retry_count = if store.get(id)?.retries_exhausted() {
                None
            } else {
                Some(store.record_retry(id)?)
            };

            match retry_count {
                Some(count) if count < record.max_retries => {
                    store.transition(id, RecordStatus::Pending)?;
                    count
                }
                _ => {
                    store.transition(id, RecordStatus::Failed)?;
                    warn!(
                        record = %id,
                        retries = record.max_retries,
                        "Retries exhausted, record failed: {}",
                        err
                    );
                    return Ok(Outcome::Failed);
                }
            }
        };

        let not_before = self
            .config
            .retry
            .not_before(policy.actions.retry_strategy, retry_count, now);
        self.queues.lock().await.get_mut(tier).requeue(id.clone(), not_before);
        debug!(record = %id, retry = retry_count, ?not_before, "Record requeued: {}", err);
        Ok(Outcome::Requeued)
    }

    /// Fail a record without spending retries on it.
    async fn fail_permanently(
        &self,
        record: &OfflineRecord,
        link: &Link,
        err: Error,
        integrity_ok: bool,
        started: Instant,
    ) -> Result<Outcome> {
        let now = self.clock.now();
        let mut store = self.store.write().await;
        store.append_attempt(
            &record.id,
            SyncAttempt::failed(
                now,
                err.to_string(),
                elapsed_ms(started),
                link.observed.clone(),
                integrity_ok,
            ),
        )?;
        store.transition(&record.id, RecordStatus::Failed)?;
        warn!(record = %record.id, "Record failed permanently: {}", err);
        Ok(Outcome::Failed)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::conflict::ConflictType;
    use crate::integrity::RepairStrategy;
    use crate::network::ConnectionType;
    use crate::policy::{PolicyConditions, RetryStrategy};
    use crate::simulation::{SimulatedEndpoint, StaticNetwork};
    use chrono::{Duration as ChronoDuration, Utc};
    use offsync_common::RecordKind;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        engine: Arc<SyncEngine>,
        network: Arc<StaticNetwork>,
        endpoint: Arc<SimulatedEndpoint>,
        clock: ManualClock,
    }

    fn wifi() -> NetworkCondition {
        NetworkCondition::online(ConnectionType::Wifi, 50.0, 20.0)
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            policies: vec![SyncPolicy::permissive("any")],
            ..EngineConfig::default()
        }
    }

    async fn harness_with(config: EngineConfig, endpoint: SimulatedEndpoint) -> Harness {
        let network = Arc::new(StaticNetwork::new(wifi()));
        let endpoint = Arc::new(endpoint);
        let clock = ManualClock::new(Utc::now());
        let engine = SyncEngine::new(
            config,
            network.clone(),
            endpoint.clone(),
            Arc::new(clock.clone()),
        )
        .unwrap();
        engine.sample_network().await;
        Harness {
            engine: Arc::new(engine),
            network,
            endpoint,
            clock,
        }
    }

    async fn harness() -> Harness {
        harness_with(test_config(), SimulatedEndpoint::new(42)).await
    }

    fn draft(priority: Priority, payload: Value) -> RecordDraft {
        RecordDraft::new(
            RecordKind::UserAction,
            payload,
            priority,
            "device-1",
            ChronoDuration::hours(1),
        )
    }

    fn large_document(revision: u32) -> Value {
        json!({
            "title": "field notes",
            "revision": revision,
            "body": "observation ".repeat(400),
        })
    }

    #[tokio::test]
    async fn test_successful_sync_keeps_payload() {
        let h = harness().await;
        let payload = json!({"amount": 125, "currency": "EUR"});
        let id = h.engine.submit(draft(Priority::High, payload.clone())).await.unwrap();

        let report = h.engine.run_cycle(Priority::High).await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(report.skipped, None);

        let record = h.engine.get(&id).await.unwrap();
        assert_eq!(record.status, RecordStatus::Synced);
        assert_eq!(record.payload, payload);
        assert_eq!(record.attempts.len(), 1);
        assert!(record.attempts[0].success);
        assert_eq!(h.endpoint.received()[0].payload, payload);
    }

    #[tokio::test]
    async fn test_retries_exhaust_into_failed() {
        let mut config = test_config();
        config.policies[0].actions.retry_strategy = RetryStrategy::Exponential;
        let h = harness_with(config, SimulatedEndpoint::new(1)).await;
        h.endpoint.fail_next(2);

        let id = h
            .engine
            .submit(draft(Priority::Critical, json!({"alert": "smoke"})).with_max_retries(2))
            .await
            .unwrap();

        let first = h.engine.run_cycle(Priority::Critical).await.unwrap();
        assert_eq!(first.requeued, 1);
        let record = h.engine.get(&id).await.unwrap();
        assert_eq!(record.status, RecordStatus::Pending);
        assert_eq!(record.retry_count, 1);

        // Still backing off.
        let waiting = h.engine.run_cycle(Priority::Critical).await.unwrap();
        assert_eq!(waiting.attempted, 0);

        h.clock.advance(ChronoDuration::minutes(10));
        let second = h.engine.run_cycle(Priority::Critical).await.unwrap();
        assert_eq!(second.failed, 1);

        let record = h.engine.get(&id).await.unwrap();
        assert_eq!(record.status, RecordStatus::Failed);
        assert_eq!(record.retry_count, 2);
        assert_eq!(record.attempts.len(), 2);
        assert!(record.attempts.iter().all(|a| !a.success));

        h.clock.advance(ChronoDuration::minutes(10));
        let third = h.engine.run_cycle(Priority::Critical).await.unwrap();
        assert_eq!(third.attempted, 0);
        assert_eq!(h.engine.get(&id).await.unwrap().attempts.len(), 2);
    }

    #[tokio::test]
    async fn test_newer_remote_wins() {
        let h = harness().await;
        let first = h
            .engine
            .submit(draft(Priority::High, json!({"theme": "light"})).with_logical_key("prefs"))
            .await
            .unwrap();
        h.engine.run_cycle(Priority::High).await.unwrap();
        assert_eq!(h.engine.get(&first).await.unwrap().status, RecordStatus::Synced);

        // Another device wrote the same key later than our next edit.
        let remote_payload = json!({"theme": "dark", "font": 14});
        h.endpoint
            .set_canonical("prefs", remote_payload.clone(), h.clock.now() + ChronoDuration::hours(1));

        h.clock.advance(ChronoDuration::minutes(1));
        let second = h
            .engine
            .submit(draft(Priority::High, json!({"theme": "sepia"})).with_logical_key("prefs"))
            .await
            .unwrap();
        let report = h.engine.run_cycle(Priority::High).await.unwrap();
        assert_eq!(report.conflicts, 1);

        let log = h.engine.conflict_log().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].conflict_type, ConflictType::Timestamp);
        assert_eq!(log[0].resolution, Resolution::RemoteWins);
        assert_eq!(log[0].resolved_payload, remote_payload);

        let record = h.engine.get(&second).await.unwrap();
        assert_eq!(record.status, RecordStatus::Synced);
        assert_eq!(record.payload, remote_payload);
        assert_eq!(h.endpoint.canonical("prefs").unwrap().payload, remote_payload);
    }

    #[tokio::test]
    async fn test_no_policy_means_no_attempts() {
        let mut config = test_config();
        config.policies = vec![SyncPolicy {
            conditions: PolicyConditions {
                network_types: vec![ConnectionType::Satellite],
                ..PolicyConditions::default()
            },
            ..SyncPolicy::permissive("satellite-only")
        }];
        let h = harness_with(config, SimulatedEndpoint::new(1)).await;

        for tier in Priority::ALL {
            h.engine.submit(draft(tier, json!({"tier": tier.as_str()}))).await.unwrap();
        }

        let reports = h.engine.run_all_cycles().await.unwrap();
        assert_eq!(reports.len(), 4);
        for report in reports {
            assert_eq!(report.attempted, 0);
            assert_eq!(report.skipped, Some(SkipReason::NoActivePolicy));
        }
        assert!(h.endpoint.received().is_empty());
        for summary in h.engine.list(&RecordFilter::default()).await {
            assert_eq!(summary.status, RecordStatus::Pending);
            assert_eq!(summary.attempt_count, 0);
        }
    }

    #[tokio::test]
    async fn test_low_bandwidth_uses_delta() {
        let h = harness().await;
        h.network
            .set(NetworkCondition::online(ConnectionType::Cellular, 1.0, 120.0));
        h.engine.sample_network().await;

        h.engine
            .submit(draft(Priority::Critical, large_document(1)).with_logical_key("notes"))
            .await
            .unwrap();
        h.engine.run_cycle(Priority::Critical).await.unwrap();

        let id = h
            .engine
            .submit(draft(Priority::Critical, large_document(2)).with_logical_key("notes"))
            .await
            .unwrap();
        let report = h.engine.run_cycle(Priority::Critical).await.unwrap();
        assert_eq!(report.synced, 1);

        let record = h.engine.get(&id).await.unwrap();
        let attempt = record.last_attempt().unwrap();
        assert!(attempt.technique.unwrap().uses_delta());
        assert!(attempt.transmitted_bytes < record.size_bytes());

        let received = h.endpoint.received();
        assert!(received[1].technique.uses_delta());
        assert_eq!(h.endpoint.canonical("notes").unwrap().payload, large_document(2));
    }

    #[tokio::test]
    async fn test_expiry_sweep() {
        let h = harness().await;
        let id = h
            .engine
            .submit(
                RecordDraft::new(
                    RecordKind::SensorReading,
                    json!({"temp": 21.5}),
                    Priority::Low,
                    "sensor-7",
                    ChronoDuration::minutes(5),
                )
                .with_max_retries(10),
            )
            .await
            .unwrap();

        assert_eq!(h.engine.sweep_expired().await.unwrap(), 0);
        h.clock.advance(ChronoDuration::minutes(6));
        assert_eq!(h.engine.sweep_expired().await.unwrap(), 1);

        assert_eq!(h.engine.get(&id).await.unwrap().status, RecordStatus::Expired);
        let low = &h.engine.queue_status().await[Priority::Low.rank() as usize];
        assert_eq!(low.depth, 0);

        h.clock.advance(ChronoDuration::minutes(10));
        let report = h.engine.run_cycle(Priority::Low).await.unwrap();
        assert_eq!(report.attempted, 0);
        assert!(h.endpoint.received().is_empty());
    }

    #[tokio::test]
    async fn test_records_stay_in_their_tier() {
        let h = harness().await;
        let low = h.engine.submit(draft(Priority::Low, json!({"n": 1}))).await.unwrap();
        let critical = h.engine.submit(draft(Priority::Critical, json!({"n": 2}))).await.unwrap();

        let status = h.engine.queue_status().await;
        assert_eq!(status[Priority::Critical.rank() as usize].depth, 1);
        assert_eq!(status[Priority::Low.rank() as usize].depth, 1);
        assert_eq!(status[Priority::High.rank() as usize].depth, 0);

        h.engine.run_cycle(Priority::Critical).await.unwrap();
        assert_eq!(h.engine.get(&critical).await.unwrap().status, RecordStatus::Synced);
        assert_eq!(h.engine.get(&low).await.unwrap().status, RecordStatus::Pending);
    }

    #[tokio::test]
    async fn test_integrity_discard_fails_record() {
        let mut config = test_config();
        config.repair_strategy = RepairStrategy::Discard;
        let h = harness_with(config, SimulatedEndpoint::new(1)).await;

        let id = h.engine.submit(draft(Priority::High, json!({"qty": 3}))).await.unwrap();
        h.engine.store.write().await.get_mut(&id).unwrap().payload = json!({"qty": 300});

        let report = h.engine.run_cycle(Priority::High).await.unwrap();
        assert_eq!(report.failed, 1);

        let record = h.engine.get(&id).await.unwrap();
        assert_eq!(record.status, RecordStatus::Failed);
        assert!(!record.attempts[0].integrity_ok);
        assert!(h.endpoint.received().is_empty());

        let metrics = h.engine.metrics(TimeRange::all()).await;
        assert_eq!(metrics.integrity_issues, 1);
        assert_eq!(metrics.failure_count, 1);
    }

    #[tokio::test]
    async fn test_integrity_retry_requeues() {
        let h = harness().await;
        let id = h.engine.submit(draft(Priority::Critical, json!({"qty": 3}))).await.unwrap();
        h.engine.store.write().await.get_mut(&id).unwrap().payload = json!({"qty": 4});

        let report = h.engine.run_cycle(Priority::Critical).await.unwrap();
        assert_eq!(report.requeued, 1);
        let record = h.engine.get(&id).await.unwrap();
        assert_eq!(record.status, RecordStatus::Pending);
        assert_eq!(record.retry_count, 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let mut config = test_config();
        config.transmit_timeout_ms = 50;
        let endpoint = SimulatedEndpoint::new(1)
            .with_cost(Arc::new(|_, _| Duration::from_secs(5)), 1.0);
        let h = harness_with(config, endpoint).await;

        let id = h.engine.submit(draft(Priority::Critical, json!({"a": 1}))).await.unwrap();
        let report = h.engine.run_cycle(Priority::Critical).await.unwrap();
        assert_eq!(report.requeued, 1);

        let record = h.engine.get(&id).await.unwrap();
        let error = record.last_attempt().unwrap().error.clone().unwrap();
        assert!(error.contains("timed out"));
    }

    #[tokio::test]
    async fn test_going_offline_cancels_transmission() {
        let endpoint = SimulatedEndpoint::new(1)
            .with_cost(Arc::new(|_, _| Duration::from_secs(5)), 1.0);
        let h = harness_with(test_config(), endpoint).await;
        let id = h.engine.submit(draft(Priority::Critical, json!({"a": 1}))).await.unwrap();

        let engine = h.engine.clone();
        let cycle = tokio::spawn(async move { engine.run_cycle(Priority::Critical).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        h.network.set(NetworkCondition::offline());
        h.engine.sample_network().await;

        let report = cycle.await.unwrap().unwrap();
        assert_eq!(report.requeued, 1);
        let record = h.engine.get(&id).await.unwrap();
        assert_eq!(record.status, RecordStatus::Pending);
        let error = record.last_attempt().unwrap().error.clone().unwrap();
        assert!(error.contains("cancelled"));
    }

    #[tokio::test]
    async fn test_offline_cycle_is_skipped() {
        let h = harness().await;
        h.network.set(NetworkCondition::offline());
        h.engine.sample_network().await;
        h.engine.submit(draft(Priority::Critical, json!({}))).await.unwrap();

        let report = h.engine.run_cycle(Priority::Critical).await.unwrap();
        assert_eq!(report.skipped, Some(SkipReason::Offline));
    }

    #[tokio::test]
    async fn test_pause_resume_and_force_sync() {
        let h = harness().await;
        let a = h.engine.submit(draft(Priority::Medium, json!({"a": 1}))).await.unwrap();
        let b = h.engine.submit(draft(Priority::Medium, json!({"b": 2}))).await.unwrap();

        h.engine.pause_queue(Priority::Medium).await;
        let report = h.engine.run_cycle(Priority::Medium).await.unwrap();
        assert_eq!(report.skipped, Some(SkipReason::Paused));

        let forced = h.engine.force_sync(&a).await.unwrap();
        assert_eq!(forced.synced, 1);
        assert_eq!(h.engine.get(&a).await.unwrap().status, RecordStatus::Synced);
        assert!(h.engine.force_sync(&a).await.is_err());

        h.engine.resume_queue(Priority::Medium).await;
        let report = h.engine.run_cycle(Priority::Medium).await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(h.engine.get(&b).await.unwrap().status, RecordStatus::Synced);
    }

    #[tokio::test]
    async fn test_priority_floor_holds_back_lower_tiers() {
        let mut config = test_config();
        config.policies[0].actions.priority_override = Some(Priority::High);
        let h = harness_with(config, SimulatedEndpoint::new(1)).await;
        h.engine.submit(draft(Priority::Low, json!({}))).await.unwrap();
        h.engine.submit(draft(Priority::High, json!({}))).await.unwrap();

        let low = h.engine.run_cycle(Priority::Low).await.unwrap();
        assert_eq!(low.skipped, Some(SkipReason::TierHeldBack));
        let high = h.engine.run_cycle(Priority::High).await.unwrap();
        assert_eq!(high.synced, 1);
    }

    #[tokio::test]
    async fn test_capacity_rejects_submissions() {
        let mut config = test_config();
        config.max_records = 2;
        config.queues.low.max_depth = 1;
        let h = harness_with(config, SimulatedEndpoint::new(1)).await;

        h.engine.submit(draft(Priority::Low, json!({}))).await.unwrap();
        assert!(matches!(
            h.engine.submit(draft(Priority::Low, json!({}))).await,
            Err(Error::CapacityExceeded(_))
        ));
        h.engine.submit(draft(Priority::High, json!({}))).await.unwrap();
        assert!(matches!(
            h.engine.submit(draft(Priority::Critical, json!({}))).await,
            Err(Error::CapacityExceeded(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_drafts_rejected() {
        let h = harness().await;
        let mut bad_ttl = draft(Priority::Low, json!({}));
        bad_ttl.ttl = Some(ChronoDuration::zero());
        assert!(matches!(h.engine.submit(bad_ttl).await, Err(Error::InvalidInput(_))));

        let mut no_device = draft(Priority::Low, json!({}));
        no_device.device_id.clear();
        assert!(matches!(h.engine.submit(no_device).await, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_purge_removes_old_synced_records() {
        let h = harness().await;
        let synced = h.engine.submit(draft(Priority::Critical, json!({"x": 1}))).await.unwrap();
        let pending = h.engine.submit(draft(Priority::Low, json!({"x": 2}))).await.unwrap();
        h.engine.pause_queue(Priority::Low).await;
        h.engine.run_cycle(Priority::Critical).await.unwrap();

        h.clock.advance(ChronoDuration::minutes(1));
        assert_eq!(h.engine.purge(h.clock.now()).await, 1);
        assert!(matches!(h.engine.get(&synced).await, Err(Error::NotFound(_))));
        assert!(h.engine.get(&pending).await.is_ok());
    }

    #[tokio::test]
    async fn test_metrics_after_mixed_outcomes() {
        let h = harness().await;
        h.endpoint.fail_next(1);
        h.engine
            .submit(draft(Priority::Critical, json!({"a": 1})).with_max_retries(1))
            .await
            .unwrap();
        h.engine.submit(draft(Priority::Critical, json!({"b": 2}))).await.unwrap();

        let report = h.engine.run_cycle(Priority::Critical).await.unwrap();
        assert_eq!(report.attempted, 2);

        let metrics = h.engine.metrics(TimeRange::all()).await;
        assert_eq!(metrics.success_count, 1);
        assert_eq!(metrics.failure_count, 1);
        assert_eq!(metrics.total_synced, 1);
    }

    #[tokio::test]
    async fn test_restore_requeues_pending_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.json");

        let h = harness().await;
        let done = h.engine.submit(draft(Priority::Critical, json!({"a": 1}))).await.unwrap();
        let waiting = h.engine.submit(draft(Priority::Medium, json!({"b": 2}))).await.unwrap();
        h.engine.pause_queue(Priority::Medium).await;
        h.engine.run_cycle(Priority::Critical).await.unwrap();
        h.engine.save(&path).await.unwrap();

        let fresh = harness().await;
        assert_eq!(fresh.engine.restore_from(&path).await.unwrap(), 1);
        assert_eq!(fresh.engine.get(&done).await.unwrap().status, RecordStatus::Synced);

        let status = fresh.engine.queue_status().await;
        assert_eq!(status[Priority::Medium.rank() as usize].depth, 1);
        fresh.engine.run_cycle(Priority::Medium).await.unwrap();
        assert_eq!(fresh.engine.get(&waiting).await.unwrap().status, RecordStatus::Synced);
    }

    #[tokio::test]
    async fn test_policy_management() {
        let h = harness().await;
        h.engine.disable_policy("any").await.unwrap();
        h.engine.submit(draft(Priority::Critical, json!({}))).await.unwrap();
        let report = h.engine.run_cycle(Priority::Critical).await.unwrap();
        assert_eq!(report.skipped, Some(SkipReason::NoActivePolicy));

        assert!(h.engine.add_policy(SyncPolicy::permissive("any")).await.is_err());
        h.engine.add_policy(SyncPolicy::permissive("fallback")).await.unwrap();
        let report = h.engine.run_cycle(Priority::Critical).await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(h.engine.policies().await.len(), 2);
    }

    #[tokio::test]
    async fn test_data_version_conflict_merges_both_edits() {
        let h = harness().await;
        let first = h
            .engine
            .submit(draft(Priority::High, json!({"a": 1, "b": 1})).with_logical_key("doc"))
            .await
            .unwrap();
        h.engine.run_cycle(Priority::High).await.unwrap();
        let base = h.engine.get(&first).await.unwrap().synced_version.unwrap();

        // Another device changed `b` from the same base.
        h.endpoint
            .set_canonical("doc", json!({"a": 1, "b": 2}), h.clock.now() + ChronoDuration::hours(1));

        h.clock.advance(ChronoDuration::minutes(1));
        let second = h
            .engine
            .submit(
                draft(Priority::High, json!({"a": 2, "b": 1}))
                    .with_logical_key("doc")
                    .with_base_version(base),
            )
            .await
            .unwrap();
        let report = h.engine.run_cycle(Priority::High).await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(report.conflicts, 1);

        let merged = json!({"a": 2, "b": 2});
        let log = h.engine.conflict_log().await;
        assert_eq!(log[0].conflict_type, ConflictType::DataVersion);
        assert_eq!(log[0].resolution, Resolution::Merged);
        assert_eq!(log[0].resolved_payload, merged);
        assert!(log[0].overlapping_fields.is_empty());

        let record = h.engine.get(&second).await.unwrap();
        assert_eq!(record.status, RecordStatus::Synced);
        assert_eq!(record.payload, merged);
        assert_eq!(record.checksum, h.engine.integrity.checksum(&merged).unwrap());

        let canonical = h.endpoint.canonical("doc").unwrap();
        assert_eq!(canonical.payload, merged);
        assert_eq!(record.synced_version, Some(canonical.version));
    }

    #[tokio::test]
    async fn test_conflict_log_is_bounded_and_purged() {
        let mut config = test_config();
        config.conflict_log_limit = 2;
        let h = harness_with(config, SimulatedEndpoint::new(1)).await;

        let mut ids = Vec::new();
        for i in 0..3 {
            let key = format!("counter-{i}");
            h.endpoint
                .set_canonical(key.as_str(), json!({"v": "remote"}), h.clock.now() + ChronoDuration::hours(1));
            let id = h
                .engine
                .submit(draft(Priority::Critical, json!({"v": "local"})).with_logical_key(key))
                .await
                .unwrap();
            ids.push(id);
            let report = h.engine.run_cycle(Priority::Critical).await.unwrap();
            assert_eq!(report.conflicts, 1);
        }

        let log = h.engine.conflict_log().await;
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].record_id, ids[1]);
        assert_eq!(log[1].record_id, ids[2]);

        h.clock.advance(ChronoDuration::days(1));
        assert_eq!(h.engine.purge(h.clock.now()).await, 3);
        assert!(h.engine.conflict_log().await.is_empty());
    }

    #[tokio::test]
    async fn test_permanent_rejection_skips_retries() {
        let h = harness().await;
        h.endpoint.reject_next(1);
        let id = h
            .engine
            .submit(draft(Priority::Critical, json!({"amount": -1})).with_max_retries(5))
            .await
            .unwrap();

        let report = h.engine.run_cycle(Priority::Critical).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.requeued, 0);

        let record = h.engine.get(&id).await.unwrap();
        assert_eq!(record.status, RecordStatus::Failed);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.attempts.len(), 1);
        assert!(record.attempts[0].integrity_ok);
        assert!(record.attempts[0].error.as_deref().unwrap().contains("Invalid input"));

        let again = h.engine.run_cycle(Priority::Critical).await.unwrap();
        assert_eq!(again.attempted, 0);
    }

    #[tokio::test]
    async fn test_device_state_gates_sync() {
        let mut config = test_config();
        config.policies[0].conditions = PolicyConditions {
            min_battery_pct: Some(20.0),
            min_storage_pct: Some(5.0),
            ..PolicyConditions::default()
        };
        let h = harness_with(config, SimulatedEndpoint::new(1)).await;
        let id = h.engine.submit(draft(Priority::Critical, json!({"n": 1}))).await.unwrap();

        h.engine
            .set_device_state(DeviceState {
                battery_pct: 10.0,
                ..DeviceState::default()
            })
            .await;
        let report = h.engine.run_cycle(Priority::Critical).await.unwrap();
        assert_eq!(report.skipped, Some(SkipReason::NoActivePolicy));

        h.engine
            .set_device_state(DeviceState {
                storage_free_pct: 2.0,
                ..DeviceState::default()
            })
            .await;
        let report = h.engine.run_cycle(Priority::Critical).await.unwrap();
        assert_eq!(report.skipped, Some(SkipReason::NoActivePolicy));
        assert!(h.endpoint.received().is_empty());
        assert_eq!(h.engine.get(&id).await.unwrap().status, RecordStatus::Pending);

        h.engine
            .set_device_state(DeviceState {
                battery_pct: 80.0,
                ..DeviceState::default()
            })
            .await;
        let report = h.engine.run_cycle(Priority::Critical).await.unwrap();
        assert_eq!(report.synced, 1);
    }

    #[tokio::test]
    async fn test_linear_retry_waits_base_delay() {
        let mut config = test_config();
        config.policies[0].actions.retry_strategy = RetryStrategy::Linear;
        let h = harness_with(config, SimulatedEndpoint::new(1)).await;
        h.endpoint.fail_next(2);
        let id = h.engine.submit(draft(Priority::Critical, json!({"n": 1}))).await.unwrap();
        let step = ChronoDuration::milliseconds(h.engine.config().retry.base_delay_ms as i64);

        for _ in 0..2 {
            let report = h.engine.run_cycle(Priority::Critical).await.unwrap();
            assert_eq!(report.requeued, 1);
            let waiting = h.engine.run_cycle(Priority::Critical).await.unwrap();
            assert_eq!(waiting.attempted, 0);
            // Same step for every retry.
            h.clock.advance(step);
        }

        let report = h.engine.run_cycle(Priority::Critical).await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(h.engine.get(&id).await.unwrap().retry_count, 2);
    }

    #[tokio::test]
    async fn test_immediate_retry_is_ready_next_cycle() {
        let mut config = test_config();
        config.policies[0].actions.retry_strategy = RetryStrategy::Immediate;
        let h = harness_with(config, SimulatedEndpoint::new(1)).await;
        h.endpoint.fail_next(1);
        let id = h.engine.submit(draft(Priority::Critical, json!({"n": 1}))).await.unwrap();

        let first = h.engine.run_cycle(Priority::Critical).await.unwrap();
        assert_eq!(first.requeued, 1);
        let second = h.engine.run_cycle(Priority::Critical).await.unwrap();
        assert_eq!(second.synced, 1);
        assert_eq!(h.engine.get(&id).await.unwrap().attempts.len(), 2);
    }

    #[tokio::test]
    async fn test_stranded_record_is_released() {
        let h = harness().await;
        let id = h.engine.submit(draft(Priority::Critical, json!({"n": 1}))).await.unwrap();
        h.engine.queues.lock().await.get_mut(Priority::Critical).remove(&id);
        h.engine
            .store
            .write()
            .await
            .transition(&id, RecordStatus::Syncing)
            .unwrap();

        h.engine.release(&id, Priority::Critical).await;
        assert_eq!(h.engine.get(&id).await.unwrap().status, RecordStatus::Pending);
        let status = h.engine.queue_status().await;
        assert_eq!(status[Priority::Critical.rank() as usize].depth, 1);

        let report = h.engine.run_cycle(Priority::Critical).await.unwrap();
        assert_eq!(report.synced, 1);
    }

    #[tokio::test]
    async fn test_untimed_draft_uses_configured_ttl() {
        let mut config = test_config();
        config.default_ttl_ms = 60_000;
        let h = harness_with(config, SimulatedEndpoint::new(1)).await;
        let id = h
            .engine
            .submit(RecordDraft::untimed(
                RecordKind::SensorReading,
                json!({"temp": 3}),
                Priority::Low,
                "sensor-1",
            ))
            .await
            .unwrap();

        let record = h.engine.get(&id).await.unwrap();
        assert_eq!(record.expires_at, record.created_at + ChronoDuration::minutes(1));
    }
}
