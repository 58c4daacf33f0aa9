//! Offsync engine
//!
//! Offline-first synchronization for records captured while disconnected:
//! - Record store with an enforced status lifecycle and bounded audit history
//! - Four priority queues, each on its own cadence
//! - Policy-driven behaviour selected from network and device conditions
//! - Integrity checks, bandwidth optimization and conflict resolution
//! - Background scheduling with cancellation when connectivity drops

pub mod capability;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod integrity;
pub mod metrics;
pub mod network;
pub mod optimizer;
pub mod policy;
pub mod queue;
pub mod record;
pub mod remote;
pub mod retry;
pub mod scheduler;
pub mod simulation;
pub mod store;

// Re-export main types
pub use capability::{CapabilityTable, DataCost, FeatureCapability, FunctionalityLevel};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, QueueConfigs};
pub use conflict::{
    Conflict, ConflictResolution, ConflictResolver, ConflictType, RemoteVersion, Resolution,
    ResolvedBy,
};
pub use engine::{CycleReport, SkipReason, SyncEngine};
pub use integrity::{
    Blake2bDigest, Checksum, Crc32Digest, IntegrityChecker, IntegrityReport, PayloadDigest,
    RepairStrategy,
};
pub use metrics::{SyncMetrics, TimeRange};
pub use network::{ConnectionType, NetworkCondition, NetworkConditionSource, NetworkMonitor};
pub use optimizer::{BandwidthOptimizer, OptimizedPayload, Technique};
pub use policy::{
    default_policies, DeviceState, EncryptionLevel, PolicyActions, PolicyConditions,
    PolicyEngine, RetryStrategy, SyncPolicy, TimeWindow, UserActivity,
};
pub use queue::{QueueConfig, QueueSet, QueueStatus, QueueStrategy, SyncQueue};
pub use record::{OfflineRecord, RecordDraft, RecordFilter, RecordSummary, SyncAttempt};
pub use remote::{
    default_transfer_cost, RemoteEndpoint, TransferCostFn, TransmitRequest, TransmitResponse,
};
pub use retry::RetryConfig;
pub use scheduler::{SchedulerHandle, SyncScheduler};
pub use simulation::{ReceivedTransfer, SimulatedEndpoint, SimulatedNetwork, StaticNetwork};
pub use store::RecordStore;
