//! Remote sync endpoint interface.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use offsync_common::{RecordId, RecordKind, Result};

use crate::conflict::RemoteVersion;
use crate::network::NetworkCondition;
use crate::optimizer::Technique;
use crate::policy::EncryptionLevel;

/// One record put on the wire.
#[derive(Debug, Clone)]
pub struct TransmitRequest {
    pub record_id: RecordId,
    pub kind: RecordKind,
    pub logical_key: Option<String>,
    pub body: Vec<u8>,
    pub technique: Technique,
    /// Baseline version the delta body applies to.
    pub delta_base_version: Option<u64>,
    /// Remote version the local edit started from.
    pub base_version: Option<u64>,
    /// Digest of the canonical payload, for end-to-end verification.
    pub checksum: String,
    pub local_modified_at: DateTime<Utc>,
    pub encryption: EncryptionLevel,
    /// Link conditions for this transfer, after policy cap and tier share.
    pub network: NetworkCondition,
}

impl TransmitRequest {
    /// Key the remote stores the record under.
    pub fn storage_key(&self) -> String {
        self.logical_key
            .clone()
            .unwrap_or_else(|| self.record_id.to_string())
    }
}

/// Remote answer to an accepted transfer.
#[derive(Debug, Clone)]
pub struct TransmitResponse {
    /// Version the remote now holds for the key.
    pub version: u64,
    /// Present when the remote's canonical copy diverges from what was sent.
    pub remote: Option<RemoteVersion>,
}

/// Remote authority that accepts records and returns canonical versions.
///
/// Implementations handle their own authentication and wire format. Errors
/// should be `Error::Transport` for anything worth retrying.
#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    /// Endpoint name for logs.
    fn name(&self) -> &str;

    /// Send one optimized record.
    async fn transmit(&self, request: TransmitRequest) -> Result<TransmitResponse>;

    /// Overwrite the remote copy of `key` with a locally resolved payload.
    ///
    /// Returns the new remote version.
    async fn publish(
        &self,
        key: &str,
        payload: Value,
        modified_at: DateTime<Utc>,
    ) -> Result<u64>;
}

/// Models how long a transfer of `bytes` takes on a given link.
pub type TransferCostFn = Arc<dyn Fn(u64, &NetworkCondition) -> Duration + Send + Sync>;

/// Round trip latency plus serialization time, stretched by unreliability.
pub fn default_transfer_cost(bytes: u64, condition: &NetworkCondition) -> Duration {
    if !condition.online || condition.bandwidth_mbps <= 0.0 {
        return Duration::from_secs(60);
    }
    let transfer_secs = (bytes as f64 * 8.0) / (condition.bandwidth_mbps * 1_000_000.0);
    let base_secs = condition.latency_ms / 1000.0 + transfer_secs;
    let reliability = (condition.reliability / 100.0).clamp(0.01, 1.0);
    Duration::from_secs_f64(base_secs / reliability)
}
