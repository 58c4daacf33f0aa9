//! Adaptive size reduction of payloads before transmission.
//!
//! The optimizer only produces a transmitted representation; the record's
//! canonical payload in the store is never touched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use offsync_common::{Error, Result};

use crate::network::NetworkCondition;
use crate::policy::SyncPolicy;
use crate::record::{payload_bytes, OfflineRecord};

/// zstd level used on healthy links.
const FAST_LEVEL: i32 = 3;
/// zstd level used below the low-bandwidth threshold.
const DENSE_LEVEL: i32 = 15;

/// How the transmitted body was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Technique {
    Uncompressed,
    Compressed,
    DeltaEncoded,
    DeltaCompressed,
}

impl Technique {
    pub fn uses_delta(self) -> bool {
        matches!(self, Technique::DeltaEncoded | Technique::DeltaCompressed)
    }

    pub fn uses_compression(self) -> bool {
        matches!(self, Technique::Compressed | Technique::DeltaCompressed)
    }
}

/// Transmitted representation of a record.
#[derive(Debug, Clone)]
pub struct OptimizedPayload {
    pub body: Vec<u8>,
    pub original_size: u64,
    pub transmitted_size: u64,
    pub technique: Technique,
    /// Percentage of bytes saved, 0-100.
    pub effectiveness: f64,
    /// Remote version the delta was computed against.
    pub delta_base_version: Option<u64>,
}

/// Last-synced version of a logical key, used as delta baseline.
#[derive(Debug, Clone)]
struct Baseline {
    version: u64,
    payload: Value,
}

/// Chooses compression and delta encoding from policy and network state.
#[derive(Debug)]
pub struct BandwidthOptimizer {
    low_bandwidth_mbps: f64,
    delta_min_bytes: u64,
    baselines: Mutex<HashMap<String, Baseline>>,
}

impl BandwidthOptimizer {
    pub fn new(low_bandwidth_mbps: f64, delta_min_bytes: u64) -> Self {
        Self {
            low_bandwidth_mbps,
            delta_min_bytes,
            baselines: Mutex::new(HashMap::new()),
        }
    }

    pub fn low_bandwidth_mbps(&self) -> f64 {
        self.low_bandwidth_mbps
    }

    /// Remember what the remote holds for a logical key after a successful sync.
    pub fn record_baseline(&self, key: impl Into<String>, version: u64, payload: Value) {
        self.lock_baselines()
            .insert(key.into(), Baseline { version, payload });
    }

    /// Version of the baseline held for a logical key.
    pub fn baseline_version(&self, key: &str) -> Option<u64> {
        self.lock_baselines().get(key).map(|b| b.version)
    }

    /// Payload held for a logical key, if it is still at `version`.
    pub fn baseline_payload(&self, key: &str, version: u64) -> Option<Value> {
        self.lock_baselines()
            .get(key)
            .filter(|b| b.version == version)
            .map(|b| b.payload.clone())
    }

    /// Produce the body to put on the wire.
    ///
    /// Delta encoding needs a baseline from an earlier successful sync under
    /// the record's logical key, so the first version of a key is at best
    /// compressed even on a slow link.
    pub fn optimize(
        &self,
        record: &OfflineRecord,
        policy: &SyncPolicy,
        condition: &NetworkCondition,
    ) -> Result<OptimizedPayload> {
        let raw = payload_bytes(&record.payload)?;
        let original_size = raw.len() as u64;

        let bandwidth = policy.effective_bandwidth(condition.bandwidth_mbps);
        let low_bandwidth = bandwidth < self.low_bandwidth_mbps;

        let mut body = raw;
        let mut delta_base_version = None;

        if low_bandwidth && original_size >= self.delta_min_bytes {
            if let Some(key) = record.logical_key.as_deref() {
                let baseline = self.lock_baselines().get(key).cloned();
                if let Some(baseline) = baseline {
                    if let Some(delta) = encode_delta(&baseline.payload, &record.payload) {
                        let encoded = serde_json::to_vec(&delta)?;
                        if encoded.len() < body.len() {
                            body = encoded;
                            delta_base_version = Some(baseline.version);
                        }
                    }
                }
            }
        }

        let mut compressed = false;
        if policy.actions.compress {
            let level = if low_bandwidth { DENSE_LEVEL } else { FAST_LEVEL };
            let packed = zstd::stream::encode_all(&body[..], level)
                .map_err(|e| Error::Compression(e.to_string()))?;
            if packed.len() < body.len() {
                body = packed;
                compressed = true;
            }
        }

        let technique = match (delta_base_version.is_some(), compressed) {
            (true, true) => Technique::DeltaCompressed,
            (true, false) => Technique::DeltaEncoded,
            (false, true) => Technique::Compressed,
            (false, false) => Technique::Uncompressed,
        };

        let transmitted_size = body.len() as u64;
        let effectiveness = if original_size == 0 {
            0.0
        } else {
            ((1.0 - transmitted_size as f64 / original_size as f64) * 100.0).clamp(0.0, 100.0)
        };

        debug!(
            record = %record.id,
            ?technique,
            original_size,
            transmitted_size,
            "Payload optimized"
        );

        Ok(OptimizedPayload {
            body,
            original_size,
            transmitted_size,
            technique,
            effectiveness,
            delta_base_version,
        })
    }

    fn lock_baselines(&self) -> std::sync::MutexGuard<'_, HashMap<String, Baseline>> {
        self.baselines.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Field-level delta between two JSON objects.
///
/// Returns `None` when either side is not an object.
pub fn encode_delta(base: &Value, target: &Value) -> Option<Value> {
    let (base, target) = (base.as_object()?, target.as_object()?);

    let mut set = Map::new();
    for (key, value) in target {
        if base.get(key) != Some(value) {
            set.insert(key.clone(), value.clone());
        }
    }
    let unset: Vec<Value> = base
        .keys()
        .filter(|k| !target.contains_key(*k))
        .map(|k| Value::String(k.clone()))
        .collect();

    let mut delta = Map::new();
    delta.insert("set".to_string(), Value::Object(set));
    delta.insert("unset".to_string(), Value::Array(unset));
    Some(Value::Object(delta))
}

/// Apply a delta produced by [`encode_delta`].
pub fn apply_delta(base: &Value, delta: &Value) -> Result<Value> {
    let mut out = base
        .as_object()
        .cloned()
        .ok_or_else(|| Error::Compression("Delta base is not an object".to_string()))?;

    if let Some(unset) = delta.get("unset").and_then(Value::as_array) {
        for key in unset.iter().filter_map(Value::as_str) {
            out.remove(key);
        }
    }
    let set = delta
        .get("set")
        .and_then(Value::as_object)
        .ok_or_else(|| Error::Compression("Delta has no set section".to_string()))?;
    for (key, value) in set {
        out.insert(key.clone(), value.clone());
    }
    Ok(Value::Object(out))
}

/// Reverse an optimized body back into the canonical payload.
///
/// `baseline` must be the payload the delta was computed against when the
/// technique uses delta encoding.
pub fn decode(body: &[u8], technique: Technique, baseline: Option<&Value>) -> Result<Value> {
    let plain = if technique.uses_compression() {
        zstd::stream::decode_all(body).map_err(|e| Error::Compression(e.to_string()))?
    } else {
        body.to_vec()
    };
    let value: Value = serde_json::from_slice(&plain)?;

    if technique.uses_delta() {
        let base = baseline
            .ok_or_else(|| Error::Compression("Delta body without baseline".to_string()))?;
        apply_delta(base, &value)
    } else {
        Ok(value)
    }
}
