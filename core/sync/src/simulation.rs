//! Deterministic stand-ins for the network and the remote endpoint.
//!
//! All randomness lives here and is seeded, so runs are reproducible.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use offsync_common::{Error, RecordId, Result};

use crate::conflict::RemoteVersion;
use crate::network::{ConnectionType, NetworkCondition, NetworkConditionSource};
use crate::optimizer::{decode, Technique};
use crate::remote::{default_transfer_cost, RemoteEndpoint, TransferCostFn, TransmitRequest, TransmitResponse};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Network source reporting whatever it was last told.
#[derive(Debug)]
pub struct StaticNetwork {
    condition: Mutex<NetworkCondition>,
}

impl StaticNetwork {
    pub fn new(condition: NetworkCondition) -> Self {
        Self {
            condition: Mutex::new(condition),
        }
    }

    pub fn set(&self, condition: NetworkCondition) {
        *lock(&self.condition) = condition;
    }
}

#[async_trait]
impl NetworkConditionSource for StaticNetwork {
    async fn probe(&self) -> NetworkCondition {
        lock(&self.condition).clone()
    }
}

/// Seeded random walk around a starting condition with occasional dropouts.
pub struct SimulatedNetwork {
    state: Mutex<(StdRng, NetworkCondition)>,
    baseline: NetworkCondition,
    dropout_rate: f64,
}

impl SimulatedNetwork {
    pub fn new(seed: u64, baseline: NetworkCondition, dropout_rate: f64) -> Self {
        Self {
            state: Mutex::new((StdRng::seed_from_u64(seed), baseline.clone())),
            baseline,
            dropout_rate: dropout_rate.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl NetworkConditionSource for SimulatedNetwork {
    async fn probe(&self) -> NetworkCondition {
        let mut guard = lock(&self.state);
        let (rng, last) = &mut *guard;

        if rng.gen::<f64>() < self.dropout_rate {
            return NetworkCondition {
                connection_type: self.baseline.connection_type,
                ..NetworkCondition::offline()
            };
        }

        let mut next = if last.online {
            last.clone()
        } else {
            self.baseline.clone()
        };
        next.bandwidth_mbps = (next.bandwidth_mbps * (1.0 + rng.gen_range(-0.2..0.2)))
            .clamp(self.baseline.bandwidth_mbps * 0.1, self.baseline.bandwidth_mbps * 3.0);
        next.latency_ms = (next.latency_ms * (1.0 + rng.gen_range(-0.2..0.2)))
            .clamp(1.0, self.baseline.latency_ms.max(1.0) * 5.0);
        next.reliability = (next.reliability + rng.gen_range(-5.0..5.0)).clamp(50.0, 100.0);
        next.signal_strength = (next.signal_strength + rng.gen_range(-5.0..5.0)).clamp(0.0, 100.0);
        *last = next.clone();
        next
    }
}

/// What the simulated endpoint received.
#[derive(Debug, Clone)]
pub struct ReceivedTransfer {
    pub record_id: RecordId,
    pub key: String,
    pub technique: Technique,
    pub bytes: u64,
    pub payload: Value,
}

struct EndpointState {
    rng: StdRng,
    canonical: HashMap<String, RemoteVersion>,
    next_version: u64,
    scripted_failures: u32,
    scripted_rejections: u32,
    received: Vec<ReceivedTransfer>,
}

/// In-memory remote authority with configurable latency and failures.
pub struct SimulatedEndpoint {
    state: Mutex<EndpointState>,
    failure_rate: f64,
    cost: TransferCostFn,
    time_scale: f64,
}

impl SimulatedEndpoint {
    /// An endpoint that never fails and answers instantly.
    pub fn new(seed: u64) -> Self {
        Self {
            state: Mutex::new(EndpointState {
                rng: StdRng::seed_from_u64(seed),
                canonical: HashMap::new(),
                next_version: 1,
                scripted_failures: 0,
                scripted_rejections: 0,
                received: Vec::new(),
            }),
            failure_rate: 0.0,
            cost: Arc::new(default_transfer_cost),
            time_scale: 0.0,
        }
    }

    /// Fail this share of transfers at random.
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Sleep for `cost(bytes, network) * time_scale` on each transfer.
    pub fn with_cost(mut self, cost: TransferCostFn, time_scale: f64) -> Self {
        self.cost = cost;
        self.time_scale = time_scale.max(0.0);
        self
    }

    /// Fail the next `n` transfers regardless of the failure rate.
    pub fn fail_next(&self, n: u32) {
        lock(&self.state).scripted_failures += n;
    }

    /// Reject the next `n` transfers as invalid, a failure retrying cannot fix.
    pub fn reject_next(&self, n: u32) {
        lock(&self.state).scripted_rejections += n;
    }

    /// Seed the remote copy of a key, as if another device wrote it.
    pub fn set_canonical(&self, key: impl Into<String>, payload: Value, modified_at: DateTime<Utc>) -> u64 {
        let mut state = lock(&self.state);
        let version = state.next_version;
        state.next_version += 1;
        state.canonical.insert(
            key.into(),
            RemoteVersion {
                payload,
                modified_at,
                version,
                rule_violation: None,
            },
        );
        version
    }

    pub fn canonical(&self, key: &str) -> Option<RemoteVersion> {
        lock(&self.state).canonical.get(key).cloned()
    }

    pub fn received(&self) -> Vec<ReceivedTransfer> {
        lock(&self.state).received.clone()
    }

    fn transfer_delay(&self, bytes: u64, network: &NetworkCondition) -> Duration {
        if self.time_scale == 0.0 {
            return Duration::ZERO;
        }
        (self.cost)(bytes, network).mul_f64(self.time_scale)
    }
}

#[async_trait]
impl RemoteEndpoint for SimulatedEndpoint {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn transmit(&self, request: TransmitRequest) -> Result<TransmitResponse> {
        let delay = self.transfer_delay(request.body.len() as u64, &request.network);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        if state.scripted_failures > 0 {
            state.scripted_failures -= 1;
            return Err(Error::Transport("Simulated connection reset".to_string()));
        }
        if state.scripted_rejections > 0 {
            state.scripted_rejections -= 1;
            return Err(Error::InvalidInput(format!(
                "Simulated rejection of {}",
                request.record_id
            )));
        }
        if self.failure_rate > 0.0 && state.rng.gen::<f64>() < self.failure_rate {
            return Err(Error::Transport("Simulated packet loss".to_string()));
        }

        let key = request.storage_key();
        let existing = state.canonical.get(&key).cloned();

        let baseline = match (request.delta_base_version, &existing) {
            (Some(base), Some(current)) if current.version == base => Some(&current.payload),
            // Stale base: hand back the current copy so the sender can reconcile.
            (Some(_), Some(current)) => {
                return Ok(TransmitResponse {
                    version: current.version,
                    remote: Some(current.clone()),
                });
            }
            (Some(base), None) => {
                return Err(Error::Transport(format!(
                    "Delta base version {} unknown for {}",
                    base, key
                )));
            }
            (None, _) => None,
        };
        let payload = decode(&request.body, request.technique, baseline)?;

        state.received.push(ReceivedTransfer {
            record_id: request.record_id.clone(),
            key: key.clone(),
            technique: request.technique,
            bytes: request.body.len() as u64,
            payload: payload.clone(),
        });

        if let Some(current) = existing {
            let based_on_current = request.base_version == Some(current.version)
                || request.delta_base_version == Some(current.version);
            if current.payload != payload && !based_on_current {
                return Ok(TransmitResponse {
                    version: current.version,
                    remote: Some(current),
                });
            }
        }

        let version = state.next_version;
        state.next_version += 1;
        state.canonical.insert(
            key,
            RemoteVersion {
                payload,
                modified_at: request.local_modified_at,
                version,
                rule_violation: None,
            },
        );
        Ok(TransmitResponse {
            version,
            remote: None,
        })
    }

    async fn publish(&self, key: &str, payload: Value, modified_at: DateTime<Utc>) -> Result<u64> {
        let mut state = lock(&self.state);
        let version = state.next_version;
        state.next_version += 1;
        state.canonical.insert(
            key.to_string(),
            RemoteVersion {
                payload,
                modified_at,
                version,
                rule_violation: None,
            },
        );
        Ok(version)
    }
}

/// Stock simulated link for a connection type.
pub fn typical_condition(connection_type: ConnectionType) -> NetworkCondition {
    match connection_type {
        ConnectionType::Ethernet => NetworkCondition::online(connection_type, 500.0, 5.0),
        ConnectionType::Wifi => NetworkCondition::online(connection_type, 60.0, 25.0),
        ConnectionType::Cellular => {
            NetworkCondition::online(connection_type, 8.0, 90.0).with_cost_per_mb(0.01)
        }
        ConnectionType::Satellite => NetworkCondition::online(connection_type, 1.0, 650.0)
            .with_reliability(75.0)
            .with_cost_per_mb(0.5),
        ConnectionType::Unknown => NetworkCondition::offline(),
    }
}
