//! Connectivity sampling.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Physical link type reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Wifi,
    Cellular,
    Satellite,
    Ethernet,
    Unknown,
}

/// Snapshot of network quality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkCondition {
    pub online: bool,
    pub connection_type: ConnectionType,
    pub bandwidth_mbps: f64,
    pub latency_ms: f64,
    /// 0-100 score.
    pub reliability: f64,
    /// 0-100 score.
    pub signal_strength: f64,
    /// Estimated cost per megabyte transferred.
    pub cost_per_mb: f64,
}

impl NetworkCondition {
    /// Conservative default used before the first sample.
    pub fn offline() -> Self {
        Self {
            online: false,
            connection_type: ConnectionType::Unknown,
            bandwidth_mbps: 0.0,
            latency_ms: 0.0,
            reliability: 0.0,
            signal_strength: 0.0,
            cost_per_mb: 0.0,
        }
    }

    pub fn online(connection_type: ConnectionType, bandwidth_mbps: f64, latency_ms: f64) -> Self {
        Self {
            online: true,
            connection_type,
            bandwidth_mbps,
            latency_ms,
            reliability: 95.0,
            signal_strength: 80.0,
            cost_per_mb: 0.0,
        }
    }

    pub fn with_reliability(mut self, reliability: f64) -> Self {
        self.reliability = reliability;
        self
    }

    pub fn with_cost_per_mb(mut self, cost: f64) -> Self {
        self.cost_per_mb = cost;
        self
    }

    /// Bound every field to a realistic range.
    pub fn clamped(mut self) -> Self {
        if !self.online {
            return Self {
                connection_type: self.connection_type,
                ..Self::offline()
            };
        }
        self.bandwidth_mbps = finite_or(self.bandwidth_mbps, 0.0).clamp(0.0, 10_000.0);
        self.latency_ms = finite_or(self.latency_ms, 0.0).clamp(1.0, 10_000.0);
        self.reliability = finite_or(self.reliability, 50.0).clamp(50.0, 100.0);
        self.signal_strength = finite_or(self.signal_strength, 0.0).clamp(0.0, 100.0);
        self.cost_per_mb = finite_or(self.cost_per_mb, 0.0).max(0.0);
        self
    }
}

impl Default for NetworkCondition {
    fn default() -> Self {
        Self::offline()
    }
}

fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

/// Reports raw connectivity from the platform.
#[async_trait]
pub trait NetworkConditionSource: Send + Sync {
    async fn probe(&self) -> NetworkCondition;
}

/// Holds the latest network snapshot.
///
/// Only the scheduler's sampling loop (or an explicit engine call) takes new
/// samples; everything else reads [`NetworkMonitor::current`].
pub struct NetworkMonitor {
    source: Arc<dyn NetworkConditionSource>,
    latest: watch::Sender<NetworkCondition>,
}

impl NetworkMonitor {
    pub fn new(source: Arc<dyn NetworkConditionSource>) -> Self {
        let (latest, _) = watch::channel(NetworkCondition::offline());
        Self { source, latest }
    }

    /// Probe the source and publish a clamped snapshot.
    pub async fn sample(&self) -> NetworkCondition {
        let condition = self.source.probe().await.clamped();
        debug!(
            online = condition.online,
            bandwidth = condition.bandwidth_mbps,
            reliability = condition.reliability,
            "Network sampled"
        );
        self.latest.send_replace(condition.clone());
        condition
    }

    /// Latest snapshot, offline before the first sample.
    pub fn current(&self) -> NetworkCondition {
        self.latest.borrow().clone()
    }

    /// Receiver notified on every new sample.
    pub fn subscribe(&self) -> watch::Receiver<NetworkCondition> {
        self.latest.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::StaticNetwork;

    #[tokio::test]
    async fn test_current_is_offline_before_first_sample() {
        let source = Arc::new(StaticNetwork::new(NetworkCondition::online(
            ConnectionType::Wifi,
            50.0,
            20.0,
        )));
        let monitor = NetworkMonitor::new(source);
        let current = monitor.current();
        assert!(!current.online);
        assert_eq!(current.connection_type, ConnectionType::Unknown);

        monitor.sample().await;
        assert!(monitor.current().online);
    }

    #[tokio::test]
    async fn test_sample_clamps_reliability() {
        let source = Arc::new(StaticNetwork::new(
            NetworkCondition::online(ConnectionType::Cellular, 4.0, 120.0).with_reliability(12.0),
        ));
        let monitor = NetworkMonitor::new(source.clone());
        assert_eq!(monitor.sample().await.reliability, 50.0);

        source.set(NetworkCondition::online(ConnectionType::Cellular, 4.0, 120.0).with_reliability(140.0));
        assert_eq!(monitor.sample().await.reliability, 100.0);
    }

    #[tokio::test]
    async fn test_subscribers_see_new_samples() {
        let source = Arc::new(StaticNetwork::new(NetworkCondition::online(
            ConnectionType::Ethernet,
            900.0,
            2.0,
        )));
        let monitor = NetworkMonitor::new(source.clone());
        let mut rx = monitor.subscribe();
        monitor.sample().await;
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().online);

        source.set(NetworkCondition::offline());
        monitor.sample().await;
        assert!(!rx.borrow_and_update().online);
    }
}
