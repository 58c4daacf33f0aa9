//! Sync policies and the rule engine that picks the active one.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use offsync_common::{Error, Priority, Result};

use crate::network::{ConnectionType, NetworkCondition};

/// How failed transmissions are spaced out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Exponential,
    Linear,
    Immediate,
}

/// Requested protection level for transfers. Carried to the endpoint as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionLevel {
    None,
    Standard,
    High,
}

/// What the user is doing with the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserActivity {
    Active,
    Idle,
    Background,
}

/// Device resources reported by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub battery_pct: f64,
    pub storage_free_pct: f64,
    pub user_activity: UserActivity,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            battery_pct: 100.0,
            storage_free_pct: 100.0,
            user_activity: UserActivity::Active,
        }
    }
}

/// Hour range in UTC, `start <= hour < end`, wrapping past midnight when
/// `start > end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl TimeWindow {
    pub fn contains(&self, hour: u32) -> bool {
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// When a policy applies. Unset fields impose no restriction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyConditions {
    /// Empty means any connection type.
    #[serde(default)]
    pub network_types: Vec<ConnectionType>,
    #[serde(default)]
    pub min_battery_pct: Option<f64>,
    #[serde(default)]
    pub min_storage_pct: Option<f64>,
    #[serde(default)]
    pub time_window: Option<TimeWindow>,
    #[serde(default)]
    pub user_activity: Option<UserActivity>,
}

/// Behaviour knobs in effect while a policy is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyActions {
    /// Tiers less urgent than this one are held back.
    #[serde(default)]
    pub priority_override: Option<Priority>,
    #[serde(default)]
    pub bandwidth_limit_mbps: Option<f64>,
    pub max_concurrent: usize,
    pub retry_strategy: RetryStrategy,
    pub compress: bool,
    pub encryption: EncryptionLevel,
}

/// A named conditional rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPolicy {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub conditions: PolicyConditions,
    pub actions: PolicyActions,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

impl SyncPolicy {
    /// Policy that matches any environment.
    pub fn permissive(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            conditions: PolicyConditions::default(),
            actions: PolicyActions {
                priority_override: None,
                bandwidth_limit_mbps: None,
                max_concurrent: 4,
                retry_strategy: RetryStrategy::Exponential,
                compress: true,
                encryption: EncryptionLevel::Standard,
            },
            expires_at: None,
        }
    }

    /// Whether every condition holds.
    pub fn matches(
        &self,
        condition: &NetworkCondition,
        device: &DeviceState,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.enabled {
            return false;
        }
        if self.expires_at.is_some_and(|at| at <= now) {
            return false;
        }

        let c = &self.conditions;
        if !c.network_types.is_empty() && !c.network_types.contains(&condition.connection_type) {
            return false;
        }
        if c.min_battery_pct.is_some_and(|min| device.battery_pct < min) {
            return false;
        }
        if c.min_storage_pct.is_some_and(|min| device.storage_free_pct < min) {
            return false;
        }
        if c.user_activity.is_some_and(|a| a != device.user_activity) {
            return false;
        }
        if c.time_window.is_some_and(|w| !w.contains(now.hour())) {
            return false;
        }
        true
    }

    /// Whether a queue tier may sync under this policy.
    pub fn allows_tier(&self, tier: Priority) -> bool {
        self.actions
            .priority_override
            .map_or(true, |floor| tier.is_at_least(floor))
    }

    /// Link bandwidth after applying the policy cap.
    pub fn effective_bandwidth(&self, bandwidth_mbps: f64) -> f64 {
        match self.actions.bandwidth_limit_mbps {
            Some(limit) => bandwidth_mbps.min(limit),
            None => bandwidth_mbps,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidInput("Policy name cannot be empty".to_string()));
        }
        if self.actions.max_concurrent == 0 {
            return Err(Error::InvalidInput(format!(
                "Policy {} allows zero concurrent transfers",
                self.name
            )));
        }
        if let Some(w) = self.conditions.time_window {
            if w.start_hour > 23 || w.end_hour > 24 {
                return Err(Error::InvalidInput(format!(
                    "Policy {} has an invalid time window",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Built-in rule set: generous on fixed links, thrifty on metered ones.
pub fn default_policies() -> Vec<SyncPolicy> {
    vec![
        SyncPolicy {
            name: "fixed-link".to_string(),
            enabled: true,
            conditions: PolicyConditions {
                network_types: vec![ConnectionType::Wifi, ConnectionType::Ethernet],
                min_battery_pct: Some(15.0),
                ..Default::default()
            },
            actions: PolicyActions {
                priority_override: None,
                bandwidth_limit_mbps: None,
                max_concurrent: 4,
                retry_strategy: RetryStrategy::Exponential,
                compress: true,
                encryption: EncryptionLevel::Standard,
            },
            expires_at: None,
        },
        SyncPolicy {
            name: "cellular-saver".to_string(),
            enabled: true,
            conditions: PolicyConditions {
                network_types: vec![ConnectionType::Cellular],
                min_battery_pct: Some(25.0),
                min_storage_pct: Some(5.0),
                ..Default::default()
            },
            actions: PolicyActions {
                priority_override: Some(Priority::Medium),
                bandwidth_limit_mbps: Some(5.0),
                max_concurrent: 2,
                retry_strategy: RetryStrategy::Exponential,
                compress: true,
                encryption: EncryptionLevel::Standard,
            },
            expires_at: None,
        },
        SyncPolicy {
            name: "satellite-critical".to_string(),
            enabled: true,
            conditions: PolicyConditions {
                network_types: vec![ConnectionType::Satellite],
                min_battery_pct: Some(10.0),
                ..Default::default()
            },
            actions: PolicyActions {
                priority_override: Some(Priority::Critical),
                bandwidth_limit_mbps: Some(1.0),
                max_concurrent: 1,
                retry_strategy: RetryStrategy::Linear,
                compress: true,
                encryption: EncryptionLevel::High,
            },
            expires_at: None,
        },
    ]
}

/// Ordered rule set; the first matching policy wins.
#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
    policies: Vec<SyncPolicy>,
}

impl PolicyEngine {
    pub fn new(policies: Vec<SyncPolicy>) -> Result<Self> {
        let mut engine = Self::default();
        for policy in policies {
            engine.add_policy(policy)?;
        }
        Ok(engine)
    }

    /// First enabled, unexpired policy whose conditions hold, if any.
    pub fn active_policy(
        &self,
        condition: &NetworkCondition,
        device: &DeviceState,
        now: DateTime<Utc>,
    ) -> Option<&SyncPolicy> {
        let active = self
            .policies
            .iter()
            .find(|p| p.matches(condition, device, now));
        match active {
            Some(p) => debug!(policy = %p.name, "Active policy selected"),
            None => debug!("No sync policy matches current conditions"),
        }
        active
    }

    /// Append a policy at the lowest precedence.
    pub fn add_policy(&mut self, policy: SyncPolicy) -> Result<()> {
        policy.validate()?;
        if self.policies.iter().any(|p| p.name == policy.name) {
            return Err(Error::InvalidInput(format!(
                "Policy '{}' already exists",
                policy.name
            )));
        }
        info!(policy = %policy.name, "Policy added");
        self.policies.push(policy);
        Ok(())
    }

    /// Replace a policy in place, keeping its precedence.
    pub fn update_policy(&mut self, policy: SyncPolicy) -> Result<()> {
        policy.validate()?;
        let slot = self.find_mut(&policy.name)?;
        *slot = policy;
        Ok(())
    }

    pub fn disable_policy(&mut self, name: &str) -> Result<()> {
        self.find_mut(name)?.enabled = false;
        info!(policy = %name, "Policy disabled");
        Ok(())
    }

    pub fn enable_policy(&mut self, name: &str) -> Result<()> {
        self.find_mut(name)?.enabled = true;
        Ok(())
    }

    pub fn policies(&self) -> &[SyncPolicy] {
        &self.policies
    }

    fn find_mut(&mut self, name: &str) -> Result<&mut SyncPolicy> {
        self.policies
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| Error::NotFound(format!("Policy '{}'", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap()
    }

    fn wifi() -> NetworkCondition {
        NetworkCondition::online(ConnectionType::Wifi, 50.0, 20.0)
    }

    #[test]
    fn test_first_matching_policy_wins() {
        let engine = PolicyEngine::new(default_policies()).unwrap();
        let device = DeviceState::default();

        let active = engine.active_policy(&wifi(), &device, noon()).unwrap();
        assert_eq!(active.name, "fixed-link");

        let cell = NetworkCondition::online(ConnectionType::Cellular, 8.0, 80.0);
        let active = engine.active_policy(&cell, &device, noon()).unwrap();
        assert_eq!(active.name, "cellular-saver");
        assert!(active.allows_tier(Priority::High));
        assert!(!active.allows_tier(Priority::Low));
    }

    #[test]
    fn test_no_policy_when_resources_low() {
        let engine = PolicyEngine::new(default_policies()).unwrap();
        let device = DeviceState {
            battery_pct: 5.0,
            ..Default::default()
        };
        assert!(engine.active_policy(&wifi(), &device, noon()).is_none());
    }

    #[test]
    fn test_time_window_wraps_midnight() {
        let window = TimeWindow {
            start_hour: 22,
            end_hour: 6,
        };
        assert!(window.contains(23));
        assert!(window.contains(3));
        assert!(!window.contains(12));

        let mut policy = SyncPolicy::permissive("nightly");
        policy.conditions.time_window = Some(window);
        assert!(!policy.matches(&wifi(), &DeviceState::default(), noon()));
    }

    #[test]
    fn test_expired_and_disabled_policies_are_skipped() {
        let mut expired = SyncPolicy::permissive("expired");
        expired.expires_at = Some(noon() - chrono::Duration::hours(1));
        let mut engine = PolicyEngine::new(vec![expired, SyncPolicy::permissive("fallback")]).unwrap();

        let device = DeviceState::default();
        assert_eq!(engine.active_policy(&wifi(), &device, noon()).unwrap().name, "fallback");

        engine.disable_policy("fallback").unwrap();
        assert!(engine.active_policy(&wifi(), &device, noon()).is_none());

        engine.enable_policy("fallback").unwrap();
        assert!(engine.active_policy(&wifi(), &device, noon()).is_some());
    }

    #[test]
    fn test_user_activity_condition() {
        let mut policy = SyncPolicy::permissive("idle-only");
        policy.conditions.user_activity = Some(UserActivity::Idle);
        assert!(!policy.matches(&wifi(), &DeviceState::default(), noon()));

        let idle = DeviceState {
            user_activity: UserActivity::Idle,
            ..Default::default()
        };
        assert!(policy.matches(&wifi(), &idle, noon()));
    }

    #[test]
    fn test_add_update_validation() {
        let mut engine = PolicyEngine::default();
        engine.add_policy(SyncPolicy::permissive("a")).unwrap();
        assert!(engine.add_policy(SyncPolicy::permissive("a")).is_err());

        let mut updated = SyncPolicy::permissive("a");
        updated.actions.max_concurrent = 9;
        engine.update_policy(updated).unwrap();
        assert_eq!(engine.policies()[0].actions.max_concurrent, 9);

        let mut broken = SyncPolicy::permissive("a");
        broken.actions.max_concurrent = 0;
        assert!(engine.update_policy(broken).is_err());
        assert!(engine.disable_policy("missing").is_err());
    }

    #[test]
    fn test_policy_json_shape() {
        let json = r#"{
            "name": "metered",
            "conditions": {"network_types": ["cellular"], "min_battery_pct": 30.0},
            "actions": {
                "bandwidth_limit_mbps": 2.0,
                "max_concurrent": 1,
                "retry_strategy": "linear",
                "compress": true,
                "encryption": "high"
            }
        }"#;
        let policy: SyncPolicy = serde_json::from_str(json).unwrap();
        assert!(policy.enabled);
        assert_eq!(policy.actions.retry_strategy, RetryStrategy::Linear);
        assert_eq!(policy.conditions.network_types, vec![ConnectionType::Cellular]);
    }
}
