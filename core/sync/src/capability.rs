//! Offline capability declarations for client features.
//!
//! The table is consumed by the UI layer to decide what to show while the
//! device is disconnected.

use serde::{Deserialize, Serialize};

/// How much of a feature works without connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionalityLevel {
    Full,
    Limited,
    ReadOnly,
    None,
}

/// Relative amount of data a feature queues while offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCost {
    Low,
    Medium,
    High,
}

/// One row of the capability table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureCapability {
    pub feature: String,
    pub works_offline: bool,
    pub data_cost: DataCost,
    pub functionality: FunctionalityLevel,
}

impl FeatureCapability {
    fn new(
        feature: &str,
        works_offline: bool,
        data_cost: DataCost,
        functionality: FunctionalityLevel,
    ) -> Self {
        Self {
            feature: feature.to_string(),
            works_offline,
            data_cost,
            functionality,
        }
    }
}

/// Static per-feature capability table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityTable {
    entries: Vec<FeatureCapability>,
}

impl CapabilityTable {
    pub fn new(entries: Vec<FeatureCapability>) -> Self {
        Self { entries }
    }

    /// Capabilities of the stock client features.
    pub fn default_table() -> Self {
        use DataCost::*;
        use FunctionalityLevel as F;
        Self::new(vec![
            FeatureCapability::new("transactions", true, Medium, F::Full),
            FeatureCapability::new("sensor-monitoring", true, High, F::Limited),
            FeatureCapability::new("alerts", true, Low, F::Full),
            FeatureCapability::new("dashboard", true, Low, F::ReadOnly),
            FeatureCapability::new("portfolio", true, Low, F::ReadOnly),
            FeatureCapability::new("model-inference", true, Medium, F::Limited),
            FeatureCapability::new("settings", true, Low, F::Full),
            FeatureCapability::new("authentication", false, Low, F::None),
            FeatureCapability::new("market-data", false, High, F::None),
        ])
    }

    pub fn get(&self, feature: &str) -> Option<&FeatureCapability> {
        self.entries.iter().find(|e| e.feature == feature)
    }

    pub fn offline_features(&self) -> impl Iterator<Item = &FeatureCapability> {
        self.entries.iter().filter(|e| e.works_offline)
    }

    pub fn entries(&self) -> &[FeatureCapability] {
        &self.entries
    }
}

impl Default for CapabilityTable {
    fn default() -> Self {
        Self::default_table()
    }
}
