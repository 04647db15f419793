//! Experiment configuration
//!
//! Loaded from a JSON file, overridable from the CLI. One config describes
//! one experiment; concurrently-running experiments each get their own
//! (cloned) copy and share nothing mutable.

use crate::assembler::AcquisitionMode;
use crate::catalog::PriceFilter;
use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

fn default_region() -> String {
    crate::gateway::DEFAULT_REGION.to_string()
}

fn default_architecture() -> String {
    "x86_64".to_string()
}

fn default_wait_after_create() -> u64 {
    30
}

fn default_wait_after_nic() -> u64 {
    15
}

/// Configuration for one rejuvenation experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Label used in resource tags and logs
    pub experiment_name: String,

    /// Replacement strategy
    pub mode: AcquisitionMode,

    /// Seconds between rejuvenation ticks
    pub rejuvenation_period_secs: u64,

    /// Total experiment duration in minutes
    pub experiment_duration_min: u64,

    /// Target proxy capacity (>= 1)
    pub proxy_count: u32,

    /// Price band / region predicate applied to the catalog
    #[serde(default)]
    pub price_filter: PriceFilter,

    /// AWS region the experiment runs in
    #[serde(default = "default_region")]
    pub region: String,

    /// Launch template instances are materialized from
    pub launch_template: String,

    /// CPU architecture the launch template targets
    #[serde(default = "default_architecture")]
    pub required_architecture: String,

    /// Settle seconds between fleet creation and resolution
    #[serde(default = "default_wait_after_create")]
    pub wait_time_after_create_secs: u64,

    /// Settle seconds after attaching extra interfaces
    #[serde(default = "default_wait_after_nic")]
    pub wait_time_after_nic_secs: u64,

    /// Select the cost-model variant that charges the ephemeral address and
    /// per-rotation remappings. Externally supplied, never inferred.
    #[serde(default)]
    pub ephemeral_charge: bool,
}

impl ExperimentConfig {
    /// Load and validate a config from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants the rest of the system assumes
    pub fn validate(&self) -> Result<()> {
        if self.proxy_count == 0 {
            return Err(ProxyError::config("proxy_count must be >= 1"));
        }
        if self.experiment_duration_min == 0 {
            return Err(ProxyError::config("experiment_duration_min must be >= 1"));
        }
        if self.rejuvenation_period_secs == 0 {
            return Err(ProxyError::config("rejuvenation_period_secs must be >= 1"));
        }
        if self.launch_template.is_empty() {
            return Err(ProxyError::config("launch_template is required"));
        }
        if let (Some(min), Some(max)) = (self.price_filter.min_cost, self.price_filter.max_cost) {
            if min > max {
                return Err(ProxyError::config("price_filter min_cost exceeds max_cost"));
            }
        }
        Ok(())
    }

    /// Rejuvenation period as a duration
    pub fn rejuvenation_period(&self) -> Duration {
        Duration::from_secs(self.rejuvenation_period_secs)
    }

    /// Experiment duration as a duration
    pub fn experiment_duration(&self) -> Duration {
        Duration::from_secs(self.experiment_duration_min * 60)
    }

    /// Settle interval after fleet creation
    pub fn wait_after_create(&self) -> Duration {
        Duration::from_secs(self.wait_time_after_create_secs)
    }

    /// Settle interval after interface attachment
    pub fn wait_after_nic(&self) -> Duration {
        Duration::from_secs(self.wait_time_after_nic_secs)
    }
}
