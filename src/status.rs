//! Experiment status registry
//!
//! Read-only queries ("current realized proxy count", "per-instance
//! public-IP inventory") for an external HTTP status endpoint. The endpoint
//! itself lives outside this crate; the rejuvenation loop publishes a fresh
//! snapshot at every phase boundary.

use crate::assembler::InstanceRecord;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Experiment lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExperimentPhase {
    /// Initial fleet assembly in progress
    Provisioning,
    /// Reachability verification in progress
    Verifying,
    /// Periodic rejuvenation ticks
    Steady,
    /// Deadline reached; releasing resources
    Draining,
}

/// Public-IP inventory of one instance
#[derive(Debug, Clone, Serialize)]
pub struct InstanceInventory {
    /// Instance id
    pub instance_id: String,

    /// Instance type
    pub instance_type: String,

    /// Public addresses in binding order (default interface last)
    pub public_ips: Vec<String>,
}

/// Point-in-time view of an experiment
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    /// Current phase
    pub phase: ExperimentPhase,

    /// Realized proxy capacity
    pub proxy_count: u32,

    /// Completed rejuvenation ticks
    pub rejuvenations: u32,

    /// Per-instance address inventory
    pub inventory: Vec<InstanceInventory>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            phase: ExperimentPhase::Provisioning,
            proxy_count: 0,
            rejuvenations: 0,
            inventory: Vec::new(),
        }
    }
}

/// Shared, cheaply-clonable status handle
#[derive(Debug, Clone, Default)]
pub struct StatusRegistry {
    inner: Arc<RwLock<StatusSnapshot>>,
}

impl StatusRegistry {
    /// Fresh registry in the Provisioning phase
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a snapshot built from the current record set
    pub async fn publish(
        &self,
        phase: ExperimentPhase,
        records: &[InstanceRecord],
        rejuvenations: u32,
    ) {
        let inventory: Vec<InstanceInventory> = records
            .iter()
            .map(|record| InstanceInventory {
                instance_id: record.instance_id.clone(),
                instance_type: record.instance_type.clone(),
                public_ips: record.bindings.iter().map(|b| b.public_ip.clone()).collect(),
            })
            .collect();
        let proxy_count = records.iter().map(|r| r.bindings.len() as u32).sum();

        let mut snapshot = self.inner.write().await;
        *snapshot = StatusSnapshot {
            phase,
            proxy_count,
            rejuvenations,
            inventory,
        };
    }

    /// Current realized proxy count
    pub async fn proxy_count(&self) -> u32 {
        self.inner.read().await.proxy_count
    }

    /// Current per-instance public-IP inventory
    pub async fn inventory(&self) -> Vec<InstanceInventory> {
        self.inner.read().await.inventory.clone()
    }

    /// Full snapshot
    pub async fn snapshot(&self) -> StatusSnapshot {
        self.inner.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::{NicBinding, OptimalBaseline};

    fn record(id: &str, ips: &[&str]) -> InstanceRecord {
        InstanceRecord {
            instance_id: id.to_string(),
            instance_type: "a.type".to_string(),
            hourly_cost: 0.1,
            zone: "us-east-1a".to_string(),
            bindings: ips
                .iter()
                .map(|ip| NicBinding {
                    interface_id: "eni-00000001".to_string(),
                    allocation_id: None,
                    association_id: None,
                    public_ip: ip.to_string(),
                })
                .collect(),
            optimal: OptimalBaseline {
                cost_per_hour: 0.1,
                instance_count: 1,
                max_nics: 1,
                instance_type: "a.type".to_string(),
                zone: "us-east-1a".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_publish_and_query() {
        let registry = StatusRegistry::new();
        let records = vec![
            record("i-1", &["203.0.113.1", "203.0.113.2"]),
            record("i-2", &["203.0.113.3"]),
        ];

        registry
            .publish(ExperimentPhase::Steady, &records, 4)
            .await;

        assert_eq!(registry.proxy_count().await, 3);
        let inventory = registry.inventory().await;
        assert_eq!(inventory.len(), 2);
        assert_eq!(inventory[0].public_ips.len(), 2);

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.phase, ExperimentPhase::Steady);
        assert_eq!(snapshot.rejuvenations, 4);
    }

    #[tokio::test]
    async fn test_default_snapshot_is_empty_provisioning() {
        let registry = StatusRegistry::new();
        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.phase, ExperimentPhase::Provisioning);
        assert_eq!(snapshot.proxy_count, 0);
        assert!(snapshot.inventory.is_empty());
    }
}
