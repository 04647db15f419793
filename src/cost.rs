//! Cost model
//!
//! Pure functions converting a realized allocation, a rejuvenation cadence,
//! and an experiment duration into accrued cost, a theoretical-optimum
//! baseline, and a straight-line monthly projection. No provider calls are
//! made here; instance prices are the snapshots taken at assembly time.
//!
//! Charge components:
//! - instance time, at per-minute granularity (`hourly / 60 * minutes`)
//! - elastic address holding, at `0.005` USD per address-hour
//! - optional per-rotation remapping surcharge (`0.1 * 2` USD per address
//!   per rotation, deallocate and allocate billed as distinct remappings),
//!   applied only under the "ephemeral charge" cost-model variant

use crate::assembler::{InstanceRecord, OptimalBaseline};
use crate::catalog::EIP_HOURLY_RATE;
use crate::error::{ProxyError, Result};
use serde::Serialize;

/// Remapping charge for one deallocate or allocate operation (USD)
const REMAP_OPERATION_RATE: f64 = 0.1;

/// Accrued and projected cost for one strategy
#[derive(Debug, Clone, Serialize)]
pub struct CostReport {
    /// Cost accrued over the experiment duration
    pub accrued: f64,

    /// Cost a perfectly-available cheapest tier would have accrued
    pub optimal: f64,

    /// Straight-line projection of `accrued` to 30 days
    pub monthly: f64,

    /// Straight-line projection of `optimal` to 30 days
    pub optimal_monthly: f64,
}

/// Accrued cost of a live-IP run.
///
/// Per instance: instance time plus address holding for every bound NIC at
/// hour granularity per rejuvenation (`ceil(rejuvenation_period / 3600)`
/// hours each), plus the remapping surcharge when `ephemeral_charge` is on.
pub fn live_ip_cost(
    records: &[InstanceRecord],
    rejuvenation_period_secs: u64,
    duration_minutes: f64,
    rejuvenations: u32,
    ephemeral_charge: bool,
) -> f64 {
    let hours_per_rejuvenation = rejuvenation_period_secs.div_ceil(3600) as f64;

    records
        .iter()
        .map(|record| {
            let nic_count = record.bindings.len() as f64;
            let instance_cost = record.hourly_cost / 60.0 * duration_minutes;
            let nic_cost =
                EIP_HOURLY_RATE * nic_count * rejuvenations as f64 * hours_per_rejuvenation;
            let remap_cost = if ephemeral_charge {
                // Deallocate and allocate are distinct remap operations
                REMAP_OPERATION_RATE * 2.0 * nic_count * rejuvenations as f64
            } else {
                0.0
            };
            instance_cost + nic_cost + remap_cost
        })
        .sum()
}

/// Cost the cheapest first-picked tier would have incurred for the entire
/// original target, statically held for the whole run. No rotation charge.
pub fn live_ip_optimal(baseline: &OptimalBaseline, duration_minutes: f64) -> f64 {
    let count = baseline.instance_count as f64;
    let instance_cost = count * baseline.cost_per_hour / 60.0 * duration_minutes;
    let nic_cost =
        EIP_HOURLY_RATE * baseline.max_nics as f64 * count * (duration_minutes / 60.0).ceil();
    instance_cost + nic_cost
}

/// Accrued cost of an instance-rejuvenation run over every generation.
///
/// Each generation is assumed to have run for an equal share of the
/// duration. `rejuvenation_count` of zero is a precondition violation:
/// provisioning always completes before cost is computed.
pub fn instance_cost(
    generations: &[InstanceRecord],
    duration_minutes: f64,
    rejuvenation_count: u32,
    address_hold_charge: bool,
) -> Result<f64> {
    if rejuvenation_count == 0 {
        return Err(ProxyError::InvalidCostInput(
            "rejuvenation count is zero; provisioning must complete before cost".to_string(),
        ));
    }
    let share = duration_minutes / rejuvenation_count as f64;

    Ok(generations
        .iter()
        .map(|record| {
            let instance_cost = record.hourly_cost / 60.0 * share;
            let address_cost = if address_hold_charge {
                EIP_HOURLY_RATE / 60.0 * share
            } else {
                0.0
            };
            instance_cost + address_cost
        })
        .sum())
}

/// Optimal baseline for an instance-rejuvenation run: every generation
/// instance priced at the first-picked tier's rate
pub fn instance_optimal(
    generations: &[InstanceRecord],
    duration_minutes: f64,
    rejuvenation_count: u32,
    address_hold_charge: bool,
) -> Result<f64> {
    if rejuvenation_count == 0 {
        return Err(ProxyError::InvalidCostInput(
            "rejuvenation count is zero; provisioning must complete before cost".to_string(),
        ));
    }
    let share = duration_minutes / rejuvenation_count as f64;

    Ok(generations
        .iter()
        .map(|record| {
            let instance_cost = record.optimal.cost_per_hour / 60.0 * share;
            let address_cost = if address_hold_charge {
                EIP_HOURLY_RATE / 60.0 * share
            } else {
                0.0
            };
            instance_cost + address_cost
        })
        .sum())
}

/// Straight-line extrapolation of an accrued cost to 30 days.
/// Not calendar-aware.
pub fn monthly_projection(accrued: f64, duration_minutes: f64) -> Result<f64> {
    if duration_minutes <= 0.0 {
        return Err(ProxyError::InvalidCostInput(
            "experiment duration must be positive".to_string(),
        ));
    }
    Ok(accrued / duration_minutes * 60.0 * 24.0 * 30.0)
}

/// Compose the full report for a live-IP run
pub fn live_ip_report(
    records: &[InstanceRecord],
    baseline: &OptimalBaseline,
    rejuvenation_period_secs: u64,
    duration_minutes: f64,
    rejuvenations: u32,
    ephemeral_charge: bool,
) -> Result<CostReport> {
    let accrued = live_ip_cost(
        records,
        rejuvenation_period_secs,
        duration_minutes,
        rejuvenations,
        ephemeral_charge,
    );
    let optimal = live_ip_optimal(baseline, duration_minutes);
    Ok(CostReport {
        accrued,
        optimal,
        monthly: monthly_projection(accrued, duration_minutes)?,
        optimal_monthly: monthly_projection(optimal, duration_minutes)?,
    })
}

/// Compose the full report for an instance-rejuvenation run
pub fn instance_report(
    generations: &[InstanceRecord],
    duration_minutes: f64,
    rejuvenation_count: u32,
    address_hold_charge: bool,
) -> Result<CostReport> {
    let accrued = instance_cost(
        generations,
        duration_minutes,
        rejuvenation_count,
        address_hold_charge,
    )?;
    let optimal = instance_optimal(
        generations,
        duration_minutes,
        rejuvenation_count,
        address_hold_charge,
    )?;
    Ok(CostReport {
        accrued,
        optimal,
        monthly: monthly_projection(accrued, duration_minutes)?,
        optimal_monthly: monthly_projection(optimal, duration_minutes)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::NicBinding;

    fn binding(n: u32) -> NicBinding {
        NicBinding {
            interface_id: format!("eni-{n:08}"),
            allocation_id: Some(format!("eipalloc-{n:08}")),
            association_id: Some(format!("eipassoc-{n:08}")),
            public_ip: format!("203.0.113.{n}"),
        }
    }

    fn record(hourly: f64, nics: u32) -> InstanceRecord {
        InstanceRecord {
            instance_id: "i-00000001".to_string(),
            instance_type: "a.type".to_string(),
            hourly_cost: hourly,
            zone: "us-east-1a".to_string(),
            bindings: (0..nics).map(binding).collect(),
            optimal: OptimalBaseline {
                cost_per_hour: hourly,
                instance_count: 1,
                max_nics: nics,
                instance_type: "a.type".to_string(),
                zone: "us-east-1a".to_string(),
            },
        }
    }

    #[test]
    fn test_single_nic_accrued_one_generation() {
        // 0.24/hr over 60 minutes, one generation -> exactly 0.24
        let generations = vec![record(0.24, 1)];
        let accrued = instance_cost(&generations, 60.0, 1, false).unwrap();
        assert!((accrued - 0.24).abs() < 1e-12);
    }

    #[test]
    fn test_live_ip_nic_contribution() {
        // nic_count=2, 120s period -> 1 hour per rejuvenation, 3 rotations
        // -> 0.005 * 2 * 3 * 1 = 0.03 on top of instance time
        let records = vec![record(0.0, 2)];
        let accrued = live_ip_cost(&records, 120, 10.0, 3, false);
        assert!((accrued - 0.03).abs() < 1e-12);
    }

    #[test]
    fn test_live_ip_instance_time_component() {
        let records = vec![record(0.30, 1)];
        // 0.30/60*30 = 0.15 instance time; 0.005*1*0*_ = 0 nic
        let accrued = live_ip_cost(&records, 3600, 30.0, 0, false);
        assert!((accrued - 0.15).abs() < 1e-12);
    }

    #[test]
    fn test_ephemeral_charge_adds_remap_cost() {
        let records = vec![record(0.0, 2)];
        let without = live_ip_cost(&records, 120, 10.0, 3, false);
        let with = live_ip_cost(&records, 120, 10.0, 3, true);
        // 0.1 * 2 ops * 2 nics * 3 rotations = 1.2
        assert!((with - without - 1.2).abs() < 1e-12);
    }

    #[test]
    fn test_live_ip_optimal_statically_held() {
        let baseline = OptimalBaseline {
            cost_per_hour: 0.12,
            instance_count: 3,
            max_nics: 4,
            instance_type: "a.type".to_string(),
            zone: "us-east-1a".to_string(),
        };
        // instances: 3 * 0.12/60 * 90 = 0.54
        // addresses: 0.005 * 4 * 3 * ceil(90/60)=2 -> 0.12
        let optimal = live_ip_optimal(&baseline, 90.0);
        assert!((optimal - 0.66).abs() < 1e-12);
    }

    #[test]
    fn test_zero_rejuvenation_count_fails_loudly() {
        let generations = vec![record(0.24, 1)];
        let err = instance_cost(&generations, 60.0, 0, false).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidCostInput(_)));
    }

    #[test]
    fn test_cost_monotone_in_duration() {
        let records = vec![record(0.24, 4), record(0.31, 2)];
        let mut previous_live = 0.0;
        let mut previous_instance = 0.0;
        for duration in [10.0, 30.0, 60.0, 240.0, 1440.0] {
            let live = live_ip_cost(&records, 300, duration, 5, true);
            let inst = instance_cost(&records, duration, 5, true).unwrap();
            assert!(live >= previous_live);
            assert!(inst >= previous_instance);
            previous_live = live;
            previous_instance = inst;
        }
    }

    #[test]
    fn test_monthly_projection_is_linear() {
        // 0.5 over 60 minutes -> 0.5 * 24 * 30 per month
        let monthly = monthly_projection(0.5, 60.0).unwrap();
        assert!((monthly - 360.0).abs() < 1e-9);

        assert!(monthly_projection(1.0, 0.0).is_err());
    }

    #[test]
    fn test_address_hold_surcharge() {
        let generations = vec![record(0.0, 1)];
        let with = instance_cost(&generations, 60.0, 2, true).unwrap();
        // 0.005/60 * (60/2) = 0.0025 per generation instance
        assert!((with - 0.0025).abs() < 1e-12);
    }
}
