//! Rejuvenation loop
//!
//! Drives one experiment from provisioning to teardown:
//!
//! ```text
//! Provisioning ──► Verifying ──► Steady ──► Steady ──► ... ──► Draining
//!      │               │           │                              │
//!      │               │           ├── sleep out the period       │
//!      │               │           │   (deadline- and shutdown-   │
//!      │               │           │    aware)                    │
//!      │               │           ├── refresh credentials        │
//!      │               │           ├── rejuvenate (mode-specific) │
//!      │               │           └── re-verify reachability     │
//!      │               │                                          │
//!   assemble       ping every                              release every
//!   the fleet      default IP                              address, then
//!                                                          terminate
//! ```
//!
//! Live-IP mode keeps the instance set fixed and rotates every elastic
//! address binding each tick. Instance mode stands up a wholly new
//! generation each tick and terminates the previous one only after the new
//! one verified (make-before-break). Any liveness failure is fatal: the
//! experiment drains immediately rather than serving through dead proxies.
//!
//! A shutdown signal on the watch channel drains early instead of waiting
//! out the remaining period.

use crate::assembler::{
    AcquisitionMode, AssemblerConfig, Assembly, FleetAssembler, InstanceRecord, NicBinding,
};
use crate::catalog::{self, PriceCatalog, SortKey};
use crate::config::ExperimentConfig;
use crate::cost::{self, CostReport};
use crate::credentials::CredentialRefresher;
use crate::error::{ProxyError, Result};
use crate::gateway::CloudGateway;
use crate::probe::{Reachability, probe_all};
use crate::retry::RetryPolicy;
use crate::status::{ExperimentPhase, StatusRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Why a bounded sleep returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wait {
    /// The full period elapsed
    Completed,
    /// The experiment deadline arrived first
    DeadlineReached,
    /// The shutdown channel flipped
    Aborted,
}

/// Sleep for `period`, but never past `deadline`, and wake immediately on
/// shutdown. A watch flip back to `false` is ignored.
async fn bounded_sleep(
    deadline: Instant,
    period: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Wait {
    let now = Instant::now();
    if now >= deadline {
        return Wait::DeadlineReached;
    }
    let wake = now + period;
    let (target, outcome) = if wake >= deadline {
        (deadline, Wait::DeadlineReached)
    } else {
        (wake, Wait::Completed)
    };

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(target) => return outcome,
            changed = shutdown.changed() => match changed {
                Ok(()) if *shutdown.borrow() => return Wait::Aborted,
                Ok(()) => continue,
                // Sender gone: no abort can arrive anymore
                Err(_) => {
                    tokio::time::sleep_until(target).await;
                    return outcome;
                }
            },
        }
    }
}

/// Final accounting of a completed experiment
#[derive(Debug)]
pub struct ExperimentOutcome {
    /// Cost accrued and projected
    pub report: CostReport,

    /// Completed rejuvenation ticks
    pub rejuvenations: u32,

    /// Live-IP: the final record set. Instance: every generation that ran.
    pub records: Vec<InstanceRecord>,
}

/// One experiment worker, parameterized over the gateway, the prober, and
/// the credential refresher so tests can script all three
pub struct RejuvenationExperiment {
    gateway: Arc<dyn CloudGateway>,
    prober: Arc<dyn Reachability>,
    refresher: Arc<dyn CredentialRefresher>,
    config: ExperimentConfig,
    status: StatusRegistry,
    retry: RetryPolicy,
    shutdown: watch::Receiver<bool>,
}

impl RejuvenationExperiment {
    /// Build a worker. The status registry is shared with status queries;
    /// the shutdown receiver pairs with the operator's watch sender.
    pub fn new(
        gateway: Arc<dyn CloudGateway>,
        prober: Arc<dyn Reachability>,
        refresher: Arc<dyn CredentialRefresher>,
        config: ExperimentConfig,
        status: StatusRegistry,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            gateway,
            prober,
            refresher,
            config,
            status,
            retry: RetryPolicy::default(),
            shutdown,
        }
    }

    /// Override the transient-error retry policy
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run the experiment to completion. On any fatal error the allocation
    /// is torn down before the error propagates.
    pub async fn run(mut self) -> Result<ExperimentOutcome> {
        info!(
            experiment = %self.config.experiment_name,
            mode = self.config.mode.label(),
            proxy_count = self.config.proxy_count,
            period_secs = self.config.rejuvenation_period_secs,
            duration_min = self.config.experiment_duration_min,
            "starting experiment"
        );
        if let Err(err) = self.refresher.refresh().await {
            warn!(error = %err, "initial credential refresh failed, proceeding with ambient credentials");
        }
        match self.config.mode {
            AcquisitionMode::LiveIp => self.run_live_ip().await,
            AcquisitionMode::Instance => self.run_instance().await,
        }
    }

    // ---- live-IP mode ----------------------------------------------------

    async fn run_live_ip(&mut self) -> Result<ExperimentOutcome> {
        let deadline = Instant::now() + self.config.experiment_duration();
        let period = self.config.rejuvenation_period();
        let mut rejuvenations = 0u32;

        self.status
            .publish(ExperimentPhase::Provisioning, &[], rejuvenations)
            .await;
        let Assembly {
            mut records,
            baseline,
            shortfalls,
        } = self.provision().await?;
        if !shortfalls.is_empty() {
            warn!(shortfalls = shortfalls.len(), "fleet assembled with under-fulfilled tiers");
        }

        self.status
            .publish(ExperimentPhase::Verifying, &records, rejuvenations)
            .await;
        if let Err(err) = self.verify(&records).await {
            error!(error = %err, "initial liveness verification failed");
            self.drain(&records, rejuvenations).await;
            return Err(err);
        }
        info!(instances = records.len(), "fleet verified, entering steady state");
        self.status
            .publish(ExperimentPhase::Steady, &records, rejuvenations)
            .await;

        loop {
            match bounded_sleep(deadline, period, &mut self.shutdown).await {
                Wait::Completed => {}
                Wait::DeadlineReached => {
                    info!("experiment deadline reached");
                    break;
                }
                Wait::Aborted => {
                    info!("shutdown requested, draining early");
                    break;
                }
            }

            if let Err(err) = self.refresher.refresh().await {
                // Stale credentials must not drive mutations; sit this tick out
                warn!(error = %err, "credential refresh failed, skipping tick");
                continue;
            }

            let tick_start = Instant::now();
            let mut tick_error = None;
            for record in records.iter_mut() {
                if let Err(err) = self.rotate_instance(record).await {
                    tick_error = Some(err);
                    break;
                }
            }
            if let Some(err) = tick_error {
                error!(error = %err, "address rotation failed");
                self.drain(&records, rejuvenations).await;
                return Err(err);
            }

            if let Err(err) = self.verify(&records).await {
                error!(error = %err, "post-rotation liveness verification failed");
                self.drain(&records, rejuvenations).await;
                return Err(err);
            }

            rejuvenations += 1;
            info!(
                tick = rejuvenations,
                instances = records.len(),
                addresses = records.iter().map(|r| r.bindings.len()).sum::<usize>(),
                elapsed_ms = tick_start.elapsed().as_millis() as u64,
                "rotation tick complete"
            );
            self.status
                .publish(ExperimentPhase::Steady, &records, rejuvenations)
                .await;
        }

        self.drain(&records, rejuvenations).await;
        let report = cost::live_ip_report(
            &records,
            &baseline,
            self.config.rejuvenation_period_secs,
            self.config.experiment_duration_min as f64,
            rejuvenations,
            self.config.ephemeral_charge,
        )?;
        info!(
            accrued = report.accrued,
            optimal = report.optimal,
            monthly = report.monthly,
            rejuvenations,
            "live-ip experiment complete"
        );
        Ok(ExperimentOutcome {
            report,
            rejuvenations,
            records,
        })
    }

    /// Rotate every binding of one instance, strictly sequentially,
    /// replacing the record's binding list with a fresh one.
    ///
    /// On failure the record keeps the already-rotated bindings plus the
    /// untouched remainder, so teardown sees everything still held.
    async fn rotate_instance(&self, record: &mut InstanceRecord) -> Result<()> {
        let old = std::mem::take(&mut record.bindings);
        let mut rotated = Vec::with_capacity(old.len());
        let mut pending = old.into_iter();

        while let Some(binding) = pending.next() {
            match self.rotate_binding(&binding).await {
                Ok(fresh) => rotated.push(fresh),
                Err(err) => {
                    rotated.push(binding);
                    rotated.extend(pending);
                    record.bindings = rotated;
                    return Err(err);
                }
            }
        }

        record.bindings = rotated;
        debug!(
            instance_id = %record.instance_id,
            bindings = record.bindings.len(),
            "instance bindings rotated"
        );
        Ok(())
    }

    /// Disassociate, release, allocate, associate: one binding's rotation.
    /// Association is not retried because the call is not idempotent.
    async fn rotate_binding(&self, binding: &NicBinding) -> Result<NicBinding> {
        if let Some(association_id) = &binding.association_id {
            self.retry
                .run(|| self.gateway.disassociate_address(association_id))
                .await?;
        }
        if let Some(allocation_id) = &binding.allocation_id {
            self.retry
                .run(|| self.gateway.release_address(allocation_id))
                .await?;
        }

        let address = self.retry.run(|| self.gateway.allocate_address()).await?;
        match self
            .gateway
            .associate_address(&address.allocation_id, &binding.interface_id)
            .await
        {
            Ok(association_id) => Ok(NicBinding {
                interface_id: binding.interface_id.clone(),
                allocation_id: Some(address.allocation_id),
                association_id: Some(association_id),
                public_ip: address.public_ip,
            }),
            Err(err) => {
                // The fresh allocation is in no binding list yet; release it
                // here or nothing ever will
                if let Err(release_err) = self.gateway.release_address(&address.allocation_id).await
                {
                    warn!(
                        allocation_id = %address.allocation_id,
                        error = %release_err,
                        "failed to release allocation after failed association"
                    );
                }
                Err(err)
            }
        }
    }

    // ---- instance mode ---------------------------------------------------

    async fn run_instance(&mut self) -> Result<ExperimentOutcome> {
        let deadline = Instant::now() + self.config.experiment_duration();
        let period = self.config.rejuvenation_period();

        self.status.publish(ExperimentPhase::Provisioning, &[], 0).await;
        let current_assembly = self.provision().await?;
        let mut current = current_assembly.records;
        let mut generations_seen = current.clone();
        // Generation count seeds the cost divisor; it is never zero once
        // provisioning succeeded
        let mut generations = 1u32;

        self.status.publish(ExperimentPhase::Verifying, &current, 0).await;
        if let Err(err) = self.verify(&current).await {
            error!(error = %err, "initial liveness verification failed");
            self.drain(&current, 0).await;
            return Err(err);
        }
        info!(instances = current.len(), "generation 1 verified, entering steady state");
        self.status.publish(ExperimentPhase::Steady, &current, 0).await;

        loop {
            match bounded_sleep(deadline, period, &mut self.shutdown).await {
                Wait::Completed => {}
                Wait::DeadlineReached => {
                    info!("experiment deadline reached");
                    break;
                }
                Wait::Aborted => {
                    info!("shutdown requested, draining early");
                    break;
                }
            }

            if let Err(err) = self.refresher.refresh().await {
                warn!(error = %err, "credential refresh failed, skipping tick");
                continue;
            }

            // Make-before-break: the replacement generation must exist and
            // verify before the serving one is touched
            let tick_start = Instant::now();
            let next = match self.provision().await {
                Ok(assembly) => assembly.records,
                Err(err) => {
                    error!(error = %err, "replacement generation failed to provision");
                    self.drain(&current, generations - 1).await;
                    return Err(err);
                }
            };
            if let Err(err) = self.verify(&next).await {
                error!(error = %err, "replacement generation failed verification");
                self.teardown(&next).await;
                self.drain(&current, generations - 1).await;
                return Err(err);
            }

            generations_seen.extend(next.iter().cloned());
            self.teardown(&current).await;
            current = next;
            generations += 1;
            info!(
                generation = generations,
                instances = current.len(),
                elapsed_ms = tick_start.elapsed().as_millis() as u64,
                "generation replaced"
            );
            self.status
                .publish(ExperimentPhase::Steady, &current, generations - 1)
                .await;
        }

        self.drain(&current, generations - 1).await;
        let report = cost::instance_report(
            &generations_seen,
            self.config.experiment_duration_min as f64,
            generations,
            self.config.ephemeral_charge,
        )?;
        info!(
            accrued = report.accrued,
            optimal = report.optimal,
            monthly = report.monthly,
            generations,
            "instance experiment complete"
        );
        Ok(ExperimentOutcome {
            report,
            rejuvenations: generations - 1,
            records: generations_seen,
        })
    }

    // ---- shared ----------------------------------------------------------

    /// Fetch, filter, and sort the price catalog, then run one assembly
    /// pass at the configured target. An aborted pass tears its partial
    /// allocation down before the cause propagates.
    async fn provision(&self) -> Result<Assembly> {
        let catalog = self.fetch_catalog().await?;
        if catalog.is_empty() {
            return Err(ProxyError::InsufficientCapacity {
                requested: self.config.proxy_count,
                fulfilled: 0,
            });
        }
        info!(rows = catalog.len(), "price catalog ready");

        let assembler = FleetAssembler::new(self.gateway.clone(), self.assembler_config());
        match assembler.assemble(self.config.proxy_count, &catalog).await {
            Ok(assembly) => Ok(assembly),
            Err(abort) => {
                warn!(
                    error = %abort.cause,
                    partial = abort.partial.len(),
                    "assembly aborted, tearing down partial allocation"
                );
                self.teardown(&abort.partial).await;
                Err(abort.cause)
            }
        }
    }

    async fn fetch_catalog(&self) -> Result<PriceCatalog> {
        let key = match self.config.mode {
            AcquisitionMode::LiveIp => SortKey::PricePerInterface,
            AcquisitionMode::Instance => SortKey::SpotPrice,
        };
        catalog::fetch(
            self.gateway.as_ref(),
            &self.retry,
            &self.config.price_filter,
            key,
        )
        .await
    }

    fn assembler_config(&self) -> AssemblerConfig {
        AssemblerConfig {
            mode: self.config.mode,
            launch_template: self.config.launch_template.clone(),
            required_architecture: self.config.required_architecture.clone(),
            wait_after_create: self.config.wait_after_create(),
            wait_after_nic: self.config.wait_after_nic(),
            experiment_name: self.config.experiment_name.clone(),
        }
    }

    /// Ping the default interface of every record. Any failure, an empty
    /// probe target included, is fatal.
    async fn verify(&self, records: &[InstanceRecord]) -> Result<()> {
        let ips: Vec<&str> = records
            .iter()
            .map(|r| r.probe_ip().unwrap_or(""))
            .collect();
        let failed = probe_all(self.prober.as_ref(), ips).await?;
        if failed.is_empty() {
            debug!(instances = records.len(), "all default interfaces reachable");
            Ok(())
        } else {
            Err(ProxyError::LivenessCheckFailed(failed))
        }
    }

    /// Publish the Draining phase and tear the record set down
    async fn drain(&self, records: &[InstanceRecord], rejuvenations: u32) {
        self.status
            .publish(ExperimentPhase::Draining, records, rejuvenations)
            .await;
        self.teardown(records).await;
    }

    /// Best-effort teardown: every failure is logged and counted, none
    /// stops the sweep
    async fn teardown(&self, records: &[InstanceRecord]) {
        let mut failures = 0u32;
        for record in records {
            for binding in &record.bindings {
                if let Some(association_id) = &binding.association_id {
                    if let Err(err) = self.gateway.disassociate_address(association_id).await {
                        failures += 1;
                        warn!(
                            association_id = %association_id,
                            error = %err,
                            "disassociate failed during teardown"
                        );
                    }
                }
                if let Some(allocation_id) = &binding.allocation_id {
                    if let Err(err) = self.gateway.release_address(allocation_id).await {
                        failures += 1;
                        warn!(
                            allocation_id = %allocation_id,
                            error = %err,
                            "release failed during teardown"
                        );
                    }
                }
            }
        }

        let instance_ids: Vec<String> =
            records.iter().map(|r| r.instance_id.clone()).collect();
        if !instance_ids.is_empty() {
            if let Err(err) = self.gateway.terminate_instances(&instance_ids).await {
                failures += 1;
                error!(error = %err, "terminate failed during teardown");
            }
        }

        if failures > 0 {
            warn!(
                instances = instance_ids.len(),
                failures, "teardown completed with failures"
            );
        } else {
            info!(instances = instance_ids.len(), "teardown complete");
        }
    }
}
