//! Provider gateway
//!
//! Thin capability interface to the compute provider. Every call is a single
//! provider round-trip; the gateway holds no orchestration state and never
//! retries internally. Throttling surfaces as
//! [`ProxyError::TransientProvider`] for the caller's retry policy.
//!
//! The fleet assembler and the rejuvenation loops work through
//! [`CloudGateway`] ONLY - never concrete SDK types. [`Ec2Gateway`] is the
//! production implementation over `aws-sdk-ec2`; tests script a mock.

use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_ec2::{
    Client,
    types::{
        DefaultTargetCapacityType, DomainType, Filter, FleetLaunchTemplateConfigRequest,
        FleetLaunchTemplateOverridesRequest, FleetLaunchTemplateSpecificationRequest, FleetType,
        InstanceType, SpotAllocationStrategy, SpotOptionsRequest, Tag,
        TargetCapacitySpecificationRequest,
    },
};
use aws_types::region::Region;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Default AWS region
pub const DEFAULT_REGION: &str = "us-east-1";

/// Provider API limit on instance types per describe-capabilities call
const CAPABILITY_BATCH_SIZE: usize = 100;

/// Per-region provider session.
///
/// Constructed once per region/account pair and owned by the experiment
/// worker. Never shared implicitly across workers.
#[derive(Debug, Clone)]
pub struct Session {
    /// AWS region name
    pub region: String,
}

impl Session {
    /// Create a session for a region
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
        }
    }

    /// Build an EC2 client from the environment credential chain
    pub async fn connect(&self) -> Client {
        debug!("Creating EC2 client for region: {}", self.region);
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(self.region.clone()))
            .load()
            .await;
        Client::new(&config)
    }
}

/// Raw spot-price record as reported by the provider, before the catalog
/// joins it with interface-count metadata
#[derive(Debug, Clone)]
pub struct RawSpotQuote {
    /// Availability zone
    pub zone: String,

    /// Instance type name
    pub instance_type: String,

    /// Spot price in USD per hour
    pub spot_price: f64,

    /// When the provider reported the price
    pub timestamp: DateTime<Utc>,
}

/// Per-type capability metadata
#[derive(Debug, Clone)]
pub struct TypeCapability {
    /// Maximum network interfaces the type supports
    pub max_network_interfaces: u32,

    /// Supported CPU architectures
    pub architectures: Vec<String>,
}

/// Opaque handle for an asynchronously-materializing fleet request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetHandle(pub String);

/// Instance data as resolved from a fleet request.
///
/// A fleet may resolve fewer instances than requested; that under-fulfillment
/// is normal and is surfaced as a count, not an error.
#[derive(Debug, Clone)]
pub struct RealizedInstance {
    /// Provider-assigned instance id
    pub instance_id: String,

    /// Instance type
    pub instance_type: String,

    /// Availability zone
    pub zone: String,

    /// Subnet the instance landed in (extra interfaces are created here)
    pub subnet_id: String,

    /// The default (device index 0) network interface
    pub default_interface_id: String,

    /// Ephemeral public address, when the provider assigned one
    pub public_ip: Option<String>,
}

/// A freshly-allocated elastic address
#[derive(Debug, Clone)]
pub struct AllocatedAddress {
    /// Allocation id, released exactly once at teardown
    pub allocation_id: String,

    /// The public IP the allocation carries
    pub public_ip: String,
}

/// An elastic address lease as seen by a sweep, bound or not
#[derive(Debug, Clone)]
pub struct AddressLease {
    /// Allocation id
    pub allocation_id: String,

    /// Association, when the address is currently bound
    pub association_id: Option<String>,
}

/// Capability interface to the compute provider.
///
/// All operations are idempotent against retry except `associate_address`,
/// which fails if the target interface or allocation is already bound.
#[async_trait]
pub trait CloudGateway: Send + Sync {
    /// Fetch the raw spot price catalog for the session's region
    async fn describe_price_catalog(&self) -> Result<Vec<RawSpotQuote>>;

    /// Fetch interface-count and architecture metadata for instance types.
    /// Batched internally at the provider's 100-types-per-call limit.
    async fn describe_capabilities(
        &self,
        instance_types: &[String],
    ) -> Result<HashMap<String, TypeCapability>>;

    /// Request spot capacity with a lowest-price allocation strategy.
    /// Asynchronous: materialization is eventually consistent and must be
    /// polled via [`Self::resolve_fleet_instances`].
    async fn create_fleet(
        &self,
        instance_type: &str,
        zone: &str,
        launch_template: &str,
        count: u32,
    ) -> Result<FleetHandle>;

    /// Resolve the instances a fleet request actually materialized
    async fn resolve_fleet_instances(&self, fleet: &FleetHandle) -> Result<Vec<RealizedInstance>>;

    /// Create a network interface in a subnet
    async fn create_interface(&self, subnet_id: &str) -> Result<String>;

    /// Attach an interface to an instance at a device index
    async fn attach_interface(
        &self,
        interface_id: &str,
        instance_id: &str,
        device_index: i32,
    ) -> Result<()>;

    /// Allocate a fresh elastic address
    async fn allocate_address(&self) -> Result<AllocatedAddress>;

    /// Bind an allocation to an interface. NOT idempotent: fails if either
    /// side is already bound.
    async fn associate_address(&self, allocation_id: &str, interface_id: &str) -> Result<String>;

    /// Unbind an association
    async fn disassociate_address(&self, association_id: &str) -> Result<()>;

    /// Release an allocation back to the provider
    async fn release_address(&self, allocation_id: &str) -> Result<()>;

    /// Terminate instances
    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<()>;

    /// Tag a resource. Best-effort: callers log and skip on failure, tagging
    /// is cosmetic rather than correctness-critical.
    async fn tag_resource(&self, resource_id: &str, key: &str, value: &str) -> Result<()>;

    /// Every pending or running instance id in the region
    async fn list_running_instances(&self) -> Result<Vec<String>>;

    /// Every elastic address lease held by the account in the region
    async fn list_address_leases(&self) -> Result<Vec<AddressLease>>;
}

/// Outcome of a [`sweep`] pass
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    /// Instances terminated
    pub instances_terminated: usize,

    /// Addresses released
    pub addresses_released: usize,

    /// Individual calls that failed along the way
    pub failures: u32,
}

/// Terminate every running instance except the excluded ids and release
/// every address lease. Best-effort: failures are counted, never
/// short-circuited on. Last-resort cleanup for a region an aborted run
/// left resources in.
pub async fn sweep(gateway: &dyn CloudGateway, excluded: &[String]) -> Result<SweepReport> {
    let mut report = SweepReport::default();

    let instances: Vec<String> = gateway
        .list_running_instances()
        .await?
        .into_iter()
        .filter(|id| !excluded.contains(id))
        .collect();
    if !instances.is_empty() {
        match gateway.terminate_instances(&instances).await {
            Ok(()) => report.instances_terminated = instances.len(),
            Err(err) => {
                report.failures += 1;
                warn!(error = %err, count = instances.len(), "sweep terminate failed");
            }
        }
    }

    for lease in gateway.list_address_leases().await? {
        if let Some(association_id) = &lease.association_id {
            if let Err(err) = gateway.disassociate_address(association_id).await {
                report.failures += 1;
                warn!(
                    association_id = %association_id,
                    error = %err,
                    "sweep disassociate failed"
                );
            }
        }
        match gateway.release_address(&lease.allocation_id).await {
            Ok(()) => report.addresses_released += 1,
            Err(err) => {
                report.failures += 1;
                warn!(
                    allocation_id = %lease.allocation_id,
                    error = %err,
                    "sweep release failed"
                );
            }
        }
    }

    Ok(report)
}

/// Production gateway over the EC2 control plane
pub struct Ec2Gateway {
    client: Client,
    session: Session,
}

impl Ec2Gateway {
    /// Connect a gateway for the session's region
    pub async fn connect(session: Session) -> Self {
        let client = session.connect().await;
        Self { client, session }
    }

    /// The region this gateway talks to
    pub fn region(&self) -> &str {
        &self.session.region
    }
}

#[async_trait]
impl CloudGateway for Ec2Gateway {
    async fn describe_price_catalog(&self) -> Result<Vec<RawSpotQuote>> {
        let start = aws_sdk_ec2::primitives::DateTime::from(std::time::SystemTime::now());
        let mut quotes = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut req = self
                .client
                .describe_spot_price_history()
                .product_descriptions("Linux/UNIX")
                .start_time(start);
            if let Some(token) = &next_token {
                req = req.next_token(token);
            }
            let response = req.send().await.map_err(ProxyError::from_ec2)?;

            for record in response.spot_price_history() {
                let (Some(zone), Some(instance_type), Some(price)) = (
                    record.availability_zone(),
                    record.instance_type(),
                    record.spot_price(),
                ) else {
                    continue;
                };
                let Ok(spot_price) = price.parse::<f64>() else {
                    warn!(price = %price, "unparsable spot price, skipping record");
                    continue;
                };
                let timestamp = record
                    .timestamp()
                    .map(|t| {
                        DateTime::from_timestamp(t.secs(), t.subsec_nanos()).unwrap_or_else(Utc::now)
                    })
                    .unwrap_or_else(Utc::now);
                quotes.push(RawSpotQuote {
                    zone: zone.to_string(),
                    instance_type: instance_type.as_str().to_string(),
                    spot_price,
                    timestamp,
                });
            }

            // The provider signals the last page with an empty token
            next_token = response
                .next_token()
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }

        debug!(count = quotes.len(), "fetched spot price catalog");
        Ok(quotes)
    }

    async fn describe_capabilities(
        &self,
        instance_types: &[String],
    ) -> Result<HashMap<String, TypeCapability>> {
        let mut capabilities = HashMap::with_capacity(instance_types.len());

        for batch in instance_types.chunks(CAPABILITY_BATCH_SIZE) {
            let response = self
                .client
                .describe_instance_types()
                .set_instance_types(Some(
                    batch.iter().map(|t| InstanceType::from(t.as_str())).collect(),
                ))
                .send()
                .await
                .map_err(ProxyError::from_ec2)?;

            for info in response.instance_types() {
                let Some(name) = info.instance_type() else {
                    continue;
                };
                let Some(max_nic) = info
                    .network_info()
                    .and_then(|n| n.maximum_network_interfaces())
                else {
                    continue;
                };
                let architectures = info
                    .processor_info()
                    .map(|p| {
                        p.supported_architectures()
                            .iter()
                            .map(|a| a.as_str().to_string())
                            .collect()
                    })
                    .unwrap_or_default();
                capabilities.insert(
                    name.as_str().to_string(),
                    TypeCapability {
                        max_network_interfaces: max_nic.max(1) as u32,
                        architectures,
                    },
                );
            }
        }

        Ok(capabilities)
    }

    async fn create_fleet(
        &self,
        instance_type: &str,
        zone: &str,
        launch_template: &str,
        count: u32,
    ) -> Result<FleetHandle> {
        let response = self
            .client
            .create_fleet()
            .spot_options(
                SpotOptionsRequest::builder()
                    .allocation_strategy(SpotAllocationStrategy::LowestPrice)
                    .build(),
            )
            .launch_template_configs(
                FleetLaunchTemplateConfigRequest::builder()
                    .launch_template_specification(
                        FleetLaunchTemplateSpecificationRequest::builder()
                            .launch_template_id(launch_template)
                            .version("1")
                            .build(),
                    )
                    .overrides(
                        FleetLaunchTemplateOverridesRequest::builder()
                            .instance_type(InstanceType::from(instance_type))
                            .availability_zone(zone)
                            .build(),
                    )
                    .build(),
            )
            .target_capacity_specification(
                TargetCapacitySpecificationRequest::builder()
                    .total_target_capacity(count as i32)
                    .spot_target_capacity(count as i32)
                    .on_demand_target_capacity(0)
                    .default_target_capacity_type(DefaultTargetCapacityType::Spot)
                    .build(),
            )
            .r#type(FleetType::Request)
            .send()
            .await
            .map_err(ProxyError::from_ec2)?;

        let fleet_id = response
            .fleet_id()
            .ok_or_else(|| ProxyError::config("no fleet id in create_fleet response"))?;

        debug!(fleet_id = %fleet_id, instance_type, zone, count, "fleet requested");
        Ok(FleetHandle(fleet_id.to_string()))
    }

    async fn resolve_fleet_instances(&self, fleet: &FleetHandle) -> Result<Vec<RealizedInstance>> {
        let response = self
            .client
            .describe_instances()
            .filters(
                Filter::builder()
                    .name("tag:aws:ec2:fleet-id")
                    .values(&fleet.0)
                    .build(),
            )
            .filters(
                Filter::builder()
                    .name("instance-state-name")
                    .values("pending")
                    .values("running")
                    .build(),
            )
            .send()
            .await
            .map_err(ProxyError::from_ec2)?;

        let mut realized = Vec::new();
        for reservation in response.reservations() {
            for instance in reservation.instances() {
                let (Some(instance_id), Some(subnet_id)) =
                    (instance.instance_id(), instance.subnet_id())
                else {
                    continue;
                };
                let Some(default_interface_id) = instance
                    .network_interfaces()
                    .first()
                    .and_then(|nic| nic.network_interface_id())
                else {
                    warn!(instance_id = %instance_id, "instance has no interface yet, skipping");
                    continue;
                };
                realized.push(RealizedInstance {
                    instance_id: instance_id.to_string(),
                    instance_type: instance
                        .instance_type()
                        .map(|t| t.as_str().to_string())
                        .unwrap_or_default(),
                    zone: instance
                        .placement()
                        .and_then(|p| p.availability_zone())
                        .unwrap_or_default()
                        .to_string(),
                    subnet_id: subnet_id.to_string(),
                    default_interface_id: default_interface_id.to_string(),
                    public_ip: instance.public_ip_address().map(str::to_string),
                });
            }
        }

        Ok(realized)
    }

    async fn create_interface(&self, subnet_id: &str) -> Result<String> {
        let response = self
            .client
            .create_network_interface()
            .subnet_id(subnet_id)
            .send()
            .await
            .map_err(ProxyError::from_ec2)?;

        response
            .network_interface()
            .and_then(|nic| nic.network_interface_id())
            .map(str::to_string)
            .ok_or_else(|| ProxyError::config("no interface id in create_network_interface response"))
    }

    async fn attach_interface(
        &self,
        interface_id: &str,
        instance_id: &str,
        device_index: i32,
    ) -> Result<()> {
        self.client
            .attach_network_interface()
            .network_interface_id(interface_id)
            .instance_id(instance_id)
            .device_index(device_index)
            .send()
            .await
            .map_err(ProxyError::from_ec2)?;
        Ok(())
    }

    async fn allocate_address(&self) -> Result<AllocatedAddress> {
        let response = self
            .client
            .allocate_address()
            .domain(DomainType::Vpc)
            .send()
            .await
            .map_err(ProxyError::from_ec2)?;

        let (Some(allocation_id), Some(public_ip)) =
            (response.allocation_id(), response.public_ip())
        else {
            return Err(ProxyError::config(
                "allocate_address response missing allocation id or ip",
            ));
        };
        Ok(AllocatedAddress {
            allocation_id: allocation_id.to_string(),
            public_ip: public_ip.to_string(),
        })
    }

    async fn associate_address(&self, allocation_id: &str, interface_id: &str) -> Result<String> {
        let response = self
            .client
            .associate_address()
            .allocation_id(allocation_id)
            .network_interface_id(interface_id)
            .send()
            .await
            .map_err(ProxyError::from_ec2)?;

        response
            .association_id()
            .map(str::to_string)
            .ok_or_else(|| ProxyError::config("no association id in associate_address response"))
    }

    async fn disassociate_address(&self, association_id: &str) -> Result<()> {
        self.client
            .disassociate_address()
            .association_id(association_id)
            .send()
            .await
            .map_err(ProxyError::from_ec2)?;
        Ok(())
    }

    async fn release_address(&self, allocation_id: &str) -> Result<()> {
        self.client
            .release_address()
            .allocation_id(allocation_id)
            .send()
            .await
            .map_err(ProxyError::from_ec2)?;
        Ok(())
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<()> {
        if instance_ids.is_empty() {
            return Ok(());
        }
        self.client
            .terminate_instances()
            .set_instance_ids(Some(instance_ids.to_vec()))
            .send()
            .await
            .map_err(ProxyError::from_ec2)?;
        Ok(())
    }

    async fn tag_resource(&self, resource_id: &str, key: &str, value: &str) -> Result<()> {
        self.client
            .create_tags()
            .resources(resource_id)
            .tags(Tag::builder().key(key).value(value).build())
            .send()
            .await
            .map_err(ProxyError::from_ec2)?;
        Ok(())
    }

    async fn list_running_instances(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut req = self.client.describe_instances().filters(
                Filter::builder()
                    .name("instance-state-name")
                    .values("pending")
                    .values("running")
                    .build(),
            );
            if let Some(token) = &next_token {
                req = req.next_token(token);
            }
            let response = req.send().await.map_err(ProxyError::from_ec2)?;

            for reservation in response.reservations() {
                for instance in reservation.instances() {
                    if let Some(id) = instance.instance_id() {
                        ids.push(id.to_string());
                    }
                }
            }

            next_token = response.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }

        Ok(ids)
    }

    async fn list_address_leases(&self) -> Result<Vec<AddressLease>> {
        let response = self
            .client
            .describe_addresses()
            .send()
            .await
            .map_err(ProxyError::from_ec2)?;

        Ok(response
            .addresses()
            .iter()
            .filter_map(|address| {
                address.allocation_id().map(|allocation_id| AddressLease {
                    allocation_id: allocation_id.to_string(),
                    association_id: address.association_id().map(str::to_string),
                })
            })
            .collect())
    }
}
