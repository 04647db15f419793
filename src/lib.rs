//! # Spotproxy Orchestrator
//!
//! Spot-instance proxy fleet acquisition and rejuvenation.
//!
//! ## Architecture
//!
//! ```text
//! Price catalog                 Fleet assembler            Rejuvenation loop
//! ├── spot price history   ──►  ├── cheapest tier first    ├── live-IP: rotate
//! ├── interface metadata        ├── partial fulfillment    │   address bindings
//! └── filter + rank             └── multi-NIC wiring  ──►  ├── instance: replace
//!                                                          │   whole generations
//! Secondary retail feed                                    └── verify, account,
//! └── comparative prices only                                  tear down
//! ```
//!
//! Proxies are elastic IP addresses riding cheap spot capacity. The catalog
//! ranks offerings by raw spot price or by price-per-interface (the fixed
//! per-address surcharge amortized across every interface the type can
//! host); the assembler greedily drains tiers cheapest-first, tolerating
//! partial fulfillment; the rejuvenation loop then periodically refreshes
//! every proxy's public identity, either by rotating address bindings on a
//! fixed instance set or by replacing whole instance generations
//! make-before-break.
//!
//! All provider access goes through the [`CloudGateway`] trait so the
//! orchestration logic stays testable against a scripted gateway. Cost
//! accounting is pure functions over the records the run produced.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod assembler;
pub mod catalog;
pub mod config;
pub mod cost;
pub mod credentials;
pub mod error;
pub mod feed;
pub mod gateway;
pub mod probe;
pub mod rejuvenate;
pub mod retry;
pub mod status;

// Error handling
pub use error::{ProxyError, Result};

// Provider gateway
pub use gateway::{
    AddressLease, AllocatedAddress, CloudGateway, DEFAULT_REGION, Ec2Gateway, FleetHandle,
    RawSpotQuote, RealizedInstance, Session, SweepReport, TypeCapability, sweep,
};

// Price catalog
pub use catalog::{EIP_HOURLY_RATE, PriceCatalog, PriceFilter, PriceQuote, SortKey};

// Fleet assembly
pub use assembler::{
    AcquisitionMode, Assembly, AssemblyAbort, AssemblerConfig, FleetAssembler, InstanceRecord,
    NicBinding, OptimalBaseline, ShortfallEvent,
};

// Rejuvenation
pub use rejuvenate::{ExperimentOutcome, RejuvenationExperiment};

// Cost accounting
pub use cost::{CostReport, instance_report, live_ip_report, monthly_projection};

// Liveness probing
pub use probe::{PingProber, Reachability, probe_all};

// Retry policy
pub use retry::RetryPolicy;

// Configuration
pub use config::ExperimentConfig;

// Status queries
pub use status::{ExperimentPhase, InstanceInventory, StatusRegistry, StatusSnapshot};

// Credential refresh
pub use credentials::{AssumeRoleRefresher, CredentialRefresher, NoopRefresher};

// Secondary price feed
pub use feed::{RetailPriceFeed, RetailPriceRecord};
