//! Spot price catalog
//!
//! Joins raw spot-price records with per-type network-interface metadata
//! into a ranked, filterable price table. Two sort keys are supported:
//!
//! - raw spot price, for single-NIC ("instance") acquisition
//! - price per interface, for multi-NIC ("live-IP") acquisition
//!
//! Price per interface amortizes the fixed per-elastic-IP hourly surcharge
//! across every interface the instance type can host:
//!
//! ```text
//! price_per_interface = (spot_price + 0.005 * (max_nic - 1)) / max_nic
//! ```
//!
//! A catalog is a snapshot: it is re-fetched for every assembly pass and
//! never mutated after construction, other than sorting.

use crate::error::Result;
use crate::gateway::{CloudGateway, RawSpotQuote, TypeCapability};
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Hourly charge for one allocated elastic IP address (USD)
pub const EIP_HOURLY_RATE: f64 = 0.005;

/// Sort key for the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortKey {
    /// Raw spot price ascending (single-NIC acquisition)
    SpotPrice,
    /// Price per network interface ascending (multi-NIC acquisition)
    PricePerInterface,
}

/// One priced spot offering, immutable once built
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceQuote {
    /// Availability zone the price was observed in (e.g. "us-east-1a")
    pub zone: String,

    /// Instance type (e.g. "t3a.medium")
    pub instance_type: String,

    /// Maximum network interfaces the type supports (>= 1)
    pub max_network_interfaces: u32,

    /// CPU architectures the type supports (e.g. "x86_64", "arm64")
    pub architectures: Vec<String>,

    /// Spot price in USD per hour
    pub spot_price: f64,

    /// Derived per-interface price (see module docs)
    pub price_per_interface: f64,

    /// When the provider reported this price
    pub timestamp: DateTime<Utc>,
}

impl PriceQuote {
    /// Derive the per-interface price for a spot price and interface count
    pub fn derive_price_per_interface(spot_price: f64, max_nic: u32) -> f64 {
        (spot_price + EIP_HOURLY_RATE * (max_nic as f64 - 1.0)) / max_nic as f64
    }

    /// Whether this type supports the given CPU architecture
    pub fn supports_architecture(&self, arch: &str) -> bool {
        self.architectures.iter().any(|a| a == arch)
    }

    /// The value of the given sort key for this quote
    pub fn key(&self, key: SortKey) -> f64 {
        match key {
            SortKey::SpotPrice => self.spot_price,
            SortKey::PricePerInterface => self.price_per_interface,
        }
    }
}

/// Filter predicate applied to a catalog before consumption.
///
/// `regions` entries are zone prefixes: a quote in "us-east-1a" passes a
/// filter listing "us-east-1". Filtering commutes with sorting; both keys
/// are derived at build time, never from the surviving row set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriceFilter {
    /// Minimum spot price (inclusive)
    pub min_cost: Option<f64>,

    /// Maximum spot price (inclusive)
    pub max_cost: Option<f64>,

    /// Zone prefixes to keep; empty keeps every zone
    #[serde(default)]
    pub regions: Vec<String>,
}

impl PriceFilter {
    /// Whether a quote passes this filter
    pub fn matches(&self, quote: &PriceQuote) -> bool {
        if let Some(min) = self.min_cost {
            if quote.spot_price < min {
                return false;
            }
        }
        if let Some(max) = self.max_cost {
            if quote.spot_price > max {
                return false;
            }
        }
        if !self.regions.is_empty()
            && !self.regions.iter().any(|r| quote.zone.starts_with(r.as_str()))
        {
            return false;
        }
        true
    }
}

/// Ordered sequence of price quotes
#[derive(Debug, Clone, Default)]
pub struct PriceCatalog {
    quotes: Vec<PriceQuote>,
}

impl PriceCatalog {
    /// Build a catalog by joining raw quotes with the capability lookup.
    ///
    /// A type absent from the lookup is excluded and logged rather than
    /// assumed to carry one interface: defaulting would silently mis-cost
    /// the row on the per-interface key.
    pub fn build(
        raw: Vec<RawSpotQuote>,
        capabilities: &HashMap<String, TypeCapability>,
    ) -> Self {
        let mut quotes = Vec::with_capacity(raw.len());
        for record in raw {
            let Some(cap) = capabilities.get(&record.instance_type) else {
                warn!(
                    instance_type = %record.instance_type,
                    "no capability metadata for type, excluding from catalog"
                );
                continue;
            };
            quotes.push(PriceQuote {
                price_per_interface: PriceQuote::derive_price_per_interface(
                    record.spot_price,
                    cap.max_network_interfaces,
                ),
                zone: record.zone,
                instance_type: record.instance_type,
                max_network_interfaces: cap.max_network_interfaces,
                architectures: cap.architectures.clone(),
                spot_price: record.spot_price,
                timestamp: record.timestamp,
            });
        }
        Self { quotes }
    }

    /// Build from already-derived quotes (secondary feeds, tests)
    pub fn from_quotes(quotes: Vec<PriceQuote>) -> Self {
        Self { quotes }
    }

    /// Sort ascending by the given key. Stable: ties keep input order.
    pub fn sort(&mut self, key: SortKey) {
        self.quotes
            .sort_by(|a, b| a.key(key).total_cmp(&b.key(key)));
    }

    /// Drop quotes rejected by the filter, preserving order
    pub fn filter(&mut self, filter: &PriceFilter) {
        self.quotes.retain(|q| filter.matches(q));
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    /// Whether the catalog has no rows
    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }

    /// All rows in current order
    pub fn rows(&self) -> &[PriceQuote] {
        &self.quotes
    }

    /// Rows at or after the assembler's cursor
    pub fn slice_from(&self, cursor: usize) -> &[PriceQuote] {
        if cursor >= self.quotes.len() {
            &[]
        } else {
            &self.quotes[cursor..]
        }
    }

    /// Cheapest row in current order, if any
    pub fn cheapest(&self) -> Option<&PriceQuote> {
        self.quotes.first()
    }
}

/// Fetch, join, filter, and sort a fresh catalog snapshot from a gateway.
/// The two read calls go through the retry policy; a throttled provider is
/// the common case right after a large fleet request.
pub async fn fetch(
    gateway: &dyn CloudGateway,
    retry: &RetryPolicy,
    filter: &PriceFilter,
    key: SortKey,
) -> Result<PriceCatalog> {
    let raw = retry.run(|| gateway.describe_price_catalog()).await?;

    let mut types: Vec<String> = raw.iter().map(|q| q.instance_type.clone()).collect();
    types.sort();
    types.dedup();
    let capabilities = retry.run(|| gateway.describe_capabilities(&types)).await?;

    let mut catalog = PriceCatalog::build(raw, &capabilities);
    catalog.filter(filter);
    catalog.sort(key);
    debug!(rows = catalog.len(), types = types.len(), "catalog snapshot built");
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn quote(zone: &str, ty: &str, price: f64, max_nic: u32) -> PriceQuote {
        PriceQuote {
            zone: zone.to_string(),
            instance_type: ty.to_string(),
            max_network_interfaces: max_nic,
            architectures: vec!["x86_64".to_string()],
            spot_price: price,
            price_per_interface: PriceQuote::derive_price_per_interface(price, max_nic),
            timestamp: Utc.timestamp_opt(1700000000, 0).unwrap(),
        }
    }

    #[test]
    fn test_price_per_interface_derivation() {
        // (0.10 + 0.005 * 3) / 4 = 0.02875
        let q = quote("us-east-1a", "t3a.medium", 0.10, 4);
        assert!((q.price_per_interface - 0.02875).abs() < 1e-12);
    }

    #[test]
    fn test_single_nic_price_equals_spot_price() {
        let q = quote("us-east-1a", "t2.micro", 0.08, 1);
        assert_eq!(q.price_per_interface, q.spot_price);
    }

    #[test]
    fn test_sort_is_stable_permutation() {
        let a = quote("us-east-1a", "a", 0.30, 2);
        let b = quote("us-east-1b", "b", 0.10, 1);
        let c = quote("us-east-1c", "c", 0.10, 1); // tie with b
        let mut catalog = PriceCatalog::from_quotes(vec![a, b, c]);
        catalog.sort(SortKey::SpotPrice);

        let types: Vec<&str> = catalog.rows().iter().map(|q| q.instance_type.as_str()).collect();
        assert_eq!(types, vec!["b", "c", "a"]);
        assert_eq!(catalog.len(), 3);

        // No element has a smaller key after a larger one
        let rows = catalog.rows();
        for pair in rows.windows(2) {
            assert!(pair[0].spot_price <= pair[1].spot_price);
        }
    }

    #[test]
    fn test_filter_and_sort_commute() {
        let quotes = vec![
            quote("us-east-1a", "a", 0.30, 2),
            quote("us-west-2a", "b", 0.05, 4),
            quote("us-east-1b", "c", 0.10, 1),
            quote("us-east-1c", "d", 0.90, 8),
        ];
        let filter = PriceFilter {
            min_cost: Some(0.06),
            max_cost: Some(0.50),
            regions: vec!["us-east-1".to_string()],
        };

        for key in [SortKey::SpotPrice, SortKey::PricePerInterface] {
            let mut filter_first = PriceCatalog::from_quotes(quotes.clone());
            filter_first.filter(&filter);
            filter_first.sort(key);

            let mut sort_first = PriceCatalog::from_quotes(quotes.clone());
            sort_first.sort(key);
            sort_first.filter(&filter);

            let left: Vec<&str> = filter_first.rows().iter().map(|q| q.instance_type.as_str()).collect();
            let right: Vec<&str> = sort_first.rows().iter().map(|q| q.instance_type.as_str()).collect();
            assert_eq!(left, right);
        }
    }

    #[test]
    fn test_region_filter_is_zone_prefix() {
        let filter = PriceFilter {
            regions: vec!["us-east-1".to_string()],
            ..Default::default()
        };
        assert!(filter.matches(&quote("us-east-1f", "a", 0.10, 1)));
        assert!(!filter.matches(&quote("us-west-2a", "a", 0.10, 1)));
    }

    #[test]
    fn test_build_excludes_types_without_capabilities() {
        let raw = vec![
            RawSpotQuote {
                zone: "us-east-1a".to_string(),
                instance_type: "known.type".to_string(),
                spot_price: 0.10,
                timestamp: Utc.timestamp_opt(1700000000, 0).unwrap(),
            },
            RawSpotQuote {
                zone: "us-east-1a".to_string(),
                instance_type: "unknown.type".to_string(),
                spot_price: 0.01,
                timestamp: Utc.timestamp_opt(1700000000, 0).unwrap(),
            },
        ];
        let mut caps = HashMap::new();
        caps.insert(
            "known.type".to_string(),
            TypeCapability {
                max_network_interfaces: 4,
                architectures: vec!["x86_64".to_string()],
            },
        );

        let catalog = PriceCatalog::build(raw, &caps);
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.rows()[0].instance_type, "known.type");
        assert_eq!(catalog.rows()[0].max_network_interfaces, 4);
    }

    #[test]
    fn test_slice_from_past_end_is_empty() {
        let catalog = PriceCatalog::from_quotes(vec![quote("us-east-1a", "a", 0.1, 1)]);
        assert!(catalog.slice_from(5).is_empty());
        assert_eq!(catalog.slice_from(0).len(), 1);
    }
}
