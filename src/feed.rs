//! Secondary-provider retail price feed
//!
//! Read-only comparative pricing from a paginated JSON retail catalog
//! (`NextPageLink`-style cursor). Only Spot SKUs are retained; they map
//! into [`PriceQuote`] rows with a single network interface, so the
//! per-interface price equals the retail price. This feed never drives the
//! live control plane.

use crate::catalog::{PriceCatalog, PriceQuote};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Default retail prices endpoint (Azure retail catalog, eastus spot VMs)
pub const DEFAULT_FEED_URL: &str = "https://prices.azure.com/api/retail/prices?$filter=serviceName%20eq%20%27Virtual%20Machines%27%20and%20priceType%20eq%20%27Consumption%27%20and%20armRegionName%20eq%20%27eastus%27";

/// One retail price record
#[derive(Debug, Clone, Deserialize)]
pub struct RetailPriceRecord {
    /// Human-readable location ("East US")
    #[serde(rename = "location")]
    pub location: String,

    /// SKU name; spot offerings carry "Spot" in the name
    #[serde(rename = "skuName")]
    pub sku_name: String,

    /// Retail price in USD per hour
    #[serde(rename = "retailPrice")]
    pub retail_price: f64,

    /// When the price took effect (RFC 3339)
    #[serde(rename = "effectiveStartDate")]
    pub effective_start_date: String,
}

#[derive(Debug, Deserialize)]
struct RetailPage {
    #[serde(rename = "Items")]
    items: Vec<RetailPriceRecord>,

    #[serde(rename = "NextPageLink")]
    next_page_link: Option<String>,
}

/// Client for the paginated retail price catalog
pub struct RetailPriceFeed {
    client: reqwest::Client,
    base_url: String,
}

impl RetailPriceFeed {
    /// Feed against the default endpoint
    pub fn new() -> Self {
        Self::with_url(DEFAULT_FEED_URL)
    }

    /// Feed against a custom endpoint (tests, other regions)
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("default client configuration is valid"),
            base_url: url.into(),
        }
    }

    /// Walk every page and collect the spot SKU records
    pub async fn fetch_spot_records(&self) -> Result<Vec<RetailPriceRecord>> {
        let mut records = Vec::new();
        let mut next: Option<String> = Some(self.base_url.clone());

        while let Some(url) = next {
            debug!(url = %url, "fetching retail price page");
            let page: RetailPage = self.client.get(&url).send().await?.json().await?;
            records.extend(page.items.into_iter().filter(|r| r.sku_name.contains("Spot")));
            next = page.next_page_link.filter(|link| !link.is_empty());
        }

        debug!(count = records.len(), "retail spot records fetched");
        Ok(records)
    }

    /// Fetch spot records and map them into a comparative price catalog
    pub async fn fetch_catalog(&self) -> Result<PriceCatalog> {
        let records = self.fetch_spot_records().await?;
        Ok(PriceCatalog::from_quotes(
            records.iter().map(quote_from_record).collect(),
        ))
    }
}

impl Default for RetailPriceFeed {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a retail record into a single-interface price quote
fn quote_from_record(record: &RetailPriceRecord) -> PriceQuote {
    let timestamp = DateTime::parse_from_rfc3339(&record.effective_start_date)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|err| {
            warn!(
                sku = %record.sku_name,
                error = %err,
                "unparsable effective start date, using now"
            );
            Utc::now()
        });
    PriceQuote {
        zone: record.location.clone(),
        instance_type: record.sku_name.clone(),
        max_network_interfaces: 1,
        architectures: vec!["x86_64".to_string()],
        spot_price: record.retail_price,
        // Single interface: per-interface price equals the retail price
        price_per_interface: record.retail_price,
        timestamp,
    }
}
