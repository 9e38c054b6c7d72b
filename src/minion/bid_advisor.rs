//! Tracks on-demand and spot prices and turns them into bids.

use crate::retry::{self, RetryPolicy, retry_async};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How an autoscaling group should buy its instances.
#[derive(Debug, Clone, PartialEq)]
pub enum Bid {
    OnDemand,
    /// Bid the on-demand price so spot instances are only lost on a spike.
    Spot { price: String },
}

impl Bid {
    pub fn is_spot(&self) -> bool {
        matches!(self, Bid::Spot { .. })
    }

    /// The bid a launch configuration encodes.
    pub fn from_spot_price(spot_price: Option<&str>) -> Self {
        match spot_price {
            Some(p) if !p.is_empty() => Bid::Spot {
                price: p.to_string(),
            },
            _ => Bid::OnDemand,
        }
    }

    pub fn spot_price(&self) -> Option<&str> {
        match self {
            Bid::OnDemand => None,
            Bid::Spot { price } => Some(price),
        }
    }
}

impl fmt::Display for Bid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bid::OnDemand => write!(f, "on-demand"),
            Bid::Spot { price } => write!(f, "spot@{}", price),
        }
    }
}

/// Bids match when the type matches and, for spot, the price too.
pub fn are_bids_equal(current: &Bid, new: &Bid) -> bool {
    match (current, new) {
        (Bid::OnDemand, Bid::OnDemand) => true,
        (Bid::Spot { price: a }, Bid::Spot { price: b }) => a == b,
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpotPrice {
    pub zone: String,
    pub instance_type: String,
    pub price: f64,
    /// Seconds since the epoch.
    pub timestamp: i64,
}

#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Hourly Linux shared-tenancy prices by instance type.
    async fn on_demand_prices(&self) -> anyhow::Result<HashMap<String, f64>>;

    /// Spot price history for the last hour.
    async fn spot_prices(&self) -> anyhow::Result<Vec<SpotPrice>>;
}

#[derive(Default)]
struct PriceTable {
    on_demand: HashMap<String, f64>,
    /// Latest spot price per (zone, instance type).
    spot: HashMap<(String, String), SpotPrice>,
}

pub struct BidAdvisor {
    feed: Box<dyn PriceFeed>,
    prices: RwLock<PriceTable>,
    threshold: f64,
    spot_enabled: AtomicBool,
    retry: RetryPolicy,
}

impl BidAdvisor {
    /// Spot is chosen when `spot <= threshold * on_demand`.
    pub fn new(feed: Box<dyn PriceFeed>, threshold: f64, spot_enabled: bool) -> Self {
        Self {
            feed,
            prices: RwLock::new(PriceTable::default()),
            threshold,
            spot_enabled: AtomicBool::new(spot_enabled),
            retry: retry::NETWORK,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn set_spot_enabled(&self, enabled: bool) {
        self.spot_enabled.store(enabled, Ordering::SeqCst);
        info!("Spot instances {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn spot_enabled(&self) -> bool {
        self.spot_enabled.load(Ordering::SeqCst)
    }

    pub async fn refresh_on_demand(&self) -> anyhow::Result<()> {
        let prices = retry_async(
            self.retry,
            "fetch on-demand prices",
            || self.feed.on_demand_prices(),
            retry::always,
        )
        .await?;
        info!("On-demand pricing updated for {} instance types", prices.len());
        self.prices
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .on_demand = prices;
        Ok(())
    }

    pub async fn refresh_spot(&self) -> anyhow::Result<()> {
        let history = retry_async(
            self.retry,
            "fetch spot price history",
            || self.feed.spot_prices(),
            retry::always,
        )
        .await?;
        let mut latest: HashMap<(String, String), SpotPrice> = HashMap::new();
        for p in history {
            let key = (p.zone.clone(), p.instance_type.clone());
            match latest.get(&key) {
                Some(seen) if seen.timestamp >= p.timestamp => {}
                _ => {
                    latest.insert(key, p);
                }
            }
        }
        info!("Spot pricing updated for {} zone/type pairs", latest.len());
        self.prices.write().unwrap_or_else(|e| e.into_inner()).spot = latest;
        Ok(())
    }

    /// Refresh both tables on their own periods forever. A failed refresh
    /// keeps the previous table.
    pub async fn run(&self, on_demand_every: Duration, spot_every: Duration) {
        let on_demand = async {
            loop {
                if let Err(e) = self.refresh_on_demand().await {
                    error!("Refreshing on-demand prices failed: {:#}", e);
                }
                tokio::time::sleep(on_demand_every).await;
            }
        };
        let spot = async {
            loop {
                if let Err(e) = self.refresh_spot().await {
                    error!("Refreshing spot prices failed: {:#}", e);
                }
                tokio::time::sleep(spot_every).await;
            }
        };
        tokio::join!(on_demand, spot);
    }

    pub fn has_prices(&self) -> bool {
        let prices = self.prices.read().unwrap_or_else(|e| e.into_inner());
        !prices.on_demand.is_empty() && !prices.spot.is_empty()
    }

    /// Poll until both tables hold data.
    pub async fn wait_for_prices(&self, poll: Duration) {
        while !self.has_prices() {
            info!("Waiting for initial pricing information");
            tokio::time::sleep(poll).await;
        }
    }

    pub fn on_demand_price(&self, instance_type: &str) -> Option<f64> {
        self.prices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .on_demand
            .get(instance_type)
            .copied()
    }

    pub fn spot_price(&self, zone: &str, instance_type: &str) -> Option<f64> {
        self.prices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .spot
            .get(&(zone.to_string(), instance_type.to_string()))
            .map(|p| p.price)
    }

    /// The bid to use now. Anything unknown falls back to on-demand.
    pub fn new_bid(&self, zone: &str, instance_type: &str) -> Bid {
        if !self.spot_enabled() {
            debug!("Spot instances disabled, bidding on-demand");
            return Bid::OnDemand;
        }
        if !self.has_prices() {
            info!("Pricing data not available, bidding on-demand");
            return Bid::OnDemand;
        }
        let Some(spot) = self.spot_price(zone, instance_type) else {
            warn!("No spot price for {} in {}, bidding on-demand", instance_type, zone);
            return Bid::OnDemand;
        };
        let Some(on_demand) = self.on_demand_price(instance_type) else {
            warn!("No on-demand price for {}, bidding on-demand", instance_type);
            return Bid::OnDemand;
        };
        debug!(
            "Spot price {} and on-demand price {} for {} in {}",
            spot, on_demand, instance_type, zone
        );
        basic_bid(spot, on_demand, self.threshold)
    }
}

pub fn basic_bid(spot: f64, on_demand: f64, threshold: f64) -> Bid {
    if spot <= threshold * on_demand {
        Bid::Spot {
            price: format!("{}", on_demand),
        }
    } else {
        Bid::OnDemand
    }
}
