//! Periodic log of the prices behind each managed group's bid.

use crate::minion::MinionManager;
use crate::minion::bid_advisor::Bid;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct PriceReport {
    pub asg: String,
    pub zone: String,
    pub instance_type: String,
    pub spot_price: Option<f64>,
    pub on_demand_price: Option<f64>,
    pub recommendation: Bid,
}

pub struct PriceReporter {
    manager: Arc<MinionManager>,
}

impl PriceReporter {
    pub fn new(manager: Arc<MinionManager>) -> Self {
        Self { manager }
    }

    /// Prices and recommendation for every managed group with a zone.
    pub fn report(&self) -> Vec<PriceReport> {
        let advisor = self.manager.advisor();
        self.manager
            .groups()
            .iter()
            .filter_map(|g| {
                let zone = g.zones.first()?.clone();
                let instance_type = g.state().launch_config.instance_type;
                Some(PriceReport {
                    asg: g.name.clone(),
                    spot_price: advisor.spot_price(&zone, &instance_type),
                    on_demand_price: advisor.on_demand_price(&instance_type),
                    recommendation: advisor.new_bid(&zone, &instance_type),
                    zone,
                    instance_type,
                })
            })
            .collect()
    }

    pub async fn run(&self, period: Duration) {
        loop {
            for r in self.report() {
                info!(
                    asg = %r.asg,
                    "{} in {}: spot {}, on-demand {}, recommending {}",
                    r.instance_type,
                    r.zone,
                    price(r.spot_price),
                    price(r.on_demand_price),
                    r.recommendation
                );
            }
            tokio::time::sleep(period).await;
        }
    }
}

fn price(p: Option<f64>) -> String {
    p.map(|p| format!("{}", p))
        .unwrap_or_else(|| "unknown".to_string())
}
