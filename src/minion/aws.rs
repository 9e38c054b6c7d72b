//! AWS backed price feed and autoscaling operations.

use crate::minion::bid_advisor::{PriceFeed, SpotPrice};
use crate::minion::scaling::{GroupInfo, InstanceInfo, LaunchConfigInfo, ScalingApi};
use anyhow::Context;
use async_trait::async_trait;
use aws_sdk_autoscaling::types::LaunchConfiguration;
use aws_sdk_ec2::types::InstanceLifecycleType;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::time::Duration;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::{debug, info};

pub const PRICING_URL: &str =
    "https://pricing.us-east-1.amazonaws.com/offers/v1.0/aws/AmazonEC2/current/index.csv";
/// Offer term code and rate code of the plain hourly on-demand rate.
const HOURLY_RATE_CODE: &str = "JRTCKXETXF.6YS6EN2CT7";
const LINUX_VPC: &str = "Linux/UNIX (Amazon VPC)";

/// The price list only knows regions by their long names.
const REGION_NAMES: &[(&str, &str)] = &[
    ("ap-northeast-1", "Asia Pacific (Tokyo)"),
    ("ap-northeast-2", "Asia Pacific (Seoul)"),
    ("ap-south-1", "Asia Pacific (Mumbai)"),
    ("ap-southeast-1", "Asia Pacific (Singapore)"),
    ("ap-southeast-2", "Asia Pacific (Sydney)"),
    ("ca-central-1", "Canada (Central)"),
    ("eu-central-1", "EU (Frankfurt)"),
    ("eu-west-1", "EU (Ireland)"),
    ("eu-west-2", "EU (London)"),
    ("sa-east-1", "South America (Sao Paulo)"),
    ("us-east-1", "US East (N. Virginia)"),
    ("us-east-2", "US East (Ohio)"),
    ("us-west-1", "US West (N. California)"),
    ("us-west-2", "US West (Oregon)"),
];

pub fn region_long_name(region: &str) -> Option<&'static str> {
    REGION_NAMES
        .iter()
        .find(|(short, _)| *short == region)
        .map(|(_, long)| *long)
}

/// Extract hourly Linux shared-tenancy prices for one region from the EC2
/// price list. Preamble lines before the header are skipped.
pub fn parse_on_demand_csv<R: BufRead>(
    mut reader: R,
    region_long: &str,
) -> anyhow::Result<HashMap<String, f64>> {
    let mut line = String::new();
    let header = loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            anyhow::bail!("price list has no header line");
        }
        if line.contains("PriceDescription") {
            break line.trim_end().replace('"', "");
        }
    };
    let columns: Vec<&str> = header.split(',').collect();
    let col = |name: &str| {
        columns
            .iter()
            .position(|c| *c == name)
            .with_context(|| format!("price list has no {} column", name))
    };
    let (rate_code, term_type, location) = (col("RateCode")?, col("TermType")?, col("Location")?);
    let (os, tenancy) = (col("Operating System")?, col("Tenancy")?);
    let (instance_type, price) = (col("Instance Type")?, col("PricePerUnit")?);

    let mut csv = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);
    let mut prices = HashMap::new();
    for record in csv.records() {
        let record = record?;
        let field = |i: usize| record.get(i).unwrap_or("");
        if field(rate_code).contains(HOURLY_RATE_CODE)
            && field(term_type).contains("OnDemand")
            && field(location).contains(region_long)
            && field(os) == "Linux"
            && field(tenancy) == "Shared"
            && let Ok(p) = field(price).parse::<f64>()
        {
            prices.insert(field(instance_type).to_string(), p);
        }
    }
    Ok(prices)
}

pub struct AwsPriceFeed {
    http: reqwest::Client,
    ec2: aws_sdk_ec2::Client,
    region_long: &'static str,
    url: String,
}

impl AwsPriceFeed {
    pub fn new(sdk: &aws_config::SdkConfig, region: &str) -> anyhow::Result<Self> {
        let region_long = region_long_name(region)
            .with_context(|| format!("no price list name for region {}", region))?;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            ec2: aws_sdk_ec2::Client::new(sdk),
            region_long,
            url: PRICING_URL.to_string(),
        })
    }
}

#[async_trait]
impl PriceFeed for AwsPriceFeed {
    async fn on_demand_prices(&self) -> anyhow::Result<HashMap<String, f64>> {
        let resp = self.http.get(&self.url).send().await?.error_for_status()?;
        // The list is large; parse it while it streams in.
        let stream = Box::pin(resp.bytes_stream().map_err(std::io::Error::other));
        let reader = SyncIoBridge::new(StreamReader::new(stream));
        let region = self.region_long;
        tokio::task::spawn_blocking(move || parse_on_demand_csv(BufReader::new(reader), region))
            .await?
    }

    async fn spot_prices(&self) -> anyhow::Result<Vec<SpotPrice>> {
        let start = aws_sdk_ec2::primitives::DateTime::from_secs(Utc::now().timestamp() - 3600);
        let mut token: Option<String> = None;
        let mut prices = Vec::new();
        loop {
            let out = self
                .ec2
                .describe_spot_price_history()
                .product_descriptions(LINUX_VPC)
                .start_time(start)
                .set_next_token(token.take())
                .send()
                .await?;
            for p in out.spot_price_history() {
                let (Some(zone), Some(instance_type), Some(price)) =
                    (p.availability_zone(), p.instance_type(), p.spot_price())
                else {
                    continue;
                };
                let Ok(price) = price.parse::<f64>() else {
                    continue;
                };
                prices.push(SpotPrice {
                    zone: zone.to_string(),
                    instance_type: instance_type.as_str().to_string(),
                    price,
                    timestamp: p.timestamp().map(|t| t.secs()).unwrap_or(0),
                });
            }
            match out.next_token() {
                Some(t) if !t.is_empty() => token = Some(t.to_string()),
                _ => break,
            }
        }
        debug!("Fetched {} spot price samples", prices.len());
        Ok(prices)
    }
}

/// Smooths over SDK accessors that return either `&str` or `Option<&str>`.
trait OptString {
    fn opt_string(self) -> Option<String>;
}

impl OptString for &str {
    fn opt_string(self) -> Option<String> {
        Some(self.to_string()).filter(|s| !s.is_empty())
    }
}

impl OptString for Option<&str> {
    fn opt_string(self) -> Option<String> {
        self.and_then(|s| s.opt_string())
    }
}

trait OptI32 {
    fn opt_i32(self) -> Option<i32>;
}

impl OptI32 for i32 {
    fn opt_i32(self) -> Option<i32> {
        Some(self)
    }
}

impl OptI32 for Option<i32> {
    fn opt_i32(self) -> Option<i32> {
        self
    }
}

pub struct AwsScaling {
    autoscaling: aws_sdk_autoscaling::Client,
    ec2: aws_sdk_ec2::Client,
}

impl AwsScaling {
    pub fn new(sdk: &aws_config::SdkConfig) -> Self {
        Self {
            autoscaling: aws_sdk_autoscaling::Client::new(sdk),
            ec2: aws_sdk_ec2::Client::new(sdk),
        }
    }

    async fn fetch_launch_config(&self, name: &str) -> anyhow::Result<LaunchConfiguration> {
        let out = self
            .autoscaling
            .describe_launch_configurations()
            .launch_configuration_names(name)
            .send()
            .await?;
        out.launch_configurations()
            .first()
            .cloned()
            .with_context(|| format!("launch configuration {} not found", name))
    }
}

#[async_trait]
impl ScalingApi for AwsScaling {
    async fn describe_groups(&self, names: &[String]) -> anyhow::Result<Vec<GroupInfo>> {
        let out = self
            .autoscaling
            .describe_auto_scaling_groups()
            .set_auto_scaling_group_names(Some(names.to_vec()))
            .send()
            .await?;
        Ok(out
            .auto_scaling_groups()
            .iter()
            .map(|g| GroupInfo {
                name: g.auto_scaling_group_name().opt_string().unwrap_or_default(),
                launch_config_name: g.launch_configuration_name().opt_string(),
                zones: g.availability_zones().to_vec(),
                desired_capacity: g.desired_capacity().opt_i32().unwrap_or(0),
                instance_ids: g
                    .instances()
                    .iter()
                    .filter_map(|i| i.instance_id().opt_string())
                    .collect(),
            })
            .collect())
    }

    async fn describe_launch_config(&self, name: &str) -> anyhow::Result<LaunchConfigInfo> {
        let lc = self.fetch_launch_config(name).await?;
        Ok(LaunchConfigInfo {
            name: lc.launch_configuration_name().opt_string().unwrap_or_default(),
            instance_type: lc.instance_type().opt_string().unwrap_or_default(),
            spot_price: lc.spot_price().opt_string(),
        })
    }

    async fn create_launch_config(
        &self,
        from: &str,
        new_name: &str,
        spot_price: Option<&str>,
    ) -> anyhow::Result<()> {
        let src = self.fetch_launch_config(from).await?;
        let res = self
            .autoscaling
            .create_launch_configuration()
            .launch_configuration_name(new_name)
            .set_image_id(src.image_id().opt_string())
            .set_key_name(src.key_name().opt_string())
            .set_security_groups(Some(src.security_groups().to_vec()))
            .set_user_data(src.user_data().opt_string())
            .set_instance_type(src.instance_type().opt_string())
            .set_block_device_mappings(Some(src.block_device_mappings().to_vec()))
            .set_instance_monitoring(src.instance_monitoring().cloned())
            .set_spot_price(spot_price.map(str::to_string))
            .set_iam_instance_profile(src.iam_instance_profile().opt_string())
            .set_ebs_optimized(src.ebs_optimized())
            .set_associate_public_ip_address(src.associate_public_ip_address())
            .send()
            .await;
        match res {
            Ok(_) => info!("Created launch configuration {}", new_name),
            Err(err) => {
                let err = err.into_service_error();
                if !err.is_already_exists_fault() {
                    return Err(err.into());
                }
                info!("Launch configuration {} already exists, reusing it", new_name);
            }
        }
        Ok(())
    }

    async fn update_group_launch_config(
        &self,
        group: &str,
        launch_config: &str,
    ) -> anyhow::Result<()> {
        self.autoscaling
            .update_auto_scaling_group()
            .auto_scaling_group_name(group)
            .launch_configuration_name(launch_config)
            .send()
            .await?;
        info!(asg = %group, "Now using launch configuration {}", launch_config);
        Ok(())
    }

    async fn delete_launch_config(&self, name: &str) -> anyhow::Result<()> {
        self.autoscaling
            .delete_launch_configuration()
            .launch_configuration_name(name)
            .send()
            .await?;
        info!("Deleted launch configuration {}", name);
        Ok(())
    }

    async fn describe_instances(&self, ids: &[String]) -> anyhow::Result<Vec<InstanceInfo>> {
        let out = self
            .ec2
            .describe_instances()
            .set_instance_ids(Some(ids.to_vec()))
            .send()
            .await?;
        let mut instances = Vec::new();
        for i in out.reservations().iter().flat_map(|r| r.instances()) {
            let Some(id) = i.instance_id() else {
                continue;
            };
            let launch_time = i
                .launch_time()
                .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), 0))
                .unwrap_or_else(Utc::now);
            instances.push(InstanceInfo {
                id: id.to_string(),
                zone: i
                    .placement()
                    .and_then(|p| p.availability_zone())
                    .unwrap_or_default()
                    .to_string(),
                instance_type: i
                    .instance_type()
                    .map(|t| t.as_str().to_string())
                    .unwrap_or_default(),
                launch_time,
                spot: i.instance_lifecycle() == Some(&InstanceLifecycleType::Spot),
            });
        }
        Ok(instances)
    }

    async fn terminate_instance(&self, id: &str) -> anyhow::Result<()> {
        self.ec2.terminate_instances().instance_ids(id).send().await?;
        Ok(())
    }
}
