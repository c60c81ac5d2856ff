//! Spot price oracle: rate-limited refresh of the latest quote per
//! (shape, zone), plus the backoff counter the lifecycle tracker bumps when
//! a placement turns out to be capacity-starved.

use std::collections::BTreeMap;
use std::time::Duration;
use std::time::SystemTime;

use aws_sdk_ec2::primitives::DateTime;
use aws_sdk_ec2::types::InstanceType;
use tracing::info;
use tracing::warn;

use crate::cache::Cache;

pub const SPOT_PRICES_LOCK: &str = "spot_prices";
const REFRESH_WINDOW: Duration = Duration::from_secs(30 * 60);
const PRODUCT_DESCRIPTION: &str = "Linux/UNIX (Amazon VPC)";

/// Refresh quotes for every cached shape, at most once per half hour across
/// all concurrent invocations. Losers of the timed lock keep their stale
/// quotes, which is fine: prices drift slowly compared to job turnover.
pub async fn refresh(cache: &Cache, ec2: &aws_sdk_ec2::Client) -> anyhow::Result<()> {
    if !cache.timed_lock(SPOT_PRICES_LOCK, REFRESH_WINDOW).await? {
        return Ok(());
    }
    let shapes = cache.shape_names().await?;
    if shapes.is_empty() {
        return Ok(());
    }
    info!("refreshing spot prices for {} shapes", shapes.len());

    // start == end == now makes the API return only the latest quote per
    // (shape, zone); the window must not be broadened
    let now = SystemTime::now();
    let mut pages = ec2
        .describe_spot_price_history()
        .set_instance_types(Some(
            shapes
                .iter()
                .map(|shape| InstanceType::from(shape.as_str()))
                .collect(),
        ))
        .max_results(1000)
        .start_time(DateTime::from(now))
        .end_time(DateTime::from(now))
        .product_descriptions(PRODUCT_DESCRIPTION)
        .into_paginator()
        .send();

    let mut observations = Vec::new();
    while let Some(page) = pages.next().await {
        for quote in page?.spot_price_history() {
            let (Some(shape), Some(az), Some(price), Some(at)) = (
                quote.instance_type(),
                quote.availability_zone(),
                quote.spot_price(),
                quote.timestamp(),
            ) else {
                continue;
            };
            let Ok(price) = price.parse::<f64>() else {
                warn!("ignoring unparsable spot price {price:?} for {shape:?}/{az}");
                continue;
            };
            observations.push(PriceObservation {
                shape: shape.as_str().to_string(),
                az: az.to_string(),
                price,
                at: (at.secs(), at.subsec_nanos()),
            });
        }
    }

    for ((shape, az), price) in latest_quotes(observations) {
        cache.upsert_quote(&shape, &az, price).await?;
    }
    Ok(())
}

/// Record one capacity-shortage / preemption observation against a
/// placement. The zone re-enters selection on the next successful refresh.
pub async fn backoff(cache: &Cache, shape: &str, az: &str) -> anyhow::Result<()> {
    info!("backing off {shape} in {az}");
    cache.increment_backoff(shape, az).await
}

struct PriceObservation {
    shape: String,
    az: String,
    price: f64,
    at: (i64, u32),
}

/// Keep the most recent observation per (shape, zone).
fn latest_quotes(observations: Vec<PriceObservation>) -> BTreeMap<(String, String), f64> {
    let mut latest: BTreeMap<(String, String), ((i64, u32), f64)> = BTreeMap::new();
    for observation in observations {
        let key = (observation.shape, observation.az);
        match latest.get(&key) {
            Some((at, _)) if *at >= observation.at => {}
            _ => {
                latest.insert(key, (observation.at, observation.price));
            }
        }
    }
    latest
        .into_iter()
        .map(|(key, (_, price))| (key, price))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn observation(shape: &str, az: &str, price: f64, secs: i64) -> PriceObservation {
        PriceObservation {
            shape: shape.to_string(),
            az: az.to_string(),
            price,
            at: (secs, 0),
        }
    }

    #[test]
    fn newest_observation_wins_regardless_of_order() {
        let quotes = latest_quotes(vec![
            observation("c5.large", "us-east-1a", 0.03, 200),
            observation("c5.large", "us-east-1a", 0.02, 100),
            observation("c5.large", "us-east-1a", 0.05, 150),
        ]);
        assert_eq!(
            quotes
                .get(&("c5.large".to_string(), "us-east-1a".to_string()))
                .copied(),
            Some(0.03)
        );
    }

    #[test]
    fn distinct_placements_are_kept_apart() {
        let quotes = latest_quotes(vec![
            observation("c5.large", "us-east-1a", 0.02, 100),
            observation("c5.large", "us-east-1b", 0.04, 100),
            observation("m5.large", "us-east-1a", 0.03, 100),
        ]);
        assert_eq!(quotes.len(), 3);
    }

    #[test]
    fn equal_timestamps_keep_the_first_observation() {
        let quotes = latest_quotes(vec![
            observation("c5.large", "us-east-1a", 0.02, 100),
            observation("c5.large", "us-east-1a", 0.09, 100),
        ]);
        assert_eq!(
            quotes
                .get(&("c5.large".to_string(), "us-east-1a".to_string()))
                .copied(),
            Some(0.02)
        );
    }
}
