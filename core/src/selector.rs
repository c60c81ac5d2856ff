//! Resource-aware placement selection: intersect the job's requirements
//! with the cached catalog, price every surviving (shape, zone) pair, and
//! return the cheapest tie set.

use crate::cache::Cache;
use crate::error::HdError;
use crate::jobscript::JobRequirements;

/// Hourly prorate for gp2 EBS, from the $0.10/GiB-month list price.
pub const EBS_GB_HOUR: f64 = 0.1 / (24.0 * 30.0);

/// One launchable (shape, zone) candidate with its effective hourly cost.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub shape: String,
    pub az: String,
    pub cost: f64,
    /// GiB of gp2 to attach because the shape's own storage is short.
    pub extra_ebs: i64,
    pub instance_storage: i64,
}

/// Return every minimum-cost placement for the given requirements. The
/// caller picks one at random to spread load across the tie set.
pub async fn select_placements(
    cache: &Cache,
    req: &JobRequirements,
) -> anyhow::Result<Vec<Placement>> {
    let mut eligible = cache.shapes_matching(req.cpus, req.mem_mb).await?;

    let known_features = cache.feature_keys().await?;
    for (key, minimum) in &req.features {
        if !known_features.iter().any(|k| k == key) {
            continue;
        }
        let satisfying = cache.shapes_with_feature_at_least(key, *minimum).await?;
        eligible.retain(|(shape, _)| satisfying.iter().any(|s| s == shape));
    }
    if eligible.is_empty() {
        return Err(HdError::NoFeasibleShape {
            cpus: req.cpus,
            mem_mb: req.mem_mb,
        }
        .into());
    }

    let mut candidates = Vec::new();
    for (shape, storage_gb) in &eligible {
        let extra_ebs = (req.disk_gb - storage_gb).max(0);
        for (az, price) in cache.quotes_for_shape(shape).await? {
            candidates.push(Placement {
                shape: shape.clone(),
                az,
                cost: price + extra_ebs as f64 * EBS_GB_HOUR,
                extra_ebs,
                instance_storage: *storage_gb,
            });
        }
    }
    candidates.sort_by(|a, b| a.cost.total_cmp(&b.cost));
    let Some(cheapest) = candidates.first() else {
        return Err(HdError::AllBackedOff.into());
    };
    let cutoff = cheapest.cost;
    candidates.retain(|candidate| candidate.cost <= cutoff);
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InstanceShape;
    use crate::cache::test_support::open_temp_cache;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn requirements(cpus: i64, mem_mb: i64, disk_gb: i64) -> JobRequirements {
        JobRequirements {
            jobname: "hd-test-1".to_string(),
            cpus,
            mem_mb,
            disk_gb,
            features: BTreeMap::new(),
            extra_logs: Vec::new(),
        }
    }

    async fn seed_shape(cache: &Cache, shape: &str, cpus: i64, mem_mb: i64, storage_gb: i64) {
        cache
            .insert_instance_type(&InstanceShape {
                shape: shape.to_string(),
                cpus,
                mem_mb,
                storage_gb,
            })
            .await
            .expect("seed shape");
    }

    #[tokio::test]
    async fn returns_the_cheapest_tie_set() {
        let (_dir, cache) = open_temp_cache().await;
        seed_shape(&cache, "s1", 2, 4096, 0).await;
        seed_shape(&cache, "s2", 4, 4096, 0).await;
        for az in ["us-east-1a", "us-east-1b"] {
            cache.upsert_quote("s1", az, 0.02).await.expect("quote");
            cache.upsert_quote("s2", az, 0.04).await.expect("quote");
        }

        let mut ties = select_placements(&cache, &requirements(2, 4096, 0))
            .await
            .expect("select");
        ties.sort_by(|a, b| a.az.cmp(&b.az));
        assert_eq!(ties.len(), 2);
        assert!(ties.iter().all(|p| p.shape == "s1" && p.cost == 0.02));
        assert_eq!(ties[0].az, "us-east-1a");
        assert_eq!(ties[1].az, "us-east-1b");
        assert!(ties.iter().all(|p| p.extra_ebs == 0));
    }

    #[tokio::test]
    async fn prices_in_missing_scratch_storage() {
        let (_dir, cache) = open_temp_cache().await;
        seed_shape(&cache, "plain", 4, 8192, 0).await;
        seed_shape(&cache, "stored", 4, 8192, 75).await;
        cache
            .upsert_quote("plain", "us-east-1a", 0.02)
            .await
            .expect("quote");
        cache
            .upsert_quote("stored", "us-east-1a", 0.02)
            .await
            .expect("quote");

        // 100 GiB requested: plain needs 100 extra, stored only 25
        let ties = select_placements(&cache, &requirements(2, 4096, 100))
            .await
            .expect("select");
        assert_eq!(ties.len(), 1);
        assert_eq!(ties[0].shape, "stored");
        assert_eq!(ties[0].extra_ebs, 25);
        assert_eq!(ties[0].instance_storage, 75);
        assert_eq!(ties[0].cost, 0.02 + 25.0 * EBS_GB_HOUR);
    }

    #[tokio::test]
    async fn shape_storage_covering_the_request_means_no_extra_volume() {
        let (_dir, cache) = open_temp_cache().await;
        seed_shape(&cache, "stored", 4, 8192, 300).await;
        cache
            .upsert_quote("stored", "us-east-1a", 0.05)
            .await
            .expect("quote");

        let ties = select_placements(&cache, &requirements(2, 4096, 200))
            .await
            .expect("select");
        assert_eq!(ties[0].extra_ebs, 0);
        assert_eq!(ties[0].cost, 0.05);
    }

    #[tokio::test]
    async fn feature_requirements_narrow_the_eligible_set() {
        let (_dir, cache) = open_temp_cache().await;
        seed_shape(&cache, "slow", 4, 8192, 0).await;
        seed_shape(&cache, "fast", 4, 8192, 0).await;
        cache
            .insert_feature("fast", "net_gbps", 25.0)
            .await
            .expect("feature");
        cache
            .insert_feature("slow", "net_gbps", 5.0)
            .await
            .expect("feature");
        cache
            .upsert_quote("slow", "us-east-1a", 0.01)
            .await
            .expect("quote");
        cache
            .upsert_quote("fast", "us-east-1a", 0.03)
            .await
            .expect("quote");

        let mut req = requirements(2, 4096, 0);
        req.features.insert("net_gbps".to_string(), 10.0);
        let ties = select_placements(&cache, &req).await.expect("select");
        assert_eq!(ties.len(), 1);
        assert_eq!(ties[0].shape, "fast");
    }

    #[tokio::test]
    async fn unknown_feature_keys_are_ignored() {
        let (_dir, cache) = open_temp_cache().await;
        seed_shape(&cache, "s1", 2, 4096, 0).await;
        cache
            .upsert_quote("s1", "us-east-1a", 0.02)
            .await
            .expect("quote");

        // mem_mb rides along in the feature map but is not a catalog feature
        let mut req = requirements(2, 4096, 0);
        req.features.insert("mem_mb".to_string(), 4096.0);
        let ties = select_placements(&cache, &req).await.expect("select");
        assert_eq!(ties.len(), 1);
    }

    #[tokio::test]
    async fn infeasible_requirements_fail_with_no_feasible_shape() {
        let (_dir, cache) = open_temp_cache().await;
        seed_shape(&cache, "s1", 2, 4096, 0).await;

        let err = select_placements(&cache, &requirements(64, 4096, 0))
            .await
            .expect_err("must fail");
        assert!(matches!(
            err.downcast_ref::<HdError>(),
            Some(HdError::NoFeasibleShape { cpus: 64, .. })
        ));
    }

    #[tokio::test]
    async fn fully_backed_off_catalog_fails_with_all_backed_off() {
        let (_dir, cache) = open_temp_cache().await;
        seed_shape(&cache, "s1", 2, 4096, 0).await;
        for az in ["us-east-1a", "us-east-1b"] {
            cache.upsert_quote("s1", az, 0.02).await.expect("quote");
            cache.increment_backoff("s1", az).await.expect("backoff");
        }

        let err = select_placements(&cache, &requirements(2, 4096, 0))
            .await
            .expect_err("must fail");
        assert!(matches!(
            err.downcast_ref::<HdError>(),
            Some(HdError::AllBackedOff)
        ));
    }

    #[tokio::test]
    async fn backed_off_zone_is_excluded_from_the_tie_set() {
        let (_dir, cache) = open_temp_cache().await;
        seed_shape(&cache, "s1", 2, 4096, 0).await;
        cache
            .upsert_quote("s1", "us-east-1a", 0.02)
            .await
            .expect("quote");
        cache
            .upsert_quote("s1", "us-east-1b", 0.02)
            .await
            .expect("quote");
        cache
            .increment_backoff("s1", "us-east-1a")
            .await
            .expect("backoff");

        let ties = select_placements(&cache, &requirements(2, 4096, 0))
            .await
            .expect("select");
        assert_eq!(ties.len(), 1);
        assert_eq!(ties[0].az, "us-east-1b");
    }
}
