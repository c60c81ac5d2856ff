//! Instance-shape catalog: enumerate what the region offers, keep the
//! shapes a worker can actually be, and remember them until the operator
//! clears the cache.

use std::collections::BTreeMap;

use aws_sdk_ec2::types::ArchitectureType;
use aws_sdk_ec2::types::InstanceTypeInfo;
use aws_sdk_ec2::types::RootDeviceType;
use aws_sdk_ec2::types::UsageClassType;
use tracing::info;

use crate::cache::Cache;
use crate::cache::InstanceShape;

/// Static per-shape feature values (e.g. network bandwidth class) that the
/// cloud catalog does not expose in a directly comparable form.
const FEATURES_JSON: &str = include_str!("../data/it_features.json");

type FeatureMap = BTreeMap<String, BTreeMap<String, f64>>;

/// Fetch and persist the shape catalog unless it is already cached. Shapes
/// are never re-fetched once present; operators re-run with a fresh cache
/// file to pick up new instance families.
pub async fn ensure_populated(cache: &Cache, ec2: &aws_sdk_ec2::Client) -> anyhow::Result<()> {
    if cache.count_instance_types().await? > 0 {
        return Ok(());
    }
    info!("fetching instance shape catalog");

    let features: FeatureMap = serde_json::from_str(FEATURES_JSON)?;
    let mut kept = 0usize;
    let mut pages = ec2.describe_instance_types().into_paginator().send();
    while let Some(page) = pages.next().await {
        for info in page?.instance_types() {
            if !shape_is_eligible(info) {
                continue;
            }
            let Some(shape) = shape_from(info) else {
                continue;
            };
            cache.insert_instance_type(&shape).await?;
            if let Some(values) = features.get(&shape.shape) {
                for (key, value) in values {
                    cache.insert_feature(&shape.shape, key, *value).await?;
                }
            }
            kept += 1;
        }
    }
    info!("instance shape catalog ready ({kept} shapes)");
    Ok(())
}

/// Policy filter for worker-capable shapes. All conditions are required.
fn shape_is_eligible(info: &InstanceTypeInfo) -> bool {
    let Some(processor) = info.processor_info() else {
        return false;
    };
    if !processor
        .supported_architectures()
        .contains(&ArchitectureType::X8664)
    {
        return false;
    }
    if processor.sustained_clock_speed_in_ghz().is_none() {
        return false;
    }
    if !info
        .supported_usage_classes()
        .contains(&UsageClassType::Spot)
    {
        return false;
    }
    if !info
        .supported_root_device_types()
        .contains(&RootDeviceType::Ebs)
    {
        return false;
    }
    if info.gpu_info().is_some()
        || info.fpga_info().is_some()
        || info.inference_accelerator_info().is_some()
    {
        return false;
    }
    if info.bare_metal().unwrap_or(false) {
        return false;
    }
    if info.burstable_performance_supported().unwrap_or(false) {
        return false;
    }
    true
}

fn shape_from(info: &InstanceTypeInfo) -> Option<InstanceShape> {
    let shape = info.instance_type()?.as_str().to_string();
    let cpus = i64::from(info.v_cpu_info().and_then(|v| v.default_v_cpus())?);
    let mem_mb = info.memory_info().and_then(|m| m.size_in_mib())?;
    let storage_gb = info
        .instance_storage_info()
        .and_then(|s| s.total_size_in_gb())
        .unwrap_or(0);
    Some(InstanceShape {
        shape,
        cpus,
        mem_mb,
        storage_gb,
    })
}
