//! Launcher: turn a jobscript into a tagged one-time spot instance running
//! the worker agent, and record the job as RUNNING.

use std::path::Path;

use anyhow::Context;
use aws_sdk_ec2::types::BlockDeviceMapping;
use aws_sdk_ec2::types::EbsBlockDevice;
use aws_sdk_ec2::types::IamInstanceProfileSpecification;
use aws_sdk_ec2::types::InstanceMarketOptionsRequest;
use aws_sdk_ec2::types::InstanceType;
use aws_sdk_ec2::types::MarketType;
use aws_sdk_ec2::types::Placement as Ec2Placement;
use aws_sdk_ec2::types::ResourceType;
use aws_sdk_ec2::types::SpotInstanceType;
use aws_sdk_ec2::types::SpotMarketOptions;
use aws_sdk_ec2::types::Tag;
use aws_sdk_ec2::types::TagSpecification;
use aws_sdk_ec2::types::VolumeType;
use aws_sdk_s3::primitives::ByteStream;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hyperdrive_protocol::AgentPayload;
use rand::seq::IndexedRandom;
use tracing::info;
use uuid::Uuid;

use crate::cache::Cache;
use crate::cache::JobLaunchParams;
use crate::cache::now_second_precision;
use crate::catalog;
use crate::cloud::CloudClients;
use crate::config::Config;
use crate::error::HdError;
use crate::jobscript;
use crate::pricing;
use crate::selector;

/// Where the worker bootstrap expects its payload; see `templates/`.
const USER_DATA_TEMPLATE: &str = include_str!("../templates/user-data.sh");
const PAYLOAD_MARKER: &str = "<PAYLOAD>";
const EXTRA_VOLUME_DEVICE: &str = "/dev/xvdz";

/// Upload the jobscript and launch an instance for it. Returns the new
/// jobid, which is the only thing printed to stdout for Snakemake.
pub async fn submit_job(
    config: &Config,
    cache: &Cache,
    clients: &CloudClients,
    jobscript: &Path,
) -> anyhow::Result<String> {
    let jobid = Uuid::new_v4().to_string();
    let script = tokio::fs::read_to_string(jobscript)
        .await
        .with_context(|| format!("reading jobscript {}", jobscript.display()))?;

    let prefix = config.s3_prefix();
    clients
        .s3
        .put_object()
        .bucket(prefix.bucket())
        .key(prefix.key(&format!("_jobs/{jobid}")))
        .body(ByteStream::from(script.into_bytes()))
        .send()
        .await?;

    request_instance(config, cache, clients, &jobid, jobscript).await?;
    Ok(jobid)
}

/// Pick a placement and issue the spot request. Used both for the initial
/// submit and for capacity retries; the jobscript object is already in
/// place from submit time.
pub async fn request_instance(
    config: &Config,
    cache: &Cache,
    clients: &CloudClients,
    jobid: &str,
    jobscript: &Path,
) -> anyhow::Result<()> {
    let script = tokio::fs::read_to_string(jobscript)
        .await
        .with_context(|| format!("reading jobscript {}", jobscript.display()))?;
    let requirements = jobscript::parse_jobscript(&script)?;

    catalog::ensure_populated(cache, &clients.ec2).await?;
    pricing::refresh(cache, &clients.ec2).await?;

    let ties = selector::select_placements(cache, &requirements).await?;
    let placement = ties.choose(&mut rand::rng()).ok_or(HdError::AllBackedOff)?;
    info!(
        "placing {jobid} on {} in {} at ${:.4}/h (extra ebs {} GiB)",
        placement.shape, placement.az, placement.cost, placement.extra_ebs
    );

    let payload = AgentPayload {
        jobid: jobid.to_string(),
        sqs_url: config.job_queue_url.clone(),
        prefix: config.prefix.clone(),
        log_group: config.log_group_name.clone(),
        extra_logs: requirements.extra_logs.clone(),
    };
    let user_data = render_user_data(&payload)?;
    let tags = job_tags(config, jobid, &requirements.jobname);

    let mut request = clients
        .ec2
        .run_instances()
        .min_count(1)
        .max_count(1)
        .security_group_ids(&config.security_group_id)
        .image_id(&config.ami_id)
        .instance_type(InstanceType::from(placement.shape.as_str()))
        .placement(
            Ec2Placement::builder()
                .availability_zone(&placement.az)
                .build(),
        )
        .user_data(BASE64.encode(&user_data))
        .iam_instance_profile(
            IamInstanceProfileSpecification::builder()
                .arn(&config.worker_profile_arn)
                .build(),
        )
        .instance_market_options(
            InstanceMarketOptionsRequest::builder()
                .market_type(MarketType::Spot)
                .spot_options(
                    SpotMarketOptions::builder()
                        .spot_instance_type(SpotInstanceType::OneTime)
                        .build(),
                )
                .build(),
        )
        .tag_specifications(
            TagSpecification::builder()
                .resource_type(ResourceType::Instance)
                .set_tags(Some(tags.clone()))
                .build(),
        )
        .tag_specifications(
            TagSpecification::builder()
                .resource_type(ResourceType::Volume)
                .set_tags(Some(tags))
                .build(),
        );
    if placement.extra_ebs > 0 {
        request = request.block_device_mappings(extra_volume_mapping(placement.extra_ebs)?);
    }

    let response = request.send().await?;
    let instance_id = response
        .instances()
        .first()
        .and_then(|instance| instance.instance_id())
        .filter(|id| !id.is_empty())
        .ok_or(HdError::LaunchRejected)?;

    cache
        .record_launch(&JobLaunchParams {
            jobid: jobid.to_string(),
            jobname: requirements.jobname,
            instance_id: instance_id.to_string(),
            orig_jobscript: jobscript.to_string_lossy().into_owned(),
            start_time: now_second_precision(),
        })
        .await?;
    Ok(())
}

fn render_user_data(payload: &AgentPayload) -> anyhow::Result<String> {
    let blob = serde_json::to_string(payload)?;
    Ok(USER_DATA_TEMPLATE.replace(PAYLOAD_MARKER, &blob))
}

fn job_tags(config: &Config, jobid: &str, jobname: &str) -> Vec<Tag> {
    let tag = |key: &str, value: &str| Tag::builder().key(key).value(value).build();
    vec![
        tag("Name", jobname),
        tag("HD-JobId", jobid),
        tag("HD-Prefix", &config.prefix),
        tag("HD-Stack", &config.stack_name),
    ]
}

fn extra_volume_mapping(extra_ebs: i64) -> anyhow::Result<BlockDeviceMapping> {
    Ok(BlockDeviceMapping::builder()
        .device_name(EXTRA_VOLUME_DEVICE)
        .ebs(
            EbsBlockDevice::builder()
                .volume_size(i32::try_from(extra_ebs).context("extra ebs size out of range")?)
                .volume_type(VolumeType::Gp2)
                .build(),
        )
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn test_config() -> Config {
        Config {
            cache: "hyperdrive.cache".into(),
            ami_id: "ami-0abc".to_string(),
            prefix: "my-bucket/runs".to_string(),
            stack_name: "hd-stack".to_string(),
            job_queue_url: "https://sqs.us-east-1.amazonaws.com/1/q".to_string(),
            log_group_name: "/hd/workers".to_string(),
            worker_profile_arn: "arn:aws:iam::1:instance-profile/w".to_string(),
            security_group_id: "sg-1".to_string(),
        }
    }

    #[test]
    fn user_data_embeds_the_payload_blob_once() {
        let payload = AgentPayload {
            jobid: "abc".to_string(),
            sqs_url: "https://queue".to_string(),
            prefix: "my-bucket/runs".to_string(),
            log_group: "/hd/workers".to_string(),
            extra_logs: vec!["logs/rule.log".to_string()],
        };
        let rendered = render_user_data(&payload).expect("render");
        assert!(!rendered.contains(PAYLOAD_MARKER), "{rendered}");
        let blob = serde_json::to_string(&payload).expect("blob");
        assert_eq!(rendered.matches(&blob).count(), 1, "{rendered}");
        assert!(rendered.contains("exec /usr/local/bin/hyperdrive-agent"));
    }

    #[test]
    fn tags_cover_instance_identification() {
        let tags = job_tags(&test_config(), "job-1", "hd-align-7");
        let pairs: Vec<(&str, &str)> = tags
            .iter()
            .map(|tag| (tag.key().unwrap_or(""), tag.value().unwrap_or("")))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("Name", "hd-align-7"),
                ("HD-JobId", "job-1"),
                ("HD-Prefix", "my-bucket/runs"),
                ("HD-Stack", "hd-stack"),
            ]
        );
    }

    #[test]
    fn extra_volume_mapping_targets_the_fixed_device() {
        let mapping = extra_volume_mapping(25).expect("mapping");
        assert_eq!(mapping.device_name(), Some("/dev/xvdz"));
        let ebs = mapping.ebs().expect("ebs");
        assert_eq!(ebs.volume_size(), Some(25));
        assert_eq!(ebs.volume_type(), Some(&VolumeType::Gp2));
    }
}
