//! The YAML config file written by `config` and read by every other
//! subcommand, plus the stack-validation flow that creates it.

use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::bail;
use hyperdrive_protocol::S3Prefix;
use serde::Deserialize;
use serde::Serialize;

use crate::cloud::CloudClients;
use crate::error::HdError;

/// Output keys the deployed stack may expose; anything else means the
/// stack was not built from the worker template. `group` is carried by the
/// template but unused here.
const EXPECTED_STACK_OUTPUTS: [&str; 5] = [
    "jobQueueUrl",
    "logGroupName",
    "workerProfileArn",
    "securityGroupId",
    "group",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub cache: PathBuf,
    pub ami_id: String,
    pub prefix: String,
    pub stack_name: String,
    pub job_queue_url: String,
    pub log_group_name: String,
    pub worker_profile_arn: String,
    pub security_group_id: String,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Err(HdError::ConfigMissing(path.to_path_buf()).into());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    pub fn store(&self, path: &Path) -> anyhow::Result<()> {
        let text = serde_yaml::to_string(self)?;
        std::fs::write(path, text)
            .with_context(|| format!("writing config file {}", path.display()))?;
        Ok(())
    }

    pub fn s3_prefix(&self) -> S3Prefix {
        S3Prefix::parse(&self.prefix)
    }
}

/// Inputs the operator supplies to the `config` subcommand.
#[derive(Debug)]
pub struct ConfigParams {
    pub stack_name: String,
    pub prefix: String,
    pub ami_id: String,
    pub cache: PathBuf,
}

/// Validate the stack and bucket, read the stack outputs, and write the
/// config file.
pub async fn create(
    clients: &CloudClients,
    params: ConfigParams,
    path: &Path,
) -> anyhow::Result<Config> {
    let stacks = match clients
        .cloudformation
        .describe_stacks()
        .stack_name(&params.stack_name)
        .send()
        .await
    {
        Ok(response) => response,
        Err(_) => bail!("stack not found"),
    };

    let bucket = S3Prefix::parse(&params.prefix).bucket().to_string();
    if clients.s3.head_bucket().bucket(&bucket).send().await.is_err() {
        bail!("cant access bucket: {bucket}");
    }

    let Some(stack) = stacks.stacks().first() else {
        bail!("stack not found");
    };

    let mut job_queue_url = None;
    let mut log_group_name = None;
    let mut worker_profile_arn = None;
    let mut security_group_id = None;
    for output in stack.outputs() {
        let (Some(key), Some(value)) = (output.output_key(), output.output_value()) else {
            continue;
        };
        if !EXPECTED_STACK_OUTPUTS.contains(&key) {
            bail!("stack does not match the expected outputs (unexpected key {key})");
        }
        match key {
            "jobQueueUrl" => job_queue_url = Some(value.to_string()),
            "logGroupName" => log_group_name = Some(value.to_string()),
            "workerProfileArn" => worker_profile_arn = Some(value.to_string()),
            "securityGroupId" => security_group_id = Some(value.to_string()),
            _ => {}
        }
    }
    let (Some(job_queue_url), Some(log_group_name), Some(worker_profile_arn), Some(security_group_id)) =
        (job_queue_url, log_group_name, worker_profile_arn, security_group_id)
    else {
        bail!("stack does not match the expected outputs");
    };

    let config = Config {
        cache: params.cache,
        ami_id: params.ami_id,
        prefix: params.prefix,
        stack_name: params.stack_name,
        job_queue_url,
        log_group_name,
        worker_profile_arn,
        security_group_id,
    };
    config.store(path)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = "\
cache: hyperdrive.cache
amiId: ami-0abc123
prefix: my-bucket/runs
stackName: hd-stack
jobQueueUrl: https://sqs.us-east-1.amazonaws.com/1234/hd-queue
logGroupName: /hd/workers
workerProfileArn: arn:aws:iam::1234:instance-profile/hd-worker
securityGroupId: sg-0def456
";

    #[test]
    fn parses_the_documented_yaml_keys() {
        let config: Config = serde_yaml::from_str(SAMPLE).expect("parse config");
        assert_eq!(config.cache, PathBuf::from("hyperdrive.cache"));
        assert_eq!(config.ami_id, "ami-0abc123");
        assert_eq!(config.stack_name, "hd-stack");
        assert_eq!(config.log_group_name, "/hd/workers");
        assert_eq!(config.s3_prefix().bucket(), "my-bucket");
        assert_eq!(config.s3_prefix().key("_jobs/x"), "runs/_jobs/x");
    }

    #[test]
    fn round_trips_through_yaml() {
        let config: Config = serde_yaml::from_str(SAMPLE).expect("parse config");
        let text = serde_yaml::to_string(&config).expect("serialize config");
        let back: Config = serde_yaml::from_str(&text).expect("reparse config");
        assert_eq!(back.job_queue_url, config.job_queue_url);
        assert_eq!(back.security_group_id, config.security_group_id);
        // the emitted keys stay camelCase for compatibility with old files
        assert!(text.contains("amiId:"), "{text}");
        assert!(text.contains("jobQueueUrl:"), "{text}");
    }

    #[test]
    fn missing_file_maps_to_config_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = Config::load(&dir.path().join("absent.yaml")).expect_err("must fail");
        assert!(matches!(
            err.downcast_ref::<HdError>(),
            Some(HdError::ConfigMissing(_))
        ));
    }
}
