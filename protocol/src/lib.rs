//! Types shared between the scheduler and the worker-side runtime agent.
//!
//! Everything here crosses a process or wire boundary: the job status queue
//! message, the payload baked into the instance user-data, and the object
//! storage prefix both sides resolve keys against.

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Lifecycle status of a job as tracked by the scheduler.
///
/// `PENDING` means the job lost its instance and is awaiting a retry launch;
/// Snakemake never sees it (it is reported as `running`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid job status: {0}")]
pub struct ParseJobStatusError(String);

impl JobStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ParseJobStatusError> {
        match value {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            _ => Err(ParseJobStatusError(value.to_string())),
        }
    }

    /// Terminal states are never left once entered.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }
}

/// One message on the job queue. The agent posts exactly one per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub jobid: String,
    pub status: JobStatus,
}

/// The single JSON blob substituted into the cloud-init template and read by
/// the agent from its payload file on boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentPayload {
    pub jobid: String,
    pub sqs_url: String,
    pub prefix: String,
    pub log_group: String,
    pub extra_logs: Vec<String>,
}

/// An S3 location of the form `bucket` or `bucket/key/prefix`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Prefix {
    bucket: String,
    key_prefix: String,
}

impl S3Prefix {
    pub fn parse(prefix: &str) -> Self {
        match prefix.split_once('/') {
            Some((bucket, key_prefix)) => Self {
                bucket: bucket.to_string(),
                key_prefix: key_prefix.to_string(),
            },
            None => Self {
                bucket: prefix.to_string(),
                key_prefix: String::new(),
            },
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Build a full object key under this prefix.
    pub fn key(&self, tail: &str) -> String {
        if self.key_prefix.is_empty() {
            tail.to_string()
        } else {
            format!("{}/{tail}", self.key_prefix.trim_end_matches('/'))
        }
    }
}
