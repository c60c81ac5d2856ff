//! Lifecycle tracker: reconcile job state from two loosely-ordered event
//! sources, the job queue and the instance-state API, and trigger retries
//! on capacity shortage or preemption.
//!
//! Both routines are gated by timed locks so the stampede of `smk-status`
//! invocations collapses to one poll per window. Ordering between the two
//! sources does not matter: whichever terminal observation reaches the
//! cache first wins and the other degrades to a no-op.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use hyperdrive_protocol::JobStatus;
use hyperdrive_protocol::QueueMessage;
use tracing::error;
use tracing::warn;

use crate::cache::Cache;
use crate::cache::now_second_precision;
use crate::cloud::CloudClients;
use crate::config::Config;
use crate::error::HdError;
use crate::launcher;
use crate::pricing;

pub const QUEUE_LOCK: &str = "sqs_status";
pub const INSTANCE_LOCK: &str = "instance_status";

/// Window for the per-job status checks Snakemake issues continuously.
pub const RECONCILE_WINDOW: Duration = Duration::from_secs(7);
/// Window for the interactive `status` table.
pub const STATUS_WINDOW: Duration = Duration::from_secs(30);

/// Drain queue messages and inspect running instances, each at most once
/// per `window` across concurrent invocations.
pub async fn reconcile(
    config: &Config,
    cache: &Cache,
    clients: &CloudClients,
    window: Duration,
) -> anyhow::Result<()> {
    check_queue(config, cache, clients, window).await?;
    check_instances(config, cache, clients, window).await?;
    Ok(())
}

/// What became of one received queue message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDisposition {
    /// The job is ours; the message was applied and must be deleted.
    Applied,
    /// Not in this cache file; leave the message for whichever scheduler
    /// invocation owns the job.
    UnknownJob,
}

pub async fn check_queue(
    config: &Config,
    cache: &Cache,
    clients: &CloudClients,
    window: Duration,
) -> anyhow::Result<()> {
    if !cache.timed_lock(QUEUE_LOCK, window).await? {
        return Ok(());
    }
    let response = clients
        .sqs
        .receive_message()
        .queue_url(&config.job_queue_url)
        .max_number_of_messages(10)
        .wait_time_seconds(2)
        .send()
        .await?;

    for message in response.messages() {
        let Some(body) = message.body() else {
            continue;
        };
        let parsed: QueueMessage = match serde_json::from_str(body) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!("leaving malformed queue message in place: {err}");
                continue;
            }
        };
        match apply_queue_message(cache, &parsed).await? {
            QueueDisposition::UnknownJob => {}
            QueueDisposition::Applied => {
                if let Some(handle) = message.receipt_handle() {
                    clients
                        .sqs
                        .delete_message()
                        .queue_url(&config.job_queue_url)
                        .receipt_handle(handle)
                        .send()
                        .await?;
                }
            }
        }
    }
    Ok(())
}

/// Fold one queue message into the cache. Idempotent: a terminal update on
/// an already-terminal job changes nothing but still counts as applied, so
/// duplicate deliveries get deleted rather than redelivered forever.
pub async fn apply_queue_message(
    cache: &Cache,
    message: &QueueMessage,
) -> anyhow::Result<QueueDisposition> {
    if cache.job_status(&message.jobid).await?.is_none() {
        return Ok(QueueDisposition::UnknownJob);
    }
    if message.status.is_terminal() {
        cache
            .mark_terminal(&message.jobid, message.status, now_second_precision())
            .await?;
    } else {
        cache
            .set_status_if_active(&message.jobid, message.status)
            .await?;
    }
    Ok(QueueDisposition::Applied)
}

/// What an instance's state reason means for its job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceDisposition {
    /// No state reason: the instance is simply running.
    Active,
    /// The worker shut itself down; the terminal status arrives (or already
    /// arrived) through the queue.
    AwaitQueue,
    /// Capacity shortage or spot preemption: back off this placement and
    /// relaunch elsewhere.
    Retry,
    /// The instance is gone for a non-retriable reason.
    Fail { surface: Option<String> },
}

pub fn classify_state_reason(code: Option<&str>, message: Option<&str>) -> InstanceDisposition {
    match code {
        None => InstanceDisposition::Active,
        Some("Client.InstanceInitiatedShutdown") => InstanceDisposition::AwaitQueue,
        Some("Server.InsufficientInstanceCapacity") | Some("Server.SpotInstanceTermination") => {
            InstanceDisposition::Retry
        }
        Some("Client.UserInitiatedShutdown") => InstanceDisposition::Fail { surface: None },
        Some(other) => InstanceDisposition::Fail {
            surface: Some(format!(
                "{other}: {}",
                message.unwrap_or("no reason message")
            )),
        },
    }
}

pub async fn check_instances(
    config: &Config,
    cache: &Cache,
    clients: &CloudClients,
    window: Duration,
) -> anyhow::Result<()> {
    if !cache.timed_lock(INSTANCE_LOCK, window).await? {
        return Ok(());
    }
    let running = cache.running_instances().await?;
    if running.is_empty() {
        return Ok(());
    }
    let job_by_instance: HashMap<String, String> = running
        .into_iter()
        .map(|(jobid, instance_id)| (instance_id, jobid))
        .collect();

    let mut pages = clients
        .ec2
        .describe_instances()
        .set_instance_ids(Some(job_by_instance.keys().cloned().collect()))
        .into_paginator()
        .send();
    while let Some(page) = pages.next().await {
        for reservation in page?.reservations() {
            for instance in reservation.instances() {
                let Some(instance_id) = instance.instance_id() else {
                    continue;
                };
                let Some(jobid) = job_by_instance.get(instance_id) else {
                    continue;
                };
                let reason = instance.state_reason();
                let disposition = classify_state_reason(
                    reason.and_then(|r| r.code()),
                    reason.and_then(|r| r.message()),
                );
                match disposition {
                    InstanceDisposition::Active | InstanceDisposition::AwaitQueue => {}
                    InstanceDisposition::Retry => {
                        cache.set_status_if_active(jobid, JobStatus::Pending).await?;
                        let shape = instance.instance_type().map(|t| t.as_str().to_string());
                        let az = instance
                            .placement()
                            .and_then(|p| p.availability_zone())
                            .map(str::to_string);
                        if let (Some(shape), Some(az)) = (shape, az) {
                            pricing::backoff(cache, &shape, &az).await?;
                        }
                        // a failed relaunch must not abort the remaining
                        // observations; the job stays PENDING and the next
                        // reconciliation tries again
                        if let Err(err) = relaunch(config, cache, clients, jobid).await {
                            error!("relaunch of job {jobid} failed: {err:#}");
                        }
                    }
                    InstanceDisposition::Fail { surface } => {
                        cache
                            .mark_terminal(jobid, JobStatus::Failed, now_second_precision())
                            .await?;
                        if let Some(reason) = surface {
                            error!("instance {instance_id} of job {jobid} died: {reason}");
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

async fn relaunch(
    config: &Config,
    cache: &Cache,
    clients: &CloudClients,
    jobid: &str,
) -> anyhow::Result<()> {
    let Some(script) = cache.orig_jobscript(jobid).await? else {
        anyhow::bail!("job {jobid} has no stored jobscript");
    };
    launcher::request_instance(config, cache, clients, jobid, Path::new(&script)).await
}

/// Authoritative local view for `smk-status`. PENDING is reported as
/// running so the workflow engine keeps waiting through a retry.
pub async fn reported_status(cache: &Cache, jobid: &str) -> anyhow::Result<&'static str> {
    match cache.job_status(jobid).await? {
        None => Err(HdError::JobNotFound.into()),
        Some(JobStatus::Success) => Ok("success"),
        Some(JobStatus::Failed) => Ok("failed"),
        Some(JobStatus::Pending | JobStatus::Running) => Ok("running"),
    }
}

/// `kill`: force the job FAILED, then terminate its instance (once).
pub async fn kill_job(cache: &Cache, clients: &CloudClients, jobid: &str) -> anyhow::Result<()> {
    let Some(job) = cache.job(jobid).await? else {
        return Err(HdError::JobNotFound.into());
    };
    cache
        .mark_terminal(jobid, JobStatus::Failed, now_second_precision())
        .await?;
    if let Some(instance_id) = job.instance_id {
        clients
            .ec2
            .terminate_instances()
            .instance_ids(instance_id)
            .send()
            .await?;
    }
    Ok(())
}
