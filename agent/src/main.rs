//! Worker-side runtime agent.
//!
//! Started by cloud-init on a freshly booted spot instance. Streams the
//! boot log to CloudWatch, gathers the local disks into a scratch volume,
//! fetches the jobscript and workflow from S3, runs the job as the
//! unprivileged worker user while sampling resource usage, posts exactly
//! one terminal message to the job queue, and powers the machine off.

use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use aws_config::BehaviorVersion;
use aws_config::imds::region::ImdsRegionProvider;
use hyperdrive_protocol::AgentPayload;
use hyperdrive_protocol::JobStatus;
use hyperdrive_protocol::QueueMessage;
use tracing::error;
use tracing::warn;
use tracing_subscriber::EnvFilter;

mod blockdev;
mod fetch;
mod job;
mod logs;
mod metrics;
mod storage;
mod user;

pub(crate) const CONDA_BIN: &str = "/opt/conda/bin";
pub(crate) const MOUNT_DIR: &str = "/tmp";
pub(crate) const BASE_DIR: &str = "/tmp/ec2-user";
pub(crate) const WORKFLOW_DIR: &str = "/tmp/ec2-user/workflow";
pub(crate) const JOBSCRIPT_PATH: &str = "/tmp/ec2-user/job.sh";
pub(crate) const CLOUD_INIT_LOG: &str = "/var/log/cloud-init-output.log";
pub(crate) const WORKER_USER: &str = "ec2-user";

const DEFAULT_PAYLOAD_PATH: &str = "/run/hyperdrive/payload.json";
/// Grace period for the log streamer to ship the tail of the output.
const FLUSH_GRACE: Duration = Duration::from_secs(3);

struct Clients {
    s3: aws_sdk_s3::Client,
    sqs: aws_sdk_sqs::Client,
    logs: aws_sdk_cloudwatchlogs::Client,
}

#[tokio::main]
async fn main() {
    // stdout lands in the cloud-init log, which we stream ourselves
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    let payload = match load_payload() {
        Ok(payload) => payload,
        Err(err) => {
            // without a payload there is no queue to report to; just die
            error!("cannot read agent payload: {err:#}");
            power_off().await;
            return;
        }
    };
    let clients = build_clients().await;

    let status = match run(&payload, &clients).await {
        Ok(exit) if exit.success() => JobStatus::Success,
        Ok(exit) => {
            warn!("job exited with {exit}");
            JobStatus::Failed
        }
        Err(err) => {
            error!("agent run failed: {err:#}");
            JobStatus::Failed
        }
    };

    if let Err(err) = post_terminal(&clients, &payload, status).await {
        error!("failed to post terminal status: {err:#}");
    }
    tokio::time::sleep(FLUSH_GRACE).await;
    power_off().await;
}

async fn run(payload: &AgentPayload, clients: &Clients) -> anyhow::Result<ExitStatus> {
    logs::spawn_streamer(clients.logs.clone(), payload);

    tokio::fs::create_dir_all(BASE_DIR).await?;
    storage::setup_scratch().await?;
    fetch::fetch_job(&clients.s3, payload).await?;

    let worker = user::lookup(WORKER_USER)?;
    fetch::chown_tree(Path::new(BASE_DIR), worker)?;

    println!("--JOB-START--");
    let started = Instant::now();
    let mut child = job::spawn(worker)?;
    let (status, usage) = metrics::watch_child(&mut child).await?;
    println!("--JOB-END--");
    metrics::report(&usage, started.elapsed());
    Ok(status)
}

fn load_payload() -> anyhow::Result<AgentPayload> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_PAYLOAD_PATH.to_string());
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    Ok(serde_json::from_str(&text)?)
}

/// Region comes from the instance metadata endpoint; everything else from
/// the worker instance profile.
async fn build_clients() -> Clients {
    let region = ImdsRegionProvider::builder().build();
    let config = aws_config::defaults(BehaviorVersion::latest())
        .region(region)
        .load()
        .await;
    Clients {
        s3: aws_sdk_s3::Client::new(&config),
        sqs: aws_sdk_sqs::Client::new(&config),
        logs: aws_sdk_cloudwatchlogs::Client::new(&config),
    }
}

async fn post_terminal(
    clients: &Clients,
    payload: &AgentPayload,
    status: JobStatus,
) -> anyhow::Result<()> {
    let message = QueueMessage {
        jobid: payload.jobid.clone(),
        status,
    };
    clients
        .sqs
        .send_message()
        .queue_url(&payload.sqs_url)
        .message_body(serde_json::to_string(&message)?)
        .send()
        .await?;
    Ok(())
}

async fn power_off() {
    match tokio::process::Command::new("poweroff").status().await {
        Ok(status) if status.success() => {}
        Ok(status) => error!("poweroff exited with {status}"),
        Err(err) => error!("poweroff failed to start: {err}"),
    }
}
