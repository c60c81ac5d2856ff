//! The `hyperdrive` multitool: Snakemake submits, polls and kills cluster
//! jobs through these subcommands, and operators use the same binary to
//! configure the stack and inspect jobs.

use std::os::unix::process::CommandExt;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use chrono::SecondsFormat;
use chrono::TimeZone;
use clap::Parser;
use hyperdrive_core::Cache;
use hyperdrive_core::CloudClients;
use hyperdrive_core::Config;
use hyperdrive_core::HdError;
use hyperdrive_core::catalog;
use hyperdrive_core::config;
use hyperdrive_core::config::ConfigParams;
use hyperdrive_core::launcher;
use hyperdrive_core::lifecycle;
use hyperdrive_core::pricing;
use hyperdrive_core::workflow;
use tracing_subscriber::EnvFilter;

mod table;

#[derive(Debug, Parser)]
#[clap(
    name = "hyperdrive",
    version,
    about = "Spot-instance cluster executor for Snakemake"
)]
struct Cli {
    /// Path to the scheduler config file.
    #[arg(long, global = true, default_value = "hyperdrive.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Create or update the config from a deployed stack.
    Config(ConfigArgs),

    /// Sync the workflow and hand over to snakemake.
    Snakemake(SnakemakeArgs),

    /// Submit one jobscript; prints the new jobid.
    SubmitJob { jobscript: PathBuf },

    /// Report a job status for snakemake's --cluster-status.
    SmkStatus { jobid: String },

    /// List jobs.
    Status,

    /// Delete finished jobs from the cache.
    CleanCache,

    /// Kill a job and terminate its instance.
    Kill { jobid: String },

    /// Print logs from a job.
    Log(LogArgs),
}

#[derive(Debug, clap::Args)]
struct ConfigArgs {
    #[arg(long = "stack-name")]
    stack_name: String,

    /// Bucket, optionally with a key prefix: `bucket[/prefix]`.
    #[arg(long)]
    prefix: String,

    /// Worker machine image.
    #[arg(long)]
    ami: String,

    #[arg(long, default_value = "hyperdrive.cache")]
    cache: PathBuf,
}

#[derive(Debug, clap::Args)]
struct SnakemakeArgs {
    /// Arguments forwarded to snakemake.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[derive(Debug, clap::Args)]
struct LogArgs {
    /// How many log events to fetch.
    #[arg(short = 'n', long = "lines", default_value_t = 10)]
    lines: i32,

    /// Read from the start of the stream instead of the tail.
    #[arg(long)]
    head: bool,

    jobid: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();
    let pname = program_name();
    match run(cli, &pname).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let message = match err.downcast_ref::<HdError>() {
                Some(HdError::ConfigMissing(_)) => format!("run \"{pname} config\" first"),
                _ => format!("{err:#}"),
            };
            eprintln!("{pname}: {message}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, pname: &str) -> anyhow::Result<()> {
    if let Command::Config(args) = &cli.command {
        let clients = CloudClients::from_env().await;
        config::create(
            &clients,
            ConfigParams {
                stack_name: args.stack_name.clone(),
                prefix: args.prefix.clone(),
                ami_id: args.ami.clone(),
                cache: args.cache.clone(),
            },
            &cli.config,
        )
        .await?;
        return Ok(());
    }

    // every other subcommand needs the config and the cache
    let config = Config::load(&cli.config)?;
    let cache = Cache::open(&config.cache).await?;
    let clients = CloudClients::from_env().await;

    match cli.command {
        Command::Config(_) => unreachable!("handled above"),

        Command::Snakemake(args) => run_snakemake(&config, &cache, &clients, &cli.config, args).await,

        Command::SubmitJob { jobscript } => {
            let jobid = launcher::submit_job(&config, &cache, &clients, &jobscript).await?;
            println!("{jobid}");
            Ok(())
        }

        Command::SmkStatus { jobid } => {
            lifecycle::reconcile(&config, &cache, &clients, lifecycle::RECONCILE_WINDOW).await?;
            println!("{}", lifecycle::reported_status(&cache, &jobid).await?);
            Ok(())
        }

        Command::Status => {
            lifecycle::reconcile(&config, &cache, &clients, lifecycle::STATUS_WINDOW).await?;
            print_status_table(&cache).await
        }

        Command::CleanCache => {
            cache.delete_terminal_jobs().await?;
            Ok(())
        }

        Command::Kill { jobid } => lifecycle::kill_job(&cache, &clients, &jobid).await,

        Command::Log(args) => print_log(&config, &cache, &clients, args).await,
    }
}

async fn print_status_table(cache: &Cache) -> anyhow::Result<()> {
    let jobs = cache.list_jobs().await?;
    if jobs.is_empty() {
        return Ok(());
    }
    let format_time = |time: Option<chrono::DateTime<chrono::Utc>>| {
        time.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default()
    };
    let mut rows = vec![
        ["jobid", "jobname", "status", "start_time", "end_time"]
            .map(str::to_string)
            .to_vec(),
    ];
    for job in jobs {
        rows.push(vec![
            job.jobid,
            job.jobname,
            job.status.as_str().to_string(),
            format_time(job.start_time),
            format_time(job.end_time),
        ]);
    }
    print!("{}", table::render(&rows));
    Ok(())
}

async fn print_log(
    config: &Config,
    cache: &Cache,
    clients: &CloudClients,
    args: LogArgs,
) -> anyhow::Result<()> {
    let response = match clients
        .logs
        .get_log_events()
        .log_group_name(&config.log_group_name)
        .log_stream_name(&args.jobid)
        .limit(args.lines)
        .start_from_head(args.head)
        .send()
        .await
    {
        Ok(response) => response,
        Err(err) => {
            let service = err.into_service_error();
            if service.is_resource_not_found_exception() {
                return Err(HdError::NoLogData.into());
            }
            return Err(service.into());
        }
    };

    for event in response.events() {
        let secs = (event.timestamp().unwrap_or(0) as f64 / 1000.0).round() as i64;
        let when = chrono::Local
            .timestamp_opt(secs, 0)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        let message = event.message().unwrap_or("");
        println!("{when} | {}", message.trim_end_matches('\n'));
    }
    println!("------");
    if let Some(status) = cache.job_status(&args.jobid).await? {
        println!("status: {}", status.as_str());
    }
    Ok(())
}

async fn run_snakemake(
    config: &Config,
    cache: &Cache,
    clients: &CloudClients,
    config_path: &Path,
    args: SnakemakeArgs,
) -> anyhow::Result<()> {
    let dry_run = args.args.iter().any(|arg| arg == "-n" || arg == "--dry-run");
    if !dry_run {
        workflow::sync_workdir(config, clients, Path::new("."), config_path).await?;
        catalog::ensure_populated(cache, &clients.ec2).await?;
        pricing::refresh(cache, &clients.ec2).await?;
    }

    // snakemake calls back into this same binary for submit and status
    let self_exe = std::env::args()
        .next()
        .context("argv is empty, cannot locate the hyperdrive binary")?;
    let err = std::process::Command::new("snakemake")
        .args(["--default-remote-provider", "S3"])
        .args(["--default-remote-prefix", &config.prefix])
        .args(["--config", &format!("DEFAULT_REMOTE_PREFIX={}", config.prefix)])
        .arg("--no-shared-fs")
        .arg("--use-conda")
        .arg("--use-singularity")
        .args(["--max-status-checks-per-second", "1"])
        .args(["--cluster", &format!("{self_exe} submit-job")])
        .args(["--cluster-status", &format!("{self_exe} smk-status")])
        .args(["--jobs", "1000000"])
        .args(&args.args)
        .exec();
    Err(anyhow::Error::new(err).context("failed to exec snakemake"))
}

fn program_name() -> String {
    std::env::args()
        .next()
        .as_deref()
        .map(Path::new)
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "hyperdrive".to_string())
}

fn init_logging() {
    let default_filter = "error,hyperdrive=info";
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}
