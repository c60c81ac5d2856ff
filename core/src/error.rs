use std::path::PathBuf;

use thiserror::Error;

/// Failures the CLI matches on to pick messages and exit codes. Everything
/// else travels as a plain [`anyhow::Error`].
#[derive(Debug, Error)]
pub enum HdError {
    #[error("config file {} not found", .0.display())]
    ConfigMissing(PathBuf),

    #[error("no instance shape satisfies cpus >= {cpus} and mem_mb >= {mem_mb}")]
    NoFeasibleShape { cpus: i64, mem_mb: i64 },

    #[error("every candidate spot placement is backing off; try again later")]
    AllBackedOff,

    #[error("spot request returned no instance id")]
    LaunchRejected,

    #[error("no log data")]
    NoLogData,

    #[error("job not found")]
    JobNotFound,
}
