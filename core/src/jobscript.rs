//! Parser for the machine-readable preamble Snakemake writes into every
//! cluster jobscript: a `# properties = {...}` line carrying the rule name,
//! resource requirements and log outputs.

use std::collections::BTreeMap;

use anyhow::Context;
use anyhow::bail;
use serde_json::Value;

const PROPERTIES_PREFIX: &str = "# properties =";

const DEFAULT_CPUS: i64 = 1;
const DEFAULT_MEM_MB: i64 = 500;

/// What the scheduler needs to know about one job, derived from its script.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequirements {
    pub jobname: String,
    pub cpus: i64,
    pub mem_mb: i64,
    pub disk_gb: i64,
    /// Every numeric resource, for matching against catalog feature values.
    pub features: BTreeMap<String, f64>,
    pub extra_logs: Vec<String>,
}

pub fn parse_jobscript(script: &str) -> anyhow::Result<JobRequirements> {
    let Some(json) = script
        .lines()
        .find_map(|line| line.strip_prefix(PROPERTIES_PREFIX))
    else {
        bail!("jobscript has no `{PROPERTIES_PREFIX}` line");
    };
    let properties: Value =
        serde_json::from_str(json.trim()).context("parsing jobscript properties")?;

    let rule = properties
        .get("rule")
        .and_then(Value::as_str)
        .context("jobscript properties lack a rule name")?;
    let smk_jobid = match properties.get("jobid") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => bail!("jobscript properties lack a jobid"),
    };

    let resources = properties
        .get("resources")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let numeric = |key: &str| resources.get(key).and_then(Value::as_f64);

    let mem_mb = match (numeric("mem_mb"), numeric("mem_gb")) {
        (Some(mb), _) => mb as i64,
        (None, Some(gb)) => (gb * 1024.0) as i64,
        (None, None) => DEFAULT_MEM_MB,
    };
    let disk_gb = match (numeric("disk_gb"), numeric("disk_mb")) {
        (Some(gb), _) => gb as i64,
        (None, Some(mb)) => (mb / 1024.0).ceil() as i64,
        (None, None) => 0,
    };

    let features = resources
        .iter()
        .filter_map(|(key, value)| value.as_f64().map(|v| (key.clone(), v)))
        .collect();

    let extra_logs = match properties.get("log") {
        Some(Value::Array(paths)) => paths
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(path)) => vec![path.clone()],
        _ => Vec::new(),
    };

    Ok(JobRequirements {
        jobname: format!("hd-{rule}-{smk_jobid}"),
        cpus: properties
            .get("threads")
            .and_then(Value::as_i64)
            .unwrap_or(DEFAULT_CPUS),
        mem_mb,
        disk_gb,
        features,
        extra_logs,
    })
}
