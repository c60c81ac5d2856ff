//! Resource sampling around the job child: every ten seconds take used
//! memory, used scratch disk and summed per-core CPU percent, and keep the
//! running maxima for the end-of-job report.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Child;
use tracing::debug;

use crate::MOUNT_DIR;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(10);
const MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceUsage {
    pub total_mem_mb: f64,
    pub peak_mem_mb: f64,
    pub total_disk_mb: f64,
    pub peak_disk_mb: f64,
    pub peak_cpu_percent: f64,
    pub cores: usize,
}

/// Wait for the child while sampling; returns its exit status plus the
/// peaks observed along the way.
pub async fn watch_child(child: &mut Child) -> anyhow::Result<(ExitStatus, ResourceUsage)> {
    let mut previous_cpu = read_cpu_times().unwrap_or_default();
    let mut usage = first_sample()?;
    loop {
        match tokio::time::timeout(SAMPLE_INTERVAL, child.wait()).await {
            Ok(status) => return Ok((status?, usage)),
            Err(_elapsed) => {
                if let Err(err) = sample(&mut usage, &mut previous_cpu) {
                    debug!("metrics sample failed: {err}");
                }
            }
        }
    }
}

pub fn report(usage: &ResourceUsage, runtime: Duration) {
    println!(
        "peak memory: {:.1}MB, {:.1}GB, {:.1}%",
        usage.peak_mem_mb,
        usage.peak_mem_mb / 1024.0,
        percent(usage.peak_mem_mb, usage.total_mem_mb)
    );
    println!(
        "peak disk: {:.1}MB, {:.1}GB, {:.1}%",
        usage.peak_disk_mb,
        usage.peak_disk_mb / 1024.0,
        percent(usage.peak_disk_mb, usage.total_disk_mb)
    );
    println!(
        "peak cpu: {:.1}% / {} cores",
        usage.peak_cpu_percent, usage.cores
    );
    println!("total runtime: {}", format_runtime(runtime));
}

fn first_sample() -> anyhow::Result<ResourceUsage> {
    let (total_mem_mb, used_mem_mb) = read_memory()?;
    let (total_disk_mb, used_disk_mb) = disk_usage(Path::new(MOUNT_DIR))?;
    Ok(ResourceUsage {
        total_mem_mb,
        peak_mem_mb: used_mem_mb,
        total_disk_mb,
        peak_disk_mb: used_disk_mb,
        peak_cpu_percent: 0.0,
        cores: read_cpu_times().map(|cores| cores.len()).unwrap_or(0),
    })
}

fn sample(usage: &mut ResourceUsage, previous_cpu: &mut Vec<CpuTimes>) -> anyhow::Result<()> {
    let (_, used_mem_mb) = read_memory()?;
    usage.peak_mem_mb = usage.peak_mem_mb.max(used_mem_mb);

    let (_, used_disk_mb) = disk_usage(Path::new(MOUNT_DIR))?;
    usage.peak_disk_mb = usage.peak_disk_mb.max(used_disk_mb);

    let current_cpu = read_cpu_times()?;
    usage.peak_cpu_percent = usage
        .peak_cpu_percent
        .max(cpu_percent_sum(previous_cpu, &current_cpu));
    *previous_cpu = current_cpu;
    Ok(())
}

fn percent(part: f64, total: f64) -> f64 {
    if total > 0.0 { 100.0 * part / total } else { 0.0 }
}

fn format_runtime(runtime: Duration) -> String {
    let secs = runtime.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// (total, used) in MiB, from /proc/meminfo.
fn read_memory() -> anyhow::Result<(f64, f64)> {
    let text = std::fs::read_to_string("/proc/meminfo")?;
    let (total_kb, available_kb) =
        parse_meminfo(&text).ok_or_else(|| anyhow::anyhow!("unreadable /proc/meminfo"))?;
    Ok((
        total_kb as f64 / 1024.0,
        (total_kb.saturating_sub(available_kb)) as f64 / 1024.0,
    ))
}

fn parse_meminfo(text: &str) -> Option<(u64, u64)> {
    let field = |name: &str| {
        text.lines().find_map(|line| {
            line.strip_prefix(name)?
                .trim_start_matches(':')
                .split_whitespace()
                .next()?
                .parse::<u64>()
                .ok()
        })
    };
    Some((field("MemTotal")?, field("MemAvailable")?))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

/// Per-core counters from /proc/stat (the aggregate `cpu` line is skipped).
fn read_cpu_times() -> anyhow::Result<Vec<CpuTimes>> {
    let text = std::fs::read_to_string("/proc/stat")?;
    Ok(parse_cpu_times(&text))
}

fn parse_cpu_times(text: &str) -> Vec<CpuTimes> {
    text.lines()
        .filter(|line| {
            line.starts_with("cpu") && line.as_bytes().get(3).is_some_and(u8::is_ascii_digit)
        })
        .map(|line| {
            let fields: Vec<u64> = line
                .split_whitespace()
                .skip(1)
                .filter_map(|field| field.parse().ok())
                .collect();
            let total: u64 = fields.iter().sum();
            let idle = fields.get(3).copied().unwrap_or(0) + fields.get(4).copied().unwrap_or(0);
            CpuTimes {
                busy: total.saturating_sub(idle),
                total,
            }
        })
        .collect()
}

/// Summed per-core busy percentage across the interval between two
/// /proc/stat readings.
fn cpu_percent_sum(previous: &[CpuTimes], current: &[CpuTimes]) -> f64 {
    previous
        .iter()
        .zip(current)
        .map(|(prev, cur)| {
            let total = cur.total.saturating_sub(prev.total);
            let busy = cur.busy.saturating_sub(prev.busy);
            if total > 0 {
                100.0 * busy as f64 / total as f64
            } else {
                0.0
            }
        })
        .sum()
}

/// (total, used) in MiB for the filesystem holding `path`.
fn disk_usage(path: &Path) -> io::Result<(f64, f64)> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut stats) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    let frsize = stats.f_frsize as u64;
    let total = stats.f_blocks as u64 * frsize;
    let used = (stats.f_blocks as u64).saturating_sub(stats.f_bfree as u64) * frsize;
    Ok((total as f64 / MB, used as f64 / MB))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn meminfo_parses_total_and_available() {
        let text = "\
MemTotal:       16316412 kB
MemFree:         1210040 kB
MemAvailable:   10794632 kB
Buffers:          514744 kB
";
        assert_eq!(parse_meminfo(text), Some((16_316_412, 10_794_632)));
    }

    #[test]
    fn meminfo_without_available_is_rejected() {
        assert_eq!(parse_meminfo("MemTotal: 100 kB\n"), None);
    }

    #[test]
    fn proc_stat_yields_one_entry_per_core() {
        let text = "\
cpu  100 0 100 800 0 0 0 0 0 0
cpu0 50 0 50 400 0 0 0 0 0 0
cpu1 50 0 50 400 0 0 0 0 0 0
intr 12345
";
        let times = parse_cpu_times(text);
        assert_eq!(times.len(), 2);
        assert_eq!(times[0], CpuTimes { busy: 100, total: 500 });
    }

    #[test]
    fn cpu_percent_sums_across_cores() {
        let previous = vec![
            CpuTimes { busy: 100, total: 500 },
            CpuTimes { busy: 100, total: 500 },
        ];
        let current = vec![
            CpuTimes { busy: 200, total: 600 },  // 100% busy over the interval
            CpuTimes { busy: 150, total: 600 },  // 50% busy
        ];
        let sum = cpu_percent_sum(&previous, &current);
        assert!((sum - 150.0).abs() < 1e-9, "{sum}");
    }

    #[test]
    fn zero_interval_contributes_nothing() {
        let times = vec![CpuTimes { busy: 10, total: 20 }];
        assert_eq!(cpu_percent_sum(&times, &times), 0.0);
    }

    #[test]
    fn runtime_formats_as_hours_minutes_seconds() {
        assert_eq!(format_runtime(Duration::from_secs(0)), "0:00:00");
        assert_eq!(format_runtime(Duration::from_secs(61)), "0:01:01");
        assert_eq!(format_runtime(Duration::from_secs(3735)), "1:02:15");
    }
}
