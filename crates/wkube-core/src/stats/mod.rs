//! Resource-usage reporting.
//!
//! Sketch-level cgroup v2 reads plus a `du` shell-out for the working
//! directory, assembled into one JSON report logged at finalization. Nothing
//! here is load-bearing for the job outcome; failures are logged and
//! swallowed by the caller.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

const CGROUP_CONTROLLERS: &str = "/sys/fs/cgroup/cgroup.controllers";
const MEMORY_CURRENT: &str = "/sys/fs/cgroup/memory.current";
const MEMORY_MAX: &str = "/sys/fs/cgroup/memory.max";
const CPU_STAT: &str = "/sys/fs/cgroup/cpu.stat";

/// Window over which the CPU usage delta is sampled.
const CPU_SAMPLE_WINDOW: Duration = Duration::from_secs(1);

/// One point-in-time resource report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatReport {
    /// When the report was taken.
    pub timestamp: DateTime<Utc>,

    /// Working-directory disk usage.
    pub working_dir: DiskUsage,

    /// Container memory usage.
    pub memory: MemUsage,

    /// CPU usage over the sampling window, percent of one core.
    pub cpu_percent: f64,

    /// Microseconds the container spent throttled during the window.
    pub cpu_throttled_usec: u64,
}

/// Disk usage of the working directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskUsage {
    /// Bytes used.
    pub used_bytes: u64,
}

/// Memory usage against the cgroup limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemUsage {
    /// Bytes currently charged.
    pub used: u64,

    /// Limit in bytes; equals `used` when the cgroup is unlimited.
    pub total: u64,

    /// Used as a percentage of the limit.
    pub used_percent: f64,
}

fn is_cgroup_v2() -> bool {
    std::path::Path::new(CGROUP_CONTROLLERS).exists()
}

fn read_memory() -> Result<(u64, u64, f64), StatsError> {
    let used: u64 = read_trimmed(MEMORY_CURRENT)?.parse().unwrap_or(0);
    let limit_raw = read_trimmed(MEMORY_MAX)?;

    if limit_raw == "max" {
        return Ok((used, used, 100.0));
    }

    let limit: u64 = limit_raw.parse().unwrap_or(0);
    let percent = if limit == 0 {
        0.0
    } else {
        used as f64 / limit as f64 * 100.0
    };
    Ok((used, limit, percent))
}

fn read_trimmed(path: &str) -> Result<String, StatsError> {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|source| StatsError::Read {
            path: path.to_string(),
            source,
        })
}

/// Pull `usage_usec` and `throttled_usec` out of a `cpu.stat` body.
fn parse_cpu_stat(contents: &str) -> (u64, u64) {
    let mut usage = 0;
    let mut throttled = 0;
    for line in contents.lines() {
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some("usage_usec"), Some(value)) => usage = value.parse().unwrap_or(0),
            (Some("throttled_usec"), Some(value)) => throttled = value.parse().unwrap_or(0),
            _ => {},
        }
    }
    (usage, throttled)
}

async fn sample_cpu() -> Result<(f64, u64), StatsError> {
    let (start_usage, start_throttled) = parse_cpu_stat(&read_trimmed(CPU_STAT)?);
    tokio::time::sleep(CPU_SAMPLE_WINDOW).await;
    let (end_usage, end_throttled) = parse_cpu_stat(&read_trimmed(CPU_STAT)?);

    let delta_seconds = (end_usage.saturating_sub(start_usage)) as f64 / 1_000_000.0;
    let percent = delta_seconds / CPU_SAMPLE_WINDOW.as_secs_f64() * 100.0;
    Ok((percent, end_throttled.saturating_sub(start_throttled)))
}

async fn working_dir_usage() -> Result<u64, StatsError> {
    let output = tokio::process::Command::new("du")
        .args(["-sb", "."])
        .output()
        .await
        .map_err(StatsError::Du)?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .split_whitespace()
        .next()
        .and_then(|field| field.parse().ok())
        .ok_or_else(|| StatsError::DuOutput {
            output: stdout.to_string(),
        })
}

/// Collect a full report.
///
/// # Errors
///
/// Returns an error on a cgroup v1 host or when any of the reads fails.
pub async fn collect() -> Result<StatReport, StatsError> {
    if !is_cgroup_v2() {
        return Err(StatsError::CgroupV1);
    }

    let used_bytes = working_dir_usage().await?;
    let (mem_used, mem_limit, mem_percent) = read_memory()?;
    let (cpu_percent, cpu_throttled_usec) = sample_cpu().await?;

    Ok(StatReport {
        timestamp: Utc::now(),
        working_dir: DiskUsage { used_bytes },
        memory: MemUsage {
            used: mem_used,
            total: mem_limit,
            used_percent: mem_percent,
        },
        cpu_percent,
        cpu_throttled_usec,
    })
}

/// Collect and log the report as one JSON line.
///
/// # Errors
///
/// Returns an error when collection fails; serialization of a collected
/// report cannot fail.
pub async fn verbose_resource_report() -> Result<(), StatsError> {
    let report = collect().await?;
    let json = serde_json::to_string(&report).unwrap_or_default();
    info!("Resource report: {json}");
    Ok(())
}

/// Resource reporting errors.
#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    /// Host is not running cgroup v2.
    #[error("cgroup v1 is not implemented for stats collection")]
    CgroupV1,

    /// A cgroup file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// The cgroup file path.
        path: String,
        /// Underlying io error.
        #[source]
        source: std::io::Error,
    },

    /// `du` could not be executed.
    #[error("failed to execute du: {0}")]
    Du(#[source] std::io::Error),

    /// `du` produced something unparseable.
    #[error("unexpected du output: {output}")]
    DuOutput {
        /// What `du` printed.
        output: String,
    },
}
