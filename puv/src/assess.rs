//! Controller resource assessment.
//!
//! Samples local CPU, memory, and load, then recommends a concurrency
//! level for the worker pool. Sampling is separated from the
//! recommendation formula so the formula can be tested with fixed inputs.

use puv_common::RunConfig;
use std::fs;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum AssessError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed {path}: {detail}")]
    Malformed { path: &'static str, detail: String },
}

/// Snapshot of controller resources at run start.
#[derive(Debug, Clone, Copy)]
pub struct ResourceSnapshot {
    pub cpu_cores: usize,
    pub available_memory_mb: u64,
    pub load_one: f64,
}

/// Sample CPU count, available memory, and 1-minute load average.
pub fn sample() -> Result<ResourceSnapshot, AssessError> {
    let cpu_cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let available_memory_mb = read_available_memory_mb()?;
    let load_one = read_load_one()?;

    debug!(
        cpu_cores,
        available_memory_mb, load_one, "sampled controller resources"
    );

    Ok(ResourceSnapshot {
        cpu_cores,
        available_memory_mb,
        load_one,
    })
}

fn read_available_memory_mb() -> Result<u64, AssessError> {
    const PATH: &str = "/proc/meminfo";
    let contents = fs::read_to_string(PATH).map_err(|source| AssessError::Read {
        path: PATH,
        source,
    })?;
    parse_available_memory_mb(&contents)
}

fn parse_available_memory_mb(meminfo: &str) -> Result<u64, AssessError> {
    const PATH: &str = "/proc/meminfo";
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            let kb = rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse::<u64>().ok())
                .ok_or_else(|| AssessError::Malformed {
                    path: PATH,
                    detail: format!("unparseable MemAvailable line: '{line}'"),
                })?;
            return Ok(kb / 1024);
        }
    }
    Err(AssessError::Malformed {
        path: PATH,
        detail: "no MemAvailable line".into(),
    })
}

fn read_load_one() -> Result<f64, AssessError> {
    const PATH: &str = "/proc/loadavg";
    let contents = fs::read_to_string(PATH).map_err(|source| AssessError::Read {
        path: PATH,
        source,
    })?;
    parse_load_one(&contents)
}

fn parse_load_one(loadavg: &str) -> Result<f64, AssessError> {
    loadavg
        .split_whitespace()
        .next()
        .and_then(|v| v.parse::<f64>().ok())
        .ok_or_else(|| AssessError::Malformed {
            path: "/proc/loadavg",
            detail: format!("unparseable load average: '{loadavg}'"),
        })
}

/// Recommend a worker-pool concurrency for the given resources.
///
/// Takes the minimum of a CPU budget (`cores * cores_factor`), a memory
/// budget (`available_mb / per_node_memory_mb`), and the configured hard
/// cap. When the 1-minute load already sits at 75% of the core count or
/// higher the result is halved. Always at least 1.
pub fn recommend_concurrency(snapshot: &ResourceSnapshot, config: &RunConfig) -> usize {
    let cpu_budget = ((snapshot.cpu_cores as f64) * config.cores_factor).floor() as usize;
    let memory_budget = (snapshot.available_memory_mb / config.per_node_memory_mb) as usize;

    let mut recommended = cpu_budget
        .min(memory_budget)
        .min(config.max_concurrency)
        .max(1);

    let load_threshold = 0.75 * snapshot.cpu_cores as f64;
    if snapshot.load_one >= load_threshold {
        warn!(
            load_one = snapshot.load_one,
            cpu_cores = snapshot.cpu_cores,
            "controller already under load, halving concurrency"
        );
        recommended = (recommended / 2).max(1);
    }

    recommended
}

/// Sample resources and recommend a concurrency, honoring any explicit
/// override from configuration.
pub fn assess(config: &RunConfig) -> Result<usize, AssessError> {
    if let Some(explicit) = config.concurrency_override {
        let capped = explicit.min(config.max_concurrency).max(1);
        info!(requested = explicit, effective = capped, "using explicit concurrency");
        return Ok(capped);
    }

    let snapshot = sample()?;
    let recommended = recommend_concurrency(&snapshot, config);
    info!(
        cpu_cores = snapshot.cpu_cores,
        available_memory_mb = snapshot.available_memory_mb,
        load_one = snapshot.load_one,
        concurrency = recommended,
        "resource assessment complete"
    );
    Ok(recommended)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(cores: usize, mem_mb: u64, load: f64) -> ResourceSnapshot {
        ResourceSnapshot {
            cpu_cores: cores,
            available_memory_mb: mem_mb,
            load_one: load,
        }
    }

    #[test]
    fn cpu_bound_host() {
        // 8 cores * 0.75 = 6; plenty of memory; idle.
        let config = RunConfig::default();
        assert_eq!(recommend_concurrency(&snapshot(8, 32_768, 0.2), &config), 6);
    }

    #[test]
    fn memory_bound_host() {
        // 1536 MB / 512 MB per node = 3, below the CPU budget of 6.
        let config = RunConfig::default();
        assert_eq!(recommend_concurrency(&snapshot(8, 1536, 0.2), &config), 3);
    }

    #[test]
    fn hard_cap_applies() {
        let config = RunConfig::default();
        assert_eq!(
            recommend_concurrency(&snapshot(64, 262_144, 0.5), &config),
            config.max_concurrency
        );
    }

    #[test]
    fn loaded_host_halves() {
        // load 6.5 >= 0.75 * 8 = 6.0, so 6 becomes 3.
        let config = RunConfig::default();
        assert_eq!(
            recommend_concurrency(&snapshot(8, 32_768, 6.5), &config),
            3
        );
    }

    #[test]
    fn never_below_one() {
        let config = RunConfig::default();
        assert_eq!(recommend_concurrency(&snapshot(1, 128, 9.0), &config), 1);
    }

    #[test]
    fn meminfo_parsing() {
        let sample = "MemTotal:       16309248 kB\nMemFree:         1024000 kB\nMemAvailable:    8192000 kB\n";
        assert_eq!(parse_available_memory_mb(sample).unwrap(), 8000);

        let missing = "MemTotal: 1 kB\n";
        assert!(parse_available_memory_mb(missing).is_err());
    }

    #[test]
    fn loadavg_parsing() {
        assert!((parse_load_one("1.52 0.84 0.60 2/1024 12345\n").unwrap() - 1.52).abs() < 1e-9);
        assert!(parse_load_one("garbage").is_err());
    }
}
