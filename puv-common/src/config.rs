//! Run configuration with environment overrides.
//!
//! All policy constants (poll cadence, attempt budgets, the disk
//! threshold, concurrency formula inputs) are defaults here rather than
//! magic numbers at call sites, and every one can be overridden through a
//! `PUV_*` environment variable. Parse problems are collected instead of
//! failing fast so a misconfigured environment reports every issue at
//! once.

use std::env;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },
}

/// Type-safe environment variable parser with collected errors.
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvParser {
    pub fn new() -> Self {
        Self {
            prefix: "PUV_",
            errors: Vec::new(),
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    pub fn get_string(&mut self, name: &str, default: &str) -> String {
        env::var(self.var_name(name)).unwrap_or_else(|_| default.to_string())
    }

    pub fn get_bool(&mut self, name: &str, default: bool) -> bool {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => match value.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                _ => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name,
                        expected: "boolean (true/false/1/0/yes/no)".into(),
                        value,
                    });
                    default
                }
            },
            Err(_) => default,
        }
    }

    pub fn get_u32_range(&mut self, name: &str, default: u32, min: u32, max: u32) -> u32 {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => match value.parse::<u32>() {
                Ok(parsed) if (min..=max).contains(&parsed) => parsed,
                Ok(_) => {
                    self.errors.push(EnvError::OutOfRange {
                        var: var_name,
                        value,
                        min: min.to_string(),
                        max: max.to_string(),
                    });
                    default
                }
                Err(_) => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name,
                        expected: "unsigned integer".into(),
                        value,
                    });
                    default
                }
            },
            Err(_) => default,
        }
    }

    pub fn get_f64_range(&mut self, name: &str, default: f64, min: f64, max: f64) -> f64 {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => match value.parse::<f64>() {
                Ok(parsed) if parsed >= min && parsed <= max => parsed,
                Ok(_) => {
                    self.errors.push(EnvError::OutOfRange {
                        var: var_name,
                        value,
                        min: min.to_string(),
                        max: max.to_string(),
                    });
                    default
                }
                Err(_) => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name,
                        expected: "number".into(),
                        value,
                    });
                    default
                }
            },
            Err(_) => default,
        }
    }

    pub fn get_secs(&mut self, name: &str, default_secs: u64, min: u64, max: u64) -> Duration {
        Duration::from_secs(u64::from(self.get_u32_range(
            name,
            default_secs as u32,
            min as u32,
            max as u32,
        )))
    }

    pub fn get_opt_secs(&mut self, name: &str) -> Option<Duration> {
        self.get_opt_usize(name)
            .map(|secs| Duration::from_secs(secs as u64))
    }

    pub fn get_opt_usize(&mut self, name: &str) -> Option<usize> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => match value.parse::<usize>() {
                Ok(parsed) if parsed >= 1 => Some(parsed),
                _ => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name,
                        expected: "integer >= 1".into(),
                        value,
                    });
                    None
                }
            },
            Err(_) => None,
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for one validation run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Explicit concurrency override; bypasses the resource assessor.
    pub concurrency_override: Option<usize>,
    /// Fraction of CPU cores usable for concurrent node operations.
    pub cores_factor: f64,
    /// Expected controller-side memory cost per concurrent node, MB.
    pub per_node_memory_mb: u64,
    /// Hard cap on concurrency regardless of resources.
    pub max_concurrency: usize,

    /// Interval between bundle-generation polls.
    pub poll_interval: Duration,
    /// Bundle-generation poll attempt budget.
    pub poll_max_attempts: u32,
    /// Interval between check-runner status polls.
    pub runner_poll_interval: Duration,
    /// Check-runner status poll attempt budget.
    pub runner_max_attempts: u32,

    /// Projected-usage threshold for the capacity gate, percent.
    pub disk_threshold_pct: f64,

    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub transfer_timeout: Duration,
    /// Wall-clock bound on the whole run; `None` leaves only the
    /// per-operation budgets.
    pub run_timeout: Option<Duration>,

    /// Remote working directory for the deployed runner and its outputs.
    pub remote_base_dir: String,
    /// Remote directory where the platform writes diagnostic bundles.
    pub bundle_dir: String,
    /// Skip remote cleanup (debugging aid).
    pub keep_remote_artifacts: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency_override: None,
            cores_factor: 0.75,
            per_node_memory_mb: 512,
            max_concurrency: 8,
            poll_interval: Duration::from_secs(30),
            poll_max_attempts: 30,
            runner_poll_interval: Duration::from_secs(15),
            runner_max_attempts: 60,
            disk_threshold_pct: 70.0,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(120),
            transfer_timeout: Duration::from_secs(600),
            run_timeout: None,
            remote_base_dir: "/tmp/puv-precheck".into(),
            bundle_dir: "/techsupport".into(),
            keep_remote_artifacts: false,
        }
    }
}

impl RunConfig {
    /// Build from defaults plus `PUV_*` environment overrides.
    ///
    /// Invalid variables keep their defaults; every problem is returned so
    /// the caller can log them together.
    pub fn from_env() -> (Self, Vec<EnvError>) {
        let mut parser = EnvParser::new();
        let defaults = Self::default();

        let config = Self {
            concurrency_override: parser.get_opt_usize("CONCURRENCY"),
            cores_factor: parser.get_f64_range("CORES_FACTOR", defaults.cores_factor, 0.1, 1.0),
            per_node_memory_mb: u64::from(parser.get_u32_range(
                "PER_NODE_MEMORY_MB",
                defaults.per_node_memory_mb as u32,
                64,
                65536,
            )),
            max_concurrency: parser.get_u32_range(
                "MAX_CONCURRENCY",
                defaults.max_concurrency as u32,
                1,
                64,
            ) as usize,
            poll_interval: parser.get_secs("POLL_INTERVAL_SECS", 30, 1, 600),
            poll_max_attempts: parser.get_u32_range(
                "POLL_MAX_ATTEMPTS",
                defaults.poll_max_attempts,
                1,
                1000,
            ),
            runner_poll_interval: parser.get_secs("RUNNER_POLL_INTERVAL_SECS", 15, 1, 600),
            runner_max_attempts: parser.get_u32_range(
                "RUNNER_MAX_ATTEMPTS",
                defaults.runner_max_attempts,
                1,
                1000,
            ),
            disk_threshold_pct: parser.get_f64_range(
                "DISK_THRESHOLD_PCT",
                defaults.disk_threshold_pct,
                1.0,
                100.0,
            ),
            connect_timeout: parser.get_secs("CONNECT_TIMEOUT_SECS", 10, 1, 300),
            command_timeout: parser.get_secs("COMMAND_TIMEOUT_SECS", 120, 1, 3600),
            transfer_timeout: parser.get_secs("TRANSFER_TIMEOUT_SECS", 600, 1, 7200),
            run_timeout: parser.get_opt_secs("RUN_TIMEOUT_SECS"),
            remote_base_dir: parser.get_string("REMOTE_BASE_DIR", &defaults.remote_base_dir),
            bundle_dir: parser.get_string("BUNDLE_DIR", &defaults.bundle_dir),
            keep_remote_artifacts: parser.get_bool("KEEP_REMOTE_ARTIFACTS", false),
        };

        (config, parser.take_errors())
    }

    /// Total wall-clock bound of the bundle-generation poll loop.
    pub fn poll_budget(&self) -> Duration {
        self.poll_interval * self.poll_max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_policy_constants() {
        let config = RunConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.poll_max_attempts, 30);
        assert_eq!(config.poll_budget(), Duration::from_secs(900));
        assert!((config.disk_threshold_pct - 70.0).abs() < f64::EPSILON);
        assert_eq!(config.max_concurrency, 8);
        assert!(config.run_timeout.is_none());
    }

    #[test]
    fn parser_collects_range_errors() {
        let mut parser = EnvParser::new();
        // Use a variable name no test environment sets.
        let value = parser.get_u32_range("NONEXISTENT_TEST_ONLY", 7, 1, 10);
        assert_eq!(value, 7);
        assert!(!parser.has_errors());
    }

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        let mut parser = EnvParser::new();
        // Unset variables fall back to the default.
        assert!(parser.get_bool("NONEXISTENT_FLAG", true));
        assert!(!parser.get_bool("NONEXISTENT_FLAG", false));
    }
}
