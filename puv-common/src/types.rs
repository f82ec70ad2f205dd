//! Core domain types for a validation run.
//!
//! A run owns an ordered set of [`NodeConfig`]s discovered from the seed
//! node. Each node eventually produces one [`NodeReport`] (the structured
//! result file written by the deployed check runner), which the aggregator
//! parses with [`parse_node_report`] - malformed input is surfaced as a
//! typed error, never a panic.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// The fixed battery of checks the runner evaluates on every node.
///
/// The report matrix has exactly one row per entry; a node whose runner
/// never produced a result gets an ERROR placeholder for each of them.
pub const CHECK_NAMES: [&str; 14] = [
    "version_check",
    "subnet_check",
    "node_status",
    "ping_check",
    "disk_space",
    "pod_status",
    "system_health",
    "techsupport",
    "certificate_check",
    "iso_check",
    "lvm_pvs_check",
    "persistent_ip_check",
    "atom0_nvme_check",
    "nxos_discovery_service",
];

/// Unique node identifier (the cluster-visible node label).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One cluster node: identity, connection settings, and attributes
/// discovered during cluster discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node label as reported by the cluster.
    pub id: NodeId,
    /// Management address used for SSH.
    pub host: String,
    /// SSH username.
    pub user: String,
    /// Path to the SSH identity file (may contain `~`).
    pub identity_file: String,
    /// OS hostname, probed after connection; names the remote result files.
    pub hostname: String,
    /// Product version reported by the cluster, if discovered.
    pub version: Option<String>,
    /// Node role (e.g. primary/secondary/standby).
    pub role: Option<String>,
    /// Operational state at discovery time.
    pub state: Option<String>,
}

impl NodeConfig {
    /// Minimal config for a node that has not been probed yet.
    pub fn new(
        id: impl Into<String>,
        host: impl Into<String>,
        user: impl Into<String>,
        identity_file: impl Into<String>,
    ) -> Self {
        let id = NodeId::new(id);
        Self {
            hostname: id.0.clone(),
            id,
            host: host.into(),
            user: user.into(),
            identity_file: identity_file.into(),
            version: None,
            role: None,
            state: None,
        }
    }
}

/// Verdict of one check on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckStatus {
    Pass,
    Fail,
    Skip,
    /// The check (or the runner itself) could not be evaluated.
    Error,
}

impl CheckStatus {
    /// Parse a status string from a result file.
    ///
    /// Unknown values map to `None`; callers record the raw string and
    /// downgrade to [`CheckStatus::Error`] rather than rejecting the file.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PASS" => Some(Self::Pass),
            "FAIL" => Some(Self::Fail),
            "SKIP" => Some(Self::Skip),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Skip => "SKIP",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one (check, node) evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub check: String,
    pub node: NodeId,
    pub status: CheckStatus,
    pub detail: String,
}

/// Parsed per-node result file, as written by the deployed check runner.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeReport {
    pub node_name: String,
    pub timestamp: String,
    /// Check name -> (status, joined detail lines).
    pub checks: BTreeMap<String, (CheckStatus, String)>,
}

/// Why a result file could not be parsed.
#[derive(Debug, Error)]
pub enum ReportParseError {
    #[error("result file is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("result file is malformed: {0}")]
    Malformed(String),
}

#[derive(Deserialize)]
struct RawReport {
    node_name: String,
    #[serde(default)]
    timestamp: String,
    checks: BTreeMap<String, RawCheck>,
}

#[derive(Deserialize)]
struct RawCheck {
    status: String,
    #[serde(default)]
    details: Vec<String>,
}

/// Parse a result file into a [`NodeReport`].
///
/// Shape errors (missing fields, wrong types, empty check map) are
/// [`ReportParseError::Malformed`]; an unrecognized status string for an
/// individual check degrades that check to ERROR with the raw value kept
/// in the detail text.
pub fn parse_node_report(raw: &str) -> Result<NodeReport, ReportParseError> {
    let parsed: RawReport = serde_json::from_str(raw)?;

    if parsed.node_name.trim().is_empty() {
        return Err(ReportParseError::Malformed("empty node_name".into()));
    }
    if parsed.checks.is_empty() {
        return Err(ReportParseError::Malformed("no checks present".into()));
    }

    let mut checks = BTreeMap::new();
    for (name, check) in parsed.checks {
        let detail = check.details.join("; ");
        match CheckStatus::parse(&check.status) {
            Some(status) => {
                checks.insert(name, (status, detail));
            }
            None => {
                let detail = if detail.is_empty() {
                    format!("unrecognized status '{}'", check.status)
                } else {
                    format!("unrecognized status '{}': {}", check.status, detail)
                };
                checks.insert(name, (CheckStatus::Error, detail));
            }
        }
    }

    Ok(NodeReport {
        node_name: parsed.node_name,
        timestamp: parsed.timestamp,
        checks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_status_parses_known_values() {
        assert_eq!(CheckStatus::parse("PASS"), Some(CheckStatus::Pass));
        assert_eq!(CheckStatus::parse("fail"), Some(CheckStatus::Fail));
        assert_eq!(CheckStatus::parse(" Skip "), Some(CheckStatus::Skip));
        assert_eq!(CheckStatus::parse("ERROR"), Some(CheckStatus::Error));
        assert_eq!(CheckStatus::parse("WARNING"), None);
    }

    #[test]
    fn node_report_parses_valid_file() {
        let raw = r#"{
            "node_name": "nd-node-1",
            "timestamp": "2025-01-15 10:00:00",
            "checks": {
                "version_check": {"status": "PASS", "details": []},
                "disk_space": {"status": "FAIL", "details": ["/data at 91%", "threshold 80%"]}
            }
        }"#;
        let report = parse_node_report(raw).unwrap();
        assert_eq!(report.node_name, "nd-node-1");
        assert_eq!(
            report.checks["version_check"],
            (CheckStatus::Pass, String::new())
        );
        assert_eq!(
            report.checks["disk_space"],
            (CheckStatus::Fail, "/data at 91%; threshold 80%".to_string())
        );
    }

    #[test]
    fn node_report_rejects_invalid_json() {
        assert!(matches!(
            parse_node_report("not json"),
            Err(ReportParseError::InvalidJson(_))
        ));
    }

    #[test]
    fn node_report_rejects_empty_checks() {
        let raw = r#"{"node_name": "n1", "checks": {}}"#;
        assert!(matches!(
            parse_node_report(raw),
            Err(ReportParseError::Malformed(_))
        ));
    }

    #[test]
    fn node_report_degrades_unknown_status_to_error() {
        let raw = r#"{
            "node_name": "n1",
            "checks": {"pod_status": {"status": "MAYBE", "details": ["odd"]}}
        }"#;
        let report = parse_node_report(raw).unwrap();
        let (status, detail) = &report.checks["pod_status"];
        assert_eq!(*status, CheckStatus::Error);
        assert!(detail.contains("MAYBE"));
        assert!(detail.contains("odd"));
    }

    #[test]
    fn check_names_has_no_duplicates() {
        let mut names: Vec<_> = CHECK_NAMES.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), CHECK_NAMES.len());
    }
}
