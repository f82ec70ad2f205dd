//! Report aggregation and rendering.
//!
//! One [`Report`] accumulates the full check matrix for the run. Merging
//! is keyed by node and replaces any previous rows for that node, so
//! re-collecting a node (or replaying a collection after a retry) cannot
//! duplicate results. The report renders as a terminal matrix, a JSON
//! document, and a plain-text summary, and the whole results directory is
//! archived with the system `tar`.

use anyhow::{bail, Context, Result};
use chrono::Local;
use puv_common::{CheckResult, CheckStatus, NodeId, CHECK_NAMES};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;

/// Aggregate counts across the whole matrix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub nodes: usize,
    pub pass: usize,
    pub fail: usize,
    pub skip: usize,
    pub error: usize,
}

/// The run's aggregated check matrix.
#[derive(Debug, Default)]
pub struct Report {
    rows: BTreeMap<NodeId, Vec<CheckResult>>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one node's rows, replacing anything previously recorded for
    /// that node.
    pub fn merge_node(&mut self, node: NodeId, rows: Vec<CheckResult>) {
        self.rows.insert(node, rows);
    }

    pub fn node_count(&self) -> usize {
        self.rows.len()
    }

    /// True when every check on every node passed. SKIP rows do not count
    /// against the verdict; FAIL and ERROR do.
    pub fn all_passed(&self) -> bool {
        !self.rows.is_empty()
            && self.rows.values().flatten().all(|r| {
                matches!(r.status, CheckStatus::Pass | CheckStatus::Skip)
            })
    }

    pub fn summary(&self) -> Summary {
        let mut summary = Summary {
            nodes: self.rows.len(),
            ..Summary::default()
        };
        for row in self.rows.values().flatten() {
            match row.status {
                CheckStatus::Pass => summary.pass += 1,
                CheckStatus::Fail => summary.fail += 1,
                CheckStatus::Skip => summary.skip += 1,
                CheckStatus::Error => summary.error += 1,
            }
        }
        summary
    }

    fn status_for(&self, node: &NodeId, check: &str) -> Option<&CheckResult> {
        self.rows
            .get(node)
            .and_then(|rows| rows.iter().find(|r| r.check == check))
    }

    /// Render the check matrix: one row per battery check, one column per
    /// node, plus a trailing section listing every non-passing detail.
    pub fn render_matrix(&self) -> String {
        let nodes: Vec<&NodeId> = self.rows.keys().collect();
        let check_width = CHECK_NAMES
            .iter()
            .map(|n| n.len())
            .max()
            .unwrap_or(0)
            .max("CHECK".len());

        let mut out = String::new();
        let _ = write!(out, "{:<width$}", "CHECK", width = check_width);
        for node in &nodes {
            let _ = write!(out, "  {:<width$}", node.as_str(), width = col_width(node));
        }
        out.push('\n');

        for &check in CHECK_NAMES.iter() {
            let _ = write!(out, "{:<width$}", check, width = check_width);
            for node in &nodes {
                let status = self
                    .status_for(node, check)
                    .map(|r| r.status.as_str())
                    .unwrap_or("-");
                let _ = write!(out, "  {:<width$}", status, width = col_width(node));
            }
            out.push('\n');
        }

        let problems: Vec<&CheckResult> = self
            .rows
            .values()
            .flatten()
            .filter(|r| matches!(r.status, CheckStatus::Fail | CheckStatus::Error))
            .collect();
        if !problems.is_empty() {
            out.push('\n');
            for row in problems {
                let _ = writeln!(
                    out,
                    "{} {} on {}: {}",
                    row.status, row.check, row.node, row.detail
                );
            }
        }

        out
    }

    fn summary_text(&self) -> String {
        let summary = self.summary();
        let verdict = if self.all_passed() {
            "READY FOR UPGRADE"
        } else {
            "NOT READY - review failures above"
        };
        format!(
            "Nodes: {}\nPASS: {}  FAIL: {}  SKIP: {}  ERROR: {}\nVerdict: {}\n",
            summary.nodes, summary.pass, summary.fail, summary.skip, summary.error, verdict
        )
    }

    /// Write `report.json` and `summary.txt` into the results directory.
    pub fn write_artifacts(&self, results_dir: &Path) -> Result<()> {
        #[derive(Serialize)]
        struct Document<'a> {
            generated_at: String,
            summary: Summary,
            all_passed: bool,
            results: Vec<&'a CheckResult>,
        }

        let document = Document {
            generated_at: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            summary: self.summary(),
            all_passed: self.all_passed(),
            results: self.rows.values().flatten().collect(),
        };

        let json_path = results_dir.join("report.json");
        let json = serde_json::to_string_pretty(&document)?;
        std::fs::write(&json_path, json)
            .with_context(|| format!("writing {}", json_path.display()))?;

        let summary_path = results_dir.join("summary.txt");
        let text = format!("{}\n{}", self.render_matrix(), self.summary_text());
        std::fs::write(&summary_path, text)
            .with_context(|| format!("writing {}", summary_path.display()))?;

        info!(dir = %results_dir.display(), "report artifacts written");
        Ok(())
    }
}

fn col_width(node: &NodeId) -> usize {
    node.as_str().len().max("ERROR".len())
}

/// Timestamped name for a run's local results directory.
pub fn results_dir_name(now: chrono::DateTime<Local>) -> String {
    format!("puv-results-{}", now.format("%Y%m%d-%H%M%S"))
}

/// Archive the results directory as `<dir>.tar.gz` next to it.
pub async fn archive_results(results_dir: &Path) -> Result<PathBuf> {
    let parent = results_dir.parent().unwrap_or_else(|| Path::new("."));
    let name = results_dir
        .file_name()
        .and_then(|n| n.to_str())
        .context("results directory has no valid name")?;
    let archive = parent.join(format!("{name}.tar.gz"));

    let status = tokio::process::Command::new("tar")
        .arg("czf")
        .arg(&archive)
        .arg("-C")
        .arg(parent)
        .arg(name)
        .status()
        .await
        .context("failed to run tar")?;

    if !status.success() {
        bail!("tar exited with {status}");
    }

    info!(archive = %archive.display(), "results archived");
    Ok(archive)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(node: &str, check: &str, status: CheckStatus, detail: &str) -> CheckResult {
        CheckResult {
            check: check.into(),
            node: NodeId::new(node),
            status,
            detail: detail.into(),
        }
    }

    fn full_battery(node: &str, status: CheckStatus) -> Vec<CheckResult> {
        CHECK_NAMES
            .iter()
            .map(|&check| row(node, check, status, ""))
            .collect()
    }

    #[test]
    fn empty_report_is_not_a_pass() {
        assert!(!Report::new().all_passed());
    }

    #[test]
    fn all_pass_verdict_tolerates_skips() {
        let mut report = Report::new();
        let mut rows = full_battery("n1", CheckStatus::Pass);
        rows[3].status = CheckStatus::Skip;
        report.merge_node(NodeId::new("n1"), rows);
        assert!(report.all_passed());
    }

    #[test]
    fn fail_or_error_breaks_the_verdict() {
        let mut report = Report::new();
        report.merge_node(NodeId::new("n1"), full_battery("n1", CheckStatus::Pass));
        let mut rows = full_battery("n2", CheckStatus::Pass);
        rows[0].status = CheckStatus::Fail;
        report.merge_node(NodeId::new("n2"), rows);
        assert!(!report.all_passed());

        let summary = report.summary();
        assert_eq!(summary.nodes, 2);
        assert_eq!(summary.fail, 1);
        assert_eq!(summary.pass, CHECK_NAMES.len() * 2 - 1);
    }

    #[test]
    fn merge_is_idempotent_per_node() {
        let mut report = Report::new();
        let mut rows = full_battery("n1", CheckStatus::Pass);
        rows[0].status = CheckStatus::Error;
        report.merge_node(NodeId::new("n1"), rows);
        // Re-collecting the same node replaces its rows outright.
        report.merge_node(NodeId::new("n1"), full_battery("n1", CheckStatus::Pass));

        assert_eq!(report.node_count(), 1);
        assert_eq!(report.summary().error, 0);
        assert!(report.all_passed());
    }

    #[test]
    fn matrix_has_row_per_check_and_column_per_node() {
        let mut report = Report::new();
        report.merge_node(NodeId::new("nd-1"), full_battery("nd-1", CheckStatus::Pass));
        let mut rows = full_battery("nd-2", CheckStatus::Pass);
        rows[4].status = CheckStatus::Fail;
        rows[4].detail = "/data at 91%".into();
        report.merge_node(NodeId::new("nd-2"), rows);

        let matrix = report.render_matrix();
        let lines: Vec<&str> = matrix.lines().collect();
        assert!(lines[0].contains("nd-1") && lines[0].contains("nd-2"));
        for check in CHECK_NAMES {
            assert!(matrix.contains(check), "matrix missing {check}");
        }
        assert!(matrix.contains("/data at 91%"));
    }

    #[test]
    fn artifacts_land_in_results_dir() {
        let mut report = Report::new();
        report.merge_node(NodeId::new("n1"), full_battery("n1", CheckStatus::Pass));

        let dir = tempfile::tempdir().unwrap();
        report.write_artifacts(dir.path()).unwrap();

        let json: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("report.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(json["all_passed"], serde_json::Value::Bool(true));
        assert_eq!(json["summary"]["pass"], CHECK_NAMES.len());

        let summary = std::fs::read_to_string(dir.path().join("summary.txt")).unwrap();
        assert!(summary.contains("READY FOR UPGRADE"));
    }

    #[test]
    fn results_dir_name_is_timestamped() {
        let now = Local::now();
        let name = results_dir_name(now);
        assert!(name.starts_with("puv-results-"));
        assert_eq!(name.len(), "puv-results-".len() + 15);
    }

    #[tokio::test]
    async fn archive_produces_tarball() {
        let dir = tempfile::tempdir().unwrap();
        let results = dir.path().join("puv-results-20260825-101500");
        std::fs::create_dir(&results).unwrap();
        std::fs::write(results.join("report.json"), "{}").unwrap();

        let archive = archive_results(&results).await.unwrap();
        assert!(archive.ends_with("puv-results-20260825-101500.tar.gz"));
        assert!(archive.exists());
    }
}
