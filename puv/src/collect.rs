//! Result collection and remote cleanup.
//!
//! Fetches each node's result file and debug log into the local results
//! directory, parses the result file into check rows, and degrades any
//! per-node problem into ERROR placeholders so the report matrix is always
//! complete. Cleanup of the remote working directory is best-effort and
//! never affects the run outcome.

use puv_common::{
    parse_node_report, CheckResult, CheckStatus, NodeConfig, NodeFailure, NodeSession, NodeReport,
    RunConfig, CHECK_NAMES,
};
use std::path::Path;
use tracing::{debug, info, warn};

fn session_for<'a>(node: &'a NodeConfig, config: &RunConfig) -> NodeSession<'a> {
    NodeSession::new(node)
        .connect_timeout(config.connect_timeout)
        .command_timeout(config.command_timeout)
        .transfer_timeout(config.transfer_timeout)
}

/// Fetch and parse one node's result file.
///
/// The debug log is fetched alongside it when available; its absence is
/// logged and ignored.
pub async fn collect_node(
    node: &NodeConfig,
    config: &RunConfig,
    results_dir: &Path,
) -> Result<NodeReport, NodeFailure> {
    let session = session_for(node, config);

    let remote_results = format!(
        "{}/{}_results.json",
        config.remote_base_dir, node.hostname
    );
    let local_results = results_dir.join(format!("{}_results.json", node.hostname));
    session
        .copy_from(&remote_results, &local_results)
        .await
        .map_err(|e| NodeFailure::from_ssh("result collection", e))?;

    let remote_log = format!("{}/{}_debug.log", config.remote_base_dir, node.hostname);
    let local_log = results_dir.join(format!("{}_debug.log", node.hostname));
    if let Err(e) = session.copy_from(&remote_log, &local_log).await {
        debug!(node = %node.id, error = %e, "debug log not collected");
    }

    let raw = std::fs::read_to_string(&local_results).map_err(|e| NodeFailure::Aggregation {
        reason: format!("failed to read collected result file: {e}"),
    })?;

    let report = parse_node_report(&raw).map_err(|e| NodeFailure::Aggregation {
        reason: e.to_string(),
    })?;

    info!(
        node = %node.id,
        checks = report.checks.len(),
        "node results collected"
    );
    Ok(report)
}

/// Expand a parsed report into one row per battery check.
///
/// A check the runner never reported gets an ERROR row; checks outside the
/// battery are dropped (the matrix shape is fixed).
pub fn report_rows(node: &NodeConfig, report: &NodeReport) -> Vec<CheckResult> {
    for name in report.checks.keys() {
        if !CHECK_NAMES.contains(&name.as_str()) {
            debug!(node = %node.id, check = %name, "ignoring unknown check in result file");
        }
    }

    CHECK_NAMES
        .iter()
        .map(|&name| match report.checks.get(name) {
            Some((status, detail)) => CheckResult {
                check: name.to_string(),
                node: node.id.clone(),
                status: *status,
                detail: detail.clone(),
            },
            None => CheckResult {
                check: name.to_string(),
                node: node.id.clone(),
                status: CheckStatus::Error,
                detail: "missing from result file".into(),
            },
        })
        .collect()
}

/// ERROR rows for a node that produced no usable results at all.
pub fn failure_rows(node: &NodeConfig, failure: &NodeFailure) -> Vec<CheckResult> {
    let detail = failure.to_string();
    CHECK_NAMES
        .iter()
        .map(|&name| CheckResult {
            check: name.to_string(),
            node: node.id.clone(),
            status: CheckStatus::Error,
            detail: detail.clone(),
        })
        .collect()
}

/// Remove the remote working directory and, when this run generated a
/// bundle, the bundle itself. Best-effort: failures are logged, never
/// propagated, and `keep_remote_artifacts` skips it entirely. Reused
/// bundles are left alone - this run does not own them.
pub async fn cleanup_node(node: &NodeConfig, config: &RunConfig, generated_bundle: Option<&str>) {
    if config.keep_remote_artifacts {
        info!(node = %node.id, dir = %config.remote_base_dir, "keeping remote artifacts");
        return;
    }

    let session = session_for(node, config);
    match session.remove_path(&config.remote_base_dir).await {
        Ok(()) => debug!(node = %node.id, dir = %config.remote_base_dir, "remote cleanup done"),
        Err(e) => warn!(node = %node.id, error = %e, "remote cleanup failed"),
    }

    if let Some(bundle) = generated_bundle {
        match session.remove_path(bundle).await {
            Ok(()) => debug!(node = %node.id, bundle = %bundle, "generated bundle removed"),
            Err(e) => warn!(node = %node.id, bundle = %bundle, error = %e, "bundle cleanup failed"),
        }
    }
}
