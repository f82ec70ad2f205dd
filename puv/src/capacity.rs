//! Per-node disk capacity gate.
//!
//! Before a diagnostic bundle is generated on a node, project what the
//! bundle filesystem's usage would look like with the new bundle added.
//! Nodes whose projected usage crosses the threshold are failed up front
//! instead of filling their disk mid-collection.

use puv_common::{NodeConfig, NodeFailure, NodeSession, RunConfig};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DfParseError {
    #[error("df output had no data line")]
    NoDataLine,

    #[error("Malformed df line: '{0}'")]
    MalformedLine(String),
}

/// Disk usage of the bundle filesystem on one node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiskUsage {
    pub capacity_kb: u64,
    pub used_pct: f64,
}

/// Parse POSIX `df -Pk <path>` output.
///
/// `-P` guarantees one line per filesystem, so we take the first data
/// line after the header: filesystem, 1024-blocks, used, available,
/// capacity%, mount point.
pub fn parse_df_output(output: &str) -> Result<DiskUsage, DfParseError> {
    let line = output
        .lines()
        .skip(1)
        .find(|l| !l.trim().is_empty())
        .ok_or(DfParseError::NoDataLine)?;

    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 6 {
        return Err(DfParseError::MalformedLine(line.to_string()));
    }

    let capacity_kb = fields[1]
        .parse::<u64>()
        .map_err(|_| DfParseError::MalformedLine(line.to_string()))?;
    let used_pct = fields[4]
        .trim_end_matches('%')
        .parse::<f64>()
        .map_err(|_| DfParseError::MalformedLine(line.to_string()))?;

    if capacity_kb == 0 {
        return Err(DfParseError::MalformedLine(line.to_string()));
    }

    Ok(DiskUsage {
        capacity_kb,
        used_pct,
    })
}

/// Outcome of the capacity projection for one node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateDecision {
    pub projected_pct: f64,
    pub threshold_pct: f64,
    pub admitted: bool,
}

/// Project usage with `bundle_bytes` added and compare to the threshold.
pub fn evaluate(usage: DiskUsage, bundle_bytes: u64, threshold_pct: f64) -> GateDecision {
    let capacity_bytes = usage.capacity_kb as f64 * 1024.0;
    let projected_pct = usage.used_pct + (bundle_bytes as f64 / capacity_bytes) * 100.0;
    GateDecision {
        projected_pct,
        threshold_pct,
        admitted: projected_pct < threshold_pct,
    }
}

/// Run the gate against a live node.
///
/// The expected bundle size is estimated from prior bundles in the bundle
/// directory when any exist; otherwise a conservative fixed estimate is
/// used.
pub async fn check_node(
    node: &NodeConfig,
    config: &RunConfig,
    estimated_bundle_bytes: u64,
) -> Result<GateDecision, NodeFailure> {
    let session = NodeSession::new(node)
        .connect_timeout(config.connect_timeout)
        .command_timeout(config.command_timeout);

    let output = session
        .run_command(&format!("df -Pk {}", config.bundle_dir))
        .await
        .map_err(|e| NodeFailure::from_ssh("capacity check", e))?;

    if output.exit_code != 0 {
        return Err(NodeFailure::Command {
            operation: "capacity check".into(),
            reason: format!("df exited {}: {}", output.exit_code, output.stderr.trim()),
        });
    }

    let usage = parse_df_output(&output.stdout).map_err(|e| NodeFailure::Command {
        operation: "capacity check".into(),
        reason: e.to_string(),
    })?;

    let decision = evaluate(usage, estimated_bundle_bytes, config.disk_threshold_pct);
    debug!(
        node = %node.id,
        used_pct = usage.used_pct,
        projected_pct = format!("{:.1}", decision.projected_pct),
        threshold_pct = decision.threshold_pct,
        admitted = decision.admitted,
        "capacity gate evaluated"
    );

    if !decision.admitted {
        warn!(
            node = %node.id,
            projected_pct = format!("{:.1}", decision.projected_pct),
            "node rejected by capacity gate"
        );
        return Err(NodeFailure::Capacity {
            projected_pct: decision.projected_pct,
            threshold_pct: decision.threshold_pct,
        });
    }

    Ok(decision)
}

/// Estimate the next bundle's size from existing bundle sizes in bytes.
///
/// Uses the largest prior bundle plus 10% headroom; falls back to the
/// default when no history exists.
pub fn estimate_bundle_bytes(prior_sizes: &[u64], default_bytes: u64) -> u64 {
    match prior_sizes.iter().max() {
        Some(&largest) if largest > 0 => largest + largest / 10,
        _ => default_bytes,
    }
}

/// Conservative default when a node has no bundle history: 1.5 GiB.
pub const DEFAULT_BUNDLE_ESTIMATE_BYTES: u64 = 1_610_612_736;

#[cfg(test)]
mod tests {
    use super::*;

    const DF_SAMPLE: &str = "\
Filesystem     1024-blocks     Used Available Capacity Mounted on
/dev/sda3          5242880   943718   4299162      18% /techsupport
";

    #[test]
    fn parses_posix_df() {
        let usage = parse_df_output(DF_SAMPLE).unwrap();
        assert_eq!(usage.capacity_kb, 5_242_880);
        assert!((usage.used_pct - 18.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_truncated_df() {
        assert!(matches!(
            parse_df_output("Filesystem 1024-blocks\n"),
            Err(DfParseError::NoDataLine)
        ));
        assert!(matches!(
            parse_df_output("header\n/dev/sda3 oops\n"),
            Err(DfParseError::MalformedLine(_))
        ));
    }

    #[test]
    fn projection_admits_below_threshold() {
        // 18% used on a 5 GiB filesystem, 1.46 GB bundle: projected 45.2%.
        let usage = DiskUsage {
            capacity_kb: 5_242_880,
            used_pct: 18.0,
        };
        let decision = evaluate(usage, 1_460_000_000, 70.0);
        assert!((decision.projected_pct - 45.2).abs() < 0.1);
        assert!(decision.admitted);
    }

    #[test]
    fn projection_rejects_at_threshold() {
        let usage = DiskUsage {
            capacity_kb: 5_242_880,
            used_pct: 55.0,
        };
        // Pushes projected usage past 70%.
        let decision = evaluate(usage, 1_460_000_000, 70.0);
        assert!(decision.projected_pct >= 70.0);
        assert!(!decision.admitted);
    }

    #[test]
    fn estimate_uses_history_with_headroom() {
        assert_eq!(estimate_bundle_bytes(&[100, 1000], 5555), 1100);
        assert_eq!(estimate_bundle_bytes(&[], 5555), 5555);
        assert_eq!(estimate_bundle_bytes(&[0], 5555), 5555);
    }
}
