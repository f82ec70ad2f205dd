//! Cluster discovery from the seed node.
//!
//! The operator supplies one reachable node; everything else comes from
//! the cluster itself: `acs version` for the product version (which picks
//! the bundle trigger variant) and `acs show nodes` for the member list.
//! Each discovered member is then probed for its OS hostname, which names
//! the remote result files.

use puv_common::{NodeConfig, NodeFailure, NodeSession, RunConfig};
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("seed node {host} unusable: {reason}")]
    Seed { host: String, reason: String },

    #[error("could not parse cluster node table: {0}")]
    MalformedTable(String),

    #[error("no reachable nodes in the cluster")]
    NoReachableNodes,
}

/// One data row of `acs show nodes`.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRow {
    pub name: String,
    pub ip: String,
    pub role: String,
    pub state: String,
}

/// Outcome of discovery: probed members plus the ones that never answered.
#[derive(Debug)]
pub struct Discovery {
    pub nodes: Vec<NodeConfig>,
    pub unreachable: Vec<(NodeConfig, NodeFailure)>,
    pub version: Option<String>,
}

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+\.\d+(?:\.\d+)*)").unwrap())
}

fn node_row_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\S+)\s+(\d{1,3}(?:\.\d{1,3}){3})\s+(\S+)\s+(\S+)\s*$").unwrap()
    })
}

/// Extract the product version from `acs version` output.
pub fn parse_version(output: &str) -> Option<String> {
    version_regex()
        .captures(output)
        .map(|c| c[1].to_string())
}

/// Parse the `acs show nodes` table.
///
/// Header and rule lines are skipped; a data-looking line that fails to
/// parse is skipped with a warning. An output with no parseable data rows
/// at all aborts discovery.
pub fn parse_nodes_table(output: &str) -> Result<Vec<NodeRow>, DiscoveryError> {
    let mut rows = Vec::new();
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty()
            || trimmed.chars().all(|c| c == '-' || c == '=' || c == '+')
            || trimmed.to_lowercase().starts_with("name")
        {
            continue;
        }
        match node_row_regex().captures(trimmed) {
            Some(caps) => rows.push(NodeRow {
                name: caps[1].to_string(),
                ip: caps[2].to_string(),
                role: caps[3].to_string(),
                state: caps[4].to_string(),
            }),
            None => warn!(line = %trimmed, "skipping malformed node table line"),
        }
    }

    if rows.is_empty() {
        return Err(DiscoveryError::MalformedTable(
            "no data rows recognized".into(),
        ));
    }
    Ok(rows)
}

/// Discover the cluster starting from the seed node.
///
/// Unreachable members are returned alongside the usable ones; the caller
/// reports them as per-node failures. Discovery only fails outright when
/// the seed itself is unusable, the table cannot be parsed, or not a
/// single member answers.
pub async fn discover(seed: &NodeConfig, config: &RunConfig) -> Result<Discovery, DiscoveryError> {
    let session = NodeSession::new(seed)
        .connect_timeout(config.connect_timeout)
        .command_timeout(config.command_timeout);

    let version_out =
        session
            .run_checked("acs version")
            .await
            .map_err(|e| DiscoveryError::Seed {
                host: seed.host.clone(),
                reason: e.to_string(),
            })?;
    let version = parse_version(&version_out);
    if version.is_none() {
        warn!(output = %version_out, "could not parse product version");
    }

    let table = session
        .run_checked("acs show nodes")
        .await
        .map_err(|e| DiscoveryError::Seed {
            host: seed.host.clone(),
            reason: e.to_string(),
        })?;
    let rows = parse_nodes_table(&table)?;
    info!(
        nodes = rows.len(),
        version = version.as_deref().unwrap_or("unknown"),
        "cluster discovered"
    );

    let mut nodes = Vec::new();
    let mut unreachable = Vec::new();

    for row in rows {
        let mut node = NodeConfig::new(&row.name, &row.ip, &seed.user, &seed.identity_file);
        node.version = version.clone();
        node.role = Some(row.role);
        node.state = Some(row.state);

        let probe = NodeSession::new(&node)
            .connect_timeout(config.connect_timeout)
            .command_timeout(config.command_timeout);
        match probe.run_checked("hostname").await {
            Ok(hostname) if !hostname.is_empty() => {
                info!(node = %node.id, hostname = %hostname, "node probed");
                node.hostname = hostname;
                nodes.push(node);
            }
            Ok(_) => {
                warn!(node = %node.id, "empty hostname, keeping node label");
                nodes.push(node);
            }
            Err(e) => {
                warn!(node = %node.id, host = %node.host, error = %e, "node unreachable");
                let failure = NodeFailure::from_ssh("discovery probe", e);
                unreachable.push((node, failure));
            }
        }
    }

    if nodes.is_empty() {
        return Err(DiscoveryError::NoReachableNodes);
    }

    Ok(Discovery {
        nodes,
        unreachable,
        version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use puv_common::mock::{install_script, MockResponse, MockScope, MockScript};

    const NODES_TABLE: &str = "\
Name        IP Address    Role       State
----        ----------    ----       -----
nd-node-1   10.0.0.11     primary    active
nd-node-2   10.0.0.12     secondary  active
nd-node-3   10.0.0.13     standby    active
";

    #[test]
    fn version_parses_from_banner() {
        assert_eq!(
            parse_version("Nexus Dashboard version 4.1.2i build 55").as_deref(),
            Some("4.1.2")
        );
        assert_eq!(parse_version("3.2"), Some("3.2".into()));
        assert_eq!(parse_version("no digits here"), None);
    }

    #[test]
    fn table_parses_data_rows() {
        let rows = parse_nodes_table(NODES_TABLE).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(
            rows[0],
            NodeRow {
                name: "nd-node-1".into(),
                ip: "10.0.0.11".into(),
                role: "primary".into(),
                state: "active".into(),
            }
        );
    }

    #[test]
    fn table_skips_malformed_lines_but_keeps_good_ones() {
        let mixed = "nd-node-1 10.0.0.11 primary active\ngarbage line without ip\n";
        let rows = parse_nodes_table(mixed).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn table_with_no_data_rows_is_fatal() {
        assert!(matches!(
            parse_nodes_table("Name IP Role State\n-----\n"),
            Err(DiscoveryError::MalformedTable(_))
        ));
        assert!(matches!(
            parse_nodes_table(""),
            Err(DiscoveryError::MalformedTable(_))
        ));
    }

    fn seed(host: &str) -> NodeConfig {
        NodeConfig::new("seed", host, "rescue-user", "~/.ssh/id_rsa")
    }

    #[tokio::test]
    async fn discovery_probes_each_member() {
        let _scope = MockScope::new();
        // Mock mode is process-global, so member probes answer through the
        // default (unscripted commands succeed with empty output); script
        // the members' hostnames explicitly.
        install_script(
            "mock://seed-1",
            MockScript::new()
                .on("acs version", MockResponse::ok("version 4.1.2\n"))
                .on("acs show nodes", MockResponse::ok(NODES_TABLE)),
        );
        for (ip, hostname) in [
            ("10.0.0.11", "nd-node-1"),
            ("10.0.0.12", "nd-node-2"),
            ("10.0.0.13", "nd-node-3"),
        ] {
            install_script(
                ip,
                MockScript::new().on("hostname", MockResponse::ok(format!("{hostname}\n"))),
            );
        }

        let config = RunConfig::default();
        let discovery = discover(&seed("mock://seed-1"), &config).await.unwrap();
        assert_eq!(discovery.nodes.len(), 3);
        assert!(discovery.unreachable.is_empty());
        assert_eq!(discovery.version.as_deref(), Some("4.1.2"));
        assert_eq!(discovery.nodes[1].hostname, "nd-node-2");
        assert_eq!(discovery.nodes[1].version.as_deref(), Some("4.1.2"));
    }

    #[tokio::test]
    async fn unreachable_member_is_reported_not_fatal() {
        let _scope = MockScope::new();
        install_script(
            "mock://seed-2",
            MockScript::new()
                .on("acs version", MockResponse::ok("version 4.1.2\n"))
                .on("acs show nodes", MockResponse::ok(NODES_TABLE)),
        );
        install_script(
            "10.0.0.11",
            MockScript::new().on("hostname", MockResponse::ok("nd-node-1\n")),
        );
        install_script("10.0.0.12", MockScript::unreachable());
        install_script(
            "10.0.0.13",
            MockScript::new().on("hostname", MockResponse::ok("nd-node-3\n")),
        );

        let config = RunConfig::default();
        let discovery = discover(&seed("mock://seed-2"), &config).await.unwrap();
        assert_eq!(discovery.nodes.len(), 2);
        assert_eq!(discovery.unreachable.len(), 1);
        assert!(discovery.unreachable[0].1.is_connection());
    }

    #[tokio::test]
    async fn dead_seed_is_fatal() {
        let _scope = MockScope::new();
        install_script("mock://seed-dead", MockScript::unreachable());

        let config = RunConfig::default();
        let err = discover(&seed("mock://seed-dead"), &config)
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Seed { .. }));
    }
}
