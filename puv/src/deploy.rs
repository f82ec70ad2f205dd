//! Check-runner deployment and monitoring.
//!
//! The runner script is embedded in the binary, staged through a local
//! temporary file, and copied to the node's working directory. It runs
//! detached under `nohup` so an interrupted controller session does not
//! kill in-flight checks; the controller tracks it purely through the
//! status file the runner keeps updated.

use crate::bundle::{BundleInfo, Clock};
use puv_common::{NodeConfig, NodeFailure, NodeSession, RunConfig};
use serde::Deserialize;
use std::borrow::Cow;
use std::io::Write;
use tracing::{debug, info, warn};

/// The runner script deployed to every node.
pub const CHECK_WORKER: &str = include_str!("../assets/check_worker.py");

/// Remote file name of the deployed runner.
pub const WORKER_FILE_NAME: &str = "check_worker.py";

fn escape(value: &str) -> String {
    shell_escape::escape(Cow::Borrowed(value)).into_owned()
}

/// Rolling status written by the runner while it works.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerStatus {
    pub node_name: String,
    pub status: String,
    #[serde(default)]
    pub current_operation: String,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub last_updated: String,
}

impl RunnerStatus {
    pub fn is_completed(&self) -> bool {
        self.status.eq_ignore_ascii_case("completed")
    }

    pub fn is_failed(&self) -> bool {
        self.status.eq_ignore_ascii_case("failed")
    }
}

fn session_for<'a>(node: &'a NodeConfig, config: &RunConfig) -> NodeSession<'a> {
    NodeSession::new(node)
        .connect_timeout(config.connect_timeout)
        .command_timeout(config.command_timeout)
        .transfer_timeout(config.transfer_timeout)
}

/// Stage the runner script on the node and start it against `bundle`.
pub async fn deploy_and_launch(
    node: &NodeConfig,
    config: &RunConfig,
    bundle: &BundleInfo,
) -> Result<(), NodeFailure> {
    let session = session_for(node, config);

    session
        .create_directory(&config.remote_base_dir)
        .await
        .map_err(|e| NodeFailure::from_ssh("runner deployment", e))?;

    // scp needs a real local file; NamedTempFile cleans up after the copy.
    let staged = stage_worker_script().map_err(|e| NodeFailure::Command {
        operation: "runner deployment".into(),
        reason: format!("failed to stage runner script: {e}"),
    })?;

    let remote_script = format!("{}/{}", config.remote_base_dir, WORKER_FILE_NAME);
    session
        .copy_to(staged.path(), &remote_script)
        .await
        .map_err(|e| NodeFailure::from_ssh("runner deployment", e))?;

    let version_arg = node
        .version
        .as_deref()
        .map(|v| format!(" {}", escape(v)))
        .unwrap_or_default();
    let launch = format!(
        "cd {base} && nohup python {script} {bundle}{version} > {log} 2>&1 &",
        base = escape(&config.remote_base_dir),
        script = WORKER_FILE_NAME,
        bundle = escape(&bundle.path),
        version = version_arg,
        log = escape(&format!("{}_debug.log", node.hostname)),
    );

    session
        .run_checked(&launch)
        .await
        .map_err(|e| NodeFailure::from_ssh("runner launch", e))?;

    info!(node = %node.id, bundle = %bundle.path, "check runner launched");
    Ok(())
}

fn stage_worker_script() -> std::io::Result<tempfile::NamedTempFile> {
    let mut staged = tempfile::NamedTempFile::new()?;
    staged.write_all(CHECK_WORKER.as_bytes())?;
    staged.flush()?;
    Ok(staged)
}

/// Poll the runner's status file until it completes or the budget runs out.
///
/// `on_progress` receives each fresh status snapshot for display. A status
/// file that has not appeared yet is a normal early state, not a failure.
pub async fn monitor<C, F>(
    node: &NodeConfig,
    config: &RunConfig,
    clock: &C,
    mut on_progress: F,
) -> Result<RunnerStatus, NodeFailure>
where
    C: Clock,
    F: FnMut(&RunnerStatus),
{
    let session = session_for(node, config);
    let status_path = format!(
        "{}/{}_status.json",
        config.remote_base_dir, node.hostname
    );
    let read_cmd = format!("cat {} 2>/dev/null || true", escape(&status_path));

    for attempt in 1..=config.runner_max_attempts {
        clock.sleep(config.runner_poll_interval).await;

        let raw = session
            .run_checked(&read_cmd)
            .await
            .map_err(|e| NodeFailure::from_ssh("runner monitoring", e))?;

        if raw.trim().is_empty() {
            debug!(node = %node.id, attempt, "status file not present yet");
            continue;
        }

        let status: RunnerStatus = match serde_json::from_str(raw.trim()) {
            Ok(status) => status,
            Err(e) => {
                // The runner rewrites the file atomically, but a node shell
                // quirk can still hand us a torn read; wait for the next poll.
                debug!(node = %node.id, attempt, error = %e, "unparseable status file");
                continue;
            }
        };

        debug!(
            node = %node.id,
            status = %status.status,
            operation = %status.current_operation,
            progress = status.progress,
            "runner status"
        );
        on_progress(&status);

        if status.is_completed() {
            info!(node = %node.id, attempts = attempt, "check runner completed");
            return Ok(status);
        }
        if status.is_failed() {
            warn!(
                node = %node.id,
                operation = %status.current_operation,
                "check runner reported failure"
            );
            return Err(NodeFailure::Command {
                operation: "check runner".into(),
                reason: format!("runner failed during '{}'", status.current_operation),
            });
        }
    }

    Err(NodeFailure::Timeout {
        operation: "check runner".into(),
        attempts: config.runner_max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::tests_support::TestClock;
    use puv_common::mock::{install_script, invocations_for, MockResponse, MockScope, MockScript};

    fn node(host: &str) -> NodeConfig {
        let mut node = NodeConfig::new("nd-node-1", host, "rescue-user", "~/.ssh/id_rsa");
        node.version = Some("4.1.2".into());
        node
    }

    fn bundle() -> BundleInfo {
        BundleInfo {
            path: "/techsupport/ts-nd-node-1.tgz".into(),
            size_bytes: 1024,
            reused: false,
        }
    }

    #[test]
    fn embedded_worker_covers_all_checks() {
        for name in puv_common::CHECK_NAMES {
            assert!(
                CHECK_WORKER.contains(&format!("\"{name}\"")),
                "runner script missing check {name}"
            );
        }
    }

    #[tokio::test]
    async fn deploy_creates_dir_and_launches_detached() {
        let _scope = MockScope::new();
        let host = "mock://deploy-ok";
        install_script(host, MockScript::new());

        let node = node(host);
        let config = RunConfig::default();
        deploy_and_launch(&node, &config, &bundle()).await.unwrap();

        let commands = invocations_for(host);
        assert!(commands.iter().any(|c| c.contains("mkdir -p")));
        let launch = commands
            .iter()
            .find(|c| c.contains("nohup python"))
            .expect("launch command issued");
        assert!(launch.contains("/techsupport/ts-nd-node-1.tgz"));
        assert!(launch.contains("4.1.2"));
        assert!(launch.contains("nd-node-1_debug.log"));
    }

    #[tokio::test]
    async fn launch_quotes_hostname_derived_log_name() {
        let _scope = MockScope::new();
        let host = "mock://deploy-odd-host";
        install_script(host, MockScript::new());

        let mut node = node(host);
        // Hostnames come back from the node itself; quoting must not
        // depend on them being shell-clean.
        node.hostname = "nd node-1".into();

        let config = RunConfig::default();
        deploy_and_launch(&node, &config, &bundle()).await.unwrap();

        let commands = invocations_for(host);
        let launch = commands
            .iter()
            .find(|c| c.contains("nohup python"))
            .expect("launch command issued");
        assert!(launch.contains("'nd node-1_debug.log'"));
    }

    #[tokio::test]
    async fn monitor_waits_through_running_states() {
        let _scope = MockScope::new();
        let host = "mock://monitor-ok";
        install_script(
            host,
            MockScript::new().on_sequence(
                "_status.json",
                vec![
                    MockResponse::ok(""),
                    MockResponse::ok(
                        r#"{"node_name":"nd-node-1","status":"running","current_operation":"disk_space","progress":35,"last_updated":"x"}"#,
                    ),
                    MockResponse::ok(
                        r#"{"node_name":"nd-node-1","status":"completed","current_operation":"done","progress":100,"last_updated":"x"}"#,
                    ),
                ],
            ),
        );

        let node = node(host);
        let config = RunConfig::default();
        let clock = TestClock::new();
        let mut seen = Vec::new();

        let status = monitor(&node, &config, &clock, |s| seen.push(s.progress))
            .await
            .unwrap();
        assert!(status.is_completed());
        assert_eq!(seen, vec![35, 100]);
        assert_eq!(clock.sleeps(), 3);
    }

    #[tokio::test]
    async fn monitor_surfaces_runner_failure() {
        let _scope = MockScope::new();
        let host = "mock://monitor-fail";
        install_script(
            host,
            MockScript::new().on(
                "_status.json",
                MockResponse::ok(
                    r#"{"node_name":"nd-node-1","status":"failed","current_operation":"pod_status","progress":40,"last_updated":"x"}"#,
                ),
            ),
        );

        let node = node(host);
        let config = RunConfig::default();
        let clock = TestClock::new();

        let err = monitor(&node, &config, &clock, |_| {}).await.unwrap_err();
        match err {
            NodeFailure::Command { reason, .. } => assert!(reason.contains("pod_status")),
            other => panic!("expected Command, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn monitor_times_out_on_silent_runner() {
        let _scope = MockScope::new();
        let host = "mock://monitor-silent";
        install_script(
            host,
            MockScript::new().on("_status.json", MockResponse::ok("")),
        );

        let node = node(host);
        let config = RunConfig {
            runner_max_attempts: 4,
            ..RunConfig::default()
        };
        let clock = TestClock::new();

        let err = monitor(&node, &config, &clock, |_| {}).await.unwrap_err();
        assert_eq!(
            err,
            NodeFailure::Timeout {
                operation: "check runner".into(),
                attempts: 4,
            }
        );
    }
}
