//! Diagnostic bundle generation and stabilization.
//!
//! Triggers tech-support collection on a node, waits for the new bundle to
//! appear in the bundle directory, then watches its size until two
//! consecutive polls agree - the platform writes bundles incrementally, so
//! a file that exists is not yet a file that is complete. The whole wait
//! is bounded by a shared attempt budget.

use puv_common::{NodeConfig, NodeFailure, NodeSession, RunConfig, SshError};
use std::borrow::Cow;
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Injectable sleep source so the poll loops are testable without real
/// waiting.
pub trait Clock: Send + Sync {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// Wall-clock implementation used in production.
pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}

/// Whether to generate a fresh bundle or reuse the newest existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleMode {
    Generate,
    Reuse,
}

/// A ready-to-analyze bundle on a node.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleInfo {
    pub path: String,
    pub size_bytes: u64,
    pub reused: bool,
}

fn escape(value: &str) -> String {
    shell_escape::escape(Cow::Borrowed(value)).into_owned()
}

/// Command that triggers tech-support collection for the node's platform
/// version. 4.x and later collect everything with the bare command; older
/// releases need the explicit system scope.
pub fn trigger_command(version: Option<&str>) -> &'static str {
    let major = version
        .and_then(|v| v.split('.').next())
        .and_then(|m| m.trim().parse::<u32>().ok());
    match major {
        Some(m) if m >= 4 => "acs techsupport collect",
        _ => "acs techsupport collect -s system",
    }
}

/// List bundles for this node's hostname, newest first.
///
/// Empty output (no matching bundle yet) is a normal state, not an error.
async fn list_bundles(
    session: &NodeSession<'_>,
    config: &RunConfig,
    hostname: &str,
) -> Result<Vec<String>, SshError> {
    let cmd = format!(
        "ls -1t {}/*{}*.tgz 2>/dev/null || true",
        config.bundle_dir,
        escape(hostname)
    );
    let stdout = session.run_checked(&cmd).await?;
    Ok(stdout
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect())
}

async fn bundle_size(session: &NodeSession<'_>, path: &str) -> Result<u64, SshError> {
    let stdout = session
        .run_checked(&format!("stat -c %s {}", escape(path)))
        .await?;
    stdout
        .trim()
        .parse::<u64>()
        .map_err(|_| SshError::CommandFailed {
            host: session.node().host.clone(),
            exit_code: 0,
            stderr: format!("unparseable stat output: '{}'", stdout.trim()),
        })
}

/// Sizes of all existing bundles for the node, for capacity estimation.
pub async fn existing_bundle_sizes(
    node: &NodeConfig,
    config: &RunConfig,
) -> Result<Vec<u64>, NodeFailure> {
    let session = session_for(node, config);
    let paths = list_bundles(&session, config, &node.hostname)
        .await
        .map_err(|e| NodeFailure::from_ssh("bundle listing", e))?;

    let mut sizes = Vec::with_capacity(paths.len());
    for path in &paths {
        match bundle_size(&session, path).await {
            Ok(size) => sizes.push(size),
            Err(e) => {
                // A bundle can be rotated away between the listing and the
                // stat; skip it rather than failing the estimate.
                debug!(node = %node.id, path = %path, error = %e, "skipping unstattable bundle");
            }
        }
    }
    Ok(sizes)
}

fn session_for<'a>(node: &'a NodeConfig, config: &RunConfig) -> NodeSession<'a> {
    NodeSession::new(node)
        .connect_timeout(config.connect_timeout)
        .command_timeout(config.command_timeout)
}

/// Obtain a ready bundle for the node according to `mode`.
///
/// Reuse mode picks the newest existing bundle; when a node has none, it
/// falls back to generating a fresh one so a mixed-age cluster still
/// produces a complete report.
pub async fn acquire<C: Clock>(
    node: &NodeConfig,
    config: &RunConfig,
    mode: BundleMode,
    clock: &C,
) -> Result<BundleInfo, NodeFailure> {
    let session = session_for(node, config);

    if mode == BundleMode::Reuse {
        let existing = list_bundles(&session, config, &node.hostname)
            .await
            .map_err(|e| NodeFailure::from_ssh("bundle listing", e))?;
        if let Some(newest) = existing.first() {
            let size_bytes = bundle_size(&session, newest)
                .await
                .map_err(|e| NodeFailure::from_ssh("bundle inspection", e))?;
            if size_bytes > 0 {
                info!(
                    node = %node.id,
                    bundle = %newest,
                    size_bytes,
                    "reusing existing bundle"
                );
                return Ok(BundleInfo {
                    path: newest.clone(),
                    size_bytes,
                    reused: true,
                });
            }
            warn!(node = %node.id, bundle = %newest, "newest bundle is empty, generating");
        } else {
            info!(node = %node.id, "no existing bundle to reuse, generating");
        }
    }

    generate(node, config, &session, clock).await
}

async fn generate<C: Clock>(
    node: &NodeConfig,
    config: &RunConfig,
    session: &NodeSession<'_>,
    clock: &C,
) -> Result<BundleInfo, NodeFailure> {
    let snapshot: HashSet<String> = list_bundles(session, config, &node.hostname)
        .await
        .map_err(|e| NodeFailure::from_ssh("bundle listing", e))?
        .into_iter()
        .collect();

    let trigger = trigger_command(node.version.as_deref());
    info!(node = %node.id, command = trigger, "triggering bundle generation");
    session
        .run_checked(trigger)
        .await
        .map_err(|e| NodeFailure::from_ssh("bundle trigger", e))?;

    // One attempt budget covers both discovery and size stabilization.
    let mut new_path: Option<String> = None;
    let mut last_size: Option<u64> = None;

    for attempt in 1..=config.poll_max_attempts {
        clock.sleep(config.poll_interval).await;

        match &new_path {
            None => {
                let current = list_bundles(session, config, &node.hostname)
                    .await
                    .map_err(|e| NodeFailure::from_ssh("bundle listing", e))?;
                if let Some(found) = current.iter().find(|p| !snapshot.contains(*p)) {
                    debug!(
                        node = %node.id,
                        bundle = %found,
                        attempt,
                        "new bundle appeared, watching size"
                    );
                    new_path = Some(found.clone());
                }
            }
            Some(path) => {
                let size = bundle_size(session, path)
                    .await
                    .map_err(|e| NodeFailure::from_ssh("bundle inspection", e))?;
                match last_size {
                    Some(previous) if previous == size => {
                        info!(
                            node = %node.id,
                            bundle = %path,
                            size_bytes = size,
                            attempts = attempt,
                            "bundle size stable"
                        );
                        return Ok(BundleInfo {
                            path: path.clone(),
                            size_bytes: size,
                            reused: false,
                        });
                    }
                    _ => {
                        debug!(
                            node = %node.id,
                            bundle = %path,
                            size_bytes = size,
                            attempt,
                            "bundle still growing"
                        );
                        last_size = Some(size);
                    }
                }
            }
        }
    }

    warn!(
        node = %node.id,
        attempts = config.poll_max_attempts,
        "bundle never stabilized within the poll budget"
    );
    Err(NodeFailure::Timeout {
        operation: "bundle generation".into(),
        attempts: config.poll_max_attempts,
    })
}

/// Test-only clock that returns immediately but counts sleeps; shared by
/// every module that polls.
#[cfg(test)]
pub(crate) mod tests_support {
    use super::Clock;
    use std::future::Future;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    pub struct TestClock(AtomicU32);

    impl TestClock {
        pub fn new() -> Self {
            Self(AtomicU32::new(0))
        }

        pub fn sleeps(&self) -> u32 {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl Clock for TestClock {
        fn sleep(&self, _duration: Duration) -> impl Future<Output = ()> + Send {
            self.0.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }
}
