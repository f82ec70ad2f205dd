//! Remote session handling for cluster nodes.
//!
//! Drives the system `ssh`/`scp` binaries through `tokio::process` for
//! maximum compatibility with existing SSH configurations and agent
//! forwarding. Every operation is bounded by a caller-visible timeout and
//! performs no implicit retry - retry policy belongs to the state machines
//! that own the operation (bundle polling, runner monitoring).

use crate::mock;
use crate::types::NodeConfig;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Default SSH connection timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default command execution timeout in seconds.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 120;

/// Default SCP transfer timeout in seconds.
pub const DEFAULT_TRANSFER_TIMEOUT_SECS: u64 = 600;

/// Result of a remote command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl CommandOutput {
    /// Check if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Errors from the SSH transport layer.
#[derive(Debug, thiserror::Error)]
pub enum SshError {
    #[error("SSH connection timeout after {timeout_secs}s to {host}")]
    ConnectionTimeout { host: String, timeout_secs: u64 },

    #[error("Command timed out after {timeout_secs}s on {host}")]
    CommandTimeout { host: String, timeout_secs: u64 },

    #[error("SSH authentication failed for {user}@{host}")]
    AuthenticationFailed { host: String, user: String },

    #[error("Host {host} is unreachable: {reason}")]
    HostUnreachable { host: String, reason: String },

    #[error("Command failed on {host} with exit code {exit_code}: {stderr}")]
    CommandFailed {
        host: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("SSH key error for {host}: {reason}")]
    KeyError { host: String, reason: String },

    #[error("Transfer failed for {host}: {reason}")]
    TransferFailed { host: String, reason: String },

    #[error("Host key verification failed for {host}")]
    HostKeyVerificationFailed { host: String },
}

impl SshError {
    /// Classify an error from SSH stderr output.
    pub fn from_ssh_stderr(host: &str, user: &str, stderr: &str, exit_code: i32) -> Self {
        let stderr_lower = stderr.to_lowercase();

        if stderr_lower.contains("permission denied") {
            return SshError::AuthenticationFailed {
                host: host.to_string(),
                user: user.to_string(),
            };
        }

        if stderr_lower.contains("host key verification failed") {
            return SshError::HostKeyVerificationFailed {
                host: host.to_string(),
            };
        }

        if stderr_lower.contains("connection timed out")
            || stderr_lower.contains("connection refused")
            || stderr_lower.contains("no route to host")
            || stderr_lower.contains("network is unreachable")
            || stderr_lower.contains("could not resolve hostname")
        {
            return SshError::HostUnreachable {
                host: host.to_string(),
                reason: stderr.trim().to_string(),
            };
        }

        if stderr_lower.contains("identity file") || stderr_lower.contains("invalid format") {
            return SshError::KeyError {
                host: host.to_string(),
                reason: stderr.trim().to_string(),
            };
        }

        SshError::CommandFailed {
            host: host.to_string(),
            exit_code,
            stderr: stderr.trim().to_string(),
        }
    }
}

/// True if a transport error message looks transient (retryable by a
/// caller whose state machine allows it). Conservative: authentication and
/// host-trust failures are never retryable.
pub fn is_retryable_transport_error_text(message: &str) -> bool {
    let message = message.to_lowercase();

    if message.contains("permission denied")
        || message.contains("host key verification failed")
        || message.contains("could not resolve hostname")
        || message.contains("identity file")
        || message.contains("invalid format")
    {
        return false;
    }

    message.contains("connection timed out")
        || message.contains("timed out")
        || message.contains("connection reset")
        || message.contains("broken pipe")
        || message.contains("connection refused")
        || message.contains("network is unreachable")
        || message.contains("no route to host")
        || message.contains("connection closed")
        || message.contains("kex_exchange_identification")
}

fn shell_escape_remote(path: &str) -> Option<String> {
    if path.contains('\n') || path.contains('\r') || path.contains('\0') {
        return None;
    }
    Some(shell_escape::escape(Cow::Borrowed(path)).into_owned())
}

/// One node's remote session.
///
/// Cheap to construct; each operation spawns its own `ssh`/`scp` process,
/// so a session can be shared read-only across concurrent polls. `close`
/// is implicit (no persistent channel is held).
pub struct NodeSession<'a> {
    node: &'a NodeConfig,
    connect_timeout: Duration,
    command_timeout: Duration,
    transfer_timeout: Duration,
}

impl<'a> NodeSession<'a> {
    pub fn new(node: &'a NodeConfig) -> Self {
        Self {
            node,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            transfer_timeout: Duration::from_secs(DEFAULT_TRANSFER_TIMEOUT_SECS),
        }
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    pub fn node(&self) -> &NodeConfig {
        self.node
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.node.user, self.node.host)
    }

    fn identity_path(&self) -> String {
        shellexpand::tilde(&self.node.identity_file).into_owned()
    }

    fn mocked(&self) -> bool {
        mock::is_mock_enabled() || mock::is_mock_host(&self.node.host)
    }

    fn build_ssh_args(&self, cmd: &mut Command) {
        cmd.arg("-o").arg("BatchMode=yes");
        cmd.arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs()));
        cmd.arg("-o").arg("StrictHostKeyChecking=accept-new");
        cmd.arg("-i").arg(self.identity_path());
    }

    /// Check SSH connectivity. Returns `false` on any failure; callers
    /// that need the cause use [`NodeSession::run_command`].
    pub async fn check_connectivity(&self) -> bool {
        if self.mocked() {
            let reachable = !mock::connect_fails(&self.node.host);
            debug!(
                node = %self.node.id,
                host = %self.node.host,
                reachable,
                "mock connectivity check"
            );
            return reachable;
        }

        let start = Instant::now();
        let mut cmd = Command::new("ssh");
        self.build_ssh_args(&mut cmd);
        cmd.arg(self.destination());
        cmd.arg("true");

        let grace = self.connect_timeout + Duration::from_secs(5);
        match tokio::time::timeout(grace, cmd.output()).await {
            Ok(Ok(output)) if output.status.success() => {
                info!(
                    node = %self.node.id,
                    host = %self.node.host,
                    duration_ms = %start.elapsed().as_millis(),
                    "SSH connectivity check passed"
                );
                true
            }
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!(
                    node = %self.node.id,
                    host = %self.node.host,
                    exit_code = output.status.code().unwrap_or(-1),
                    stderr = %stderr.trim(),
                    "SSH connectivity check failed"
                );
                false
            }
            Ok(Err(e)) => {
                warn!(node = %self.node.id, error = %e, "failed to spawn ssh");
                false
            }
            Err(_) => {
                warn!(
                    node = %self.node.id,
                    timeout_secs = self.connect_timeout.as_secs(),
                    "SSH connectivity check timed out"
                );
                false
            }
        }
    }

    /// Execute a command on the node.
    ///
    /// Non-zero exit codes are returned in the [`CommandOutput`], not as
    /// errors; only transport failures and timeouts error out.
    pub async fn run_command(&self, remote_cmd: &str) -> Result<CommandOutput, SshError> {
        if self.mocked() {
            if mock::connect_fails(&self.node.host) {
                return Err(SshError::HostUnreachable {
                    host: self.node.host.clone(),
                    reason: "mock: connection refused".into(),
                });
            }
            let response = mock::respond(&self.node.host, remote_cmd);
            return Ok(CommandOutput {
                stdout: response.stdout,
                stderr: response.stderr,
                exit_code: response.exit_code,
                duration: Duration::from_millis(1),
            });
        }

        debug!(
            node = %self.node.id,
            host = %self.node.host,
            command = %remote_cmd,
            timeout_secs = self.command_timeout.as_secs(),
            "executing remote command"
        );

        let start = Instant::now();
        let mut cmd = Command::new("ssh");
        self.build_ssh_args(&mut cmd);
        cmd.arg(self.destination());
        cmd.arg(remote_cmd);

        let output = match tokio::time::timeout(self.command_timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                error!(
                    node = %self.node.id,
                    command = %remote_cmd,
                    error = %e,
                    "ssh failed to execute"
                );
                return Err(SshError::HostUnreachable {
                    host: self.node.host.clone(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                warn!(
                    node = %self.node.id,
                    command = %remote_cmd,
                    timeout_secs = self.command_timeout.as_secs(),
                    "remote command timed out"
                );
                return Err(SshError::CommandTimeout {
                    host: self.node.host.clone(),
                    timeout_secs: self.command_timeout.as_secs(),
                });
            }
        };

        let duration = start.elapsed();
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        if output.status.success() {
            debug!(
                node = %self.node.id,
                command = %remote_cmd,
                duration_ms = %duration.as_millis(),
                "remote command completed"
            );
        } else {
            warn!(
                node = %self.node.id,
                command = %remote_cmd,
                exit_code,
                stderr = %stderr.trim(),
                "remote command failed"
            );
        }

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
            duration,
        })
    }

    /// Execute a command that must succeed; returns trimmed stdout.
    pub async fn run_checked(&self, remote_cmd: &str) -> Result<String, SshError> {
        let output = self.run_command(remote_cmd).await?;
        if !output.success() {
            return Err(SshError::from_ssh_stderr(
                &self.node.host,
                &self.node.user,
                &output.stderr,
                output.exit_code,
            ));
        }
        Ok(output.stdout.trim().to_string())
    }

    /// Create a directory on the node.
    pub async fn create_directory(&self, path: &str) -> Result<(), SshError> {
        let escaped = shell_escape_remote(path).ok_or_else(|| SshError::CommandFailed {
            host: self.node.host.clone(),
            exit_code: -1,
            stderr: format!("path contains control characters: {}", path),
        })?;
        self.run_checked(&format!("mkdir -p {}", escaped)).await?;
        Ok(())
    }

    /// Remove a path on the node (`rm -rf`). Best-effort callers ignore
    /// the result; the error carries the cause for logging.
    pub async fn remove_path(&self, path: &str) -> Result<(), SshError> {
        let escaped = shell_escape_remote(path).ok_or_else(|| SshError::CommandFailed {
            host: self.node.host.clone(),
            exit_code: -1,
            stderr: format!("path contains control characters: {}", path),
        })?;
        self.run_checked(&format!("rm -rf {}", escaped)).await?;
        Ok(())
    }

    /// Copy a local file to the node via SCP.
    pub async fn copy_to(&self, local_path: &Path, remote_path: &str) -> Result<(), SshError> {
        if self.mocked() {
            if mock::connect_fails(&self.node.host) {
                return Err(SshError::TransferFailed {
                    host: self.node.host.clone(),
                    reason: "mock: connection refused".into(),
                });
            }
            debug!(
                node = %self.node.id,
                local = %local_path.display(),
                remote = %remote_path,
                "mock upload"
            );
            return Ok(());
        }

        let mut cmd = Command::new("scp");
        self.build_scp_args(&mut cmd);
        cmd.arg(local_path);
        cmd.arg(format!("{}:{}", self.destination(), remote_path));
        self.run_transfer(cmd, remote_path).await
    }

    /// Copy a remote file from the node via SCP.
    pub async fn copy_from(&self, remote_path: &str, local_path: &Path) -> Result<(), SshError> {
        if self.mocked() {
            if mock::connect_fails(&self.node.host) {
                return Err(SshError::TransferFailed {
                    host: self.node.host.clone(),
                    reason: "mock: connection refused".into(),
                });
            }
            let content = mock::file_content(&self.node.host, remote_path).ok_or_else(|| {
                SshError::TransferFailed {
                    host: self.node.host.clone(),
                    reason: format!("mock: no such remote file {}", remote_path),
                }
            })?;
            std::fs::write(local_path, content).map_err(|e| SshError::TransferFailed {
                host: self.node.host.clone(),
                reason: e.to_string(),
            })?;
            return Ok(());
        }

        let mut cmd = Command::new("scp");
        self.build_scp_args(&mut cmd);
        cmd.arg(format!("{}:{}", self.destination(), remote_path));
        cmd.arg(local_path);
        self.run_transfer(cmd, remote_path).await
    }

    fn build_scp_args(&self, cmd: &mut Command) {
        cmd.arg("-o").arg("BatchMode=yes");
        cmd.arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs()));
        cmd.arg("-o").arg("StrictHostKeyChecking=accept-new");
        cmd.arg("-i").arg(self.identity_path());
        cmd.arg("-q");
    }

    async fn run_transfer(&self, mut cmd: Command, remote_path: &str) -> Result<(), SshError> {
        let start = Instant::now();
        let output = match tokio::time::timeout(self.transfer_timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(SshError::TransferFailed {
                    host: self.node.host.clone(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(SshError::TransferFailed {
                    host: self.node.host.clone(),
                    reason: format!("timeout after {}s", self.transfer_timeout.as_secs()),
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(
                node = %self.node.id,
                remote = %remote_path,
                stderr = %stderr.trim(),
                "scp transfer failed"
            );
            return Err(SshError::TransferFailed {
                host: self.node.host.clone(),
                reason: stderr.trim().to_string(),
            });
        }

        info!(
            node = %self.node.id,
            remote = %remote_path,
            duration_ms = %start.elapsed().as_millis(),
            "scp transfer completed"
        );
        Ok(())
    }
}
