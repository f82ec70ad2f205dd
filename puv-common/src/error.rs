//! Per-node failure taxonomy.
//!
//! Failures are attributed to the narrowest scope (one node, one
//! operation) and travel as data into the final report; they never abort
//! sibling work. The run itself only aborts when continuation is
//! meaningless (no reachable nodes, user cancellation).

use crate::ssh::SshError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A failure scoped to one node's processing.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum NodeFailure {
    /// Could not reach or authenticate to the node.
    #[error("connection to {host} failed: {reason}")]
    Connection { host: String, reason: String },

    /// A remote command failed or could not be executed.
    #[error("{operation} failed: {reason}")]
    Command { operation: String, reason: String },

    /// Pre-extraction capacity gate rejected the node.
    #[error("projected disk usage {projected_pct:.1}% exceeds threshold {threshold_pct:.1}%")]
    Capacity {
        projected_pct: f64,
        threshold_pct: f64,
    },

    /// A polling budget was exhausted without reaching the goal state.
    #[error("{operation} timed out after {attempts} attempts")]
    Timeout { operation: String, attempts: u32 },

    /// Result file missing or unparsable.
    #[error("result aggregation failed: {reason}")]
    Aggregation { reason: String },

    /// The run was cancelled while this node was pending or in flight.
    #[error("cancelled")]
    Cancelled,
}

impl NodeFailure {
    /// Attribute an SSH-layer error to a named operation.
    ///
    /// Connection-class errors keep their own variant so the report can
    /// distinguish "node unreachable" from "command failed on the node".
    pub fn from_ssh(operation: &str, err: SshError) -> Self {
        match err {
            SshError::ConnectionTimeout { host, .. } => Self::Connection {
                host,
                reason: "connection timed out".into(),
            },
            SshError::AuthenticationFailed { host, user } => Self::Connection {
                host,
                reason: format!("authentication failed for user {}", user),
            },
            SshError::HostUnreachable { host, reason } => Self::Connection { host, reason },
            SshError::HostKeyVerificationFailed { host } => Self::Connection {
                host,
                reason: "host key verification failed".into(),
            },
            other => Self::Command {
                operation: operation.to_string(),
                reason: other.to_string(),
            },
        }
    }

    /// True for failures that mean the node was never processed at all.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}
