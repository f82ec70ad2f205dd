//! Cluster Pre-Upgrade Validator - Common Library
//!
//! Shared types, remote session handling, and configuration used by the
//! `puv` orchestrator and its tests.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod logging;
pub mod mock;
pub mod ssh;
pub mod types;

pub use config::RunConfig;
pub use error::NodeFailure;
pub use logging::{init_logging, LogConfig, LogFormat, LoggingGuards};
pub use ssh::{CommandOutput, NodeSession, SshError};
pub use types::{
    parse_node_report, CheckResult, CheckStatus, NodeConfig, NodeId, NodeReport, ReportParseError,
    CHECK_NAMES,
};
