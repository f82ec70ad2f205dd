//! Cluster pre-upgrade validator.
//!
//! Connects to a seed node, discovers the cluster, collects a diagnostic
//! bundle from every node, runs the health-check battery against each one,
//! and prints an aggregated readiness report. Exit code 0 means every
//! check on every node passed.

use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::{theme::ColorfulTheme, Input, Select};
use puv::bundle::BundleMode;
use puv::run::{self, RunOptions, RunOutcome};
use puv_common::{init_logging, LogConfig, NodeConfig, RunConfig};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, warn};

#[derive(Parser, Debug)]
#[command(
    name = "puv",
    version,
    about = "Cluster pre-upgrade validator",
    long_about = "Collects diagnostic bundles from every cluster node over SSH, runs the \
                  pre-upgrade health-check battery on each, and aggregates a readiness report."
)]
struct Cli {
    /// Seed node address (prompted for when omitted).
    #[arg(long)]
    host: Option<String>,

    /// SSH user for all nodes (prompted for when omitted interactively).
    #[arg(long)]
    user: Option<String>,

    /// SSH identity file (prompted for when omitted interactively).
    #[arg(long)]
    identity: Option<String>,

    /// Reuse each node's newest existing bundle instead of generating.
    #[arg(long, conflicts_with = "generate")]
    reuse: bool,

    /// Generate fresh bundles (the default; kept for scripting clarity).
    #[arg(long)]
    generate: bool,

    /// Parent directory for the timestamped results directory.
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// Explicit worker concurrency; bypasses the resource assessor.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Disable per-node progress bars.
    #[arg(long)]
    no_progress: bool,

    /// Log level (overridable via PUV_LOG_LEVEL).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_config = LogConfig::from_env(&cli.log_level).with_stderr();
    let _guards = match init_logging(&log_config) {
        Ok(guards) => Some(guards),
        Err(e) => {
            eprintln!("warning: logging setup failed: {e}");
            None
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            return ExitCode::from(2);
        }
    };

    match runtime.block_on(run_cli(cli)) {
        Ok(outcome) => {
            println!("{}", outcome.report.render_matrix());
            let summary = outcome.report.summary();
            println!(
                "Nodes: {}  PASS: {}  FAIL: {}  SKIP: {}  ERROR: {}",
                summary.nodes, summary.pass, summary.fail, summary.skip, summary.error
            );
            println!("Results: {}", outcome.results_dir.display());
            println!("Archive: {}", outcome.archive.display());
            if outcome.report.all_passed() {
                println!("Cluster is READY for upgrade.");
                ExitCode::SUCCESS
            } else {
                println!("Cluster is NOT ready for upgrade.");
                ExitCode::from(1)
            }
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "validation run failed");
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

async fn run_cli(cli: Cli) -> Result<RunOutcome> {
    let interactive = std::io::stdin().is_terminal();

    let host = match cli.host {
        Some(host) => host,
        None if interactive => Input::with_theme(&ColorfulTheme::default())
            .with_prompt("Seed node address")
            .interact_text()
            .context("failed to read seed node address")?,
        None => anyhow::bail!("--host is required when not running interactively"),
    };

    let user = prompt_or_default(cli.user, interactive, "SSH user", "rescue-user")?;
    let identity = prompt_or_default(cli.identity, interactive, "SSH identity file", "~/.ssh/id_rsa")?;

    let mode = if cli.reuse {
        BundleMode::Reuse
    } else if cli.generate || !interactive {
        BundleMode::Generate
    } else {
        let choice = Select::with_theme(&ColorfulTheme::default())
            .with_prompt("Diagnostic bundles")
            .items(&[
                "Generate fresh bundles (recommended)",
                "Reuse each node's newest existing bundle",
            ])
            .default(0)
            .interact()
            .context("failed to read bundle mode selection")?;
        if choice == 1 {
            BundleMode::Reuse
        } else {
            BundleMode::Generate
        }
    };

    let (mut config, env_errors) = RunConfig::from_env();
    for env_error in env_errors {
        warn!(error = %env_error, "ignoring invalid environment override");
    }
    if cli.concurrency.is_some() {
        config.concurrency_override = cli.concurrency;
    }

    let seed = NodeConfig::new("seed", host, user, identity);
    let options = RunOptions {
        seed,
        mode,
        output_dir: cli.output_dir,
        show_progress: interactive && !cli.no_progress,
    };

    run::execute(options, config).await
}

fn prompt_or_default(
    flag: Option<String>,
    interactive: bool,
    prompt: &str,
    default: &str,
) -> Result<String> {
    match flag {
        Some(value) => Ok(value),
        None if interactive => Input::with_theme(&ColorfulTheme::default())
            .with_prompt(prompt)
            .default(default.to_string())
            .interact_text()
            .with_context(|| format!("failed to read {prompt}")),
        None => Ok(default.to_string()),
    }
}
