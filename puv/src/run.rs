//! End-to-end run orchestration.
//!
//! Pipeline: discover the cluster, assess controller resources, then push
//! every node through capacity gate, bundle acquisition, check-runner
//! deployment, and result collection - each phase as one bounded pool pass
//! so a slow node only ever delays its own batch. Per-node failures turn
//! into ERROR rows; the run itself only aborts when discovery fails or the
//! operator cancels before any node completes. Remote cleanup always runs.

use crate::assess;
use crate::bundle::{self, BundleInfo, BundleMode, SystemClock};
use crate::capacity;
use crate::cluster;
use crate::collect;
use crate::deploy;
use crate::pool::WorkerPool;
use crate::progress::{NodePhase, ProgressTracker};
use crate::report::{self, Report};
use anyhow::{Context, Result};
use chrono::Local;
use puv_common::{NodeConfig, NodeFailure, RunConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Operator-facing options for one validation run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Seed node used for cluster discovery.
    pub seed: NodeConfig,
    pub mode: BundleMode,
    /// Parent directory for the timestamped results directory.
    pub output_dir: PathBuf,
    pub show_progress: bool,
}

/// What a finished run produced.
pub struct RunOutcome {
    pub report: Report,
    pub results_dir: PathBuf,
    pub archive: PathBuf,
}

/// Run the full validation pipeline, cancelling on Ctrl-C or on the
/// configured run deadline, whichever comes first.
pub async fn execute(options: RunOptions, config: RunConfig) -> Result<RunOutcome> {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let deadline = config.run_timeout;
    tokio::spawn(async move {
        let interrupt = async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => warn!("interrupt received, cancelling run"),
                // No signal handler means no interrupt will ever arrive.
                Err(_) => std::future::pending::<()>().await,
            }
        };
        match deadline {
            Some(limit) => tokio::select! {
                () = interrupt => {}
                () = tokio::time::sleep(limit) => {
                    warn!(limit_secs = limit.as_secs(), "run deadline reached, cancelling run");
                }
            },
            None => interrupt.await,
        }
        let _ = cancel_tx.send(true);
    });
    execute_with_cancel(options, config, cancel_rx).await
}

/// Pipeline body with an injectable cancel signal (tests drive it directly
/// instead of raising a real SIGINT).
pub async fn execute_with_cancel(
    options: RunOptions,
    config: RunConfig,
    cancel_rx: watch::Receiver<bool>,
) -> Result<RunOutcome> {
    let discovery = cluster::discover(&options.seed, &config)
        .await
        .context("cluster discovery failed")?;

    let concurrency = assess::assess(&config).context("resource assessment failed")?;
    info!(
        nodes = discovery.nodes.len(),
        unreachable = discovery.unreachable.len(),
        concurrency,
        mode = ?options.mode,
        "starting validation run"
    );

    let results_dir = options
        .output_dir
        .join(report::results_dir_name(Local::now()));
    std::fs::create_dir_all(&results_dir)
        .with_context(|| format!("creating {}", results_dir.display()))?;

    let config = Arc::new(config);
    let tracker = Arc::new(ProgressTracker::new(options.show_progress));
    let clock = Arc::new(SystemClock);
    let mut report = Report::new();

    for node in &discovery.nodes {
        tracker.register(&node.id);
    }
    for (node, failure) in &discovery.unreachable {
        tracker.register(&node.id);
        fail_node(&mut report, &tracker, node, failure);
    }

    let all_nodes = discovery.nodes.clone();
    let pool = WorkerPool::new(concurrency, cancel_rx);

    // Capacity gate: only generation adds a new bundle to the disk.
    let mut admitted = discovery.nodes;
    if options.mode == BundleMode::Generate {
        let gate_results = {
            let config = config.clone();
            let tracker = tracker.clone();
            pool.run("capacity gate", admitted, move |node: NodeConfig| {
                let config = config.clone();
                let tracker = tracker.clone();
                async move {
                    tracker.update(&node.id, NodePhase::CapacityCheck);
                    let sizes = bundle::existing_bundle_sizes(&node, &config).await?;
                    let estimate = capacity::estimate_bundle_bytes(
                        &sizes,
                        capacity::DEFAULT_BUNDLE_ESTIMATE_BYTES,
                    );
                    capacity::check_node(&node, &config, estimate).await?;
                    Ok(())
                }
            })
            .await
        };
        admitted = absorb(&mut report, &tracker, gate_results, |n| n)
            .into_iter()
            .map(|(node, ())| node)
            .collect();
    }

    // Bundle acquisition.
    let bundle_results = {
        let config = config.clone();
        let tracker = tracker.clone();
        let clock = clock.clone();
        let mode = options.mode;
        pool.run("bundle acquisition", admitted, move |node: NodeConfig| {
            let config = config.clone();
            let tracker = tracker.clone();
            let clock = clock.clone();
            async move {
                tracker.update(&node.id, NodePhase::GeneratingBundle);
                bundle::acquire(&node, &config, mode, clock.as_ref()).await
            }
        })
        .await
    };
    let with_bundles: Vec<(NodeConfig, BundleInfo)> =
        absorb(&mut report, &tracker, bundle_results, |n| n);
    let bundle_records: std::collections::HashMap<puv_common::NodeId, BundleInfo> = with_bundles
        .iter()
        .map(|(node, bundle)| (node.id.clone(), bundle.clone()))
        .collect();

    // Deploy the runner and wait for the battery to finish.
    let run_results = {
        let config = config.clone();
        let tracker = tracker.clone();
        let clock = clock.clone();
        pool.run(
            "check execution",
            with_bundles,
            move |(node, bundle): (NodeConfig, BundleInfo)| {
                let config = config.clone();
                let tracker = tracker.clone();
                let clock = clock.clone();
                async move {
                    tracker.update(&node.id, NodePhase::Deploying);
                    deploy::deploy_and_launch(&node, &config, &bundle).await?;
                    tracker.update(&node.id, NodePhase::RunningChecks(0));
                    deploy::monitor(&node, &config, clock.as_ref(), |status| {
                        tracker.update(&node.id, NodePhase::RunningChecks(status.progress));
                    })
                    .await?;
                    Ok(())
                }
            },
        )
        .await
    };
    let completed: Vec<NodeConfig> = absorb(&mut report, &tracker, run_results, |(n, _)| n)
        .into_iter()
        .map(|((node, _), ())| node)
        .collect();

    // Collect results into the local results directory.
    let collect_results = {
        let config = config.clone();
        let tracker = tracker.clone();
        let results_dir = results_dir.clone();
        pool.run("result collection", completed, move |node: NodeConfig| {
            let config = config.clone();
            let tracker = tracker.clone();
            let results_dir = results_dir.clone();
            async move {
                tracker.update(&node.id, NodePhase::Collecting);
                collect::collect_node(&node, &config, &results_dir).await
            }
        })
        .await
    };
    for (node, node_report) in absorb(&mut report, &tracker, collect_results, |n| n) {
        report.merge_node(node.id.clone(), collect::report_rows(&node, &node_report));
        tracker.update(&node.id, NodePhase::Complete);
    }

    // Cleanup runs unconditionally, even after cancellation or mid-phase
    // failures, so no half-deployed runner is left behind. It gets its own
    // pool on a fresh signal: a cancelled run still cleans up, batched
    // like every other phase. Bundles this run generated are removed too;
    // reused ones are not ours to delete.
    let (_cleanup_tx, cleanup_rx) = watch::channel(false);
    let cleanup_pool = WorkerPool::new(concurrency, cleanup_rx);
    let bundle_records = Arc::new(bundle_records);
    {
        let config = config.clone();
        let bundle_records = bundle_records.clone();
        cleanup_pool
            .run("remote cleanup", all_nodes, move |node: NodeConfig| {
                let config = config.clone();
                let bundle_records = bundle_records.clone();
                async move {
                    let generated = bundle_records
                        .get(&node.id)
                        .filter(|bundle| !bundle.reused)
                        .map(|bundle| bundle.path.clone());
                    collect::cleanup_node(&node, &config, generated.as_deref()).await;
                    Ok::<(), NodeFailure>(())
                }
            })
            .await;
    }

    report
        .write_artifacts(&results_dir)
        .context("writing report artifacts")?;
    let archive = report::archive_results(&results_dir)
        .await
        .context("archiving results")?;

    tracker.clear();
    let summary = report.summary();
    info!(
        nodes = summary.nodes,
        pass = summary.pass,
        fail = summary.fail,
        skip = summary.skip,
        error = summary.error,
        all_passed = report.all_passed(),
        "validation run finished"
    );

    Ok(RunOutcome {
        report,
        results_dir,
        archive,
    })
}

fn fail_node(
    report: &mut Report,
    tracker: &ProgressTracker,
    node: &NodeConfig,
    failure: &NodeFailure,
) {
    warn!(node = %node.id, failure = %failure, "node failed");
    tracker.update(&node.id, NodePhase::Failed(failure.to_string()));
    report.merge_node(node.id.clone(), collect::failure_rows(node, failure));
}

/// Split a pool pass into survivors and recorded failures. `node_of` maps
/// the pool item back to its node for failure attribution.
fn absorb<N, T>(
    report: &mut Report,
    tracker: &ProgressTracker,
    results: Vec<(N, Result<T, NodeFailure>)>,
    node_of: impl Fn(&N) -> &NodeConfig,
) -> Vec<(N, T)> {
    let mut survivors = Vec::with_capacity(results.len());
    for (item, result) in results {
        match result {
            Ok(value) => survivors.push((item, value)),
            Err(failure) => fail_node(report, tracker, node_of(&item), &failure),
        }
    }
    survivors
}
