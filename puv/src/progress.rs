//! Per-node progress display.
//!
//! One progress bar per node under a shared [`MultiProgress`], advanced by
//! phase. The check-running phase additionally folds in the runner's own
//! percentage so long-running batteries show movement between phases.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use puv_common::NodeId;
use std::collections::HashMap;
use std::sync::Mutex;

/// Where a node currently is in the validation pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum NodePhase {
    Queued,
    GeneratingBundle,
    StabilizingBundle,
    CapacityCheck,
    Deploying,
    /// Checks running on the node; inner value is the runner's own 0-100.
    RunningChecks(u8),
    Collecting,
    Complete,
    Failed(String),
}

impl NodePhase {
    pub fn percent(&self) -> u64 {
        match self {
            Self::Queued => 0,
            Self::GeneratingBundle => 10,
            Self::StabilizingBundle => 30,
            Self::CapacityCheck => 40,
            Self::Deploying => 50,
            // Runner progress maps onto the 55..=90 band.
            Self::RunningChecks(p) => 55 + (u64::from(*p.min(&100)) * 35) / 100,
            Self::Collecting => 92,
            Self::Complete => 100,
            Self::Failed(_) => 100,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Queued => "queued".into(),
            Self::GeneratingBundle => "generating bundle".into(),
            Self::StabilizingBundle => "waiting for bundle to stabilize".into(),
            Self::CapacityCheck => "checking disk capacity".into(),
            Self::Deploying => "deploying check runner".into(),
            Self::RunningChecks(p) => format!("running checks ({p}%)"),
            Self::Collecting => "collecting results".into(),
            Self::Complete => "complete".into(),
            Self::Failed(reason) => format!("failed: {reason}"),
        }
    }
}

/// Tracks one bar per node; safe to update from concurrent tasks.
pub struct ProgressTracker {
    multi: MultiProgress,
    bars: Mutex<HashMap<NodeId, ProgressBar>>,
    enabled: bool,
}

impl ProgressTracker {
    /// `enabled = false` turns every update into a no-op (non-interactive
    /// runs log through tracing instead).
    pub fn new(enabled: bool) -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
            enabled,
        }
    }

    fn style() -> ProgressStyle {
        ProgressStyle::with_template("{prefix:>14} [{bar:30.cyan/blue}] {percent:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ")
    }

    pub fn register(&self, node: &NodeId) {
        if !self.enabled {
            return;
        }
        let bar = self.multi.add(ProgressBar::new(100));
        bar.set_style(Self::style());
        bar.set_prefix(node.to_string());
        bar.set_message(NodePhase::Queued.message());
        self.bars
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(node.clone(), bar);
    }

    pub fn update(&self, node: &NodeId, phase: NodePhase) {
        if !self.enabled {
            return;
        }
        let bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(bar) = bars.get(node) {
            bar.set_position(phase.percent());
            bar.set_message(phase.message());
            if matches!(phase, NodePhase::Complete | NodePhase::Failed(_)) {
                bar.finish();
            }
        }
    }

    pub fn clear(&self) {
        if self.enabled {
            let _ = self.multi.clear();
        }
    }
}
