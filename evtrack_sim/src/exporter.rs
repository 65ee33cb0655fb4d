//! Frame recorder for offline inspection of a scenario run.
//!
//! A recording pairs ground truth with what the tracker reported at regular
//! µs timestamps, together with the running tracker counters, so a run can
//! be replayed or plotted without re-simulating it.

use crate::oracle::Oracle;
use crate::runner::{rms_error, ScenarioMetrics, ScenarioResult};
use crate::scenarios::ScenarioId;
use crate::SimError;
use evtrack_core::{ClusterSnapshot, Tracker, TrackerConfig, TrackerStats};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Ground truth position of one blob at a frame.
#[derive(Debug, Clone, Serialize)]
pub struct BlobPosition {
    pub id: u64,
    pub x: f64,
    pub y: f64,
}

/// Tracker state sampled at one point in simulated time.
#[derive(Debug, Clone, Serialize)]
pub struct SimFrame {
    pub time_us: i64,
    pub ground_truth: Vec<BlobPosition>,

    /// Cluster snapshots without path history
    pub clusters: Vec<ClusterSnapshot>,

    /// Counters accumulated up to this frame
    pub stats: TrackerStats,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rms_error_px: Option<f64>,
}

/// Outcome of the recorded run.
#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub metrics: ScenarioMetrics,
}

/// A recorded scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct SimExport {
    pub scenario: ScenarioId,
    pub seed: u64,

    /// Tracker configuration the run used
    pub config: TrackerConfig,

    /// Record only visible clusters
    pub visible_only: bool,

    pub frames: Vec<SimFrame>,

    /// Filled in once the run completes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<ExportSummary>,
}

impl SimExport {
    pub fn new(scenario: ScenarioId, seed: u64, config: TrackerConfig) -> Self {
        Self {
            scenario,
            seed,
            config,
            visible_only: false,
            frames: Vec::new(),
            summary: None,
        }
    }

    /// Skip candidate clusters when recording frames.
    pub fn with_visible_only(mut self, visible_only: bool) -> Self {
        self.visible_only = visible_only;
        self
    }

    /// Sample the oracle and tracker at `time_us`.
    pub fn record(&mut self, time_us: i64, oracle: &Oracle, tracker: &Tracker) {
        let ground_truth = oracle.ground_truth_positions();
        let snapshot = |c: &evtrack_core::Cluster| {
            let mut s = c.snapshot();
            s.path.clear();
            s
        };
        let clusters = if self.visible_only {
            tracker.visible_clusters().map(snapshot).collect()
        } else {
            tracker.clusters().map(snapshot).collect()
        };

        self.frames.push(SimFrame {
            time_us,
            rms_error_px: rms_error(tracker, &ground_truth),
            ground_truth: ground_truth
                .into_iter()
                .map(|(id, p)| BlobPosition { id, x: p.x, y: p.y })
                .collect(),
            clusters,
            stats: tracker.stats().clone(),
        });
    }

    /// Attach the run's outcome.
    pub fn close(&mut self, result: &ScenarioResult) {
        self.summary = Some(ExportSummary {
            passed: result.passed,
            failure_reason: result.failure_reason.clone(),
            metrics: result.metrics.clone(),
        });
    }

    /// Time covered by the recorded frames (µs).
    pub fn span_us(&self) -> i64 {
        match (self.frames.first(), self.frames.last()) {
            (Some(first), Some(last)) => last.time_us.saturating_sub(first.time_us),
            _ => 0,
        }
    }

    pub fn write_json<W: Write>(&self, writer: W) -> Result<(), SimError> {
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// Write the recording to `path` as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SimError> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_json(&mut writer)?;
        writer.flush()?;
        Ok(())
    }
}
