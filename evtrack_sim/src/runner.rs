//! Scenario runner - drives the tracker with oracle events and checks the outcome.

use crate::exporter::SimExport;
use crate::oracle::Oracle;
use crate::scenarios::ScenarioId;

use evtrack_core::{Tracker, TrackerConfig, TrackerStats};
use nalgebra::Vector2;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Blob spread used by every scenario (px)
const BLOB_SIGMA_PX: f64 = 1.5;

/// Blob event rate used by every scenario (events/s)
const BLOB_RATE_HZ: f64 = 20_000.0;

/// Maximum acceptable RMS error of visible clusters (px)
const MAX_RMS_ERROR_PX: f64 = 3.0;

/// A visible cluster farther than this from every blob is spurious (px)
const SPURIOUS_DISTANCE_PX: f64 = 10.0;

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Number of active ground truth blobs at end
    pub final_blob_count: usize,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScenarioMetrics {
    /// Events produced by the oracle
    pub events_generated: u64,

    /// Events that landed in a visible cluster
    pub events_in_visible: u64,

    /// Live clusters at end
    pub final_clusters: usize,

    /// Visible clusters at end
    pub visible_clusters: usize,

    /// Largest visible population seen at any step
    pub max_visible_clusters: usize,

    /// RMS distance of visible clusters to the nearest blob (px)
    pub rms_error_px: Option<f64>,

    /// Visible clusters far from every blob at end
    pub spurious_visible: usize,

    /// Active blobs with a visible cluster nearby at end
    pub tracked_blobs: usize,

    pub tracker: TrackerStats,
}

/// Runs tracking scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Simulated duration in seconds
    duration_secs: f64,

    /// Oracle step in µs
    step_us: i64,

    /// Export a frame every this many µs
    export_interval_us: i64,

    config: TrackerConfig,
}

/// Scenario-specific timeline events.
#[derive(Debug, Default)]
struct ScenarioPlan {
    /// (blob id, time µs) at which the blob stops emitting
    deactivations: Vec<(u64, i64)>,
}

impl ScenarioRunner {
    /// Creates a new scenario runner with the default tracker configuration.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            duration_secs: 1.0,
            step_us: 1_000,
            export_interval_us: 10_000,
            config: TrackerConfig::default(),
        }
    }

    /// Sets the simulated duration.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration_secs = secs;
        self
    }

    /// Sets the tracker configuration.
    pub fn with_config(mut self, config: TrackerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the frame export interval.
    pub fn with_export_interval_us(mut self, interval_us: i64) -> Self {
        self.export_interval_us = interval_us.max(1);
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.execute(scenario, None)
    }

    /// Runs a scenario, recording frames into `export`.
    pub fn run_with_export(&self, scenario: ScenarioId, export: &mut SimExport) -> ScenarioResult {
        let result = self.execute(scenario, Some(export));
        export.close(&result);
        result
    }

    fn execute(&self, scenario: ScenarioId, mut export: Option<&mut SimExport>) -> ScenarioResult {
        info!(
            "Starting scenario: {} (seed={}) - {}",
            scenario.name(),
            self.seed,
            scenario.description()
        );

        let mut tracker = match Tracker::new(self.config.clone()) {
            Ok(tracker) => tracker,
            Err(e) => return self.failed(scenario, format!("Invalid tracker config: {}", e)),
        };

        let physics_seed = self.seed.wrapping_mul(0x9e3779b97f4a7c15);
        let mut oracle = Oracle::new(physics_seed, self.config.size_x, self.config.size_y)
            .with_step_us(self.step_us);
        let plan = self.setup(scenario, &mut oracle);

        let end_us = (self.duration_secs * 1e6) as i64;
        let mut metrics = ScenarioMetrics::default();
        let mut batch = Vec::new();
        let mut next_export_us = self.export_interval_us;
        let mut tick = 0u64;

        while oracle.time_us() < end_us {
            for &(id, at_us) in &plan.deactivations {
                if oracle.time_us() >= at_us && oracle.blob(id).map_or(false, |b| b.active) {
                    debug!("  t={:.3}s | blob {} stops emitting", oracle.time(), id);
                    oracle.deactivate_blob(id);
                }
            }

            batch.clear();
            metrics.events_generated += oracle.step(&mut batch) as u64;
            for event in &batch {
                if tracker.filter_event(event) {
                    metrics.events_in_visible += 1;
                }
            }
            metrics.max_visible_clusters = metrics.max_visible_clusters.max(tracker.visible_count());

            if let Some(export) = export.as_deref_mut() {
                if oracle.time_us() >= next_export_us {
                    export.record(oracle.time_us(), &oracle, &tracker);
                    next_export_us += self.export_interval_us;
                }
            }

            if tick % 100 == 0 {
                debug!(
                    "  t={:.3}s | blobs={} | clusters={} | visible={}",
                    oracle.time(),
                    oracle.active_blobs().len(),
                    tracker.len(),
                    tracker.visible_count()
                );
            }
            tick += 1;
        }

        // Final bulk cycle so visibility reflects the end time
        tracker.update_cluster_list(oracle.time_us());

        let ground_truth = oracle.ground_truth_positions();
        metrics.final_clusters = tracker.len();
        metrics.visible_clusters = tracker.visible_count();
        metrics.rms_error_px = rms_error(&tracker, &ground_truth);
        let (spurious, tracked) = coverage(&tracker, &ground_truth);
        metrics.spurious_visible = spurious;
        metrics.tracked_blobs = tracked;
        metrics.tracker = tracker.stats().clone();

        let failure_reason = self.evaluate(scenario, &metrics, ground_truth.len());
        let passed = failure_reason.is_none();

        if passed {
            info!(
                "✓ {} complete: {} events, {} visible clusters, RMS error: {}",
                scenario.name(),
                metrics.events_generated,
                metrics.visible_clusters,
                metrics
                    .rms_error_px
                    .map_or_else(|| "n/a".to_string(), |e| format!("{:.2}px", e))
            );
        } else {
            warn!("{} failed: {:?}", scenario.name(), failure_reason);
        }

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed,
            final_time_secs: oracle.time(),
            final_blob_count: ground_truth.len(),
            failure_reason,
            metrics,
        }
    }

    /// Spawns the scenario's blobs. Velocities scale with the duration so
    /// every trajectory stays inside the frame.
    fn setup(&self, scenario: ScenarioId, oracle: &mut Oracle) -> ScenarioPlan {
        let d = self.duration_secs.max(1e-3);
        let end_us = (self.duration_secs * 1e6) as i64;
        let mut plan = ScenarioPlan::default();
        let (w, h) = (self.config.size_x as f64, self.config.size_y as f64);

        match scenario {
            ScenarioId::SingleBlob => {
                oracle.spawn_blob(
                    Vector2::new(0.3 * w, 0.5 * h),
                    Vector2::new(0.35 * w / d, -0.1 * h / d),
                    BLOB_SIGMA_PX,
                    BLOB_RATE_HZ,
                );
            }
            ScenarioId::TwoBlobs => {
                oracle.spawn_blob(
                    Vector2::new(0.23 * w, 0.35 * h),
                    Vector2::new(0.23 * w / d, 0.08 * h / d),
                    BLOB_SIGMA_PX,
                    BLOB_RATE_HZ,
                );
                oracle.spawn_blob(
                    Vector2::new(0.75 * w, 0.65 * h),
                    Vector2::new(-0.23 * w / d, -0.08 * h / d),
                    BLOB_SIGMA_PX,
                    BLOB_RATE_HZ,
                );
            }
            ScenarioId::Converging => {
                // B meets A at 60% of the run on a heading within 50° of A's,
                // then the two objects fuse (B stops emitting).
                let meet = 0.6 * d;
                let a_start = Vector2::new(0.35 * w, 0.38 * h);
                let a_vel = Vector2::new(0.17 * w / d, 0.0);
                let b_start = a_start + Vector2::new(0.0, 0.15 * h);
                let b_vel = a_vel + (a_start - b_start) / meet;
                oracle.spawn_blob(a_start, a_vel, BLOB_SIGMA_PX, BLOB_RATE_HZ);
                let b = oracle.spawn_blob(b_start, b_vel, BLOB_SIGMA_PX, BLOB_RATE_HZ);
                plan.deactivations.push((b, (0.6 * end_us as f64) as i64));
            }
            ScenarioId::Fade => {
                let id = oracle.spawn_blob(
                    Vector2::new(0.5 * w, 0.5 * h),
                    Vector2::new(0.06 * w / d, 0.0),
                    BLOB_SIGMA_PX,
                    BLOB_RATE_HZ,
                );
                plan.deactivations.push((id, end_us / 2));
            }
            ScenarioId::NoiseFloor => {
                oracle.spawn_blob(
                    Vector2::new(0.35 * w, 0.5 * h),
                    Vector2::new(0.3 * w / d, -0.12 * h / d),
                    BLOB_SIGMA_PX,
                    BLOB_RATE_HZ,
                );
                oracle.set_noise_rate(BLOB_RATE_HZ);
            }
        }
        plan
    }

    /// Returns the failure reason, or `None` if the scenario passed.
    fn evaluate(
        &self,
        scenario: ScenarioId,
        metrics: &ScenarioMetrics,
        blobs: usize,
    ) -> Option<String> {
        // Under noise, a noise-born cluster may briefly take over the blob's
        // events, so only spurious clusters are counted there.
        let expected_visible = match scenario {
            ScenarioId::SingleBlob | ScenarioId::Converging => Some(1),
            ScenarioId::TwoBlobs => Some(2),
            ScenarioId::Fade => Some(0),
            ScenarioId::NoiseFloor => None,
        };

        if let Some(expected) = expected_visible {
            if metrics.visible_clusters != expected {
                return Some(format!(
                    "{} visible clusters, expected {}",
                    metrics.visible_clusters, expected
                ));
            }
        }
        if metrics.spurious_visible > 0 {
            return Some(format!(
                "{} visible clusters far from any blob",
                metrics.spurious_visible
            ));
        }
        if metrics.tracked_blobs < blobs {
            return Some(format!(
                "{} of {} blobs tracked by a visible cluster",
                metrics.tracked_blobs, blobs
            ));
        }
        if scenario == ScenarioId::Fade && metrics.max_visible_clusters == 0 {
            return Some("blob never became visible before fading".to_string());
        }
        match metrics.rms_error_px {
            Some(rms) if rms >= MAX_RMS_ERROR_PX => Some(format!(
                "RMS error {:.2}px exceeds threshold {:.1}px",
                rms, MAX_RMS_ERROR_PX
            )),
            _ => None,
        }
    }

    fn failed(&self, scenario: ScenarioId, reason: String) -> ScenarioResult {
        warn!("{} failed: {}", scenario.name(), reason);
        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: false,
            final_time_secs: 0.0,
            final_blob_count: 0,
            failure_reason: Some(reason),
            metrics: ScenarioMetrics::default(),
        }
    }
}

/// RMS distance from each visible cluster to its nearest ground truth blob.
pub(crate) fn rms_error(tracker: &Tracker, ground_truth: &[(u64, Vector2<f64>)]) -> Option<f64> {
    if ground_truth.is_empty() {
        return None;
    }
    let squared: Vec<f64> = tracker
        .visible_clusters()
        .map(|c| {
            ground_truth
                .iter()
                .map(|(_, p)| (c.location() - p).norm_squared())
                .fold(f64::INFINITY, f64::min)
        })
        .collect();
    if squared.is_empty() {
        return None;
    }
    Some((squared.iter().sum::<f64>() / squared.len() as f64).sqrt())
}

/// Counts (visible clusters far from every blob, blobs with a visible
/// cluster nearby).
fn coverage(tracker: &Tracker, ground_truth: &[(u64, Vector2<f64>)]) -> (usize, usize) {
    let near = |a: Vector2<f64>, b: &Vector2<f64>| (a - b).norm() <= SPURIOUS_DISTANCE_PX;

    let spurious = tracker
        .visible_clusters()
        .filter(|c| !ground_truth.iter().any(|(_, p)| near(c.location(), p)))
        .count();
    let tracked = ground_truth
        .iter()
        .filter(|(_, p)| tracker.visible_clusters().any(|c| near(c.location(), p)))
        .count();
    (spurious, tracked)
}
