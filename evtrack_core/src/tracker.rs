//! The Tracker - owns the live cluster population and drives its lifecycle.
//!
//! Per-cluster state machine (all transitions happen in the bulk cycle):
//!
//! ```text
//!   spawn ──► CANDIDATE ──(support)──► VISIBLE
//!                 │                       │
//!                 └──────┬────────────────┘
//!                        ├──► MERGED  (absorbed into a new cluster)
//!                        └──► PRUNED  (lost support / left frame / clock anomaly)
//! ```
//!
//! The bulk cycle runs whenever an incoming event finds the previous cycle
//! at least `update_interval_us` old (or in the future):
//! 1. Prune
//! 2. Merge (to a fixed point)
//! 3. Predict locations and re-index
//! 4. Update paths and velocities
//! 5. Decay masses
//! 6. Rebuild the visible view

use crate::cluster::{Cluster, ClusterKey, ClusterSnapshot};
use crate::config::{ConfigError, MatchPolicy, MergePolicy, TrackerConfig};
use crate::event::{Event, EventSource};
use crate::spatial_index::SpatialIndex;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use slotmap::SlotMap;
use tracing::{debug, trace, warn};

// ============================================================================
// STATISTICS
// ============================================================================

/// Running counters, useful for diagnostics and the simulation harness.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerStats {
    pub events_seen: u64,
    pub events_accepted: u64,
    pub events_out_of_bounds: u64,
    pub events_rejected_polarity: u64,
    pub clusters_spawned: u64,
    pub clusters_merged: u64,
    pub clusters_pruned: u64,
    pub spawns_refused: u64,
    pub timestamp_regressions: u64,
    pub stale_index_entries: u64,
    pub bulk_cycles: u64,
}

// ============================================================================
// TRACKER
// ============================================================================

/// Upper bound on up-front allocation; larger populations grow on demand.
const PREALLOCATED_CLUSTERS: usize = 64;

pub struct Tracker {
    // === Configuration (immutable snapshot) ===
    config: TrackerConfig,

    // === Population ===
    /// Arena owning every live cluster
    clusters: SlotMap<ClusterKey, Cluster>,

    /// Population order (spawn order, merge products appended)
    order: Vec<ClusterKey>,

    /// Visible subset, rebuilt every bulk cycle
    visible: Vec<ClusterKey>,

    /// Scratch list for two-phase pruning
    prune_list: Vec<ClusterKey>,

    // === Spatial Index (grid cell → ClusterKey) ===
    index: SpatialIndex,

    // === Shared estimates ===
    last_update_time: Option<i64>,
    average_velocity: Vector2<f64>,
    initial_angle: f64,
    next_id: u64,

    stats: TrackerStats,
}

impl Tracker {
    /// Create a tracker, validating the configuration.
    pub fn new(config: TrackerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_validated(config))
    }

    /// Create a tracker with the default configuration.
    pub fn with_defaults() -> Self {
        Self::from_validated(TrackerConfig::default())
    }

    fn from_validated(config: TrackerConfig) -> Self {
        let index = SpatialIndex::new(config.size_x, config.size_y, config.grid_shift);
        let capacity = config.max_clusters.min(PREALLOCATED_CLUSTERS);
        Self {
            clusters: SlotMap::with_capacity_and_key(capacity),
            order: Vec::with_capacity(capacity),
            visible: Vec::with_capacity(capacity),
            prune_list: Vec::new(),
            index,
            last_update_time: None,
            average_velocity: Vector2::zeros(),
            initial_angle: 0.0,
            next_id: 0,
            stats: TrackerStats::default(),
            config,
        }
    }

    // ========================================================================
    // EVENT ASSIGNMENT
    // ========================================================================

    /// Process a single event.
    ///
    /// Runs the bulk cycle first if it is overdue, drops out-of-bounds events,
    /// matches the event with the configured `MatchPolicy` and spawns a new
    /// cluster when nothing matches and the population has room.
    ///
    /// Returns whether the event landed in a currently visible cluster.
    pub fn filter_event(&mut self, event: &Event) -> bool {
        self.stats.events_seen += 1;
        self.maybe_update(event.timestamp);

        if !event.in_bounds(self.config.size_x, self.config.size_y) {
            self.stats.events_out_of_bounds += 1;
            return false;
        }

        let matched = match self.config.matching {
            MatchPolicy::FirstContaining => self.first_containing(event),
            MatchPolicy::Nearest => self.nearest_containing(event),
        };

        match matched {
            Some(key) => self.assign(key, event).unwrap_or(false),
            None => {
                self.spawn(event);
                false
            }
        }
    }

    /// Process a batch of events, appending every accepted event to `out`.
    ///
    /// Matching uses the spatial index only (no full scan). Each cluster's
    /// location at the start of the batch is recorded for `distance_moved`.
    ///
    /// Returns the number of accepted events.
    pub fn filter_batch(&mut self, events: &[Event], out: &mut Vec<Event>) -> usize {
        for cluster in self.clusters.values_mut() {
            cluster.pre_batch_location = cluster.location;
        }

        let mut accepted = 0;
        for event in events {
            self.stats.events_seen += 1;
            self.maybe_update(event.timestamp);

            if !event.in_bounds(self.config.size_x, self.config.size_y) {
                self.stats.events_out_of_bounds += 1;
                continue;
            }

            let landed = match self.lookup_index(event) {
                Some(key) => self.assign(key, event).is_some(),
                None => self.spawn(event).is_some(),
            };
            if landed {
                out.push(*event);
                accepted += 1;
            }
        }
        accepted
    }

    /// Feed every batch of an `EventSource` through `filter_batch`.
    pub fn drain_source<S: EventSource>(
        &mut self,
        source: &mut S,
        out: &mut Vec<Event>,
    ) -> usize {
        let mut batch = Vec::new();
        let mut accepted = 0;
        loop {
            batch.clear();
            if source.next_batch(&mut batch) == 0 {
                break;
            }
            accepted += self.filter_batch(&batch, out);
        }
        accepted
    }

    /// Returns `Some(visible)` if the cluster took the event, `None` if the
    /// polarity filter rejected it.
    fn assign(&mut self, key: ClusterKey, event: &Event) -> Option<bool> {
        let cluster = self.clusters.get_mut(key)?;
        if cluster.add_event(event, &self.config) {
            self.stats.events_accepted += 1;
            Some(cluster.visible)
        } else {
            self.stats.events_rejected_polarity += 1;
            None
        }
    }

    fn spawn(&mut self, event: &Event) -> Option<ClusterKey> {
        if self.clusters.len() >= self.config.max_clusters {
            self.stats.spawns_refused += 1;
            return None;
        }
        if !self.config.polarity.accepts(event.polarity) {
            self.stats.events_rejected_polarity += 1;
            return None;
        }

        let id = self.next_id;
        self.next_id += 1;

        let cluster = Cluster::spawn(
            id,
            event,
            &self.config,
            self.average_velocity,
            self.initial_angle,
        );
        let location = cluster.location;
        let key = self.clusters.insert(cluster);
        self.order.push(key);
        self.index.update(key, location);

        self.stats.clusters_spawned += 1;
        self.stats.events_accepted += 1;
        trace!(id, x = event.x, y = event.y, t = event.timestamp, "spawned cluster");
        Some(key)
    }

    /// Index lookup that evicts entries whose cluster no longer exists.
    fn lookup_index(&mut self, event: &Event) -> Option<ClusterKey> {
        let key = self.index.find_near(event)?;
        if self.clusters.contains_key(key) {
            Some(key)
        } else {
            warn!(?key, "stale spatial index entry evicted");
            self.stats.stale_index_entries += 1;
            self.index.remove(key);
            None
        }
    }

    fn first_containing(&self, event: &Event) -> Option<ClusterKey> {
        let scale = self.config.surround_scale();
        self.ordered()
            .find(|(_, c)| c.box_contains(event, scale))
            .map(|(key, _)| key)
    }

    fn nearest_containing(&self, event: &Event) -> Option<ClusterKey> {
        let scale = self.config.surround_scale();
        let mut best: Option<(ClusterKey, f64)> = None;

        for (key, c) in self.ordered() {
            let dx = c.distance_to_x(event).abs();
            let dy = c.distance_to_y(event).abs();
            if dx <= c.radius_x * scale && dy <= c.radius_y * scale {
                let d = dx + dy;
                if best.map_or(true, |(_, best_d)| d < best_d) {
                    best = Some((key, d));
                }
            }
        }
        best.map(|(key, _)| key)
    }

    // ========================================================================
    // BULK CYCLE
    // ========================================================================

    fn maybe_update(&mut self, t: i64) {
        match self.last_update_time {
            None => self.last_update_time = Some(t),
            Some(last) if t < last => {
                self.stats.timestamp_regressions += 1;
                warn!(
                    last_update = last,
                    t, "timestamp went backwards, resynchronizing cluster list"
                );
                self.update_cluster_list(t);
            }
            Some(last) if t.saturating_sub(last) >= self.config.update_interval_us => {
                self.update_cluster_list(t);
            }
            Some(_) => {}
        }
    }

    /// Run one full bulk cycle at time `t`.
    pub fn update_cluster_list(&mut self, t: i64) {
        self.prune(t);
        self.merge();
        self.update_locations(t);
        self.update_paths(t);
        self.update_masses(t);
        self.update_visibility(t);

        self.last_update_time = Some(t);
        self.stats.bulk_cycles += 1;
        trace!(
            t,
            clusters = self.clusters.len(),
            visible = self.visible.len(),
            "bulk cycle"
        );
    }

    /// Remove clusters that lost support, left the frame or carry future
    /// timestamps. Two-phase: mark during the scan, sweep afterward.
    fn prune(&mut self, t: i64) {
        let cfg = &self.config;
        self.prune_list.clear();

        for &key in &self.order {
            let Some(c) = self.clusters.get(key) else {
                continue;
            };
            let since_support = t.saturating_sub(c.last_event_timestamp);
            if since_support == 0 {
                continue;
            }

            let threshold = if cfg.perspective.is_enabled() {
                cfg.mass_threshold * c.perspective_scale(cfg)
            } else {
                cfg.mass_threshold
            };
            let lived = t.saturating_sub(c.first_event_timestamp) as f64;
            let mass_too_small = c.mass_at(t, cfg) < threshold
                && (lived >= cfg.mass_decay_tau_us || c.lifetime() == 0);
            let from_future = since_support < 0;
            let hit_edge = c.has_hit_edge(cfg);

            if mass_too_small || from_future || hit_edge {
                self.prune_list.push(key);
            }
        }

        if self.prune_list.is_empty() {
            return;
        }
        let doomed = std::mem::take(&mut self.prune_list);
        for &key in &doomed {
            if let Some(c) = self.remove_cluster(key) {
                debug!(id = c.id, num_events = c.num_events, t, "pruned cluster");
                self.stats.clusters_pruned += 1;
            }
        }
        self.prune_list = doomed;
    }

    /// Merge overlapping, velocity-compatible clusters until none remain.
    fn merge(&mut self) {
        while let Some((ka, kb)) = self.find_merge_pair() {
            let merged = match (self.clusters.get(ka), self.clusters.get(kb)) {
                (Some(a), Some(b)) => {
                    debug!(a = a.id, b = b.id, "merging clusters");
                    Cluster::merged(a, b, &self.config)
                }
                _ => break,
            };
            self.remove_cluster(ka);
            self.remove_cluster(kb);

            let location = merged.location;
            let key = self.clusters.insert(merged);
            self.order.push(key);
            self.index.update(key, location);
            self.stats.clusters_merged += 1;
        }

        if self.config.perspective.is_enabled() {
            for c in self.clusters.values_mut() {
                c.apply_perspective(&self.config);
            }
        }
    }

    fn find_merge_pair(&self) -> Option<(ClusterKey, ClusterKey)> {
        let max_angle = match self.config.merge {
            MergePolicy::OverlapOnly => None,
            MergePolicy::VelocityAngle { max_angle_deg } => Some(max_angle_deg.to_radians()),
        };

        for (i, &ka) in self.order.iter().enumerate() {
            let Some(a) = self.clusters.get(ka) else {
                continue;
            };
            for &kb in &self.order[i + 1..] {
                let Some(b) = self.clusters.get(kb) else {
                    continue;
                };
                if a.distance_to_cluster(b) >= a.radius + b.radius {
                    continue;
                }
                if let Some(max_angle) = max_angle {
                    if a.velocity_valid && b.velocity_valid && a.velocity_angle_to(b) > max_angle {
                        continue;
                    }
                }
                return Some((ka, kb));
            }
        }
        None
    }

    fn update_locations(&mut self, t: i64) {
        for &key in &self.order {
            if let Some(c) = self.clusters.get_mut(key) {
                c.update_location(t, &self.config, &mut self.average_velocity);
                self.index.update(key, c.location);
            }
        }
    }

    fn update_paths(&mut self, t: i64) {
        let m = self.config.mixing_factor;
        let dynamic_angle = self.config.shape.angle.is_dynamic();
        let mut visible = 0usize;

        for &key in &self.order {
            if let Some(c) = self.clusters.get_mut(key) {
                c.update_path(t, &self.config);
                if c.visible {
                    visible += 1;
                    if dynamic_angle {
                        self.initial_angle = (1.0 - m) * self.initial_angle + m * c.angle;
                    }
                }
            }
        }
        trace!(t, visible, "paths updated");
    }

    fn update_masses(&mut self, t: i64) {
        for c in self.clusters.values_mut() {
            c.update_mass(t, &self.config);
        }
    }

    fn update_visibility(&mut self, t: i64) {
        self.visible.clear();
        for &key in &self.order {
            if let Some(c) = self.clusters.get_mut(key) {
                if c.check_visibility(t, &self.config) {
                    self.visible.push(key);
                }
            }
        }
    }

    /// Remove a cluster from the arena, the order, the visible view and the
    /// spatial index in one step.
    fn remove_cluster(&mut self, key: ClusterKey) -> Option<Cluster> {
        self.index.remove(key);
        self.order.retain(|k| *k != key);
        self.visible.retain(|k| *k != key);
        self.clusters.remove(key)
    }

    /// Drop every cluster. Cluster ids keep increasing afterwards.
    pub fn reset(&mut self) {
        self.clusters.clear();
        self.order.clear();
        self.visible.clear();
        self.prune_list.clear();
        self.index.reset();
        self.last_update_time = None;
        self.average_velocity = Vector2::zeros();
        self.initial_angle = 0.0;
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    fn ordered(&self) -> impl Iterator<Item = (ClusterKey, &Cluster)> + '_ {
        self.order
            .iter()
            .filter_map(|&key| self.clusters.get(key).map(|c| (key, c)))
    }

    /// All live clusters in population order.
    pub fn clusters(&self) -> impl Iterator<Item = &Cluster> + '_ {
        self.ordered().map(|(_, c)| c)
    }

    /// Clusters found visible by the last bulk cycle.
    pub fn visible_clusters(&self) -> impl Iterator<Item = &Cluster> + '_ {
        self.visible.iter().filter_map(|&key| self.clusters.get(key))
    }

    pub fn keys(&self) -> &[ClusterKey] {
        &self.order
    }

    pub fn cluster(&self, key: ClusterKey) -> Option<&Cluster> {
        self.clusters.get(key)
    }

    pub fn cluster_by_id(&self, id: u64) -> Option<&Cluster> {
        self.clusters().find(|c| c.id == id)
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn visible_count(&self) -> usize {
        self.visible.len()
    }

    pub fn snapshots(&self) -> Vec<ClusterSnapshot> {
        self.clusters().map(Cluster::snapshot).collect()
    }

    pub fn visible_snapshots(&self) -> Vec<ClusterSnapshot> {
        self.visible_clusters().map(Cluster::snapshot).collect()
    }

    /// Smoothed velocity (px/µs) used to seed new clusters.
    pub fn average_velocity(&self) -> Vector2<f64> {
        self.average_velocity
    }

    pub fn last_update_time(&self) -> Option<i64> {
        self.last_update_time
    }

    pub fn stats(&self) -> &TrackerStats {
        &self.stats
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn spatial_index(&self) -> &SpatialIndex {
        &self.index
    }
}

// ============================================================================
// TESTS
// ============================================================================
