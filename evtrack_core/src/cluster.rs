//! The Cluster - a single tracked object hypothesis.
//!
//! A cluster is mutated from two directions:
//! - **Per event** (`add_event`): mass, position, rate statistics, running
//!   distances and shape are mixed toward the incoming event.
//! - **Per bulk cycle** (`update_location`, `update_path`, `update_mass`,
//!   `check_visibility`): dead-reckoning, velocity estimation from the path,
//!   mass decay and the visibility decision.
//!
//! Clusters never keep a reference to the configuration; every operation
//! receives `&TrackerConfig` from the owning tracker.

use crate::config::{AngleMode, MassPolicy, Perspective, PositionPolicy, TrackerConfig};
use crate::event::Event;
use crate::lowpass::LowpassFilter;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use slotmap::new_key_type;
use std::collections::VecDeque;
use std::f64::consts::{FRAC_PI_2, PI};

new_key_type! {
    /// Generational handle of a cluster inside the tracker's arena.
    pub struct ClusterKey;
}

/// Converts pixels per timestamp tick (µs) to pixels per second.
pub const VELOCITY_PPS_SCALE: f64 = 1e6;

/// EMA weight used when feeding the tracker-wide average velocity.
pub const AVERAGE_VELOCITY_MIXING_FACTOR: f64 = 0.001;

const ASPECT_RATIO_MIN: f64 = 0.5;
const ASPECT_RATIO_MAX_DYNAMIC_ANGLE: f64 = 1.0;
const ASPECT_RATIO_MAX_FIXED_ANGLE: f64 = 2.5;

// ============================================================================
// PATH
// ============================================================================

/// One sample of a cluster's trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PathPoint {
    pub x: f64,
    pub y: f64,
    /// Bulk-cycle time of the sample (µs)
    pub t: i64,
    /// Events assigned to the cluster since the previous sample
    pub events: u64,
}

// ============================================================================
// CLUSTER
// ============================================================================

#[derive(Debug, Clone)]
pub struct Cluster {
    // === Identity ===
    pub(crate) id: u64,
    pub(crate) hue: f32,

    // === Kinematics ===
    pub(crate) location: Vector2<f64>,
    pub(crate) birth_location: Option<Vector2<f64>>,
    pub(crate) pre_batch_location: Vector2<f64>,
    /// Integral of the position error (smoothed position policy only)
    pub(crate) position_error_integral: Vector2<f64>,
    pub(crate) raw_velocity_ppt: Vector2<f64>,
    pub(crate) velocity_ppt: Vector2<f64>,
    pub(crate) velocity_pps: Vector2<f64>,
    pub(crate) velocity_valid: bool,
    vx_filter: LowpassFilter,
    vy_filter: LowpassFilter,
    last_velocity_update: Option<i64>,

    // === Shape ===
    pub(crate) radius: f64,
    pub(crate) radius_x: f64,
    pub(crate) radius_y: f64,
    pub(crate) aspect_ratio: f64,
    pub(crate) angle: f64,
    cos_angle: f64,
    sin_angle: f64,

    // === Support ===
    pub(crate) mass: f64,
    pub(crate) mass_now: f64,
    pub(crate) num_events: u64,
    path_num_events: u64,

    // === Time ===
    pub(crate) first_event_timestamp: i64,
    pub(crate) last_event_timestamp: i64,
    pub(crate) last_update_time: i64,

    // === Event statistics ===
    pub(crate) instantaneous_isi: f64,
    pub(crate) average_isi: f64,
    pub(crate) instantaneous_event_rate: f64,
    pub(crate) average_event_rate: f64,
    pub(crate) distance_to_last_event: f64,
    pub(crate) average_event_distance: f64,
    pub(crate) average_event_x_distance: f64,
    pub(crate) average_event_y_distance: f64,

    // === History & state ===
    pub(crate) path: VecDeque<PathPoint>,
    pub(crate) visible: bool,
    pub(crate) ever_visible: bool,
}

impl Cluster {
    /// Create a cluster from an unmatched event.
    pub(crate) fn spawn(
        id: u64,
        event: &Event,
        cfg: &TrackerConfig,
        average_velocity: Vector2<f64>,
        initial_angle: f64,
    ) -> Self {
        let location = Vector2::new(event.xf(), event.yf());
        let t = event.timestamp;

        let mut cluster = Self {
            id,
            hue: (id as f64 * 0.618_033_988_749_895).fract() as f32,
            location,
            birth_location: None,
            pre_batch_location: location,
            position_error_integral: Vector2::zeros(),
            raw_velocity_ppt: Vector2::zeros(),
            velocity_ppt: Vector2::zeros(),
            velocity_pps: Vector2::zeros(),
            velocity_valid: false,
            vx_filter: LowpassFilter::new(cfg.velocity.tau_x_ms),
            vy_filter: LowpassFilter::new(cfg.velocity.tau_y_ms),
            last_velocity_update: None,
            radius: cfg.default_radius(),
            radius_x: cfg.default_radius(),
            radius_y: cfg.default_radius(),
            aspect_ratio: 1.0,
            angle: 0.0,
            cos_angle: 1.0,
            sin_angle: 0.0,
            mass: 1.0,
            mass_now: 1.0,
            num_events: 1,
            path_num_events: 0,
            first_event_timestamp: t,
            last_event_timestamp: t,
            last_update_time: t,
            instantaneous_isi: 0.0,
            average_isi: 0.0,
            instantaneous_event_rate: 0.0,
            average_event_rate: 0.0,
            distance_to_last_event: 0.0,
            average_event_distance: 0.0,
            average_event_x_distance: 0.0,
            average_event_y_distance: 0.0,
            path: VecDeque::with_capacity(cfg.path_length.min(128)),
            visible: false,
            ever_visible: false,
        };

        if cfg.velocity.seed_from_average {
            cluster.velocity_ppt = average_velocity;
            cluster.velocity_pps = average_velocity * VELOCITY_PPS_SCALE;
            cluster.vx_filter.set_internal_value(average_velocity.x);
            cluster.vy_filter.set_internal_value(average_velocity.y);
        }
        if cfg.shape.angle.is_dynamic() {
            cluster.set_angle(initial_angle);
        }
        if cfg.perspective.is_enabled() {
            cluster.apply_perspective(cfg);
        }
        cluster
    }

    // ========================================================================
    // PER-EVENT UPDATE
    // ========================================================================

    /// Assign an event to this cluster.
    ///
    /// Returns `false` (and leaves the cluster untouched) when the polarity
    /// filter rejects the event.
    pub(crate) fn add_event(&mut self, event: &Event, cfg: &TrackerConfig) -> bool {
        if !cfg.polarity.accepts(event.polarity) {
            return false;
        }

        let now = event.timestamp;
        let m = cfg.mixing_factor;
        let m1 = 1.0 - m;

        // Offsets are measured against the pre-update state.
        let target = Vector2::new(event.xf(), event.yf());
        let offset = target - self.location;
        let distance = self.distance_to(event);
        let x_distance = self.distance_to_x(event).abs();
        let y_distance = self.distance_to_y(event).abs();
        self.distance_to_last_event = distance;

        // 1. mass
        self.accumulate_mass(now, distance, cfg);

        // 2. position
        match cfg.position {
            PositionPolicy::Mixing => {
                self.location = self.location * m1 + target * m;
            }
            PositionPolicy::Smoothed {
                position_gain,
                integral_gain,
            } => {
                self.position_error_integral = self.position_error_integral * m1 + offset * m;
                self.location +=
                    offset * (m * position_gain) + self.position_error_integral * integral_gain;
            }
        }

        // 3. event rate
        let isi = now.saturating_sub(self.last_event_timestamp).max(1) as f64;
        self.instantaneous_isi = isi;
        self.instantaneous_event_rate = 1.0 / isi;
        if self.num_events <= 1 {
            self.average_isi = isi;
            self.average_event_rate = self.instantaneous_event_rate;
        } else {
            self.average_isi = m1 * self.average_isi + m * isi;
            self.average_event_rate =
                m1 * self.average_event_rate + m * self.instantaneous_event_rate;
        }

        // 4. running distances
        self.average_event_distance = m1 * self.average_event_distance + m * distance;
        self.average_event_x_distance = m1 * self.average_event_x_distance + m * x_distance;
        self.average_event_y_distance = m1 * self.average_event_y_distance + m * y_distance;

        // 5. shape
        self.update_shape(offset, distance, cfg);

        self.num_events += 1;
        self.last_event_timestamp = now;
        self.last_update_time = self.last_update_time.max(now);
        true
    }

    fn accumulate_mass(&mut self, now: i64, distance: f64, cfg: &TrackerConfig) {
        let dt = self.last_event_timestamp.saturating_sub(now) as f64;
        let tau = cfg.mass_decay_tau_us;
        match cfg.mass_policy {
            MassPolicy::SurroundInhibition { cost, .. } => {
                let dmass = if distance <= self.radius { 1.0 } else { -cost };
                self.mass = dmass + self.mass * (dt / tau).exp();
            }
            MassPolicy::Plain => {
                // Decay only when time moved forward; equal or older
                // timestamps add undecayed support.
                if dt < 0.0 {
                    self.mass = 1.0 + self.mass * (dt / tau).exp();
                } else {
                    self.mass += 1.0;
                }
            }
        }
    }

    fn update_shape(&mut self, offset: Vector2<f64>, distance: f64, cfg: &TrackerConfig) {
        let shape = &cfg.shape;

        if shape.dynamic_size {
            let m = cfg.mixing_factor;
            let radius = (1.0 - m) * self.radius + m * distance;
            self.set_radius(cfg.clamp_radius(radius));
        }

        if shape.dynamic_aspect_ratio {
            let dw = offset.x * self.cos_angle + offset.y * self.sin_angle;
            let dh = -offset.x * self.sin_angle + offset.y * self.cos_angle;
            if dw != 0.0 {
                let max = if shape.angle.is_dynamic() {
                    ASPECT_RATIO_MAX_DYNAMIC_ANGLE
                } else {
                    ASPECT_RATIO_MAX_FIXED_ANGLE
                };
                let target = (dh / dw).abs().clamp(ASPECT_RATIO_MIN, max);
                let mix = shape.aspect_ratio_mixing_factor;
                self.set_aspect_ratio((1.0 - mix) * self.aspect_ratio + mix * target);
            }
        }

        match shape.angle {
            AngleMode::FollowVelocity if self.velocity_valid => {
                self.set_angle(self.velocity_ppt.y.atan2(self.velocity_ppt.x));
            }
            AngleMode::FollowEvents | AngleMode::FollowVelocity => {
                if offset.x != 0.0 || offset.y != 0.0 {
                    // Orientation is an axis: fold into [0, π) and wrap the
                    // difference so we never rotate the long way round.
                    let mut target = offset.y.atan2(offset.x);
                    if target < 0.0 {
                        target += PI;
                    }
                    if target >= PI {
                        target -= PI;
                    }
                    let mut diff = target - self.angle;
                    if diff > FRAC_PI_2 {
                        diff -= PI;
                    } else if diff < -FRAC_PI_2 {
                        diff += PI;
                    }
                    self.set_angle(self.angle + shape.angle_mixing_factor * diff);
                }
            }
            AngleMode::Fixed => {}
        }
    }

    // ========================================================================
    // BULK-CYCLE UPDATES
    // ========================================================================

    /// Append a path sample if events arrived since the previous one, then
    /// re-estimate velocity.
    pub(crate) fn update_path(&mut self, t: i64, cfg: &TrackerConfig) {
        if self.num_events == self.path_num_events {
            return;
        }
        self.path.push_back(PathPoint {
            x: self.location.x,
            y: self.location.y,
            t,
            events: self.num_events - self.path_num_events,
        });
        self.path_num_events = self.num_events;
        while self.path.len() > cfg.path_length {
            self.path.pop_front();
        }
        self.update_velocity(cfg);
    }

    /// Finite-difference velocity over the most recent stretch of path that
    /// carries at least `mass_threshold` events.
    pub(crate) fn update_velocity(&mut self, cfg: &TrackerConfig) {
        let n = self.path.len();
        if n < 2 {
            return;
        }

        let last = self.path[n - 1];
        let mut events = last.events as f64;
        let mut first_idx = n - 1;
        while first_idx > 0 && (first_idx == n - 1 || events < cfg.mass_threshold) {
            first_idx -= 1;
            events += self.path[first_idx].events as f64;
        }
        if events < cfg.mass_threshold {
            return;
        }

        let first = self.path[first_idx];
        let dt = last.t.saturating_sub(first.t) as f64;
        if dt <= 0.0 {
            return;
        }

        self.raw_velocity_ppt = Vector2::new((last.x - first.x) / dt, (last.y - first.y) / dt);
        let key_time = self.last_event_timestamp;
        let mut velocity = Vector2::new(
            self.vx_filter.filter(self.raw_velocity_ppt.x, key_time),
            self.vy_filter.filter(self.raw_velocity_ppt.y, key_time),
        );

        if let (Some(friction), Some(prev)) =
            (cfg.velocity.friction_tau_us(), self.last_velocity_update)
        {
            let elapsed = key_time.saturating_sub(prev).max(0) as f64;
            velocity *= (-elapsed / friction).exp();
        }
        self.last_velocity_update = Some(key_time);

        self.velocity_ppt = velocity;
        self.velocity_pps = velocity * VELOCITY_PPS_SCALE;
        self.velocity_valid = true;
    }

    /// Dead-reckon the location forward to `t`, feeding the tracker's shared
    /// average velocity when seeding is enabled.
    pub(crate) fn update_location(
        &mut self,
        t: i64,
        cfg: &TrackerConfig,
        average_velocity: &mut Vector2<f64>,
    ) {
        if self.velocity_valid && t > self.last_update_time {
            let dt = t.saturating_sub(self.last_update_time) as f64;
            self.location += self.velocity_ppt * (dt * cfg.velocity.predictive_factor);
            if cfg.velocity.seed_from_average {
                *average_velocity = *average_velocity * (1.0 - AVERAGE_VELOCITY_MIXING_FACTOR)
                    + self.velocity_ppt * AVERAGE_VELOCITY_MIXING_FACTOR;
            }
        }
        self.last_update_time = self.last_update_time.max(t);
    }

    /// Refresh the cached decayed mass. Depends only on `t`, so repeated
    /// calls at the same time are idempotent.
    pub(crate) fn update_mass(&mut self, t: i64, cfg: &TrackerConfig) {
        self.mass_now = self.mass_at(t, cfg);
    }

    /// Decide visibility at time `t`.
    ///
    /// The event-count gate and the decayed-mass gate are intentionally not
    /// unified: at exactly `num_events == threshold` the mass is not checked.
    pub(crate) fn check_visibility(&mut self, t: i64, cfg: &TrackerConfig) -> bool {
        let threshold = cfg.mass_threshold;
        let n = self.num_events as f64;

        let mut visible = !(n < threshold || (n > threshold && self.mass_at(t, cfg) < threshold));
        if let Some(min_speed) = cfg.velocity.min_visible_speed_pps {
            if self.speed_pps() < min_speed {
                visible = false;
            }
        }

        if visible {
            if self.birth_location.is_none() {
                self.birth_location = Some(self.location);
            }
            self.ever_visible = true;
        }
        self.visible = visible;
        visible
    }

    // ========================================================================
    // MERGE
    // ========================================================================

    /// Combine two clusters into one.
    ///
    /// The stronger input (higher mass decayed to the common latest event
    /// time, ties to the lower id) donates identity, location, shape,
    /// velocity, path and birth location. Support accumulators are
    /// mass-weighted so the result is independent of argument order.
    pub(crate) fn merged(a: &Cluster, b: &Cluster, cfg: &TrackerConfig) -> Cluster {
        let t_max = a.last_event_timestamp.max(b.last_event_timestamp);
        let tau = cfg.mass_decay_tau_us;
        let mass_a = a.mass * (a.last_event_timestamp.saturating_sub(t_max) as f64 / tau).exp();
        let mass_b = b.mass * (b.last_event_timestamp.saturating_sub(t_max) as f64 / tau).exp();

        let a_stronger = mass_a > mass_b || (mass_a == mass_b && a.id < b.id);
        let (strong, weak) = if a_stronger { (a, b) } else { (b, a) };

        let mass = mass_a + mass_b;
        let weighted = |x: f64, y: f64| {
            if mass != 0.0 {
                (mass_a * x + mass_b * y) / mass
            } else {
                0.5 * (x + y)
            }
        };

        let mut merged = strong.clone();
        merged.mass = mass;
        merged.mass_now = mass;
        merged.num_events = a.num_events + b.num_events;
        merged.first_event_timestamp = a.first_event_timestamp.min(b.first_event_timestamp);
        merged.last_event_timestamp = t_max;
        merged.last_update_time = a.last_update_time.max(b.last_update_time);
        merged.average_event_distance =
            weighted(a.average_event_distance, b.average_event_distance);
        merged.average_event_x_distance =
            weighted(a.average_event_x_distance, b.average_event_x_distance);
        merged.average_event_y_distance =
            weighted(a.average_event_y_distance, b.average_event_y_distance);
        merged.ever_visible = a.ever_visible || b.ever_visible;
        merged.birth_location = strong.birth_location.or(weak.birth_location);

        if cfg.grow_merged_size {
            let mut radius = (a.radius + b.radius) * (1.0 + cfg.mixing_factor);
            if cfg.shape.dynamic_size {
                radius = cfg.clamp_radius(radius);
            }
            merged.set_radius(radius);
        }
        merged
    }

    // ========================================================================
    // GEOMETRY
    // ========================================================================

    /// Manhattan distance from the center to the event.
    #[inline]
    pub fn distance_to(&self, event: &Event) -> f64 {
        (event.xf() - self.location.x).abs() + (event.yf() - self.location.y).abs()
    }

    /// Manhattan distance between two cluster centers.
    #[inline]
    pub fn distance_to_cluster(&self, other: &Cluster) -> f64 {
        (other.location.x - self.location.x).abs() + (other.location.y - self.location.y).abs()
    }

    fn motion_compensated_offset(&self, event: &Event) -> Vector2<f64> {
        let dt = event.timestamp.saturating_sub(self.last_update_time) as f64;
        let predicted = self.location + self.velocity_ppt * dt;
        Vector2::new(event.xf(), event.yf()) - predicted
    }

    /// Signed offset of the event from the predicted center along the
    /// cluster's major axis.
    pub fn distance_to_x(&self, event: &Event) -> f64 {
        let offset = self.motion_compensated_offset(event);
        offset.x * self.cos_angle + offset.y * self.sin_angle
    }

    /// Signed offset along the cluster's minor axis.
    pub fn distance_to_y(&self, event: &Event) -> f64 {
        let offset = self.motion_compensated_offset(event);
        -offset.x * self.sin_angle + offset.y * self.cos_angle
    }

    /// Axis-aligned box test against `radius_x/y * scale`.
    #[inline]
    pub fn box_contains(&self, event: &Event, scale: f64) -> bool {
        (event.xf() - self.location.x).abs() <= self.radius_x * scale
            && (event.yf() - self.location.y).abs() <= self.radius_y * scale
    }

    /// Unsigned angle between the two velocity vectors, in radians.
    /// Zero when either velocity vanishes.
    pub fn velocity_angle_to(&self, other: &Cluster) -> f64 {
        let na = self.velocity_ppt.norm();
        let nb = other.velocity_ppt.norm();
        if na == 0.0 || nb == 0.0 {
            return 0.0;
        }
        (self.velocity_ppt.dot(&other.velocity_ppt) / (na * nb))
            .clamp(-1.0, 1.0)
            .acos()
    }

    /// True when edge purging is enabled and the center left the frame.
    pub fn has_hit_edge(&self, cfg: &TrackerConfig) -> bool {
        if !cfg.edge_purging {
            return false;
        }
        let (x, y) = (self.location.x, self.location.y);
        x < 0.0 || y < 0.0 || x > cfg.size_x as f64 || y > cfg.size_y as f64
    }

    /// Expected size factor at the current location under the perspective model.
    pub fn perspective_scale(&self, cfg: &TrackerConfig) -> f64 {
        let ratio = cfg.shape.max_size_scale_ratio;
        let scale = match cfg.perspective {
            Perspective::Disabled => return 1.0,
            Perspective::Horizon => 1.0 - self.location.y / cfg.size_y as f64,
            Perspective::VanishingPoint { x, y } => {
                (self.location - Vector2::new(x, y)).norm() / cfg.size_x.max(cfg.size_y) as f64
            }
        };
        scale.clamp(1.0 / ratio, ratio)
    }

    pub(crate) fn apply_perspective(&mut self, cfg: &TrackerConfig) {
        let radius = cfg.default_radius() * self.perspective_scale(cfg);
        self.set_radius(radius);
    }

    // ========================================================================
    // SHAPE SETTERS
    // ========================================================================

    pub(crate) fn set_radius(&mut self, radius: f64) {
        self.radius = radius;
        self.radius_x = radius / self.aspect_ratio;
        self.radius_y = radius * self.aspect_ratio;
    }

    pub(crate) fn set_aspect_ratio(&mut self, aspect_ratio: f64) {
        self.aspect_ratio = aspect_ratio;
        self.radius_x = self.radius / aspect_ratio;
        self.radius_y = self.radius * aspect_ratio;
    }

    pub(crate) fn set_angle(&mut self, angle: f64) {
        let mut angle = angle;
        if !angle.is_finite() {
            return;
        }
        while angle > PI {
            angle -= 2.0 * PI;
        }
        while angle <= -PI {
            angle += 2.0 * PI;
        }
        self.angle = angle;
        self.cos_angle = angle.cos();
        self.sin_angle = angle.sin();
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn hue(&self) -> f32 {
        self.hue
    }

    pub fn location(&self) -> Vector2<f64> {
        self.location
    }

    pub fn birth_location(&self) -> Option<Vector2<f64>> {
        self.birth_location
    }

    /// Euclidean distance moved since the start of the current batch.
    pub fn distance_moved(&self) -> f64 {
        (self.location - self.pre_batch_location).norm()
    }

    /// Velocity in pixels per tick (µs), low-pass filtered.
    pub fn velocity_ppt(&self) -> Vector2<f64> {
        self.velocity_ppt
    }

    /// Velocity in pixels per second.
    pub fn velocity_pps(&self) -> Vector2<f64> {
        self.velocity_pps
    }

    pub fn raw_velocity_ppt(&self) -> Vector2<f64> {
        self.raw_velocity_ppt
    }

    pub fn is_velocity_valid(&self) -> bool {
        self.velocity_valid
    }

    /// Speed in px/s; zero until velocity is valid.
    pub fn speed_pps(&self) -> f64 {
        if self.velocity_valid {
            self.velocity_pps.norm()
        } else {
            0.0
        }
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    pub fn radius_x(&self) -> f64 {
        self.radius_x
    }

    pub fn radius_y(&self) -> f64 {
        self.radius_y
    }

    pub fn aspect_ratio(&self) -> f64 {
        self.aspect_ratio
    }

    pub fn angle(&self) -> f64 {
        self.angle
    }

    pub fn mass(&self) -> f64 {
        self.mass
    }

    /// Mass decayed to the last bulk cycle.
    pub fn mass_now(&self) -> f64 {
        self.mass_now
    }

    /// Mass decayed to an arbitrary time.
    #[inline]
    pub fn mass_at(&self, t: i64, cfg: &TrackerConfig) -> f64 {
        self.mass * (self.last_event_timestamp.saturating_sub(t) as f64 / cfg.mass_decay_tau_us).exp()
    }

    pub fn num_events(&self) -> u64 {
        self.num_events
    }

    pub fn first_event_timestamp(&self) -> i64 {
        self.first_event_timestamp
    }

    pub fn last_event_timestamp(&self) -> i64 {
        self.last_event_timestamp
    }

    pub fn last_update_time(&self) -> i64 {
        self.last_update_time
    }

    /// Time span covered by assigned events.
    pub fn lifetime(&self) -> i64 {
        self.last_event_timestamp
            .saturating_sub(self.first_event_timestamp)
    }

    pub fn average_event_rate(&self) -> f64 {
        self.average_event_rate
    }

    pub fn average_isi(&self) -> f64 {
        self.average_isi
    }

    pub fn average_event_distance(&self) -> f64 {
        self.average_event_distance
    }

    pub fn average_event_xy_distance(&self) -> (f64, f64) {
        (self.average_event_x_distance, self.average_event_y_distance)
    }

    pub fn path(&self) -> &VecDeque<PathPoint> {
        &self.path
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn has_ever_been_visible(&self) -> bool {
        self.ever_visible
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        ClusterSnapshot {
            id: self.id,
            location: [self.location.x, self.location.y],
            velocity_ppt: [self.velocity_ppt.x, self.velocity_ppt.y],
            velocity_pps: [self.velocity_pps.x, self.velocity_pps.y],
            velocity_valid: self.velocity_valid,
            radius: self.radius,
            radius_x: self.radius_x,
            radius_y: self.radius_y,
            aspect_ratio: self.aspect_ratio,
            angle: self.angle,
            mass_now: self.mass_now,
            num_events: self.num_events,
            visible: self.visible,
            ever_visible: self.ever_visible,
            birth_location: self.birth_location.map(|b| [b.x, b.y]),
            hue: self.hue,
            path: self.path.iter().copied().collect(),
        }
    }
}

// ============================================================================
// OUTPUT VIEW
// ============================================================================

/// Read-only view of a cluster for renderers and downstream detectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub id: u64,
    pub location: [f64; 2],
    pub velocity_ppt: [f64; 2],
    pub velocity_pps: [f64; 2],
    pub velocity_valid: bool,
    pub radius: f64,
    pub radius_x: f64,
    pub radius_y: f64,
    pub aspect_ratio: f64,
    pub angle: f64,
    pub mass_now: f64,
    pub num_events: u64,
    pub visible: bool,
    pub ever_visible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birth_location: Option<[f64; 2]>,
    pub hue: f32,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub path: Vec<PathPoint>,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PolarityFilter, VelocityConfig};
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn cfg() -> TrackerConfig {
        TrackerConfig::for_sensor(128, 128)
    }

    fn ev(x: u16, y: u16, t: i64) -> Event {
        Event::new(x, y, t, true)
    }

    fn spawn_at(x: u16, y: u16, t: i64, cfg: &TrackerConfig) -> Cluster {
        Cluster::spawn(1, &ev(x, y, t), cfg, Vector2::zeros(), 0.0)
    }

    /// Feed `per_step` events at a point moving +1px in x per 1 ms step,
    /// sampling the path after every step.
    fn drive_right(c: &mut Cluster, cfg: &TrackerConfig, steps: i64, per_step: i64) {
        for k in 1..=steps {
            let t = k * 1_000;
            let x = (20 + k) as u16;
            for i in 0..per_step {
                c.add_event(&ev(x, 40, t - per_step + i + 1), cfg);
            }
            c.update_path(t, cfg);
        }
    }

    #[test]
    fn test_spawn_state() {
        let cfg = cfg();
        let c = spawn_at(10, 20, 500, &cfg);
        assert_eq!(c.num_events(), 1);
        assert_relative_eq!(c.location().x, 10.0);
        assert_relative_eq!(c.location().y, 20.0);
        assert_relative_eq!(c.radius(), cfg.default_radius());
        assert_eq!(c.first_event_timestamp(), 500);
        assert_eq!(c.last_update_time(), 500);
        assert!(!c.is_velocity_valid());
        assert!(c.birth_location().is_none());
    }

    #[test]
    fn test_spawn_seeds_average_velocity() {
        let cfg = TrackerConfig {
            velocity: VelocityConfig {
                seed_from_average: true,
                ..Default::default()
            },
            ..cfg()
        };
        let c = Cluster::spawn(3, &ev(5, 5, 0), &cfg, Vector2::new(0.001, 0.0), 0.0);
        assert_relative_eq!(c.velocity_pps().x, 1000.0, epsilon = 1e-9);
        assert!(!c.is_velocity_valid());
    }

    #[test]
    fn test_add_event_moves_toward_event() {
        let cfg = cfg();
        let mut c = spawn_at(10, 10, 0, &cfg);
        let before = c.location();
        let target = Vector2::new(20.0, 14.0);

        assert!(c.add_event(&ev(20, 14, 100), &cfg));

        assert_eq!(c.num_events(), 2);
        assert!((c.location() - target).norm() < (before - target).norm());
        assert_relative_eq!(c.location().x, 10.5, epsilon = 1e-12);
        assert_relative_eq!(c.location().y, 10.2, epsilon = 1e-12);
        assert_eq!(c.last_event_timestamp(), 100);
    }

    #[test]
    fn test_polarity_filter_rejects_without_mutation() {
        let cfg = TrackerConfig {
            polarity: PolarityFilter::OnOnly,
            ..cfg()
        };
        let mut c = spawn_at(10, 10, 0, &cfg);
        let rejected = Event::new(20, 20, 50, false);
        assert!(!c.add_event(&rejected, &cfg));
        assert_eq!(c.num_events(), 1);
        assert_relative_eq!(c.location().x, 10.0);
        assert_eq!(c.last_event_timestamp(), 0);
    }

    #[test]
    fn test_mass_at_own_timestamp_is_exact() {
        let cfg = cfg();
        let mut c = spawn_at(10, 10, 0, &cfg);
        for t in [100, 250, 900, 4_000] {
            c.add_event(&ev(11, 10, t), &cfg);
        }
        assert_eq!(c.mass_at(c.last_event_timestamp(), &cfg), c.mass());
    }

    #[test]
    fn test_plain_mass_decay_asymmetry() {
        let cfg = cfg();
        let mut c = spawn_at(10, 10, 0, &cfg);
        // Same timestamp: flat +1, no decay
        c.add_event(&ev(10, 10, 0), &cfg);
        assert_relative_eq!(c.mass(), 2.0);
        // One tau later: 1 + 2/e
        c.add_event(&ev(10, 10, 10_000), &cfg);
        assert_relative_eq!(c.mass(), 1.0 + 2.0 * (-1.0f64).exp(), epsilon = 1e-12);
    }

    #[test]
    fn test_surround_inhibition_penalizes_far_events() {
        let cfg = TrackerConfig {
            mass_policy: MassPolicy::SurroundInhibition {
                cost: 2.0,
                surround_scale: 2.0,
            },
            ..cfg()
        };
        let mut c = spawn_at(10, 10, 0, &cfg);
        let far = 10 + (cfg.default_radius() as u16) + 5;
        c.add_event(&ev(far, 10, 0), &cfg);
        assert_relative_eq!(c.mass(), -1.0);
        c.add_event(&ev(10, 10, 0), &cfg);
        assert_relative_eq!(c.mass(), 0.0);
    }

    #[test]
    fn test_smoothed_position_moves_toward_event() {
        let cfg = TrackerConfig {
            position: PositionPolicy::Smoothed {
                position_gain: 1.0,
                integral_gain: 0.1,
            },
            ..cfg()
        };
        let mut c = spawn_at(10, 10, 0, &cfg);
        for t in 1..10 {
            let before = (c.location() - Vector2::new(30.0, 10.0)).norm();
            c.add_event(&ev(30, 10, t), &cfg);
            assert!((c.location() - Vector2::new(30.0, 10.0)).norm() < before);
        }
        assert!(c.position_error_integral.x > 0.0);
    }

    #[test]
    fn test_event_rate_statistics() {
        let cfg = cfg();
        let mut c = spawn_at(10, 10, 0, &cfg);
        c.add_event(&ev(10, 10, 100), &cfg);
        assert_relative_eq!(c.average_isi(), 100.0);
        assert_relative_eq!(c.average_event_rate(), 0.01);
        // Same timestamp clamps the interval to one tick
        c.add_event(&ev(10, 10, 100), &cfg);
        assert_relative_eq!(c.instantaneous_isi, 1.0);
    }

    #[test]
    fn test_dynamic_size_is_clamped() {
        let cfg = cfg();
        let mut c = spawn_at(10, 10, 0, &cfg);
        for t in 0..500 {
            c.add_event(&ev(10, 10, t), &cfg);
            c.location = Vector2::new(10.0, 10.0);
        }
        let default = cfg.default_radius();
        assert_relative_eq!(c.radius(), default / cfg.shape.max_size_scale_ratio, epsilon = 1e-9);
    }

    #[test]
    fn test_fixed_size_keeps_radius() {
        let mut cfg = cfg();
        cfg.shape.dynamic_size = false;
        let mut c = spawn_at(10, 10, 0, &cfg);
        c.add_event(&ev(10, 10, 5), &cfg);
        assert_relative_eq!(c.radius(), cfg.default_radius());
    }

    #[test]
    fn test_aspect_ratio_follows_vertical_spread() {
        let mut cfg = cfg();
        cfg.shape.dynamic_aspect_ratio = true;
        cfg.shape.aspect_ratio_mixing_factor = 0.1;
        let mut c = spawn_at(50, 50, 0, &cfg);
        for t in 0..300 {
            let y = if t % 2 == 0 { 58 } else { 42 };
            c.add_event(&ev(51, y, t), &cfg);
            c.location = Vector2::new(50.0, 50.0);
        }
        assert!(c.aspect_ratio() > 2.0);
        assert!(c.aspect_ratio() <= ASPECT_RATIO_MAX_FIXED_ANGLE + 1e-9);
        assert!(c.radius_y() > c.radius_x());
    }

    #[test]
    fn test_angle_follows_events() {
        let mut cfg = cfg();
        cfg.shape.angle = AngleMode::FollowEvents;
        cfg.shape.angle_mixing_factor = 0.2;
        let mut c = spawn_at(50, 50, 0, &cfg);
        // Events along the diagonal pull the axis toward π/4
        for t in 0..200 {
            let (x, y) = if t % 2 == 0 { (60, 60) } else { (40, 40) };
            c.add_event(&ev(x, y, t), &cfg);
            c.location = Vector2::new(50.0, 50.0);
        }
        assert_relative_eq!(c.angle(), PI / 4.0, epsilon = 1e-3);
    }

    #[test]
    fn test_angle_follows_velocity_when_valid() {
        let mut cfg = cfg();
        cfg.shape.angle = AngleMode::FollowVelocity;
        let mut c = spawn_at(50, 50, 0, &cfg);
        c.velocity_ppt = Vector2::new(0.0, 1e-3);
        c.velocity_valid = true;
        c.add_event(&ev(52, 50, 10), &cfg);
        assert_relative_eq!(c.angle(), FRAC_PI_2, epsilon = 1e-12);
    }

    #[test]
    fn test_path_not_extended_without_events() {
        let cfg = cfg();
        let mut c = spawn_at(10, 10, 0, &cfg);
        c.update_path(1_000, &cfg);
        assert_eq!(c.path().len(), 1);
        assert_eq!(c.path()[0].events, 1);
        c.update_path(2_000, &cfg);
        c.update_path(3_000, &cfg);
        assert_eq!(c.path().len(), 1);

        c.add_event(&ev(11, 10, 3_500), &cfg);
        c.update_path(4_000, &cfg);
        assert_eq!(c.path().len(), 2);
        assert_eq!(c.path()[1].events, 1);
    }

    #[test]
    fn test_path_trimmed_oldest_first() {
        let cfg = TrackerConfig {
            path_length: 5,
            ..cfg()
        };
        let mut c = spawn_at(10, 10, 0, &cfg);
        for k in 1..=12 {
            c.add_event(&ev(10, 10, k * 100), &cfg);
            c.update_path(k * 100, &cfg);
        }
        assert_eq!(c.path().len(), 5);
        assert_eq!(c.path().front().unwrap().t, 800);
        assert_eq!(c.path().back().unwrap().t, 1_200);
    }

    #[test]
    fn test_velocity_needs_support() {
        let cfg = cfg();
        let mut c = spawn_at(20, 40, 0, &cfg);
        // 2 steps × 5 events is below the 30-event threshold
        drive_right(&mut c, &cfg, 2, 5);
        assert!(!c.is_velocity_valid());
    }

    #[test]
    fn test_velocity_points_along_motion() {
        let cfg = cfg();
        let mut c = spawn_at(20, 40, 0, &cfg);
        drive_right(&mut c, &cfg, 20, 20);

        assert!(c.is_velocity_valid());
        let v = c.velocity_pps();
        assert!(v.x > 0.0, "vx = {}", v.x);
        assert!(v.y.abs() < v.x * 0.1);
        assert_relative_eq!(v.x, c.velocity_ppt().x * VELOCITY_PPS_SCALE, epsilon = 1e-6);
    }

    #[test]
    fn test_friction_slows_velocity() {
        let plain = cfg();
        let friction = TrackerConfig {
            velocity: VelocityConfig {
                friction_tau_ms: Some(1.0),
                ..Default::default()
            },
            ..cfg()
        };
        let mut a = spawn_at(20, 40, 0, &plain);
        let mut b = spawn_at(20, 40, 0, &friction);
        drive_right(&mut a, &plain, 20, 20);
        drive_right(&mut b, &friction, 20, 20);
        assert!(b.velocity_ppt().x.abs() < a.velocity_ppt().x.abs());
    }

    #[test]
    fn test_update_location_dead_reckons() {
        let cfg = cfg();
        let mut avg = Vector2::zeros();
        let mut c = spawn_at(10, 10, 0, &cfg);
        c.velocity_ppt = Vector2::new(0.001, -0.002);
        c.velocity_valid = true;

        c.update_location(1_000, &cfg, &mut avg);
        assert_relative_eq!(c.location().x, 11.0, epsilon = 1e-9);
        assert_relative_eq!(c.location().y, 8.0, epsilon = 1e-9);
        assert_eq!(c.last_update_time(), 1_000);
        // Seeding disabled: shared average untouched
        assert_eq!(avg, Vector2::zeros());

        // No elapsed time, no movement
        c.update_location(1_000, &cfg, &mut avg);
        assert_relative_eq!(c.location().x, 11.0, epsilon = 1e-9);
    }

    #[test]
    fn test_update_location_feeds_average() {
        let mut cfg = cfg();
        cfg.velocity.seed_from_average = true;
        let mut avg = Vector2::zeros();
        let mut c = spawn_at(10, 10, 0, &cfg);
        c.velocity_ppt = Vector2::new(1.0, 0.0);
        c.velocity_valid = true;
        c.update_location(10, &cfg, &mut avg);
        assert_relative_eq!(avg.x, AVERAGE_VELOCITY_MIXING_FACTOR);
    }

    #[test]
    fn test_visibility_gates_kept_verbatim() {
        let cfg = cfg();
        let mut c = spawn_at(10, 10, 0, &cfg);
        c.num_events = 30;
        c.mass = 1.0;
        // Exactly at the threshold the mass gate is skipped
        assert!(c.check_visibility(0, &cfg));
        c.num_events = 31;
        assert!(!c.check_visibility(0, &cfg));
        c.mass = 40.0;
        assert!(c.check_visibility(0, &cfg));
        c.num_events = 29;
        assert!(!c.check_visibility(0, &cfg));
    }

    #[test]
    fn test_velocity_gate() {
        let mut cfg = cfg();
        cfg.velocity.min_visible_speed_pps = Some(100.0);
        let mut c = spawn_at(10, 10, 0, &cfg);
        c.num_events = 100;
        c.mass = 100.0;
        assert!(!c.check_visibility(0, &cfg));
        c.velocity_pps = Vector2::new(150.0, 0.0);
        c.velocity_valid = true;
        assert!(c.check_visibility(0, &cfg));
    }

    #[test]
    fn test_birth_location_frozen_and_visibility_sticky() {
        let cfg = cfg();
        let mut c = spawn_at(10, 10, 0, &cfg);
        c.num_events = 100;
        c.mass = 100.0;
        assert!(c.check_visibility(0, &cfg));
        let birth = c.birth_location().unwrap();

        c.location = Vector2::new(90.0, 90.0);
        c.mass = 0.0;
        assert!(!c.check_visibility(0, &cfg));
        assert!(c.has_ever_been_visible());

        c.mass = 100.0;
        assert!(c.check_visibility(0, &cfg));
        assert_eq!(c.birth_location(), Some(birth));
    }

    #[test]
    fn test_has_hit_edge() {
        let mut cfg = cfg();
        let mut c = spawn_at(10, 10, 0, &cfg);
        assert!(!c.has_hit_edge(&cfg));
        c.location = Vector2::new(-0.5, 10.0);
        assert!(c.has_hit_edge(&cfg));
        c.location = Vector2::new(128.0, 128.0);
        assert!(!c.has_hit_edge(&cfg));
        c.location = Vector2::new(10.0, 128.5);
        assert!(c.has_hit_edge(&cfg));
        cfg.edge_purging = false;
        assert!(!c.has_hit_edge(&cfg));
    }

    #[test]
    fn test_directional_distance_uses_angle_and_motion() {
        let cfg = cfg();
        let mut c = spawn_at(50, 50, 0, &cfg);
        c.set_angle(FRAC_PI_2);
        let e = ev(50, 60, 0);
        assert_relative_eq!(c.distance_to_x(&e), 10.0, epsilon = 1e-9);
        assert_relative_eq!(c.distance_to_y(&e), 0.0, epsilon = 1e-9);

        // Moving at +10 px/ms in y: after 1 ms the prediction reaches the event
        c.set_angle(0.0);
        c.velocity_ppt = Vector2::new(0.0, 0.01);
        let later = ev(50, 60, 1_000);
        assert_relative_eq!(c.distance_to_y(&later), 0.0, epsilon = 1e-9);
        assert_relative_eq!(c.distance_to(&later), 10.0);
    }

    #[test]
    fn test_perspective_scale() {
        let mut cfg = cfg();
        let mut c = spawn_at(64, 32, 0, &cfg);
        assert_relative_eq!(c.perspective_scale(&cfg), 1.0);

        cfg.perspective = Perspective::Horizon;
        assert_relative_eq!(c.perspective_scale(&cfg), 0.75);
        c.apply_perspective(&cfg);
        assert_relative_eq!(c.radius(), cfg.default_radius() * 0.75);

        cfg.perspective = Perspective::VanishingPoint { x: 64.0, y: 128.0 };
        c.location = Vector2::new(64.0, 127.0);
        assert_relative_eq!(c.perspective_scale(&cfg), 0.25);
    }

    #[test]
    fn test_merge_stronger_donates_identity() {
        let mut cfg = cfg();
        cfg.grow_merged_size = false;
        let mut strong = Cluster::spawn(7, &ev(10, 10, 0), &cfg, Vector2::zeros(), 0.0);
        let weak = Cluster::spawn(2, &ev(14, 10, 0), &cfg, Vector2::zeros(), 0.0);
        for t in 1..10 {
            strong.add_event(&ev(10, 10, t), &cfg);
        }

        let merged = Cluster::merged(&weak, &strong, &cfg);
        assert_eq!(merged.id(), 7);
        assert_relative_eq!(merged.location().x, strong.location().x);
        assert_eq!(merged.num_events(), 11);
        assert_eq!(merged.last_event_timestamp(), 9);
        assert_eq!(merged.first_event_timestamp(), 0);
    }

    #[test]
    fn test_merge_grows_radius() {
        let mut cfg = cfg();
        cfg.grow_merged_size = true;
        cfg.shape.dynamic_size = false;
        let a = Cluster::spawn(1, &ev(10, 10, 0), &cfg, Vector2::zeros(), 0.0);
        let b = Cluster::spawn(2, &ev(12, 10, 0), &cfg, Vector2::zeros(), 0.0);
        let merged = Cluster::merged(&a, &b, &cfg);
        assert_relative_eq!(
            merged.radius(),
            2.0 * cfg.default_radius() * (1.0 + cfg.mixing_factor)
        );
    }

    #[test]
    fn test_merge_ties_go_to_lower_id() {
        let cfg = cfg();
        let a = Cluster::spawn(4, &ev(10, 10, 0), &cfg, Vector2::zeros(), 0.0);
        let b = Cluster::spawn(9, &ev(20, 10, 0), &cfg, Vector2::zeros(), 0.0);
        assert_eq!(Cluster::merged(&a, &b, &cfg).id(), 4);
        assert_eq!(Cluster::merged(&b, &a, &cfg).id(), 4);
    }

    fn arb_cluster(id: u64) -> impl Strategy<Value = Cluster> {
        (0u16..128, 0u16..128, 0i64..50_000, prop::collection::vec((0u16..128, 0i64..2_000), 0..40))
            .prop_map(move |(x, y, t0, feed)| {
                let cfg = cfg();
                let mut c = Cluster::spawn(id, &ev(x, y, t0), &cfg, Vector2::zeros(), 0.0);
                let mut t = t0;
                for (ex, dt) in feed {
                    t += dt;
                    c.add_event(&ev(ex, y, t), &cfg);
                }
                c
            })
    }

    proptest! {
        #[test]
        fn prop_merge_is_order_independent(a in arb_cluster(1), b in arb_cluster(2)) {
            let cfg = cfg();
            let ab = Cluster::merged(&a, &b, &cfg);
            let ba = Cluster::merged(&b, &a, &cfg);

            prop_assert_eq!(ab.num_events(), ba.num_events());
            prop_assert_eq!(ab.mass(), ba.mass());
            prop_assert_eq!(ab.last_event_timestamp(), ba.last_event_timestamp());
            prop_assert_eq!(ab.id(), ba.id());
            prop_assert_eq!(ab.location(), ba.location());
            prop_assert_eq!(ab.radius(), ba.radius());
            prop_assert_eq!(ab.angle(), ba.angle());
        }

        #[test]
        fn prop_ever_visible_is_sticky(masses in prop::collection::vec(0.0f64..100.0, 1..30)) {
            let cfg = cfg();
            let mut c = spawn_at(50, 50, 0, &cfg);
            c.num_events = 100;
            let mut seen = false;
            for m in masses {
                c.mass = m;
                c.check_visibility(0, &cfg);
                seen |= c.is_visible();
                prop_assert_eq!(c.has_ever_been_visible(), seen);
            }
        }
    }
}
