//! Tracker configuration.
//!
//! A `TrackerConfig` is an immutable snapshot owned by the `Tracker` for its
//! whole lifetime. Clusters never hold a reference to it; every cluster
//! operation that needs a parameter receives `&TrackerConfig` explicitly.
//!
//! Behavior that used to be a tangle of boolean switches is expressed as one
//! enum per concern (`MatchPolicy`, `MassPolicy`, ...), so each policy can be
//! tested on its own.

use serde::{Deserialize, Serialize};
use std::path::Path;

// ============================================================================
// POLICIES
// ============================================================================

/// How a single incoming event picks its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    /// First cluster, in population order, whose axis-aligned box contains the event
    FirstContaining,

    /// Globally nearest cluster by motion-compensated, angle-projected distance
    /// among all clusters whose box contains the event
    Nearest,
}

/// How a cluster's mass reacts to an assigned event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MassPolicy {
    /// +1 per event; decay applied only when time moved forward
    Plain,

    /// +1 inside the radius, -cost in the surround; matching boxes are scaled
    /// by `surround_scale` so surround events reach the cluster at all
    SurroundInhibition { cost: f64, surround_scale: f64 },
}

/// How a cluster's position follows assigned events.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PositionPolicy {
    /// Exponential mix toward the event by the mixing factor
    Mixing,

    /// Two-gain controller (proportional + integral of the position error)
    Smoothed { position_gain: f64, integral_gain: f64 },
}

/// When two overlapping clusters are allowed to merge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MergePolicy {
    /// Merge whenever centers are closer than the sum of radii
    OverlapOnly,

    /// Additionally require velocity headings to differ by at most
    /// `max_angle_deg` (not checked if either velocity is not yet valid)
    VelocityAngle { max_angle_deg: f64 },
}

/// How the cluster's orientation evolves.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AngleMode {
    Fixed,
    /// Rotate toward the direction of incoming events
    FollowEvents,
    /// Snap to the velocity heading once velocity is valid
    FollowVelocity,
}

impl AngleMode {
    pub fn is_dynamic(&self) -> bool {
        !matches!(self, AngleMode::Fixed)
    }
}

/// Optional perspective model scaling expected cluster size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Perspective {
    Disabled,

    /// Size shrinks linearly toward the top row (`y = size_y`)
    Horizon,

    /// Size grows with distance from a vanishing point
    VanishingPoint { x: f64, y: f64 },
}

impl Perspective {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Perspective::Disabled)
    }
}

/// Which event polarities a cluster accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolarityFilter {
    Both,
    OnOnly,
    OffOnly,
}

impl PolarityFilter {
    #[inline]
    pub fn accepts(&self, polarity: bool) -> bool {
        match self {
            PolarityFilter::Both => true,
            PolarityFilter::OnOnly => polarity,
            PolarityFilter::OffOnly => !polarity,
        }
    }
}

// ============================================================================
// CONFIGURATION SECTIONS
// ============================================================================

/// Shape dynamics. Each toggle is independent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShapeConfig {
    /// Let the radius follow the mean event distance (default: true)
    pub dynamic_size: bool,

    /// Radius is clamped to `[default / ratio, default * ratio]` (default: 4.0)
    pub max_size_scale_ratio: f64,

    /// Let the aspect ratio follow the event spread (default: false)
    pub dynamic_aspect_ratio: bool,

    /// Mixing factor for aspect ratio updates (default: 0.01)
    pub aspect_ratio_mixing_factor: f64,

    /// Orientation mode (default: Fixed)
    pub angle: AngleMode,

    /// Mixing factor for angle updates (default: 0.005)
    pub angle_mixing_factor: f64,
}

impl Default for ShapeConfig {
    fn default() -> Self {
        Self {
            dynamic_size: true,
            max_size_scale_ratio: 4.0,
            dynamic_aspect_ratio: false,
            aspect_ratio_mixing_factor: 0.01,
            angle: AngleMode::Fixed,
            angle_mixing_factor: 0.005,
        }
    }
}

/// Velocity estimation and prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VelocityConfig {
    /// Low-pass time constant for vx in ms (default: 100)
    pub tau_x_ms: f64,

    /// Low-pass time constant for vy in ms (default: 100)
    pub tau_y_ms: f64,

    /// Exponential friction toward zero in ms; `None` or non-finite disables it
    pub friction_tau_ms: Option<f64>,

    /// Scale on dead-reckoning between bulk cycles (default: 1.0)
    pub predictive_factor: f64,

    /// Seed new clusters with the tracker's smoothed average velocity (default: false)
    pub seed_from_average: bool,

    /// Minimum speed in px/s required for visibility; `None` disables the gate
    pub min_visible_speed_pps: Option<f64>,
}

impl Default for VelocityConfig {
    fn default() -> Self {
        Self {
            tau_x_ms: 100.0,
            tau_y_ms: 100.0,
            friction_tau_ms: None,
            predictive_factor: 1.0,
            seed_from_average: false,
            min_visible_speed_pps: None,
        }
    }
}

impl VelocityConfig {
    /// Friction time constant in µs, or `None` when the feature is disabled.
    pub fn friction_tau_us(&self) -> Option<f64> {
        self.friction_tau_ms
            .filter(|tau| tau.is_finite() && *tau > 0.0)
            .map(|tau| tau * 1000.0)
    }
}

// ============================================================================
// TRACKER CONFIGURATION
// ============================================================================

/// Complete tracker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Sensor width in pixels (default: 346)
    pub size_x: u32,

    /// Sensor height in pixels (default: 260)
    pub size_y: u32,

    /// Interval between bulk update cycles in µs (default: 1000)
    pub update_interval_us: i64,

    /// Maximum live clusters (default: 10)
    pub max_clusters: usize,

    /// Default radius as a fraction of the larger sensor dimension (default: 0.1)
    pub cluster_size: f64,

    /// Mixing factor for position and running averages (default: 0.05)
    pub mixing_factor: f64,

    /// Mass decay time constant in µs (default: 10000)
    pub mass_decay_tau_us: f64,

    /// Mass / event count needed for visibility (default: 30)
    pub mass_threshold: f64,

    pub polarity: PolarityFilter,
    pub matching: MatchPolicy,
    pub mass_policy: MassPolicy,
    pub position: PositionPolicy,
    pub merge: MergePolicy,

    /// Merged radius = (ra + rb)(1 + mixing) instead of the stronger's radius
    pub grow_merged_size: bool,

    pub shape: ShapeConfig,
    pub perspective: Perspective,
    pub velocity: VelocityConfig,

    /// Maximum path samples kept per cluster (default: 100)
    pub path_length: usize,

    /// Prune clusters whose center leaves the frame (default: true)
    pub edge_purging: bool,

    /// Spatial index cell size is `1 << grid_shift` pixels (default: 2)
    pub grid_shift: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            size_x: 346,
            size_y: 260,
            update_interval_us: 1_000,
            max_clusters: 10,
            cluster_size: 0.1,
            mixing_factor: 0.05,
            mass_decay_tau_us: 10_000.0,
            mass_threshold: 30.0,
            polarity: PolarityFilter::Both,
            matching: MatchPolicy::FirstContaining,
            mass_policy: MassPolicy::Plain,
            position: PositionPolicy::Mixing,
            merge: MergePolicy::VelocityAngle { max_angle_deg: 60.0 },
            grow_merged_size: false,
            shape: ShapeConfig::default(),
            perspective: Perspective::Disabled,
            velocity: VelocityConfig::default(),
            path_length: 100,
            edge_purging: true,
            grid_shift: 2,
        }
    }
}

impl TrackerConfig {
    /// Create a default configuration for a `size_x × size_y` sensor.
    pub fn for_sensor(size_x: u32, size_y: u32) -> Self {
        Self {
            size_x,
            size_y,
            ..Default::default()
        }
    }

    /// Radius assigned to a freshly spawned cluster.
    #[inline]
    pub fn default_radius(&self) -> f64 {
        self.size_x.max(self.size_y) as f64 * self.cluster_size
    }

    /// Scale applied to matching boxes (surround inhibition widens them).
    #[inline]
    pub fn surround_scale(&self) -> f64 {
        match self.mass_policy {
            MassPolicy::SurroundInhibition { surround_scale, .. } => surround_scale,
            MassPolicy::Plain => 1.0,
        }
    }

    /// Clamp a radius into the configured dynamic-size bounds.
    pub fn clamp_radius(&self, radius: f64) -> f64 {
        let default = self.default_radius();
        let ratio = self.shape.max_size_scale_ratio;
        radius.clamp(default / ratio, default * ratio)
    }

    /// Check parameter ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size_x == 0 || self.size_y == 0 || self.size_x > 65_536 || self.size_y > 65_536 {
            return Err(ConfigError::InvalidSensorSize {
                size_x: self.size_x,
                size_y: self.size_y,
            });
        }
        check(self.max_clusters >= 1, "max_clusters", "must be at least 1")?;
        check(
            self.update_interval_us >= 0,
            "update_interval_us",
            "must not be negative",
        )?;
        check(
            self.cluster_size > 0.0 && self.cluster_size <= 1.0,
            "cluster_size",
            "must be in (0, 1]",
        )?;
        check(
            self.mixing_factor > 0.0 && self.mixing_factor <= 1.0,
            "mixing_factor",
            "must be in (0, 1]",
        )?;
        check(
            self.mass_decay_tau_us.is_finite() && self.mass_decay_tau_us > 0.0,
            "mass_decay_tau_us",
            "must be positive and finite",
        )?;
        check(
            self.mass_threshold.is_finite() && self.mass_threshold >= 0.0,
            "mass_threshold",
            "must be non-negative and finite",
        )?;
        check(self.path_length >= 2, "path_length", "must be at least 2")?;
        check(self.grid_shift <= 15, "grid_shift", "must be at most 15")?;
        check(
            self.shape.max_size_scale_ratio.is_finite() && self.shape.max_size_scale_ratio >= 1.0,
            "shape.max_size_scale_ratio",
            "must be at least 1",
        )?;
        check(
            (0.0..=1.0).contains(&self.shape.aspect_ratio_mixing_factor),
            "shape.aspect_ratio_mixing_factor",
            "must be in [0, 1]",
        )?;
        check(
            (0.0..=1.0).contains(&self.shape.angle_mixing_factor),
            "shape.angle_mixing_factor",
            "must be in [0, 1]",
        )?;
        check(
            self.velocity.tau_x_ms.is_finite() && self.velocity.tau_x_ms > 0.0,
            "velocity.tau_x_ms",
            "must be positive and finite",
        )?;
        check(
            self.velocity.tau_y_ms.is_finite() && self.velocity.tau_y_ms > 0.0,
            "velocity.tau_y_ms",
            "must be positive and finite",
        )?;
        check(
            self.velocity.predictive_factor.is_finite(),
            "velocity.predictive_factor",
            "must be finite",
        )?;
        if let MassPolicy::SurroundInhibition { cost, surround_scale } = self.mass_policy {
            check(cost.is_finite() && cost >= 0.0, "mass_policy.cost", "must be non-negative")?;
            check(
                surround_scale.is_finite() && surround_scale >= 1.0,
                "mass_policy.surround_scale",
                "must be at least 1",
            )?;
        }
        if let PositionPolicy::Smoothed {
            position_gain,
            integral_gain,
        } = self.position
        {
            check(
                position_gain.is_finite(),
                "position.position_gain",
                "must be finite",
            )?;
            check(
                integral_gain.is_finite(),
                "position.integral_gain",
                "must be finite",
            )?;
        }
        if let Perspective::VanishingPoint { x, y } = self.perspective {
            check(
                x.is_finite() && y.is_finite(),
                "perspective.vanishing_point",
                "must be finite",
            )?;
        }
        if let Some(min_speed) = self.velocity.min_visible_speed_pps {
            check(
                min_speed.is_finite(),
                "velocity.min_visible_speed_pps",
                "must be finite",
            )?;
        }
        if let MergePolicy::VelocityAngle { max_angle_deg } = self.merge {
            check(
                (0.0..=180.0).contains(&max_angle_deg),
                "merge.max_angle_deg",
                "must be in [0, 180]",
            )?;
        }
        Ok(())
    }

    /// Parse a configuration from JSON; omitted fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: TrackerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn check(ok: bool, name: &'static str, reason: &'static str) -> Result<(), ConfigError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigError::InvalidParameter { name, reason })
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Errors raised while building or loading a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid sensor size {size_x}x{size_y}")]
    InvalidSensorSize { size_x: u32, size_y: u32 },

    #[error("Invalid parameter `{name}`: {reason}")]
    InvalidParameter {
        name: &'static str,
        reason: &'static str,
    },

    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

// ============================================================================
// TESTS
// ============================================================================
