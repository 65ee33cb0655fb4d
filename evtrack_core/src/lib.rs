//! evtrack - Event-Driven Multi-Object Cluster Tracker
//!
//! Tracks moving objects in the sparse, asynchronous output of a neuromorphic
//! (DVS-style) sensor. Each event is assigned to a nearby cluster in O(1)
//! amortized time; a periodic bulk cycle predicts motion, merges duplicate
//! clusters and prunes clusters that lost support.
//!
//! 1. **Cluster**: position, velocity, shape and decaying mass of one object
//! 2. **SpatialIndex**: grid of generational handles for O(1) batch lookup
//! 3. **Tracker**: owns the population and drives the lifecycle

pub mod event;
pub mod lowpass;
pub mod config;
pub mod cluster;
pub mod spatial_index;
pub mod tracker;

// Re-export key types for convenience
pub use cluster::{Cluster, ClusterKey, ClusterSnapshot, PathPoint};
pub use config::{
    AngleMode, ConfigError, MassPolicy, MatchPolicy, MergePolicy, Perspective, PolarityFilter,
    PositionPolicy, ShapeConfig, TrackerConfig, VelocityConfig,
};
pub use event::{Event, EventSource};
pub use spatial_index::{SpatialIndex, SpatialIndexStats};
pub use tracker::{Tracker, TrackerStats};
