//! evtrack Deterministic Simulation Harness
//!
//! Drives the cluster tracker with synthetic event streams whose ground
//! truth is known, then checks what the tracker reports against it.
//!
//! # Core Principle
//!
//! All randomness is derived from a single 64-bit seed, so a scenario run
//! with the same seed and configuration produces the same events and the
//! same tracker state.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                ScenarioRunner                │
//! │  ┌────────────┐  events   ┌───────────────┐  │
//! │  │   Oracle   │──────────►│    Tracker    │  │
//! │  │ (blobs +   │           │ (evtrack_core)│  │
//! │  │  noise)    │           └───────┬───────┘  │
//! │  └─────┬──────┘                   │          │
//! │        │ ground truth   snapshots │          │
//! │        └──────────┬───────────────┘          │
//! │                   ▼                          │
//! │         ScenarioMetrics / SimExport          │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use evtrack_sim::{ScenarioId, ScenarioRunner};
//!
//! let result = ScenarioRunner::new(42)
//!     .with_duration(0.5)
//!     .run(ScenarioId::SingleBlob);
//! assert!(result.passed);
//! ```

mod exporter;
mod oracle;
mod runner;
pub mod scenarios;

pub use exporter::{BlobPosition, ExportSummary, SimExport, SimFrame};
pub use oracle::{GroundTruthBlob, Oracle};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use scenarios::ScenarioId;

use thiserror::Error;

/// Errors raised by the simulation harness.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Tracker config error: {0}")]
    Config(#[from] evtrack_core::ConfigError),

    #[error("Unknown scenario: {0}")]
    UnknownScenario(String),
}
