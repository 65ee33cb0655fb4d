//! Tracking scenarios for the simulation harness.

use serde::{Deserialize, Serialize};

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// SIM-001: One blob drifting across the frame
    SingleBlob,

    /// SIM-002: Two distant blobs moving apart
    TwoBlobs,

    /// SIM-003: Two blobs converging on a common heading, then fusing
    Converging,

    /// SIM-004: One blob that stops emitting halfway through
    Fade,

    /// SIM-005: One blob under uniform background noise
    NoiseFloor,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::SingleBlob,
            ScenarioId::TwoBlobs,
            ScenarioId::Converging,
            ScenarioId::Fade,
            ScenarioId::NoiseFloor,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::SingleBlob => "single_blob",
            ScenarioId::TwoBlobs => "two_blobs",
            ScenarioId::Converging => "converging",
            ScenarioId::Fade => "fade",
            ScenarioId::NoiseFloor => "noise_floor",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::SingleBlob => "One blob, one visible cluster within 3 px of ground truth",
            ScenarioId::TwoBlobs => "Two separated blobs never merge, two visible clusters",
            ScenarioId::Converging => "Blobs converge and fuse, a single visible cluster remains",
            ScenarioId::Fade => "Blob stops emitting, its cluster is pruned",
            ScenarioId::NoiseFloor => "Blob tracked under uniform noise, noise never yields a visible cluster",
        }
    }

    /// Looks a scenario up by name (case-insensitive, `sim-00N` accepted).
    pub fn from_name(name: &str) -> Option<ScenarioId> {
        name.parse().ok()
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "single_blob" | "singleblob" | "sim-001" => Ok(ScenarioId::SingleBlob),
            "two_blobs" | "twoblobs" | "sim-002" => Ok(ScenarioId::TwoBlobs),
            "converging" | "sim-003" => Ok(ScenarioId::Converging),
            "fade" | "sim-004" => Ok(ScenarioId::Fade),
            "noise_floor" | "noisefloor" | "sim-005" => Ok(ScenarioId::NoiseFloor),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
