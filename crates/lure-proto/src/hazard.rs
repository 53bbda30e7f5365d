use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    None,
    Caution,
    Critical,
}

impl Severity {
    pub fn is_hazard(self) -> bool {
        self != Severity::None
    }
}

/// Obstacle assessment for one processed frame.
///
/// Angles are relative to the camera axis: `bearing_deg` positive to the
/// right, `elevation_deg` positive upward. All fields are clamped to their
/// physical range on construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HazardSignal {
    pub severity: Severity,
    pub bearing_deg: f32,
    pub elevation_deg: f32,
    pub distance_m: f32,
    pub frame_seq: u64,
    pub timestamp: Instant,
}

impl HazardSignal {
    pub const MAX_DISTANCE_M: f32 = 1_000.0;

    pub fn new(
        severity: Severity,
        bearing_deg: f32,
        elevation_deg: f32,
        distance_m: f32,
        frame_seq: u64,
        timestamp: Instant,
    ) -> Self {
        Self {
            severity,
            bearing_deg: finite_or(bearing_deg, 0.0).clamp(-180.0, 180.0),
            elevation_deg: finite_or(elevation_deg, 0.0).clamp(-90.0, 90.0),
            distance_m: finite_or(distance_m, Self::MAX_DISTANCE_M).clamp(0.0, Self::MAX_DISTANCE_M),
            frame_seq,
            timestamp,
        }
    }

    /// Nothing in view.
    pub fn clear(frame_seq: u64, timestamp: Instant) -> Self {
        Self::new(Severity::None, 0.0, 0.0, Self::MAX_DISTANCE_M, frame_seq, timestamp)
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.timestamp)
    }

    pub fn with_severity(self, severity: Severity) -> Self {
        Self { severity, ..self }
    }
}

fn finite_or(v: f32, fallback: f32) -> f32 {
    if v.is_finite() { v } else { fallback }
}
