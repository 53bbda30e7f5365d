use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaypointAction {
    #[default]
    Navigate,
    /// Hover at the point and release the payload.
    #[serde(alias = "drop")]
    DropPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub lat: f64,
    pub lon: f64,
    #[serde(alias = "alt", default = "default_alt_m")]
    pub alt_m: f32,
    #[serde(default)]
    pub action: WaypointAction,
}

fn default_alt_m() -> f32 {
    50.0
}

impl Waypoint {
    pub fn new(lat: f64, lon: f64, alt_m: f32, action: WaypointAction) -> Self {
        Self { lat, lon, alt_m, action }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && self.alt_m.is_finite()
            && self.lat.abs() <= 90.0
            && self.lon.abs() <= 180.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// No upload attempted this session.
    #[default]
    Idle,
    Pending,
    Sent,
    Acknowledged,
    Failed,
}

/// Ordered waypoint sequence. Flight order is vector order.
///
/// Waypoints cannot be edited after construction; a new mission replaces an
/// old one wholesale.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mission {
    waypoints: Vec<Waypoint>,
    status: UploadStatus,
}

impl Mission {
    pub fn new(waypoints: Vec<Waypoint>) -> Self {
        Self { waypoints, status: UploadStatus::Pending }
    }

    pub fn waypoints(&self) -> &[Waypoint] {
        &self.waypoints
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    pub fn status(&self) -> UploadStatus {
        self.status
    }

    pub fn with_status(self, status: UploadStatus) -> Self {
        Self { status, ..self }
    }

    /// Index of the first waypoint with invalid coordinates, if any.
    pub fn first_invalid(&self) -> Option<usize> {
        self.waypoints.iter().position(|w| !w.is_valid())
    }
}
