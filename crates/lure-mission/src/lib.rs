pub mod doctor;
pub mod geo;
pub mod parse;
pub mod store;

use serde::Deserialize;

pub use store::{MissionError, MissionStore, StoreSnapshot, UploadReport};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MissionConfig {
    /// INAV keeps at most this many waypoints in its mission buffer.
    pub max_waypoints: usize,
    pub min_alt_m: f32,
    pub max_alt_m: f32,
    /// Altitude given to drops that arrive without one.
    pub default_alt_m: f32,
}

impl Default for MissionConfig {
    fn default() -> Self {
        Self {
            max_waypoints: 60,
            min_alt_m: 5.0,
            max_alt_m: 120.0,
            default_alt_m: 50.0,
        }
    }
}
