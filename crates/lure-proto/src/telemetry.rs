use serde::Serialize;
use std::time::{Duration, Instant};

/// Latest values read back from the FC over the Mission Link.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FcTelemetry {
    pub ts_unix_ms: i64,
    pub armed: bool,
    // MSP_STATUS flight mode bitfield
    pub mode_flags: u32,
    pub nav_mode: u8,
    pub nav_state: u8,
    pub current_wp: u8,
    pub gps_fix: u8,
    pub gps_sats: u8,
    pub lat: f64,
    pub lon: f64,
    pub alt_m: f32,
}

/// Liveness of the Mission Link, judged by replies from the FC.
#[derive(Debug, Clone, Default)]
pub struct LinkHealth {
    pub last_reply: Option<Instant>,
    pub consecutive_failures: u32,
}

impl LinkHealth {
    /// `None` when the FC has never answered.
    pub fn age(&self, now: Instant) -> Option<Duration> {
        self.last_reply.map(|t| now.saturating_duration_since(t))
    }

    pub fn is_healthy(&self, now: Instant, timeout: Duration) -> bool {
        matches!(self.age(now), Some(age) if age <= timeout)
    }
}
