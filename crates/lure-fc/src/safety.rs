use std::time::{Duration, Instant};

/// Minimum spacing between operator re-arm requests reaching the arbiter.
#[derive(Debug)]
pub struct RearmGuard {
    last_rearm: Option<Instant>,
    min_interval: Duration,
}

impl RearmGuard {
    pub fn new(min_interval: Duration) -> Self {
        Self { last_rearm: None, min_interval }
    }

    pub fn allow(&mut self, now: Instant) -> bool {
        if let Some(t) = self.last_rearm {
            if now.saturating_duration_since(t) < self.min_interval { return false; }
        }
        self.last_rearm = Some(now);
        true
    }
}
