use std::time::{Duration, Instant};

use lure_proto::{HazardSignal, Severity};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    /// Critical stays critical this long after the last raw critical frame.
    pub critical_hold_ms: u64,
    /// Consecutive raw clear frames needed before Critical drops to None.
    pub clear_frames: u32,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self { critical_hold_ms: 300, clear_frames: 6 }
    }
}

/// Smooths raw classifier output so a single noisy frame cannot make a
/// critical obstacle disappear.
///
/// Once a raw Critical is seen, output only returns to None after the hold
/// has expired and `clear_frames` consecutive raw-clear frames arrived, even
/// if Caution frames came in between.
#[derive(Debug)]
pub struct SeverityFilter {
    hold: Duration,
    clear_frames: u32,
    current: Severity,
    last_critical: Option<HazardSignal>,
    /// Most recent non-clear output since the last critical.
    last_hazard: Option<HazardSignal>,
    clear_run: u32,
    pending_clear: bool,
}

impl SeverityFilter {
    pub fn new(cfg: &DebounceConfig) -> Self {
        Self {
            hold: Duration::from_millis(cfg.critical_hold_ms),
            clear_frames: cfg.clear_frames,
            current: Severity::None,
            last_critical: None,
            last_hazard: None,
            clear_run: 0,
            pending_clear: false,
        }
    }

    pub fn current(&self) -> Severity {
        self.current
    }

    fn holding(&self, now: Instant) -> bool {
        self.last_critical.map_or(false, |c| now.saturating_duration_since(c.timestamp) < self.hold)
    }

    pub fn apply(&mut self, raw: HazardSignal) -> HazardSignal {
        let now = raw.timestamp;
        match raw.severity {
            Severity::Critical => {
                self.clear_run = 0;
                self.pending_clear = true;
                self.last_critical = Some(raw);
                self.last_hazard = Some(raw);
                self.current = Severity::Critical;
                raw
            }
            Severity::Caution => {
                self.clear_run = 0;
                let out = if self.current == Severity::Critical && self.holding(now) {
                    raw.with_severity(Severity::Critical)
                } else {
                    self.current = Severity::Caution;
                    raw
                };
                if self.pending_clear {
                    self.last_hazard = Some(out);
                }
                out
            }
            Severity::None => {
                self.clear_run = self.clear_run.saturating_add(1);
                if self.pending_clear {
                    // keep steering away from where the obstacle last was
                    let holding = self.holding(now);
                    if holding || self.clear_run < self.clear_frames {
                        let held = if holding { self.last_critical } else { self.last_hazard };
                        if let Some(h) = held {
                            return HazardSignal { frame_seq: raw.frame_seq, timestamp: raw.timestamp, ..h };
                        }
                    }
                    self.pending_clear = false;
                    self.last_hazard = None;
                }
                self.current = Severity::None;
                raw
            }
        }
    }
}
