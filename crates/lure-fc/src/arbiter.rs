//! Flight-authority state machine.
//!
//! Runs once per output tick inside the control task. Given the same
//! sequence of [`TickInput`]s it produces the same sequence of
//! [`Decision`]s; it reads no clocks of its own.

use std::fmt;
use std::time::{Duration, Instant};

use lure_proto::{AuthorityState, HazardSignal, Severity};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// With vision disabled no hazard is ever expected and a silent
    /// classifier is not a fault.
    pub vision_enabled: bool,
    /// Classifier cadence. A signal older than one period is stale.
    pub vision_fps: f32,
    /// Hazards closer than this take authority away from the mission.
    pub override_distance_m: f32,
    /// Consecutive fresh clear frames needed to hand authority back.
    pub clear_frames: u32,
    pub link_timeout_ms: u64,
    /// How long a stale hazard keeps its severity.
    pub stall_hold_ms: u64,
    /// Staleness at which the classifier counts as stalled.
    pub stall_failsafe_ms: u64,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            vision_enabled: true,
            vision_fps: 60.0,
            override_distance_m: 5.0,
            clear_frames: 30,
            link_timeout_ms: 1_500,
            stall_hold_ms: 250,
            stall_failsafe_ms: 1_000,
        }
    }
}

impl ArbiterConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.vision_fps.max(1.0))
    }

    pub fn stall_hold(&self) -> Duration {
        Duration::from_millis(self.stall_hold_ms)
    }

    pub fn stall_failsafe(&self) -> Duration {
        Duration::from_millis(self.stall_failsafe_ms)
    }

    pub fn link_timeout(&self) -> Duration {
        Duration::from_millis(self.link_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailsafeReason {
    /// No valid FC reply within the link timeout, or none ever.
    LinkTimeout,
    /// The latest upload failed and there is no earlier mission to fly.
    MissionFailed,
    /// Operator asserted failsafe.
    External,
    /// Classifier output went stale for too long.
    ClassifierStall,
    /// Started without an acknowledged mission.
    Boot,
}

impl FailsafeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailsafeReason::LinkTimeout => "link_timeout",
            FailsafeReason::MissionFailed => "mission_failed",
            FailsafeReason::External => "external",
            FailsafeReason::ClassifierStall => "classifier_stall",
            FailsafeReason::Boot => "boot",
        }
    }
}

impl fmt::Display for FailsafeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the arbiter looks at in one tick.
#[derive(Debug, Clone, Copy)]
pub struct TickInput {
    pub now: Instant,
    /// Latest published classifier output, possibly already consumed.
    pub hazard: Option<HazardSignal>,
    /// Time since the last valid FC reply; `None` if there never was one.
    pub link_age: Option<Duration>,
    /// An acknowledged mission is current.
    pub mission_ready: bool,
    /// The latest upload failed with nothing acknowledged before it.
    pub mission_failed: bool,
    pub external_failsafe: bool,
    pub rearm: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub authority: AuthorityState,
    /// Set exactly when `authority` is FAILSAFE.
    pub reason: Option<FailsafeReason>,
    /// Hazard the encoder should steer away from. Only in OVERRIDE.
    pub hazard: Option<HazardSignal>,
    /// Severity after staleness handling.
    pub effective: Severity,
    pub changed: bool,
}

#[derive(Debug)]
pub struct Arbiter {
    cfg: ArbiterConfig,
    state: AuthorityState,
    reason: Option<FailsafeReason>,
    boot: Option<Instant>,
    last_seq: Option<u64>,
    latest: Option<HazardSignal>,
    clear_streak: u32,
}

impl Arbiter {
    pub fn new(cfg: ArbiterConfig) -> Self {
        Self {
            cfg,
            state: AuthorityState::Failsafe,
            reason: Some(FailsafeReason::Boot),
            boot: None,
            last_seq: None,
            latest: None,
            clear_streak: 0,
        }
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.cfg
    }

    pub fn state(&self) -> AuthorityState {
        self.state
    }

    pub fn reason(&self) -> Option<FailsafeReason> {
        self.reason
    }

    pub fn step(&mut self, input: &TickInput) -> Decision {
        let now = input.now;
        let first_tick = self.boot.is_none();
        let boot = *self.boot.get_or_insert(now);

        self.consume(input.hazard, now);
        let effective = self.effective(now);
        let stalled = self.stalled(now, boot);
        let fault = self.fault(input, stalled);
        let prev = self.state;

        if first_tick {
            match fault {
                Some(r) => self.enter_failsafe(r),
                None if !input.mission_ready => self.enter_failsafe(FailsafeReason::Boot),
                None => self.enter(AuthorityState::Mission),
            }
        } else {
            match (self.state, fault) {
                (AuthorityState::Failsafe, _) => {
                    if let Some(r) = fault {
                        self.note_fault(r);
                    }
                    if input.rearm {
                        self.try_rearm(fault, input.mission_ready);
                    }
                }
                (_, Some(r)) => self.enter_failsafe(r),
                (AuthorityState::Mission, None) => {
                    if effective.map_or(false, |h| self.within_override(&h)) {
                        self.enter(AuthorityState::Override);
                    }
                }
                (AuthorityState::Override, None) => {
                    if self.clear_streak >= self.cfg.clear_frames {
                        self.enter(AuthorityState::Mission);
                    }
                }
            }
            if input.rearm && prev != AuthorityState::Failsafe {
                debug!("arbiter: re-arm ignored in {}", prev);
            }
        }

        let hazard = match self.state {
            AuthorityState::Override => effective.filter(|h| self.within_override(h)),
            _ => None,
        };

        Decision {
            authority: self.state,
            reason: self.reason,
            hazard,
            effective: effective.map_or(Severity::None, |h| h.severity),
            changed: first_tick || prev != self.state,
        }
    }

    /// Takes each frame at most once. Only fresh frames move the clear
    /// counter.
    fn consume(&mut self, hazard: Option<HazardSignal>, now: Instant) {
        let Some(h) = hazard else { return };
        if self.last_seq == Some(h.frame_seq) {
            return;
        }
        self.last_seq = Some(h.frame_seq);
        self.latest = Some(h);

        if h.age(now) > self.cfg.stale_after() {
            return;
        }
        if h.severity.is_hazard() {
            self.clear_streak = 0;
        } else {
            self.clear_streak = self.clear_streak.saturating_add(1);
        }
    }

    /// Latest signal as it counts for triggering: fresh signals as they
    /// are, stale hazards held until `stall_hold`, anything older as clear.
    fn effective(&self, now: Instant) -> Option<HazardSignal> {
        let h = self.latest?;
        let age = h.age(now);
        if age <= self.cfg.stale_after() || (age <= self.cfg.stall_hold() && h.severity.is_hazard()) {
            Some(h)
        } else {
            None
        }
    }

    fn stalled(&self, now: Instant, boot: Instant) -> bool {
        if !self.cfg.vision_enabled {
            return false;
        }
        let age = match &self.latest {
            Some(h) => h.age(now),
            None => now.saturating_duration_since(boot),
        };
        age > self.cfg.stall_failsafe()
    }

    fn fault(&self, input: &TickInput, stalled: bool) -> Option<FailsafeReason> {
        if input.external_failsafe {
            return Some(FailsafeReason::External);
        }
        match input.link_age {
            Some(age) if age <= self.cfg.link_timeout() => {}
            _ => return Some(FailsafeReason::LinkTimeout),
        }
        if input.mission_failed {
            return Some(FailsafeReason::MissionFailed);
        }
        if stalled {
            return Some(FailsafeReason::ClassifierStall);
        }
        None
    }

    fn within_override(&self, h: &HazardSignal) -> bool {
        h.severity.is_hazard() && h.distance_m < self.cfg.override_distance_m
    }

    fn try_rearm(&mut self, fault: Option<FailsafeReason>, mission_ready: bool) {
        match fault {
            Some(r) => warn!("arbiter: re-arm rejected, {} still present", r),
            None if !mission_ready => warn!("arbiter: re-arm rejected, no acknowledged mission"),
            None => {
                info!("arbiter: re-armed");
                self.enter(AuthorityState::Mission);
            }
        }
    }

    fn enter_failsafe(&mut self, reason: FailsafeReason) {
        if self.state != AuthorityState::Failsafe || self.boot_pending() {
            warn!("arbiter: {} -> FAILSAFE ({})", self.state, reason);
        }
        self.state = AuthorityState::Failsafe;
        self.reason = Some(reason);
        self.clear_streak = 0;
    }

    /// Keeps the reported reason on the fault that currently blocks re-arm.
    fn note_fault(&mut self, reason: FailsafeReason) {
        if self.reason != Some(reason) {
            info!("arbiter: FAILSAFE now held by {}", reason);
            self.reason = Some(reason);
        }
    }

    fn enter(&mut self, next: AuthorityState) {
        info!("arbiter: {} -> {}", self.state, next);
        self.state = next;
        self.reason = None;
        self.clear_streak = 0;
    }

    fn boot_pending(&self) -> bool {
        self.reason == Some(FailsafeReason::Boot)
    }
}
