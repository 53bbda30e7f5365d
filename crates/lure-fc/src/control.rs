//! The control task: arbiter and channel encoder on a fixed tick.
//!
//! Reads only handoff cells and a non-blocking command queue, so a slow
//! classifier or a busy Mission Link can never delay a frame.

use std::sync::Arc;
use std::time::{Duration, Instant};

use lure_mission::MissionStore;
use lure_proto::{AuthorityState, HandoffReader, HandoffWriter, HazardSignal, LinkHealth, Severity};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::arbiter::{Arbiter, ArbiterConfig, FailsafeReason, TickInput};
use crate::safety::RearmGuard;
use crate::sbus::{ChannelEncoder, ChannelFrame, SbusConfig, CHANNELS, FRAME_LEN};

const REARM_MIN_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    Rearm,
    AssertFailsafe,
    ClearFailsafe,
}

/// Published once per tick for the web surface.
#[derive(Debug, Clone, Serialize)]
pub struct ControlStatus {
    pub authority: AuthorityState,
    pub failsafe_reason: Option<FailsafeReason>,
    pub external_failsafe: bool,
    pub hazard_severity: Severity,
    pub hazard_bearing_deg: Option<f32>,
    pub hazard_distance_m: Option<f32>,
    pub hazard_frame_seq: Option<u64>,
    pub channels: [u16; CHANNELS],
    pub ticks: u64,
}

impl Default for ControlStatus {
    fn default() -> Self {
        Self {
            authority: AuthorityState::Failsafe,
            failsafe_reason: Some(FailsafeReason::Boot),
            external_failsafe: false,
            hazard_severity: Severity::None,
            hazard_bearing_deg: None,
            hazard_distance_m: None,
            hazard_frame_seq: None,
            channels: [crate::sbus::SBUS_MID; CHANNELS],
            ticks: 0,
        }
    }
}

/// Cells and queues the control task is wired to.
pub struct ControlIo {
    pub hazard: HandoffReader<Option<HazardSignal>>,
    pub health: HandoffReader<LinkHealth>,
    pub store: Arc<MissionStore>,
    pub ops: mpsc::Receiver<OperatorCommand>,
    pub authority: HandoffWriter<AuthorityState>,
    pub status: HandoffWriter<ControlStatus>,
}

pub struct ControlLoop {
    arbiter: Arbiter,
    encoder: ChannelEncoder,
    io: ControlIo,
    rearm_guard: RearmGuard,
    external_failsafe: bool,
    ticks: u64,
}

impl ControlLoop {
    pub fn new(arbiter: ArbiterConfig, sbus: SbusConfig, io: ControlIo) -> Self {
        let encoder = ChannelEncoder::new(sbus, arbiter.override_distance_m, AuthorityState::Failsafe);
        io.authority.publish(AuthorityState::Failsafe);
        Self {
            arbiter: Arbiter::new(arbiter),
            encoder,
            io,
            rearm_guard: RearmGuard::new(REARM_MIN_INTERVAL),
            external_failsafe: false,
            ticks: 0,
        }
    }

    pub fn authority(&self) -> AuthorityState {
        self.arbiter.state()
    }

    /// One output tick: drain operator commands, arbitrate, encode.
    pub fn tick(&mut self, now: Instant) -> ChannelFrame {
        let mut rearm = false;
        while let Ok(cmd) = self.io.ops.try_recv() {
            match cmd {
                OperatorCommand::Rearm => {
                    if self.rearm_guard.allow(now) {
                        rearm = true;
                    } else {
                        debug!("control: re-arm request dropped, too soon after the last one");
                    }
                }
                OperatorCommand::AssertFailsafe => {
                    if !self.external_failsafe {
                        warn!("control: operator asserted failsafe");
                    }
                    self.external_failsafe = true;
                }
                OperatorCommand::ClearFailsafe => {
                    if self.external_failsafe {
                        info!("control: operator cleared failsafe trigger");
                    }
                    self.external_failsafe = false;
                }
            }
        }

        let store = self.io.store.snapshot();
        let hazard = self.io.hazard.latest();
        let input = TickInput {
            now,
            hazard,
            link_age: self.io.health.latest().age(now),
            mission_ready: store.has_acknowledged(),
            mission_failed: store.failed_without_prior(),
            external_failsafe: self.external_failsafe,
            rearm,
        };

        let decision = self.arbiter.step(&input);
        if decision.changed {
            self.io.authority.publish(decision.authority);
        }
        let frame = self.encoder.next_frame(decision.authority, decision.hazard.as_ref());
        self.ticks += 1;

        self.io.status.publish(ControlStatus {
            authority: decision.authority,
            failsafe_reason: decision.reason,
            external_failsafe: self.external_failsafe,
            hazard_severity: decision.effective,
            hazard_bearing_deg: hazard.map(|h| h.bearing_deg),
            hazard_distance_m: hazard.map(|h| h.distance_m),
            hazard_frame_seq: hazard.map(|h| h.frame_seq),
            channels: frame.channels,
            ticks: self.ticks,
        });
        frame
    }

    /// Emits one SBUS frame per `period` into `sink`, forever.
    ///
    /// A tick that cannot be served on time is skipped rather than bunched.
    /// A frame the port only partly accepted is finished before the next
    /// one starts, so the receiver never sees a torn frame; whole frames
    /// still waiting are replaced by the newest. Write failures are logged
    /// and the next tick tries again.
    pub async fn run<W>(mut self, mut sink: W, period: Duration)
    where
        W: AsyncWrite + Unpin,
    {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut pending: Vec<u8> = Vec::with_capacity(FRAME_LEN * 2);
        let mut write_errors: u64 = 0;
        info!("control: running at {:?} per frame", period);

        loop {
            interval.tick().await;
            let now = tokio::time::Instant::now();
            let deadline = now + period;
            let frame = self.tick(now.into_std());

            // keep only the unsent tail of a frame already on the wire
            pending.truncate(pending.len() % FRAME_LEN);
            pending.extend_from_slice(&frame.encode());

            let res = match tokio::time::timeout_at(deadline, drain(&mut sink, &mut pending)).await {
                Ok(r) => r,
                Err(_) => Err(std::io::ErrorKind::TimedOut.into()),
            };
            if let Err(e) = res {
                if e.kind() != std::io::ErrorKind::TimedOut {
                    pending.clear();
                }
                write_errors += 1;
                if write_errors == 1 || write_errors % 500 == 0 {
                    warn!("control: sbus write failed ({} so far): {}", write_errors, e);
                }
            }
        }
    }
}

/// Writes out `pending`, dropping bytes as the sink accepts them. Safe to
/// cancel between writes: what is left is exactly what was not sent.
async fn drain<W>(sink: &mut W, pending: &mut Vec<u8>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while !pending.is_empty() {
        let n = sink.write(&pending[..]).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        pending.drain(..n);
    }
    sink.flush().await
}
