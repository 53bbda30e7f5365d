use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use lure_mission::{MissionStore, UploadReport};
use lure_proto::{AuthorityState, FcTelemetry, HandoffReader, HandoffWriter, LinkHealth, Mission};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::msp::{self, Direction, MspParser, ParseEvent, WaypointPayload};
use crate::{FcError, LinkTiming};

/// Outcome handed back to whoever asked for an upload.
pub type UploadResult = Result<Arc<Mission>, String>;

#[derive(Debug)]
pub enum LinkCommand {
    Upload { mission: Mission, reply: oneshot::Sender<UploadResult> },
}

/// Request/response side of the FC connection.
///
/// Owns the byte stream exclusively. Every valid reply refreshes the
/// published [`LinkHealth`].
pub struct MissionLink<S> {
    io: S,
    parser: MspParser,
    timing: LinkTiming,
    health: HandoffWriter<LinkHealth>,
    telemetry: HandoffWriter<FcTelemetry>,
    last_poll: Option<Instant>,
}

impl<S> MissionLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        io: S,
        timing: LinkTiming,
        health: HandoffWriter<LinkHealth>,
        telemetry: HandoffWriter<FcTelemetry>,
    ) -> Self {
        Self { io, parser: MspParser::new(), timing, health, telemetry, last_poll: None }
    }

    pub fn timing(&self) -> &LinkTiming {
        &self.timing
    }

    /// Single request, single reply. No retries.
    pub async fn exchange(&mut self, cmd: u8, payload: &[u8]) -> Result<Bytes, FcError> {
        // bytes of an abandoned exchange must not leak into this one
        self.parser.reset();
        let frame = msp::encode(Direction::Request, cmd, payload)?;
        trace!("msp tx {}", hex::encode(&frame));
        self.io.write_all(&frame).await?;
        self.io.flush().await?;

        let deadline = Instant::now() + self.timing.reply_timeout;
        let mut buf = [0u8; 128];
        let result = loop {
            let n = match tokio::time::timeout_at(deadline, self.io.read(&mut buf)).await {
                Err(_) => break Err(FcError::LinkTimeout { cmd }),
                Ok(Err(e)) => break Err(FcError::Io(e)),
                Ok(Ok(0)) => break Err(FcError::Io(std::io::ErrorKind::UnexpectedEof.into())),
                Ok(Ok(n)) => n,
            };
            trace!("msp rx {}", hex::encode(&buf[..n]));

            let mut outcome = None;
            for ev in self.parser.push_bytes(&buf[..n]) {
                match ev {
                    ParseEvent::Frame(f) if f.cmd == cmd && f.direction == Direction::Reply => {
                        outcome = Some(Ok(f.payload));
                    }
                    ParseEvent::Frame(f) if f.cmd == cmd && f.direction == Direction::Error => {
                        self.mark_alive();
                        outcome = Some(Err(FcError::Nack { cmd }));
                    }
                    ParseEvent::ChecksumMismatch { cmd: got } if got == cmd => {
                        outcome = Some(Err(FcError::ChecksumMismatch { cmd }));
                    }
                    other => debug!("msp: ignoring {:?} while waiting for cmd {}", other, cmd),
                }
                if outcome.is_some() {
                    break;
                }
            }
            if let Some(o) = outcome {
                break o;
            }
        };

        match &result {
            Ok(_) => self.mark_alive(),
            Err(FcError::LinkTimeout { .. }) => self.health.update(|h| {
                h.consecutive_failures += 1;
                true
            }),
            Err(_) => {}
        }
        result
    }

    /// [`MissionLink::exchange`] with bounded retries and jittered
    /// exponential backoff. Exhausted nacks become `UploadRejected`;
    /// exhausted timeouts and checksum failures become `LinkTimeout`.
    ///
    /// A telemetry poll that has come due runs before each attempt.
    pub async fn request(&mut self, cmd: u8, payload: &[u8], wp: Option<u8>) -> Result<Bytes, FcError> {
        let mut attempt = 0u32;
        loop {
            if self.telemetry_due() {
                if let Err(e) = self.poll_telemetry().await {
                    debug!("msp: telemetry poll between requests failed: {}", e);
                }
            }
            let err = match self.exchange(cmd, payload).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_transient() => e,
                Err(e) => return Err(e),
            };
            if attempt >= self.timing.retries {
                warn!("msp: cmd {} failed after {} attempts: {}", cmd, attempt + 1, err);
                return Err(match err {
                    FcError::Nack { cmd } => FcError::UploadRejected { cmd, wp },
                    _ => FcError::LinkTimeout { cmd },
                });
            }
            let delay = self.backoff(attempt);
            debug!("msp: cmd {} attempt {} failed ({}); retry in {:?}", cmd, attempt + 1, err, delay);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.timing.backoff_base;
        let exp = base.saturating_mul(1u32 << attempt.min(8)).min(self.timing.backoff_max);
        let jitter_ms = base.as_millis() as u64 / 2;
        let jitter = if jitter_ms > 0 { rand::thread_rng().gen_range(0..=jitter_ms) } else { 0 };
        exp + Duration::from_millis(jitter)
    }

    fn mark_alive(&self) {
        let now = Instant::now().into_std();
        self.health.update(|h| {
            h.last_reply = Some(now);
            h.consecutive_failures = 0;
            true
        });
    }

    /// Pushes every waypoint and the save marker. The report is only
    /// returned when all of them were acknowledged.
    pub async fn upload(&mut self, mission: &Mission, store: &MissionStore) -> Result<UploadReport, FcError> {
        let total = mission.len();
        let mut report = UploadReport::default();
        info!("msp: uploading {} waypoints", total);

        for (i, wp) in mission.waypoints().iter().enumerate() {
            let body = WaypointPayload::from_waypoint(i, wp, i + 1 == total, self.timing.drop_hold_s);
            self.request(msp::MSP_SET_WP, &body.to_bytes(), Some(body.wp_no)).await?;
            if i == 0 {
                store.mark_sent();
            }
            report.acked_waypoints += 1;
            debug!("msp: waypoint {}/{} acknowledged", i + 1, total);
        }

        self.request(msp::MSP_WP_MISSION_SAVE, &[0], None).await?;
        report.finalized = true;
        Ok(report)
    }

    pub fn telemetry_due(&self) -> bool {
        match self.last_poll {
            None => true,
            Some(t) => t.elapsed() >= self.timing.telemetry_interval,
        }
    }

    /// One pass over status, GPS and nav status. Single attempt each.
    pub async fn poll_telemetry(&mut self) -> Result<FcTelemetry, FcError> {
        self.last_poll = Some(Instant::now());
        let mut t = self.telemetry.current();

        let status = self.exchange(msp::MSP_STATUS, &[]).await?;
        if let Some(s) = msp::parse_status(&status) {
            t.armed = s.armed();
            t.mode_flags = s.mode_flags;
        }
        let gps = self.exchange(msp::MSP_RAW_GPS, &[]).await?;
        if let Some(g) = msp::parse_raw_gps(&gps) {
            t.gps_fix = g.fix_type;
            t.gps_sats = g.sats;
            t.lat = g.lat;
            t.lon = g.lon;
            t.alt_m = g.alt_m;
        }
        let nav = self.exchange(msp::MSP_NAV_STATUS, &[]).await?;
        if let Some(n) = msp::parse_nav_status(&nav) {
            t.nav_mode = n.mode;
            t.nav_state = n.state;
            t.current_wp = n.active_wp;
        }

        t.ts_unix_ms = (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64;
        self.telemetry.publish(t.clone());
        Ok(t)
    }

    /// Serves upload requests and keeps telemetry flowing until the
    /// command channel closes.
    pub async fn run(
        mut self,
        store: Arc<MissionStore>,
        mut cmds: mpsc::Receiver<LinkCommand>,
        mut authority: HandoffReader<AuthorityState>,
    ) {
        let mut poll = tokio::time::interval(self.timing.telemetry_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("mission link: running");

        loop {
            tokio::select! {
                cmd = cmds.recv() => match cmd {
                    Some(LinkCommand::Upload { mission, reply }) => {
                        self.serve_upload(mission, reply, &store, &mut cmds, &mut authority).await;
                    }
                    None => break,
                },
                _ = poll.tick() => {
                    if !self.telemetry_due() {
                        continue;
                    }
                    if let Err(e) = self.poll_telemetry().await {
                        debug!("mission link: telemetry poll failed: {}", e);
                    }
                }
            }
        }
        info!("mission link: command channel closed");
    }

    async fn serve_upload(
        &mut self,
        mission: Mission,
        reply: oneshot::Sender<UploadResult>,
        store: &MissionStore,
        cmds: &mut mpsc::Receiver<LinkCommand>,
        authority: &mut HandoffReader<AuthorityState>,
    ) {
        let mut next = Some((mission, reply));

        while let Some((mission, reply)) = next.take() {
            store.begin_upload();
            let outcome = {
                let upload = self.upload(&mission, store);
                tokio::pin!(upload);
                tokio::select! {
                    res = &mut upload => Ok(res),
                    Some(cmd) = cmds.recv() => Err(Some(cmd)),
                    _ = failsafe_entered(authority) => Err(None),
                }
            };

            let result = match outcome {
                Ok(Ok(report)) => store.replace(mission, report).map_err(|e| e.to_string()),
                Ok(Err(e)) => {
                    store.fail(&e.to_string());
                    Err(e.to_string())
                }
                Err(superseded) => {
                    self.parser.reset();
                    let why = if superseded.is_some() { "superseded by a newer upload" } else { "failsafe engaged" };
                    let e = FcError::Cancelled(why);
                    warn!("mission link: {}", e);
                    store.fail(&e.to_string());
                    if let Some(LinkCommand::Upload { mission, reply }) = superseded {
                        next = Some((mission, reply));
                    }
                    Err(e.to_string())
                }
            };
            // requester may have gone away
            let _ = reply.send(result);
        }
    }
}

/// Resolves when authority moves into FAILSAFE from another state.
async fn failsafe_entered(authority: &mut HandoffReader<AuthorityState>) {
    authority.take();
    loop {
        if !authority.changed().await {
            std::future::pending::<()>().await;
        }
        if authority.take() == AuthorityState::Failsafe {
            return;
        }
    }
}
