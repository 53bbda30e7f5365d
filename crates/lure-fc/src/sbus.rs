//! Override Link: SBUS frames fed to the FC receiver input.
//!
//! Frame: `0x0F`, 16 channels × 11 bits packed little-endian into 22 bytes,
//! a flags byte, `0x00`. Sent at a fixed rate whatever the authority is.

use lure_proto::{AuthorityState, HazardSignal, Severity};
use serde::Deserialize;

pub const CHANNELS: usize = 16;
pub const FRAME_LEN: usize = 25;
pub const HEADER: u8 = 0x0F;
pub const FOOTER: u8 = 0x00;
pub const FLAG_FRAME_LOST: u8 = 0x04;
pub const FLAG_FAILSAFE: u8 = 0x08;

pub const SBUS_MIN: u16 = 172;
pub const SBUS_MID: u16 = 992;
pub const SBUS_MAX: u16 = 1811;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SbusConfig {
    pub enable: bool,
    pub serial_dev: String,
    pub rate_hz: f32,
    /// Largest change of any channel between two consecutive frames.
    pub max_delta: u16,
    /// Largest stick deflection from center an avoidance maneuver may command.
    pub max_deflection: u16,

    pub roll_ch: usize,
    pub pitch_ch: usize,
    pub throttle_ch: usize,
    pub yaw_ch: usize,
    pub mode_ch: usize,
    pub failsafe_ch: usize,

    /// Mode switch positions (FC modes tab).
    pub mode_mission: u16,
    pub mode_override: u16,
    pub mode_failsafe: u16,
    /// Throttle held in FAILSAFE. Below center is a slow descent in althold.
    pub failsafe_throttle: u16,
    /// Also raise the SBUS failsafe flag while in FAILSAFE, handing the
    /// FC its own receiver-failsafe procedure.
    pub assert_rx_failsafe_flag: bool,
}

impl Default for SbusConfig {
    fn default() -> Self {
        Self {
            enable: true,
            serial_dev: "/dev/ttyS2".into(),
            rate_hz: 70.0,
            max_delta: 120,
            max_deflection: 400,
            roll_ch: 0,
            pitch_ch: 1,
            throttle_ch: 2,
            yaw_ch: 3,
            mode_ch: 4,
            failsafe_ch: 5,
            mode_mission: SBUS_MAX,
            mode_override: SBUS_MIN,
            mode_failsafe: SBUS_MID,
            failsafe_throttle: SBUS_MID - 100,
            assert_rx_failsafe_flag: false,
        }
    }
}

impl SbusConfig {
    pub fn period(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f32(1.0 / self.rate_hz.max(1.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelFrame {
    pub channels: [u16; CHANNELS],
    pub failsafe: bool,
    pub frame_lost: bool,
}

impl ChannelFrame {
    pub fn centered() -> Self {
        Self { channels: [SBUS_MID; CHANNELS], failsafe: false, frame_lost: false }
    }

    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut out = [0u8; FRAME_LEN];
        out[0] = HEADER;
        let mut bits: u32 = 0;
        let mut nbits = 0u32;
        let mut idx = 1;
        for ch in self.channels {
            bits |= ((ch & 0x07FF) as u32) << nbits;
            nbits += 11;
            while nbits >= 8 {
                out[idx] = (bits & 0xFF) as u8;
                idx += 1;
                bits >>= 8;
                nbits -= 8;
            }
        }
        let mut flags = 0u8;
        if self.frame_lost {
            flags |= FLAG_FRAME_LOST;
        }
        if self.failsafe {
            flags |= FLAG_FAILSAFE;
        }
        out[23] = flags;
        out[24] = FOOTER;
        out
    }

    pub fn decode(buf: &[u8; FRAME_LEN]) -> Option<Self> {
        if buf[0] != HEADER || buf[24] != FOOTER {
            return None;
        }
        let mut channels = [0u16; CHANNELS];
        let mut bits: u32 = 0;
        let mut nbits = 0u32;
        let mut idx = 1;
        for ch in channels.iter_mut() {
            while nbits < 11 {
                bits |= (buf[idx] as u32) << nbits;
                idx += 1;
                nbits += 8;
            }
            *ch = (bits & 0x07FF) as u16;
            bits >>= 11;
            nbits -= 11;
        }
        Some(Self {
            channels,
            failsafe: buf[23] & FLAG_FAILSAFE != 0,
            frame_lost: buf[23] & FLAG_FRAME_LOST != 0,
        })
    }

    /// Largest per-channel difference to `other`.
    pub fn max_step(&self, other: &ChannelFrame) -> u16 {
        self.channels
            .iter()
            .zip(other.channels.iter())
            .map(|(a, b)| a.abs_diff(*b))
            .max()
            .unwrap_or(0)
    }
}

/// Turns the authority decision of each tick into a rate-limited frame.
#[derive(Debug, Clone)]
pub struct ChannelEncoder {
    cfg: SbusConfig,
    avoid_range_m: f32,
    last: ChannelFrame,
}

impl ChannelEncoder {
    /// Output starts directly at the target for `initial`: there is no
    /// earlier frame to ramp from.
    pub fn new(cfg: SbusConfig, avoid_range_m: f32, initial: AuthorityState) -> Self {
        let mut enc = Self { cfg, avoid_range_m, last: ChannelFrame::centered() };
        enc.last = enc.target(initial, None);
        enc
    }

    pub fn last(&self) -> &ChannelFrame {
        &self.last
    }

    pub fn target(&self, authority: AuthorityState, hazard: Option<&HazardSignal>) -> ChannelFrame {
        let c = &self.cfg;
        let mut f = ChannelFrame::centered();
        f.channels[c.failsafe_ch] = SBUS_MIN;

        match authority {
            AuthorityState::Mission => {
                f.channels[c.mode_ch] = c.mode_mission;
            }
            AuthorityState::Override => {
                f.channels[c.mode_ch] = c.mode_override;
                if let Some(h) = hazard {
                    let (roll, pitch, throttle) = self.avoidance(h);
                    f.channels[c.roll_ch] = roll;
                    f.channels[c.pitch_ch] = pitch;
                    f.channels[c.throttle_ch] = throttle;
                }
            }
            AuthorityState::Failsafe => {
                f.channels[c.mode_ch] = c.mode_failsafe;
                f.channels[c.failsafe_ch] = SBUS_MAX;
                f.channels[c.throttle_ch] = c.failsafe_throttle;
                f.failsafe = c.assert_rx_failsafe_flag;
            }
        }
        for ch in f.channels.iter_mut() {
            *ch = (*ch).clamp(SBUS_MIN, SBUS_MAX);
        }
        f
    }

    /// Stick positions pushing the aircraft away from the hazard:
    /// roll opposite its lateral offset, pitch back from anything ahead,
    /// throttle opposite its elevation.
    fn avoidance(&self, h: &HazardSignal) -> (u16, u16, u16) {
        let gain = match h.severity {
            Severity::Critical => 1.0,
            Severity::Caution => 0.6,
            Severity::None => 0.0,
        };
        let closeness = if self.avoid_range_m > 0.0 {
            (1.0 - h.distance_m / self.avoid_range_m).clamp(0.0, 1.0)
        } else {
            1.0
        };
        let intensity = self.cfg.max_deflection as f32 * gain * (0.4 + 0.6 * closeness);

        let b = h.bearing_deg.to_radians();
        let e = h.elevation_deg.to_radians();
        let mid = SBUS_MID as f32;
        let roll = mid - intensity * b.sin();
        let pitch = mid - intensity * b.cos().max(0.0);
        let throttle = mid - intensity * e.sin();
        (to_channel(roll), to_channel(pitch), to_channel(throttle))
    }

    /// Next frame to put on the wire: every channel moves toward the
    /// target by at most `max_delta`.
    pub fn next_frame(&mut self, authority: AuthorityState, hazard: Option<&HazardSignal>) -> ChannelFrame {
        let target = self.target(authority, hazard);
        let step = self.cfg.max_delta;
        let mut out = target;
        for (o, prev) in out.channels.iter_mut().zip(self.last.channels.iter()) {
            *o = slew(*prev, *o, step);
        }
        self.last = out;
        out
    }
}

fn to_channel(v: f32) -> u16 {
    v.round().clamp(SBUS_MIN as f32, SBUS_MAX as f32) as u16
}

fn slew(from: u16, to: u16, step: u16) -> u16 {
    if to > from {
        from + (to - from).min(step)
    } else {
        from - (from - to).min(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::time::Instant;

    fn hazard(sev: Severity, bearing: f32, elevation: f32, dist: f32) -> HazardSignal {
        HazardSignal::new(sev, bearing, elevation, dist, 1, Instant::now())
    }

    #[test]
    fn frame_layout_matches_sbus() {
        let f = ChannelFrame::centered();
        let raw = f.encode();
        assert_eq!(raw[0], HEADER);
        assert_eq!(raw[24], FOOTER);
        // 992 = 0b011_1110_0000, first byte holds its low 8 bits
        assert_eq!(raw[1], 0xE0);
        assert_eq!(ChannelFrame::decode(&raw), Some(f));
    }

    #[test]
    fn arbitrary_channels_survive_packing() {
        let mut f = ChannelFrame::centered();
        for (i, ch) in f.channels.iter_mut().enumerate() {
            *ch = SBUS_MIN + (i as u16 * 97) % (SBUS_MAX - SBUS_MIN);
        }
        f.failsafe = true;
        let back = ChannelFrame::decode(&f.encode()).unwrap();
        assert_eq!(back, f);
    }

    #[test]
    fn mission_target_is_pass_through() {
        let enc = ChannelEncoder::new(SbusConfig::default(), 5.0, AuthorityState::Mission);
        let t = enc.target(AuthorityState::Mission, None);
        let c = SbusConfig::default();
        assert_eq!(t.channels[c.roll_ch], SBUS_MID);
        assert_eq!(t.channels[c.throttle_ch], SBUS_MID);
        assert_eq!(t.channels[c.mode_ch], c.mode_mission);
        assert_eq!(t.channels[c.failsafe_ch], SBUS_MIN);
    }

    #[test]
    fn avoidance_moves_away_from_hazard() {
        let c = SbusConfig::default();
        let enc = ChannelEncoder::new(c.clone(), 5.0, AuthorityState::Mission);

        let right = enc.target(AuthorityState::Override, Some(&hazard(Severity::Critical, 90.0, 0.0, 1.0)));
        assert!(right.channels[c.roll_ch] < SBUS_MID, "roll left away from a hazard on the right");

        let ahead = enc.target(AuthorityState::Override, Some(&hazard(Severity::Critical, 0.0, 0.0, 1.0)));
        assert!(ahead.channels[c.pitch_ch] < SBUS_MID, "pitch back from a hazard ahead");
        assert_eq!(ahead.channels[c.roll_ch], SBUS_MID);

        let above = enc.target(AuthorityState::Override, Some(&hazard(Severity::Caution, 0.0, 60.0, 2.0)));
        assert!(above.channels[c.throttle_ch] < SBUS_MID, "descend from a hazard above");

        let near = SBUS_MID - ahead.channels[c.pitch_ch];
        let far = enc.target(AuthorityState::Override, Some(&hazard(Severity::Critical, 0.0, 0.0, 4.5)));
        assert!(SBUS_MID - far.channels[c.pitch_ch] < near);
        assert!(near <= c.max_deflection);
    }

    #[test]
    fn failsafe_target_is_hold() {
        let c = SbusConfig::default();
        let enc = ChannelEncoder::new(c.clone(), 5.0, AuthorityState::Failsafe);
        let t = enc.last();
        assert_eq!(t.channels[c.mode_ch], c.mode_failsafe);
        assert_eq!(t.channels[c.failsafe_ch], SBUS_MAX);
        assert_eq!(t.channels[c.throttle_ch], c.failsafe_throttle);
        assert!(!t.failsafe);
    }

    #[test]
    fn deltas_never_exceed_limit() {
        let c = SbusConfig::default();
        let mut enc = ChannelEncoder::new(c.clone(), 5.0, AuthorityState::Mission);
        let mut rng = StdRng::seed_from_u64(42);
        let states = [AuthorityState::Mission, AuthorityState::Override, AuthorityState::Failsafe];

        let mut prev = *enc.last();
        for _ in 0..5_000 {
            let state = states[rng.gen_range(0..3)];
            let h = hazard(
                [Severity::None, Severity::Caution, Severity::Critical][rng.gen_range(0..3)],
                rng.gen_range(-180.0..180.0),
                rng.gen_range(-90.0..90.0),
                rng.gen_range(0.0..10.0),
            );
            let hz = if rng.gen_bool(0.7) { Some(&h) } else { None };
            let f = enc.next_frame(state, hz);
            assert!(f.max_step(&prev) <= c.max_delta);
            assert!(f.channels.iter().all(|v| (SBUS_MIN..=SBUS_MAX).contains(v)));
            prev = f;
        }
    }

    #[test]
    fn output_converges_on_target() {
        let c = SbusConfig::default();
        let mut enc = ChannelEncoder::new(c.clone(), 5.0, AuthorityState::Mission);
        let mut f = *enc.last();
        for _ in 0..20 {
            f = enc.next_frame(AuthorityState::Override, None);
        }
        assert_eq!(f, enc.target(AuthorityState::Override, None));
    }
}
