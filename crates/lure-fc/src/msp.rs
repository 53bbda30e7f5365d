//! MSP v1 framing as spoken by INAV.
//!
//! `$ M <dir> <size> <cmd> <payload..> <checksum>` where `dir` is `<` for
//! requests, `>` for replies and `!` for errors, and the checksum is the XOR
//! of size, cmd and every payload byte.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use lure_proto::{Waypoint, WaypointAction};

use crate::FcError;

pub const MSP_API_VERSION: u8 = 1;
pub const MSP_WP_MISSION_SAVE: u8 = 19;
pub const MSP_STATUS: u8 = 101;
pub const MSP_RAW_GPS: u8 = 106;
pub const MSP_NAV_STATUS: u8 = 121;
pub const MSP_SET_WP: u8 = 209;

pub const MAX_PAYLOAD: usize = 255;

// INAV navigation actions
pub const NAV_WP_ACTION_WAYPOINT: u8 = 1;
pub const NAV_WP_ACTION_HOLD_TIME: u8 = 3;
/// Flag byte marking the final waypoint of a mission.
pub const NAV_WP_FLAG_LAST: u8 = 0xA5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Reply,
    Error,
}

impl Direction {
    fn byte(self) -> u8 {
        match self {
            Direction::Request => b'<',
            Direction::Reply => b'>',
            Direction::Error => b'!',
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'<' => Some(Direction::Request),
            b'>' => Some(Direction::Reply),
            b'!' => Some(Direction::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub direction: Direction,
    pub cmd: u8,
    pub payload: Bytes,
}

pub fn checksum(cmd: u8, payload: &[u8]) -> u8 {
    payload.iter().fold(payload.len() as u8 ^ cmd, |acc, b| acc ^ b)
}

pub fn encode(direction: Direction, cmd: u8, payload: &[u8]) -> Result<Bytes, FcError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FcError::PayloadTooLarge(payload.len()));
    }
    let mut out = BytesMut::with_capacity(payload.len() + 6);
    out.put_slice(b"$M");
    out.put_u8(direction.byte());
    out.put_u8(payload.len() as u8);
    out.put_u8(cmd);
    out.put_slice(payload);
    out.put_u8(checksum(cmd, payload));
    Ok(out.freeze())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    Frame(Frame),
    ChecksumMismatch { cmd: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    HeaderM,
    Direction,
    Size,
    Cmd,
    Payload,
    Checksum,
}

/// Byte-at-a-time MSP decoder. Garbage between frames is skipped.
#[derive(Debug)]
pub struct MspParser {
    state: State,
    direction: Direction,
    size: usize,
    cmd: u8,
    buf: BytesMut,
}

impl Default for MspParser {
    fn default() -> Self {
        Self::new()
    }
}

impl MspParser {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            direction: Direction::Reply,
            size: 0,
            cmd: 0,
            buf: BytesMut::with_capacity(MAX_PAYLOAD),
        }
    }

    /// Drops any partially received frame.
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.buf.clear();
    }

    pub fn push_byte(&mut self, b: u8) -> Option<ParseEvent> {
        match self.state {
            State::Idle => {
                if b == b'$' {
                    self.state = State::HeaderM;
                }
            }
            State::HeaderM => {
                self.state = match b {
                    b'M' => State::Direction,
                    b'$' => State::HeaderM,
                    _ => State::Idle,
                };
            }
            State::Direction => match Direction::from_byte(b) {
                Some(d) => {
                    self.direction = d;
                    self.state = State::Size;
                }
                None => self.state = if b == b'$' { State::HeaderM } else { State::Idle },
            },
            State::Size => {
                self.size = b as usize;
                self.buf.clear();
                self.state = State::Cmd;
            }
            State::Cmd => {
                self.cmd = b;
                self.state = if self.size == 0 { State::Checksum } else { State::Payload };
            }
            State::Payload => {
                self.buf.put_u8(b);
                if self.buf.len() == self.size {
                    self.state = State::Checksum;
                }
            }
            State::Checksum => {
                self.state = State::Idle;
                let payload = self.buf.split().freeze();
                if checksum(self.cmd, &payload) != b {
                    return Some(ParseEvent::ChecksumMismatch { cmd: self.cmd });
                }
                return Some(ParseEvent::Frame(Frame { direction: self.direction, cmd: self.cmd, payload }));
            }
        }
        None
    }

    pub fn push_bytes(&mut self, data: &[u8]) -> Vec<ParseEvent> {
        data.iter().filter_map(|b| self.push_byte(*b)).collect()
    }
}

/// INAV `MSP_SET_WP` body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaypointPayload {
    pub wp_no: u8,
    pub action: u8,
    pub lat_e7: i32,
    pub lon_e7: i32,
    pub alt_cm: i32,
    pub p1: i16,
    pub p2: i16,
    pub p3: i16,
    pub flag: u8,
}

impl WaypointPayload {
    pub const LEN: usize = 21;

    /// `index` is zero-based; INAV numbers mission waypoints from 1.
    pub fn from_waypoint(index: usize, wp: &Waypoint, is_last: bool, drop_hold_s: u16) -> Self {
        let (action, p1) = match wp.action {
            WaypointAction::Navigate => (NAV_WP_ACTION_WAYPOINT, 0),
            WaypointAction::DropPayload => (NAV_WP_ACTION_HOLD_TIME, drop_hold_s.min(i16::MAX as u16) as i16),
        };
        Self {
            wp_no: (index + 1).min(u8::MAX as usize) as u8,
            action,
            lat_e7: (wp.lat * 1e7).round() as i32,
            lon_e7: (wp.lon * 1e7).round() as i32,
            alt_cm: (wp.alt_m * 100.0).round() as i32,
            p1,
            p2: 0,
            p3: 0,
            flag: if is_last { NAV_WP_FLAG_LAST } else { 0 },
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut b = BytesMut::with_capacity(Self::LEN);
        b.put_u8(self.wp_no);
        b.put_u8(self.action);
        b.put_i32_le(self.lat_e7);
        b.put_i32_le(self.lon_e7);
        b.put_i32_le(self.alt_cm);
        b.put_i16_le(self.p1);
        b.put_i16_le(self.p2);
        b.put_i16_le(self.p3);
        b.put_u8(self.flag);
        b.freeze()
    }

    pub fn parse(mut b: &[u8]) -> Option<Self> {
        if b.len() < Self::LEN {
            return None;
        }
        Some(Self {
            wp_no: b.get_u8(),
            action: b.get_u8(),
            lat_e7: b.get_i32_le(),
            lon_e7: b.get_i32_le(),
            alt_cm: b.get_i32_le(),
            p1: b.get_i16_le(),
            p2: b.get_i16_le(),
            p3: b.get_i16_le(),
            flag: b.get_u8(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReply {
    pub cycle_time_us: u16,
    pub sensors: u16,
    pub mode_flags: u32,
}

impl StatusReply {
    /// ARM is the first box in INAV's mode bitfield.
    pub fn armed(&self) -> bool {
        self.mode_flags & 1 != 0
    }
}

pub fn parse_status(mut b: &[u8]) -> Option<StatusReply> {
    if b.len() < 10 {
        return None;
    }
    let cycle_time_us = b.get_u16_le();
    let _i2c_errors = b.get_u16_le();
    let sensors = b.get_u16_le();
    let mode_flags = b.get_u32_le();
    Some(StatusReply { cycle_time_us, sensors, mode_flags })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsReply {
    pub fix_type: u8,
    pub sats: u8,
    pub lat: f64,
    pub lon: f64,
    pub alt_m: f32,
}

pub fn parse_raw_gps(mut b: &[u8]) -> Option<GpsReply> {
    if b.len() < 16 {
        return None;
    }
    let fix_type = b.get_u8();
    let sats = b.get_u8();
    let lat = b.get_i32_le() as f64 / 1e7;
    let lon = b.get_i32_le() as f64 / 1e7;
    let alt_m = b.get_i16_le() as f32;
    Some(GpsReply { fix_type, sats, lat, lon, alt_m })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavStatusReply {
    pub mode: u8,
    pub state: u8,
    pub active_wp_action: u8,
    pub active_wp: u8,
    pub error: u8,
}

pub fn parse_nav_status(b: &[u8]) -> Option<NavStatusReply> {
    if b.len() < 5 {
        return None;
    }
    Some(NavStatusReply { mode: b[0], state: b[1], active_wp_action: b[2], active_wp: b[3], error: b[4] })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_known_frame() {
        // MSP_STATUS request, no payload: checksum == cmd
        let f = encode(Direction::Request, MSP_STATUS, &[]).unwrap();
        assert_eq!(&f[..], &[b'$', b'M', b'<', 0, 101, 101]);
    }

    #[test]
    fn parser_resyncs_after_garbage() {
        let mut p = MspParser::new();
        let mut stream = vec![0x00, b'$', b'X', b'$', b'$'];
        stream.extend_from_slice(&encode(Direction::Reply, MSP_SET_WP, &[1, 2, 3]).unwrap()[1..]);
        let ev = p.push_bytes(&stream);
        assert_eq!(ev.len(), 1);
        match &ev[0] {
            ParseEvent::Frame(f) => {
                assert_eq!(f.direction, Direction::Reply);
                assert_eq!(f.cmd, MSP_SET_WP);
                assert_eq!(&f.payload[..], &[1, 2, 3]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bad_checksum_is_reported() {
        let mut frame = encode(Direction::Reply, MSP_RAW_GPS, &[9, 9]).unwrap().to_vec();
        *frame.last_mut().unwrap() ^= 0xFF;
        let mut p = MspParser::new();
        assert_eq!(p.push_bytes(&frame), vec![ParseEvent::ChecksumMismatch { cmd: MSP_RAW_GPS }]);
    }

    #[test]
    fn error_direction_parses() {
        let mut p = MspParser::new();
        let ev = p.push_bytes(&encode(Direction::Error, MSP_SET_WP, &[]).unwrap());
        assert!(matches!(&ev[..], [ParseEvent::Frame(Frame { direction: Direction::Error, cmd: MSP_SET_WP, .. })]));
    }

    #[test]
    fn reset_discards_partial_frame() {
        let mut p = MspParser::new();
        let full = encode(Direction::Reply, MSP_STATUS, &[1, 2, 3, 4]).unwrap();
        assert!(p.push_bytes(&full[..6]).is_empty());
        p.reset();
        assert_eq!(p.push_bytes(&full).len(), 1);
    }

    #[test]
    fn oversized_payload_rejected() {
        assert!(matches!(
            encode(Direction::Request, MSP_SET_WP, &[0u8; 256]),
            Err(FcError::PayloadTooLarge(256))
        ));
    }

    #[test]
    fn waypoint_payload_layout() {
        let wp = Waypoint::new(41.1413, -73.3579, 50.0, WaypointAction::DropPayload);
        let p = WaypointPayload::from_waypoint(1, &wp, true, 8);
        assert_eq!(p.wp_no, 2);
        assert_eq!(p.action, NAV_WP_ACTION_HOLD_TIME);
        assert_eq!(p.p1, 8);
        assert_eq!(p.alt_cm, 5000);
        assert_eq!(p.flag, NAV_WP_FLAG_LAST);

        let bytes = p.to_bytes();
        assert_eq!(bytes.len(), WaypointPayload::LEN);
        assert_eq!(WaypointPayload::parse(&bytes), Some(p));
        assert_eq!(i32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]), 411_413_000);
    }

    #[test]
    fn telemetry_replies_decode() {
        let mut st = Vec::new();
        st.extend_from_slice(&2000u16.to_le_bytes());
        st.extend_from_slice(&0u16.to_le_bytes());
        st.extend_from_slice(&0x23u16.to_le_bytes());
        st.extend_from_slice(&0b101u32.to_le_bytes());
        st.push(0);
        let s = parse_status(&st).unwrap();
        assert!(s.armed());
        assert_eq!(s.cycle_time_us, 2000);

        let mut gps = vec![3u8, 11];
        gps.extend_from_slice(&411_413_000i32.to_le_bytes());
        gps.extend_from_slice(&(-733_579_000i32).to_le_bytes());
        gps.extend_from_slice(&42i16.to_le_bytes());
        gps.extend_from_slice(&[0, 0, 0, 0]);
        let g = parse_raw_gps(&gps).unwrap();
        assert_eq!(g.sats, 11);
        assert!((g.lon + 73.3579).abs() < 1e-9);

        assert_eq!(parse_nav_status(&[3, 5, 1, 2, 0, 0, 0]).unwrap().active_wp, 2);
        assert!(parse_nav_status(&[1, 2]).is_none());
    }
}
