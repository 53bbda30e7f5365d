#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use lure_fc::msp::{self, Direction, Frame, MspParser, ParseEvent, WaypointPayload};
use lure_proto::{Mission, Waypoint, WaypointAction};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

pub enum Answer {
    Ack(Vec<u8>),
    Nack,
    Silent,
}

/// Requests the fake FC has seen, in arrival order.
pub type Seen = Arc<Mutex<Vec<Frame>>>;

/// Scripted flight controller on the far end of a duplex pipe. Telemetry
/// requests are always answered; everything else goes through `script`.
pub fn fake_fc<F>(mut io: DuplexStream, mut script: F) -> (Seen, JoinHandle<()>)
where
    F: FnMut(&Frame) -> Answer + Send + 'static,
{
    let seen: Seen = Arc::default();
    let log = seen.clone();
    let task = tokio::spawn(async move {
        let mut parser = MspParser::new();
        let mut buf = [0u8; 256];
        loop {
            let n = match io.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            for ev in parser.push_bytes(&buf[..n]) {
                let ParseEvent::Frame(req) = ev else { continue };
                if req.direction != Direction::Request {
                    continue;
                }
                log.lock().unwrap().push(req.clone());
                let answer = match req.cmd {
                    msp::MSP_STATUS | msp::MSP_RAW_GPS | msp::MSP_NAV_STATUS => Answer::Ack(vec![0; 16]),
                    _ => script(&req),
                };
                let out = match answer {
                    Answer::Ack(p) => msp::encode(Direction::Reply, req.cmd, &p).unwrap(),
                    Answer::Nack => msp::encode(Direction::Error, req.cmd, &[]).unwrap(),
                    Answer::Silent => continue,
                };
                if io.write_all(&out).await.is_err() {
                    return;
                }
            }
        }
    });
    (seen, task)
}

pub fn waypoint_no(f: &Frame) -> Option<u8> {
    if f.cmd != msp::MSP_SET_WP {
        return None;
    }
    WaypointPayload::parse(&f.payload).map(|w| w.wp_no)
}

pub fn mission_at(lat: f64, n: usize) -> Mission {
    Mission::new(
        (0..n)
            .map(|i| Waypoint::new(lat + i as f64 * 0.0005, 10.75, 25.0, WaypointAction::DropPayload))
            .collect(),
    )
}
