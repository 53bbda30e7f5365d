use anyhow::Result;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_serial::SerialPortBuilderExt;
use tracing::{info, warn};

use crate::msp::{self, Direction, MspParser, ParseEvent};

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub dev: String,
    pub baud: u32,
    pub msp_seen: bool,
    pub elapsed_ms: u64,
    pub note: String,
}

#[derive(Debug, Clone)]
pub struct AutodetectResult {
    pub chosen: Option<(String, u32)>,
    pub probes: Vec<ProbeResult>,
}

pub fn default_candidate_devs() -> Vec<String> {
    vec![
        "/dev/serial0".into(),
        "/dev/ttyAMA0".into(),
        "/dev/ttyS0".into(),
        "/dev/ttyS1".into(),
        "/dev/ttyUSB0".into(),
        "/dev/ttyACM0".into(),
        "/dev/ttyACM1".into(),
    ]
}

pub fn default_candidate_bauds() -> Vec<u32> {
    vec![115200, 57600, 230400, 921600]
}

/// Asks for `MSP_API_VERSION` and waits for a well-formed reply.
/// Returns the reported `(protocol, major, minor)`.
pub async fn probe_msp<S>(io: &mut S, reply_timeout: Duration) -> Result<Option<(u8, u8, u8)>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = msp::encode(Direction::Request, msp::MSP_API_VERSION, &[])?;
    io.write_all(&frame).await?;
    io.flush().await?;

    let deadline = Instant::now() + reply_timeout;
    let mut parser = MspParser::new();
    let mut buf = [0u8; 64];
    loop {
        let n = match tokio::time::timeout_at(deadline, io.read(&mut buf)).await {
            Err(_) => return Ok(None),
            Ok(r) => r?,
        };
        if n == 0 {
            return Ok(None);
        }
        for ev in parser.push_bytes(&buf[..n]) {
            if let ParseEvent::Frame(f) = ev {
                if f.cmd == msp::MSP_API_VERSION && f.direction == Direction::Reply {
                    let p = &f.payload;
                    let v = (
                        p.first().copied().unwrap_or(0),
                        p.get(1).copied().unwrap_or(0),
                        p.get(2).copied().unwrap_or(0),
                    );
                    return Ok(Some(v));
                }
            }
        }
    }
}

/// Tries every device at every baud until one answers MSP.
pub async fn autodetect_fc(
    candidate_devs: Vec<String>,
    candidate_bauds: Vec<u32>,
    reply_timeout: Duration,
) -> Result<AutodetectResult> {
    let mut probes = Vec::new();

    for dev in candidate_devs {
        for baud in &candidate_bauds {
            let start = Instant::now();
            let mut msp_seen = false;

            let note = match tokio_serial::new(&dev, *baud).open_native_async() {
                Ok(mut port) => match probe_msp(&mut port, reply_timeout).await {
                    Ok(Some((proto, major, minor))) => {
                        msp_seen = true;
                        format!("msp api {}.{} (protocol {})", major, minor, proto)
                    }
                    Ok(None) => "no msp reply".into(),
                    Err(e) => format!("probe failed: {}", e),
                },
                Err(e) => {
                    warn!("fc autodetect probe failed dev={} baud={} err={}", dev, baud, e);
                    format!("open failed: {}", e)
                }
            };

            probes.push(ProbeResult {
                dev: dev.clone(),
                baud: *baud,
                msp_seen,
                elapsed_ms: start.elapsed().as_millis() as u64,
                note,
            });
            if msp_seen {
                info!("fc autodetect: OK {} @ {}", dev, baud);
                return Ok(AutodetectResult { chosen: Some((dev, *baud)), probes });
            }
        }
    }

    Ok(AutodetectResult { chosen: None, probes })
}
