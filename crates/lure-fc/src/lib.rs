pub mod arbiter;
pub mod autodetect;
pub mod control;
pub mod doctor;
pub mod link;
pub mod msp;
pub mod safety;
pub mod sbus;

use serde::Deserialize;
use std::time::Duration;

pub use arbiter::{Arbiter, ArbiterConfig, Decision, FailsafeReason, TickInput};
pub use control::{ControlIo, ControlLoop, ControlStatus, OperatorCommand};
pub use link::{LinkCommand, MissionLink, UploadResult};
pub use sbus::{ChannelEncoder, ChannelFrame, SbusConfig};

#[derive(Debug, thiserror::Error)]
pub enum FcError {
    #[error("mission link timeout waiting for reply to cmd {cmd}")]
    LinkTimeout { cmd: u8 },
    #[error("checksum mismatch in reply to cmd {cmd}")]
    ChecksumMismatch { cmd: u8 },
    #[error("FC nacked cmd {cmd}")]
    Nack { cmd: u8 },
    #[error("FC rejected cmd {cmd}{}", .wp.map(|n| format!(" (waypoint {n})")).unwrap_or_default())]
    UploadRejected { cmd: u8, wp: Option<u8> },
    #[error("payload of {0} bytes exceeds MSP v1 limit")]
    PayloadTooLarge(usize),
    #[error("upload cancelled: {0}")]
    Cancelled(&'static str),
    #[error("mission link i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl FcError {
    /// Errors worth another attempt of the same request.
    pub fn is_transient(&self) -> bool {
        matches!(self, FcError::LinkTimeout { .. } | FcError::ChecksumMismatch { .. } | FcError::Nack { .. })
    }
}

/// Mission Link (MSP) serial settings and retry policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FcConfig {
    pub enable: bool,

    /// Probe candidate ports/bauds for an MSP reply instead of using `serial_dev`.
    pub autodetect: bool,
    pub serial_dev: Option<String>,
    pub baud: Option<u32>,
    pub candidate_devs: Option<Vec<String>>,
    pub candidate_bauds: Option<Vec<u32>>,

    pub reply_timeout_ms: u64,
    /// Extra attempts after the first one fails.
    pub retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub telemetry_interval_ms: u64,

    /// Hover time at drop waypoints (INAV POSHOLD_TIME parameter).
    pub drop_hold_s: u16,
}

impl Default for FcConfig {
    fn default() -> Self {
        Self {
            enable: true,
            autodetect: false,
            serial_dev: Some("/dev/ttyS1".into()),
            baud: Some(115_200),
            candidate_devs: None,
            candidate_bauds: None,
            reply_timeout_ms: 250,
            retries: 3,
            backoff_base_ms: 50,
            backoff_max_ms: 800,
            telemetry_interval_ms: 200,
            drop_hold_s: 5,
        }
    }
}

impl FcConfig {
    pub fn timing(&self) -> LinkTiming {
        LinkTiming {
            reply_timeout: Duration::from_millis(self.reply_timeout_ms),
            retries: self.retries,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            telemetry_interval: Duration::from_millis(self.telemetry_interval_ms),
            drop_hold_s: self.drop_hold_s,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LinkTiming {
    pub reply_timeout: Duration,
    pub retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub telemetry_interval: Duration,
    pub drop_hold_s: u16,
}

impl Default for LinkTiming {
    fn default() -> Self {
        FcConfig::default().timing()
    }
}
