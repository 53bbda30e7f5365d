use anyhow::Result;

use crate::sbus::{SbusConfig, CHANNELS, SBUS_MAX, SBUS_MID, SBUS_MIN};
use crate::{ArbiterConfig, FcConfig};

pub fn check_link(fc: &FcConfig) -> Result<()> {
    if !fc.enable {
        return Ok(());
    }
    if !fc.autodetect {
        anyhow::ensure!(fc.serial_dev.as_ref().map(|s| !s.is_empty()).unwrap_or(false), "fc.serial_dev missing");
        anyhow::ensure!(fc.baud.unwrap_or(0) > 0, "fc.baud invalid");
    }
    anyhow::ensure!(fc.reply_timeout_ms >= 10, "fc.reply_timeout_ms too small");
    anyhow::ensure!(fc.retries <= 10, "fc.retries should be 0..10");
    anyhow::ensure!(fc.backoff_max_ms >= fc.backoff_base_ms, "fc.backoff_max_ms below backoff_base_ms");
    anyhow::ensure!(fc.telemetry_interval_ms >= 20, "fc.telemetry_interval_ms too small");
    Ok(())
}

pub fn check_control(arb: &ArbiterConfig, sbus: &SbusConfig, fc: &FcConfig) -> Result<()> {
    anyhow::ensure!(arb.override_distance_m > 0.0, "arbiter.override_distance_m must be positive");
    anyhow::ensure!(arb.clear_frames >= 1, "arbiter.clear_frames must be at least 1");
    anyhow::ensure!(arb.vision_fps > 0.0, "arbiter.vision_fps must be positive");
    anyhow::ensure!(arb.stall_hold_ms < arb.stall_failsafe_ms, "arbiter.stall_hold_ms must be below stall_failsafe_ms");
    anyhow::ensure!(
        arb.link_timeout_ms > fc.telemetry_interval_ms + fc.reply_timeout_ms,
        "arbiter.link_timeout_ms must exceed one telemetry round ({} ms)",
        fc.telemetry_interval_ms + fc.reply_timeout_ms
    );

    anyhow::ensure!((10.0..=300.0).contains(&sbus.rate_hz), "sbus.rate_hz should be 10..300");
    anyhow::ensure!(sbus.max_delta >= 1, "sbus.max_delta must be at least 1");
    anyhow::ensure!(sbus.max_deflection <= SBUS_MAX - SBUS_MID, "sbus.max_deflection exceeds stick travel");

    let chans = [sbus.roll_ch, sbus.pitch_ch, sbus.throttle_ch, sbus.yaw_ch, sbus.mode_ch, sbus.failsafe_ch];
    anyhow::ensure!(chans.iter().all(|c| *c < CHANNELS), "sbus channel index out of range");
    for (i, a) in chans.iter().enumerate() {
        anyhow::ensure!(!chans[i + 1..].contains(a), "sbus channel {} mapped twice", a);
    }
    for v in [sbus.mode_mission, sbus.mode_override, sbus.mode_failsafe, sbus.failsafe_throttle] {
        anyhow::ensure!((SBUS_MIN..=SBUS_MAX).contains(&v), "sbus value {} outside {}..{}", v, SBUS_MIN, SBUS_MAX);
    }
    Ok(())
}
