//! Capture and classification, decoupled by a one-frame slot.
//!
//! Capture overwrites the slot; an unclassified frame is dropped, never
//! queued. The classifier always takes the newest frame and publishes its
//! verdict into the hazard handoff cell.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use lure_proto::{HandoffWriter, HazardSignal};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::camera::{self, FrameSource};
use crate::{Frame, HazardClassifier, SeverityFilter};

#[derive(Debug, Default)]
pub struct VisionStats {
    pub captured: AtomicU64,
    pub classified: AtomicU64,
    /// Frames overwritten before the classifier got to them.
    pub dropped: AtomicU64,
    /// Classifications that took longer than the frame budget.
    pub overruns: AtomicU64,
    pub capture_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct VisionStatsSnapshot {
    pub captured: u64,
    pub classified: u64,
    pub dropped: u64,
    pub overruns: u64,
    pub capture_errors: u64,
}

impl VisionStats {
    pub fn snapshot(&self) -> VisionStatsSnapshot {
        VisionStatsSnapshot {
            captured: self.captured.load(Ordering::Relaxed),
            classified: self.classified.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            capture_errors: self.capture_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
struct SlotState {
    frame: Option<Frame>,
    closed: bool,
}

/// Single-slot frame cell between the async capture task and the blocking
/// classifier thread.
#[derive(Debug, Default)]
pub struct FrameSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Stores `frame`, returning true if it replaced one nobody took.
    pub fn put(&self, frame: Frame) -> bool {
        let replaced = self.lock().frame.replace(frame).is_some();
        self.ready.notify_one();
        replaced
    }

    /// Newest frame, waiting up to `timeout` for one. `None` on timeout or
    /// when the slot is closed and empty.
    pub fn take_timeout(&self, timeout: Duration) -> Option<Frame> {
        let guard = self.lock();
        let (mut guard, _) = self
            .ready
            .wait_timeout_while(guard, timeout, |s| s.frame.is_none() && !s.closed)
            .unwrap_or_else(|p| p.into_inner());
        guard.frame.take()
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        let s = self.lock();
        s.closed && s.frame.is_none()
    }
}

/// Pulls frames from `source` at `fps` into `slot` until the source runs
/// dry. Closes the slot on the way out.
pub async fn capture_loop(
    mut source: FrameSource,
    slot: std::sync::Arc<FrameSlot>,
    fps: f32,
    width: u32,
    height: u32,
    stats: std::sync::Arc<VisionStats>,
) {
    let mut tick = tokio::time::interval(Duration::from_secs_f32(1.0 / fps.max(1.0)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut seq = 0u64;
    info!("vision: capture running at {} fps", fps);

    loop {
        tick.tick().await;
        let bytes = match source.next_encoded().await {
            Ok(Some(b)) => b,
            Ok(None) => {
                info!("vision: frame source exhausted after {} frames", seq);
                break;
            }
            Err(e) => {
                let n = stats.capture_errors.fetch_add(1, Ordering::Relaxed) + 1;
                if n == 1 || n % 100 == 0 {
                    warn!("vision: capture failed ({} so far): {:#}", n, e);
                }
                continue;
            }
        };
        let captured_at = tokio::time::Instant::now().into_std();
        seq += 1;
        let frame = match camera::decode_at(seq, captured_at, &bytes, width, height) {
            Ok(f) => f,
            Err(e) => {
                stats.capture_errors.fetch_add(1, Ordering::Relaxed);
                debug!("vision: {:#}", e);
                continue;
            }
        };
        stats.captured.fetch_add(1, Ordering::Relaxed);
        if slot.put(frame) {
            stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
    slot.close();
}

/// Blocking classifier worker. Run it on `spawn_blocking`.
///
/// Published signals carry the capture time of their frame. A result that
/// blew the frame budget is not published: the previous signal stays in
/// the cell and ages into staleness.
pub fn classify_loop(
    slot: &FrameSlot,
    classifier: &mut dyn HazardClassifier,
    filter: &mut SeverityFilter,
    out: &HandoffWriter<Option<HazardSignal>>,
    budget: Duration,
    stats: &VisionStats,
) {
    info!("vision: classifier running, budget {:?}", budget);
    loop {
        let Some(frame) = slot.take_timeout(Duration::from_millis(250)) else {
            if slot.is_closed() {
                break;
            }
            continue;
        };

        let started = Instant::now();
        let raw = classifier.classify(&frame);
        let signal = filter.apply(raw);
        let elapsed = started.elapsed();

        let n = stats.classified.fetch_add(1, Ordering::Relaxed) + 1;
        if elapsed > budget {
            let over = stats.overruns.fetch_add(1, Ordering::Relaxed) + 1;
            if over == 1 || over % 100 == 0 {
                warn!("vision: frame {} took {:?} (budget {:?}), {} overruns in {} frames", frame.seq, elapsed, budget, over, n);
            }
            continue;
        }
        out.publish(Some(signal));
    }
    info!("vision: classifier stopped");
}
