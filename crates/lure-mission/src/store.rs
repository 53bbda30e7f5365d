//! Owner of the authoritative mission.
//!
//! The store only ever exposes whole, acknowledged missions. An upload that
//! does not finish leaves the previous mission in place and flips the upload
//! status to `Failed`.

use std::sync::{Arc, Mutex, MutexGuard};

use lure_proto::{Mission, UploadStatus};
use tracing::{info, warn};

use crate::MissionConfig;

#[derive(Debug, thiserror::Error)]
pub enum MissionError {
    #[error("mission has no waypoints")]
    Empty,
    #[error("waypoint {index} has invalid coordinates")]
    InvalidWaypoint { index: usize },
    #[error("waypoint {index} altitude {alt_m}m outside {min}..{max}m")]
    AltitudeOutOfRange { index: usize, alt_m: f32, min: f32, max: f32 },
    #[error("mission has {count} waypoints, FC accepts at most {max}")]
    TooManyWaypoints { count: usize, max: usize },
    #[error("upload incomplete: {acked}/{total} waypoints acknowledged, finalized={finalized}")]
    Incomplete { acked: usize, total: usize, finalized: bool },
}

/// What the Mission Link confirmed for one upload attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub acked_waypoints: usize,
    pub finalized: bool,
}

impl UploadReport {
    pub fn is_complete_for(&self, mission: &Mission) -> bool {
        !mission.is_empty() && self.finalized && self.acked_waypoints == mission.len()
    }
}

/// Point-in-time view for status reporting.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub current: Option<Arc<Mission>>,
    pub status: UploadStatus,
    pub last_error: Option<String>,
}

impl StoreSnapshot {
    pub fn has_acknowledged(&self) -> bool {
        self.current.is_some()
    }

    /// Latest upload failed and there is nothing to fall back to.
    pub fn failed_without_prior(&self) -> bool {
        self.status == UploadStatus::Failed && self.current.is_none()
    }
}

#[derive(Debug, Default)]
pub struct MissionStore {
    inner: Mutex<StoreSnapshot>,
}

impl MissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreSnapshot> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Last mission the FC fully acknowledged.
    pub fn current(&self) -> Option<Arc<Mission>> {
        self.lock().current.clone()
    }

    pub fn status(&self) -> UploadStatus {
        self.lock().status
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.lock().clone()
    }

    pub fn begin_upload(&self) {
        let mut g = self.lock();
        g.status = UploadStatus::Pending;
        g.last_error = None;
    }

    pub fn mark_sent(&self) {
        let mut g = self.lock();
        if g.status == UploadStatus::Pending {
            g.status = UploadStatus::Sent;
        }
    }

    /// Swaps in `mission` if `report` covers every waypoint and the
    /// finalize marker. Otherwise records the failure and keeps the
    /// previous mission.
    pub fn replace(&self, mission: Mission, report: UploadReport) -> Result<Arc<Mission>, MissionError> {
        if !report.is_complete_for(&mission) {
            let err = MissionError::Incomplete {
                acked: report.acked_waypoints,
                total: mission.len(),
                finalized: report.finalized,
            };
            self.fail(&err.to_string());
            return Err(err);
        }

        let mission = Arc::new(mission.with_status(UploadStatus::Acknowledged));
        let mut g = self.lock();
        g.current = Some(mission.clone());
        g.status = UploadStatus::Acknowledged;
        g.last_error = None;
        info!("mission store: {} waypoints acknowledged", mission.len());
        Ok(mission)
    }

    pub fn fail(&self, reason: &str) {
        let mut g = self.lock();
        g.status = UploadStatus::Failed;
        g.last_error = Some(reason.to_string());
        warn!(
            "mission store: upload failed ({}); keeping {}",
            reason,
            match &g.current {
                Some(m) => format!("previous mission of {} waypoints", m.len()),
                None => "no mission".to_string(),
            }
        );
    }
}

/// Checks a candidate mission against FC limits before any byte is sent.
pub fn validate(mission: &Mission, cfg: &MissionConfig) -> Result<(), MissionError> {
    if mission.is_empty() {
        return Err(MissionError::Empty);
    }
    if mission.len() > cfg.max_waypoints {
        return Err(MissionError::TooManyWaypoints { count: mission.len(), max: cfg.max_waypoints });
    }
    if let Some(index) = mission.first_invalid() {
        return Err(MissionError::InvalidWaypoint { index });
    }
    for (index, wp) in mission.waypoints().iter().enumerate() {
        if wp.alt_m < cfg.min_alt_m || wp.alt_m > cfg.max_alt_m {
            return Err(MissionError::AltitudeOutOfRange {
                index,
                alt_m: wp.alt_m,
                min: cfg.min_alt_m,
                max: cfg.max_alt_m,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lure_proto::{Waypoint, WaypointAction};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn mission(n: usize) -> Mission {
        Mission::new(
            (0..n)
                .map(|i| Waypoint::new(41.0 + i as f64 * 0.001, -73.0, 30.0, WaypointAction::DropPayload))
                .collect(),
        )
    }

    #[test]
    fn complete_upload_swaps_mission() {
        let store = MissionStore::new();
        store.begin_upload();
        store.mark_sent();
        assert_eq!(store.status(), UploadStatus::Sent);

        let m = store
            .replace(mission(3), UploadReport { acked_waypoints: 3, finalized: true })
            .unwrap();
        assert_eq!(m.status(), UploadStatus::Acknowledged);
        assert_eq!(store.status(), UploadStatus::Acknowledged);
        assert_eq!(store.current().unwrap().len(), 3);
    }

    #[test]
    fn incomplete_upload_keeps_previous() {
        let store = MissionStore::new();
        store.replace(mission(2), UploadReport { acked_waypoints: 2, finalized: true }).unwrap();

        let err = store
            .replace(mission(5), UploadReport { acked_waypoints: 5, finalized: false })
            .unwrap_err();
        assert!(matches!(err, MissionError::Incomplete { acked: 5, total: 5, finalized: false }));
        assert_eq!(store.status(), UploadStatus::Failed);
        assert_eq!(store.current().unwrap().len(), 2);
        assert!(!store.snapshot().failed_without_prior());
    }

    #[test]
    fn failure_without_prior_is_flagged() {
        let store = MissionStore::new();
        store.begin_upload();
        store.fail("link timeout");
        let snap = store.snapshot();
        assert!(snap.failed_without_prior());
        assert_eq!(snap.last_error.as_deref(), Some("link timeout"));
    }

    #[test]
    fn replace_is_all_or_nothing() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let store = MissionStore::new();
        let mut expected: Option<usize> = None;

        for _ in 0..500 {
            let n = rng.gen_range(1..12);
            let acked = rng.gen_range(0..=n);
            let finalized = rng.gen_bool(0.5);
            let res = store.replace(mission(n), UploadReport { acked_waypoints: acked, finalized });

            if acked == n && finalized {
                assert!(res.is_ok());
                assert_eq!(store.status(), UploadStatus::Acknowledged);
                expected = Some(n);
            } else {
                assert!(res.is_err());
                assert_eq!(store.status(), UploadStatus::Failed);
            }
            assert_eq!(store.current().map(|m| m.len()), expected);
            if let Some(m) = store.current() {
                assert_eq!(m.status(), UploadStatus::Acknowledged);
            }
        }
    }

    #[test]
    fn validate_rejects_out_of_limits() {
        let cfg = MissionConfig::default();
        assert!(matches!(validate(&mission(0), &cfg), Err(MissionError::Empty)));
        assert!(matches!(
            validate(&mission(cfg.max_waypoints + 1), &cfg),
            Err(MissionError::TooManyWaypoints { .. })
        ));
        let low = Mission::new(vec![Waypoint::new(1.0, 1.0, 1.0, WaypointAction::Navigate)]);
        assert!(matches!(validate(&low, &cfg), Err(MissionError::AltitudeOutOfRange { index: 0, .. })));
        assert!(validate(&mission(3), &cfg).is_ok());
    }
}
