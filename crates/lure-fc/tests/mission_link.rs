mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fake_fc, mission_at, waypoint_no, Answer};
use lure_fc::msp::{self, WaypointPayload};
use lure_fc::{FcError, LinkCommand, LinkTiming, MissionLink};
use lure_mission::{MissionStore, UploadReport};
use lure_proto::{handoff, AuthorityState, FcTelemetry, LinkHealth, UploadStatus};
use tokio::sync::{mpsc, oneshot};

fn link(io: tokio::io::DuplexStream) -> MissionLink<tokio::io::DuplexStream> {
    let (health, _) = handoff(LinkHealth::default());
    let (telemetry, _) = handoff(FcTelemetry::default());
    MissionLink::new(io, LinkTiming::default(), health, telemetry)
}

#[tokio::test(start_paused = true)]
async fn three_waypoint_upload_is_acknowledged() {
    let (host, fc) = tokio::io::duplex(1024);
    let (seen, _fc) = fake_fc(fc, |_| Answer::Ack(vec![]));
    let store = MissionStore::new();
    let mut l = link(host);

    let mission = mission_at(59.91, 3);
    store.begin_upload();
    let report = l.upload(&mission, &store).await.unwrap();
    assert_eq!(report, UploadReport { acked_waypoints: 3, finalized: true });
    assert_eq!(store.status(), UploadStatus::Sent);

    let current = store.replace(mission, report).unwrap();
    assert_eq!(current.len(), 3);
    assert_eq!(store.status(), UploadStatus::Acknowledged);

    let frames = seen.lock().unwrap().clone();
    let wps: Vec<WaypointPayload> = frames
        .iter()
        .filter(|f| f.cmd == msp::MSP_SET_WP)
        .filter_map(|f| WaypointPayload::parse(&f.payload))
        .collect();
    assert_eq!(wps.iter().map(|w| w.wp_no).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(wps[2].flag, msp::NAV_WP_FLAG_LAST);
    assert!(wps[..2].iter().all(|w| w.flag == 0));
    assert!(wps.iter().all(|w| w.action == msp::NAV_WP_ACTION_HOLD_TIME && w.alt_cm == 2500));
    assert_eq!(frames.last().map(|f| f.cmd), Some(msp::MSP_WP_MISSION_SAVE));
}

#[tokio::test(start_paused = true)]
async fn unacked_waypoint_fails_upload_and_keeps_previous() {
    let (host, fc) = tokio::io::duplex(1024);
    let (seen, _fc) = fake_fc(fc, |f| match waypoint_no(f) {
        Some(2) => Answer::Silent,
        _ => Answer::Ack(vec![]),
    });

    let store = Arc::new(MissionStore::new());
    let previous = mission_at(60.0, 2);
    store.replace(previous, UploadReport { acked_waypoints: 2, finalized: true }).unwrap();

    let (health, health_r) = handoff(LinkHealth::default());
    let (telemetry, _) = handoff(FcTelemetry::default());
    let (_authority, authority_r) = handoff(AuthorityState::Mission);
    let (cmd_tx, cmd_rx) = mpsc::channel(4);
    let l = MissionLink::new(host, LinkTiming::default(), health, telemetry);
    let task = tokio::spawn(l.run(store.clone(), cmd_rx, authority_r));

    let (reply_tx, reply_rx) = oneshot::channel();
    cmd_tx.send(LinkCommand::Upload { mission: mission_at(59.91, 3), reply: reply_tx }).await.unwrap();
    let err = reply_rx.await.unwrap().unwrap_err();
    assert!(err.contains("timeout"), "unexpected error: {err}");

    assert_eq!(store.status(), UploadStatus::Failed);
    let current = store.current().unwrap();
    assert_eq!(current.len(), 2);
    assert_eq!(current.waypoints()[0].lat, 60.0);

    let frames = seen.lock().unwrap().clone();
    let attempts = frames.iter().filter(|f| waypoint_no(f) == Some(2)).count();
    assert_eq!(attempts, 1 + LinkTiming::default().retries as usize);
    assert!(!frames.iter().any(|f| waypoint_no(f) == Some(3)));
    assert!(!frames.iter().any(|f| f.cmd == msp::MSP_WP_MISSION_SAVE));

    // telemetry kept flowing between the retries
    let first_wp2 = frames.iter().position(|f| waypoint_no(f) == Some(2)).unwrap();
    assert!(frames[first_wp2..].iter().any(|f| f.cmd == msp::MSP_STATUS));
    assert!(health_r.latest().last_reply.is_some());

    drop(cmd_tx);
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn exhausted_nacks_are_rejections() {
    let (host, fc) = tokio::io::duplex(1024);
    let (_seen, _fc) = fake_fc(fc, |f| match waypoint_no(f) {
        Some(1) => Answer::Nack,
        _ => Answer::Ack(vec![]),
    });
    let store = MissionStore::new();
    let mut l = link(host);

    let err = l.upload(&mission_at(59.91, 2), &store).await.unwrap_err();
    assert!(matches!(err, FcError::UploadRejected { cmd: msp::MSP_SET_WP, wp: Some(1) }), "{err:?}");
}

#[tokio::test(start_paused = true)]
async fn newer_upload_supersedes_stuck_one() {
    let (host, fc) = tokio::io::duplex(1024);
    // the first mission's second waypoint is never answered
    let (_seen, _fc) = fake_fc(fc, |f| {
        let stuck = f.cmd == msp::MSP_SET_WP
            && WaypointPayload::parse(&f.payload).map_or(false, |w| w.wp_no == 2 && w.lat_e7 < 595_000_000);
        if stuck { Answer::Silent } else { Answer::Ack(vec![]) }
    });

    let store = Arc::new(MissionStore::new());
    let (health, _) = handoff(LinkHealth::default());
    let (telemetry, _) = handoff(FcTelemetry::default());
    let (_authority, authority_r) = handoff(AuthorityState::Failsafe);
    let (cmd_tx, cmd_rx) = mpsc::channel(4);
    let task = tokio::spawn(MissionLink::new(host, LinkTiming::default(), health, telemetry).run(
        store.clone(),
        cmd_rx,
        authority_r,
    ));

    let (first_tx, first_rx) = oneshot::channel();
    cmd_tx.send(LinkCommand::Upload { mission: mission_at(59.0, 3), reply: first_tx }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (second_tx, second_rx) = oneshot::channel();
    cmd_tx.send(LinkCommand::Upload { mission: mission_at(60.0, 2), reply: second_tx }).await.unwrap();

    let err = first_rx.await.unwrap().unwrap_err();
    assert!(err.contains("superseded"), "{err}");
    let done = second_rx.await.unwrap().unwrap();
    assert_eq!(done.len(), 2);
    assert_eq!(store.status(), UploadStatus::Acknowledged);
    assert_eq!(store.current().unwrap().waypoints()[0].lat, 60.0);

    drop(cmd_tx);
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn entering_failsafe_abandons_upload() {
    let (host, fc) = tokio::io::duplex(1024);
    let (_seen, _fc) = fake_fc(fc, |f| match waypoint_no(f) {
        Some(2) => Answer::Silent,
        _ => Answer::Ack(vec![]),
    });

    let store = Arc::new(MissionStore::new());
    let (health, _) = handoff(LinkHealth::default());
    let (telemetry, _) = handoff(FcTelemetry::default());
    let (authority, authority_r) = handoff(AuthorityState::Mission);
    let (cmd_tx, cmd_rx) = mpsc::channel(4);
    let task = tokio::spawn(MissionLink::new(host, LinkTiming::default(), health, telemetry).run(
        store.clone(),
        cmd_rx,
        authority_r,
    ));

    let (reply_tx, reply_rx) = oneshot::channel();
    cmd_tx.send(LinkCommand::Upload { mission: mission_at(59.0, 3), reply: reply_tx }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    authority.publish(AuthorityState::Failsafe);

    let err = reply_rx.await.unwrap().unwrap_err();
    assert!(err.contains("failsafe"), "{err}");
    assert_eq!(store.status(), UploadStatus::Failed);
    assert!(store.current().is_none());

    drop(cmd_tx);
    task.await.unwrap();
}
