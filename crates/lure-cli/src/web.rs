//! Ground-station HTTP surface: mission upload, status and operator
//! failsafe control. Minimal HTTP/1.1, one request per connection.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use lure_fc::{ControlStatus, LinkCommand, OperatorCommand};
use lure_mission::parse::parse_mission;
use lure_mission::{geo, store, MissionConfig, MissionStore};
use lure_proto::{FcTelemetry, HandoffReader, LinkHealth, Mission, Waypoint, WaypointAction};
use lure_vision::VisionStats;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const MAX_HEAD: usize = 16 * 1024;
const MAX_BODY: usize = 256 * 1024;
/// A client gets this long to deliver its whole request.
const READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub enable: bool,
    pub bind: String,
    /// How long an upload request waits for the FC before giving up.
    pub upload_timeout_s: u64,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { enable: true, bind: "0.0.0.0:8080".into(), upload_timeout_s: 30 }
    }
}

/// Handles shared with every request.
#[derive(Clone)]
pub struct WebState {
    pub store: Arc<MissionStore>,
    pub mission_cfg: MissionConfig,
    pub link: Option<mpsc::Sender<LinkCommand>>,
    pub ops: mpsc::Sender<OperatorCommand>,
    pub control: HandoffReader<ControlStatus>,
    pub telemetry: HandoffReader<FcTelemetry>,
    pub health: HandoffReader<LinkHealth>,
    pub link_timeout: Duration,
    pub vision: Option<Arc<VisionStats>>,
    pub upload_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl Response {
    fn json(status: u16, v: Value) -> Self {
        Self { status, content_type: "application/json", body: v.to_string() }
    }

    fn html(body: &str) -> Self {
        Self { status: 200, content_type: "text/html; charset=utf-8", body: body.to_string() }
    }

    fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            400 => "Bad Request",
            404 => "Not Found",
            408 => "Request Timeout",
            409 => "Conflict",
            413 => "Payload Too Large",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            _ => "Error",
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
}

pub async fn serve(cfg: WebConfig, state: WebState) -> Result<()> {
    let listener = TcpListener::bind(&cfg.bind).await.with_context(|| format!("bind {}", cfg.bind))?;
    info!("web: listening on {}", cfg.bind);
    loop {
        let (sock, peer) = match listener.accept().await {
            Ok(c) => c,
            Err(e) => {
                warn!("web: accept failed: {}", e);
                continue;
            }
        };
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle(sock, &state).await {
                debug!("web: {} {:#}", peer, e);
            }
        });
    }
}

async fn handle(mut sock: TcpStream, state: &WebState) -> Result<()> {
    let resp = match read_request_within(&mut sock, READ_TIMEOUT).await {
        Ok(Some(req)) => {
            debug!("web: {} {}", req.method, req.path);
            route(state, &req).await
        }
        Ok(None) => Response::json(408, json!({ "success": false, "error": "request timed out" })),
        Err(e) => Response::json(400, json!({ "success": false, "error": format!("{:#}", e) })),
    };
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        resp.status,
        resp.reason(),
        resp.content_type,
        resp.body.len()
    );
    sock.write_all(head.as_bytes()).await?;
    sock.write_all(resp.body.as_bytes()).await?;
    sock.shutdown().await?;
    Ok(())
}

/// `read_request` with a deadline. `None` when the client was too slow.
pub async fn read_request_within<R>(r: &mut R, limit: Duration) -> Result<Option<Request>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match tokio::time::timeout(limit, read_request(r)).await {
        Ok(req) => req.map(Some),
        Err(_) => Ok(None),
    }
}

pub async fn read_request<R>(r: &mut R) -> Result<Request>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        if let Some(i) = find(&buf, b"\r\n\r\n") {
            break i;
        }
        anyhow::ensure!(buf.len() < MAX_HEAD, "request head too large");
        let n = r.read(&mut chunk).await?;
        anyhow::ensure!(n > 0, "connection closed mid-request");
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = std::str::from_utf8(&buf[..head_end]).context("request head not utf-8")?;
    let mut lines = head.split("\r\n");
    let mut first = lines.next().unwrap_or_default().split_whitespace();
    let method = first.next().context("missing method")?.to_string();
    let path = first.next().context("missing path")?.to_string();

    let mut content_length = 0usize;
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            if k.trim().eq_ignore_ascii_case("content-length") {
                content_length = v.trim().parse().context("bad content-length")?;
            }
        }
    }
    anyhow::ensure!(content_length <= MAX_BODY, "body too large");

    let mut body = buf[head_end + 4..].to_vec();
    while body.len() < content_length {
        let n = r.read(&mut chunk).await?;
        anyhow::ensure!(n > 0, "connection closed mid-body");
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);
    Ok(Request { method, path, body })
}

fn find(hay: &[u8], needle: &[u8]) -> Option<usize> {
    hay.windows(needle.len()).position(|w| w == needle)
}

pub async fn route(state: &WebState, req: &Request) -> Response {
    let path = req.path.split('?').next().unwrap_or("");
    match (req.method.as_str(), path) {
        ("GET", "/") => Response::html(INDEX),
        ("GET", "/api/status") => Response::json(200, status(state)),
        ("POST", "/api/upload_mission") => upload_mission(state, &req.body).await,
        ("POST", "/api/start_mission") => start_mission(state).await,
        ("POST", "/api/failsafe") => {
            operator(state, OperatorCommand::AssertFailsafe).await;
            Response::json(200, json!({ "success": true, "message": "failsafe asserted" }))
        }
        ("POST", "/api/parse_mission") => parse(state, &req.body),
        _ => Response::json(404, json!({ "success": false, "error": "not found" })),
    }
}

fn status(state: &WebState) -> Value {
    let snap = state.store.snapshot();
    let control = state.control.latest();
    let health = state.health.latest();
    let now = tokio::time::Instant::now().into_std();
    let link_age_ms = health.age(now).map(|d| d.as_millis() as u64);

    json!({
        "ts_unix_ms": (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64,
        "mission": {
            "status": snap.status,
            "count": snap.current.as_ref().map_or(0, |m| m.len()),
            "distance_m": snap.current.as_ref().map_or(0.0, |m| geo::path_length_m(m.waypoints()).round()),
            "last_error": snap.last_error,
        },
        "authority": control.authority,
        "failsafe_reason": control.failsafe_reason,
        "control": control,
        "link": {
            "enabled": state.link.is_some(),
            "healthy": health.is_healthy(now, state.link_timeout),
            "age_ms": link_age_ms,
            "consecutive_failures": health.consecutive_failures,
        },
        "telemetry": state.telemetry.latest(),
        "vision": state.vision.as_ref().map(|v| v.snapshot()),
    })
}

#[derive(Debug, Deserialize)]
struct UploadBody {
    drops: Vec<DropIn>,
}

#[derive(Debug, Deserialize)]
struct DropIn {
    lat: f64,
    lon: f64,
    #[serde(alias = "alt_m")]
    alt: Option<f32>,
    action: Option<WaypointAction>,
}

async fn upload_mission(state: &WebState, body: &[u8]) -> Response {
    let parsed: UploadBody = match serde_json::from_slice(body) {
        Ok(b) => b,
        Err(e) => return Response::json(400, json!({ "success": false, "error": format!("bad request body: {}", e) })),
    };
    let mission = Mission::new(
        parsed
            .drops
            .into_iter()
            .map(|d| Waypoint::new(d.lat, d.lon, d.alt.unwrap_or(state.mission_cfg.default_alt_m), d.action.unwrap_or_default()))
            .collect(),
    );
    if let Err(e) = store::validate(&mission, &state.mission_cfg) {
        return Response::json(400, json!({ "success": false, "error": e.to_string() }));
    }
    let Some(link) = &state.link else {
        return Response::json(503, json!({ "success": false, "error": "flight controller link disabled" }));
    };

    let count = mission.len();
    let (reply, rx) = oneshot::channel();
    if link.send(LinkCommand::Upload { mission, reply }).await.is_err() {
        return Response::json(503, json!({ "success": false, "error": "mission link not running" }));
    }
    info!("web: upload of {} waypoints requested", count);

    match tokio::time::timeout(state.upload_timeout, rx).await {
        Ok(Ok(Ok(m))) => Response::json(200, json!({ "success": true, "status": "acknowledged", "count": m.len() })),
        Ok(Ok(Err(e))) => Response::json(502, json!({ "success": false, "status": "failed", "error": e })),
        Ok(Err(_)) => Response::json(503, json!({ "success": false, "error": "mission link dropped the request" })),
        Err(_) => Response::json(504, json!({ "success": false, "status": "pending", "error": "timed out waiting for the flight controller" })),
    }
}

async fn start_mission(state: &WebState) -> Response {
    if state.store.current().is_none() {
        return Response::json(409, json!({ "success": false, "error": "no acknowledged mission" }));
    }
    operator(state, OperatorCommand::ClearFailsafe).await;
    operator(state, OperatorCommand::Rearm).await;
    Response::json(200, json!({ "success": true, "message": "re-arm requested" }))
}

async fn operator(state: &WebState, cmd: OperatorCommand) {
    if state.ops.send(cmd).await.is_err() {
        warn!("web: control task gone, dropped {:?}", cmd);
    }
}

fn parse(state: &WebState, body: &[u8]) -> Response {
    let text = String::from_utf8_lossy(body);
    match parse_mission(&text, state.mission_cfg.default_alt_m) {
        Ok(p) => Response::json(
            200,
            json!({
                "success": true,
                "format": p.format,
                "count": p.waypoints.len(),
                "distance_m": geo::path_length_m(&p.waypoints).round(),
                "waypoints": p.waypoints,
            }),
        ),
        Err(e) => Response::json(400, json!({ "success": false, "error": e.to_string() })),
    }
}

const INDEX: &str = r#"<!DOCTYPE html>
<html>
<head><title>lure</title></head>
<body>
<h1>lure flight-authority coordinator</h1>
<ul>
<li>GET <a href="/api/status">/api/status</a></li>
<li>POST /api/upload_mission {"drops":[{"lat":..,"lon":..,"alt":..}]}</li>
<li>POST /api/parse_mission (mission file body)</li>
<li>POST /api/start_mission</li>
<li>POST /api/failsafe</li>
</ul>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use lure_mission::UploadReport;
    use lure_proto::{handoff, UploadStatus};

    struct Harness {
        state: WebState,
        ops: mpsc::Receiver<OperatorCommand>,
        link: Option<mpsc::Receiver<LinkCommand>>,
    }

    fn harness(with_link: bool) -> Harness {
        let (ops_tx, ops) = mpsc::channel(8);
        let (link_tx, link_rx) = mpsc::channel(2);
        let (_, control) = handoff(ControlStatus::default());
        let (_, telemetry) = handoff(FcTelemetry::default());
        let (_, health) = handoff(LinkHealth::default());
        let state = WebState {
            store: Arc::new(MissionStore::new()),
            mission_cfg: MissionConfig::default(),
            link: with_link.then_some(link_tx),
            ops: ops_tx,
            control,
            telemetry,
            health,
            link_timeout: Duration::from_millis(1500),
            vision: None,
            upload_timeout: Duration::from_secs(5),
        };
        Harness { state, ops, link: with_link.then_some(link_rx) }
    }

    fn post(path: &str, body: &str) -> Request {
        Request { method: "POST".into(), path: path.into(), body: body.as_bytes().to_vec() }
    }

    fn body(r: &Response) -> Value {
        serde_json::from_str(&r.body).unwrap()
    }

    #[tokio::test]
    async fn parses_request_with_body() {
        let raw = b"POST /api/failsafe HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\n\r\nabcdEXTRA";
        let mut r = &raw[..];
        let req = read_request(&mut r).await.unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/api/failsafe");
        assert_eq!(req.body, b"abcd");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_client_is_cut_off() {
        let (mut server, mut client) = tokio::io::duplex(1024);
        client.write_all(b"GET /api/status HTTP/1.1\r\n").await.unwrap();
        // head never finished
        let got = read_request_within(&mut server, READ_TIMEOUT).await.unwrap();
        assert!(got.is_none());

        let (mut server, mut client) = tokio::io::duplex(1024);
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let got = read_request_within(&mut server, READ_TIMEOUT).await.unwrap();
        assert_eq!(got.map(|r| r.path), Some("/".to_string()));
    }

    #[tokio::test]
    async fn status_reports_boot_failsafe() {
        let h = harness(false);
        let r = route(&h.state, &Request { method: "GET".into(), path: "/api/status".into(), body: vec![] }).await;
        assert_eq!(r.status, 200);
        let v = body(&r);
        assert_eq!(v["authority"], "FAILSAFE");
        assert_eq!(v["failsafe_reason"], "boot");
        assert_eq!(v["mission"]["status"], "idle");
        assert_eq!(v["link"]["healthy"], false);
    }

    #[tokio::test]
    async fn upload_is_forwarded_and_acknowledged() {
        let mut h = harness(true);
        let mut link = h.link.take().unwrap();
        let store = h.state.store.clone();
        let fc = tokio::spawn(async move {
            let Some(LinkCommand::Upload { mission, reply }) = link.recv().await else { panic!("no upload") };
            assert_eq!(mission.len(), 2);
            assert_eq!(mission.waypoints()[1].alt_m, 50.0);
            assert_eq!(mission.waypoints()[0].action, WaypointAction::DropPayload);
            store.begin_upload();
            let m = store.replace(mission, UploadReport { acked_waypoints: 2, finalized: true }).unwrap();
            reply.send(Ok(m)).unwrap();
        });

        let r = route(
            &h.state,
            &post("/api/upload_mission", r#"{"drops":[{"lat":59.9,"lon":10.7,"alt":30,"action":"drop"},{"lat":59.91,"lon":10.71}]}"#),
        )
        .await;
        fc.await.unwrap();
        assert_eq!(r.status, 200, "{}", r.body);
        let v = body(&r);
        assert_eq!(v["success"], true);
        assert_eq!(v["count"], 2);
        assert_eq!(h.state.store.status(), UploadStatus::Acknowledged);
    }

    #[tokio::test]
    async fn upload_failure_is_reported() {
        let mut h = harness(true);
        let mut link = h.link.take().unwrap();
        tokio::spawn(async move {
            if let Some(LinkCommand::Upload { reply, .. }) = link.recv().await {
                let _ = reply.send(Err("mission link timeout waiting for reply to cmd 209".into()));
            }
        });
        let r = route(&h.state, &post("/api/upload_mission", r#"{"drops":[{"lat":1,"lon":2}]}"#)).await;
        assert_eq!(r.status, 502);
        assert_eq!(body(&r)["status"], "failed");
    }

    #[tokio::test]
    async fn invalid_missions_never_reach_the_link() {
        let mut h = harness(true);
        let r = route(&h.state, &post("/api/upload_mission", r#"{"drops":[]}"#)).await;
        assert_eq!(r.status, 400);
        let r = route(&h.state, &post("/api/upload_mission", r#"{"drops":[{"lat":95,"lon":2}]}"#)).await;
        assert_eq!(r.status, 400);
        let r = route(&h.state, &post("/api/upload_mission", "not json")).await;
        assert_eq!(r.status, 400);
        assert!(h.link.as_mut().unwrap().try_recv().is_err());

        let h = harness(false);
        let r = route(&h.state, &post("/api/upload_mission", r#"{"drops":[{"lat":1,"lon":2}]}"#)).await;
        assert_eq!(r.status, 503);
    }

    #[tokio::test]
    async fn start_needs_a_mission_then_rearms() {
        let mut h = harness(false);
        let r = route(&h.state, &post("/api/start_mission", "")).await;
        assert_eq!(r.status, 409);
        assert!(h.ops.try_recv().is_err());

        h.state
            .store
            .replace(Mission::new(vec![Waypoint::new(1.0, 2.0, 30.0, WaypointAction::Navigate)]), UploadReport {
                acked_waypoints: 1,
                finalized: true,
            })
            .unwrap();
        let r = route(&h.state, &post("/api/start_mission", "")).await;
        assert_eq!(r.status, 200);
        assert_eq!(h.ops.try_recv().unwrap(), OperatorCommand::ClearFailsafe);
        assert_eq!(h.ops.try_recv().unwrap(), OperatorCommand::Rearm);

        route(&h.state, &post("/api/failsafe", "")).await;
        assert_eq!(h.ops.try_recv().unwrap(), OperatorCommand::AssertFailsafe);
    }

    #[tokio::test]
    async fn parse_mission_endpoint() {
        let h = harness(false);
        let text = "QGC WPL 110\n0\t1\t0\t16\t0\t0\t0\t0\t59.0\t10.0\t0\t1\n1\t0\t3\t16\t0\t0\t0\t0\t59.001\t10.0\t40\t1\n";
        let r = route(&h.state, &post("/api/parse_mission", text)).await;
        assert_eq!(r.status, 200, "{}", r.body);
        let v = body(&r);
        assert_eq!(v["format"], "qgc_wpl");
        assert_eq!(v["count"], 1);

        let r = route(&h.state, &post("/api/parse_mission", "")).await;
        assert_eq!(r.status, 400);
        let r = route(&h.state, &Request { method: "GET".into(), path: "/nope".into(), body: vec![] }).await;
        assert_eq!(r.status, 404);
    }
}
