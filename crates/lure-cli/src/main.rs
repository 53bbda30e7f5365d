mod web;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{info, warn};

use lure_fc::autodetect::{autodetect_fc, default_candidate_bauds, default_candidate_devs, AutodetectResult};
use lure_fc::{doctor as fc_doctor, ArbiterConfig, ControlIo, ControlLoop, ControlStatus, FcConfig, MissionLink, SbusConfig};
use lure_mission::parse::parse_mission;
use lure_mission::{doctor as mission_doctor, geo, store, MissionConfig, MissionStore};
use lure_proto::{handoff, AuthorityState, FcTelemetry, LinkHealth, Mission};
use lure_vision::{camera, pipeline, CameraConfig, EdgeClassifier, FrameSource, HazardClassifier, SeverityFilter, VisionConfig, VisionStats};

use web::{WebConfig, WebState};

#[derive(Debug, Parser)]
#[command(name = "lure", version, about = "lure - onboard flight-authority coordinator for a fishing drone")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Doctor,
    Run,
    Fc { #[command(subcommand)] cmd: FcCmd },
    Mission { #[command(subcommand)] cmd: MissionCmd },
    Vision { #[command(subcommand)] cmd: VisionCmd },
}

#[derive(Debug, Subcommand)]
enum FcCmd {
    /// Probe serial ports/bauds for an MSP reply.
    Autodetect,
    /// Poll the FC once and print its telemetry.
    Status,
}

#[derive(Debug, Subcommand)]
enum MissionCmd {
    /// Parse a mission file (INAV XML, QGC WPL or plain lat/lon/alt lines).
    Parse { file: String },
    /// Parse, validate and upload a mission file directly.
    Upload { file: String },
}

#[derive(Debug, Subcommand)]
enum VisionCmd {
    /// Run the edge classifier over one still image.
    Classify { image: String },
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct Config {
    fc: FcConfig,
    sbus: SbusConfig,
    arbiter: ArbiterConfig,
    vision: VisionConfig,
    camera: CameraConfig,
    mission: MissionConfig,
    web: WebConfig,
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).context("read config")?;
    toml::from_str(&s).context("parse config toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg).await?,
        Command::Run => run(cfg).await?,
        Command::Fc { cmd } => fc_cmd(&cfg, cmd).await?,
        Command::Mission { cmd } => mission_cmd(&cfg, cmd).await?,
        Command::Vision { cmd } => vision_cmd(&cfg, cmd).await?,
    }
    Ok(())
}

async fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    preflight(cfg)?;

    if cfg.vision.enable {
        anyhow::ensure!(cfg.vision.fps > 0.0 && cfg.vision.fps <= 240.0, "vision.fps should be 1..240");
        anyhow::ensure!(cfg.vision.width >= 16 && cfg.vision.height >= 16, "vision frame too small");
        if cfg.camera.mode == "replay" {
            FrameSource::from_config(&cfg.camera)?;
        }
    } else {
        warn!("doctor: vision disabled, no obstacle avoidance");
    }
    if !cfg.sbus.enable {
        warn!("doctor: sbus disabled, channel frames are discarded");
    }
    cfg.web.bind.parse::<std::net::SocketAddr>().context("web.bind")?;

    info!("doctor: OK");
    Ok(())
}

/// Checks every `run` relies on: limits, link timing, channel map.
fn preflight(cfg: &Config) -> Result<()> {
    mission_doctor::check_limits(&cfg.mission)?;
    fc_doctor::check_link(&cfg.fc)?;
    fc_doctor::check_control(&cfg.arbiter, &cfg.sbus, &cfg.fc)?;
    Ok(())
}

async fn fc_cmd(cfg: &Config, cmd: FcCmd) -> Result<()> {
    match cmd {
        FcCmd::Autodetect => {
            anyhow::ensure!(cfg.fc.enable, "fc.enable=false");
            let res = run_fc_autodetect(&cfg.fc).await?;
            if let Some((dev, baud)) = res.chosen {
                println!("CHOSEN: {} @ {}", dev, baud);
            } else {
                println!("CHOSEN: none");
            }
            for p in res.probes {
                println!("probe dev={} baud={} msp={} {}ms note={}", p.dev, p.baud, p.msp_seen, p.elapsed_ms, p.note);
            }
            Ok(())
        }
        FcCmd::Status => {
            let mut link = open_link(&cfg.fc).await?;
            let t = link.poll_telemetry().await.context("poll FC telemetry")?;
            println!("{}", serde_json::to_string_pretty(&t)?);
            Ok(())
        }
    }
}

async fn mission_cmd(cfg: &Config, cmd: MissionCmd) -> Result<()> {
    match cmd {
        MissionCmd::Parse { file } => {
            let parsed = read_mission(&file, &cfg.mission).await?;
            println!("format={:?} waypoints={} distance_m={:.0}", parsed.format, parsed.waypoints.len(), geo::path_length_m(&parsed.waypoints));
            for (i, wp) in parsed.waypoints.iter().enumerate() {
                println!("{:>3} {:.7} {:.7} {:>6.1}m {:?}", i + 1, wp.lat, wp.lon, wp.alt_m, wp.action);
            }
            Ok(())
        }
        MissionCmd::Upload { file } => {
            let parsed = read_mission(&file, &cfg.mission).await?;
            let mission = Mission::new(parsed.waypoints);
            store::validate(&mission, &cfg.mission)?;

            let mut link = open_link(&cfg.fc).await?;
            let store = MissionStore::new();
            store.begin_upload();
            let report = match link.upload(&mission, &store).await {
                Ok(r) => r,
                Err(e) => {
                    store.fail(&e.to_string());
                    return Err(e).context("upload mission");
                }
            };
            let m = store.replace(mission, report)?;
            println!("uploaded {} waypoints", m.len());
            Ok(())
        }
    }
}

async fn read_mission(file: &str, cfg: &MissionConfig) -> Result<lure_mission::parse::ParsedMission> {
    let text = tokio::fs::read_to_string(file).await.with_context(|| format!("read {}", file))?;
    parse_mission(&text, cfg.default_alt_m).with_context(|| format!("parse {}", file))
}

async fn vision_cmd(cfg: &Config, cmd: VisionCmd) -> Result<()> {
    match cmd {
        VisionCmd::Classify { image } => {
            let bytes = tokio::fs::read(&image).await.with_context(|| format!("read {}", image))?;
            let frame = camera::decode(1, &bytes, cfg.vision.width, cfg.vision.height)?;
            let mut clf = EdgeClassifier::new(cfg.vision.edge.clone());
            let s = clf.classify(&frame);
            println!(
                "severity={:?} bearing_deg={:.1} elevation_deg={:.1} distance_m={:.1} edges={}",
                s.severity,
                s.bearing_deg,
                s.elevation_deg,
                s.distance_m,
                lure_vision::edge::edge_count(&frame.luma)
            );
            Ok(())
        }
    }
}

async fn run(cfg: Config) -> Result<()> {
    info!("run: starting");
    preflight(&cfg).context("config failed preflight, see `lure doctor`")?;

    let store = Arc::new(MissionStore::new());
    let (hazard_w, hazard_r) = handoff(None);
    let (health_w, health_r) = handoff(LinkHealth::default());
    let (telemetry_w, telemetry_r) = handoff(FcTelemetry::default());
    let (authority_w, authority_r) = handoff(AuthorityState::Failsafe);
    let (status_w, status_r) = handoff(ControlStatus::default());
    let (ops_tx, ops_rx) = mpsc::channel(16);

    let mut arbiter = cfg.arbiter.clone();
    arbiter.vision_enabled = cfg.vision.enable;
    arbiter.vision_fps = cfg.vision.fps;

    // Mission Link
    let mut link_tx = None;
    if cfg.fc.enable {
        let (dev, baud) = resolve_fc_port(&cfg.fc).await?;
        let port = open_msp_port(&dev, baud)?;
        info!("run: mission link on {} @ {}", dev, baud);
        let (tx, rx) = mpsc::channel(4);
        let link = MissionLink::new(port, cfg.fc.timing(), health_w, telemetry_w);
        tokio::spawn(link.run(store.clone(), rx, authority_r));
        link_tx = Some(tx);
    } else {
        warn!("run: fc disabled, authority stays in FAILSAFE");
    }

    // Vision
    let mut vision_stats = None;
    if cfg.vision.enable {
        let source = FrameSource::from_config(&cfg.camera)?;
        let slot = Arc::new(pipeline::FrameSlot::new());
        let stats = Arc::new(VisionStats::default());
        tokio::spawn(pipeline::capture_loop(
            source,
            slot.clone(),
            cfg.vision.fps,
            cfg.vision.width,
            cfg.vision.height,
            stats.clone(),
        ));

        let vcfg = cfg.vision.clone();
        let worker_stats = stats.clone();
        tokio::task::spawn_blocking(move || {
            let mut clf = EdgeClassifier::new(vcfg.edge.clone());
            let mut filter = SeverityFilter::new(&vcfg.debounce);
            pipeline::classify_loop(&slot, &mut clf, &mut filter, &hazard_w, vcfg.frame_budget(), &worker_stats);
        });
        vision_stats = Some(stats);
    }

    // Control + Override Link
    let control = ControlLoop::new(
        arbiter.clone(),
        cfg.sbus.clone(),
        ControlIo { hazard: hazard_r, health: health_r.clone(), store: store.clone(), ops: ops_rx, authority: authority_w, status: status_w },
    );
    let period = cfg.sbus.period();
    if cfg.sbus.enable {
        let port = open_sbus_port(&cfg.sbus.serial_dev)?;
        info!("run: sbus on {} every {:?}", cfg.sbus.serial_dev, period);
        tokio::spawn(control.run(port, period));
    } else {
        tokio::spawn(control.run(tokio::io::sink(), period));
    }

    // Web
    if cfg.web.enable {
        let state = WebState {
            store: store.clone(),
            mission_cfg: cfg.mission.clone(),
            link: link_tx,
            ops: ops_tx,
            control: status_r,
            telemetry: telemetry_r,
            health: health_r,
            link_timeout: arbiter.link_timeout(),
            vision: vision_stats,
            upload_timeout: Duration::from_secs(cfg.web.upload_timeout_s),
        };
        let wcfg = cfg.web.clone();
        tokio::spawn(async move {
            if let Err(e) = web::serve(wcfg, state).await {
                warn!("web server stopped: {:#}", e);
            }
        });
    }

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("run: shutting down");
    Ok(())
}

async fn run_fc_autodetect(fc: &FcConfig) -> Result<AutodetectResult> {
    let devs = fc.candidate_devs.clone().unwrap_or_else(default_candidate_devs);
    let bauds = fc.candidate_bauds.clone().unwrap_or_else(default_candidate_bauds);
    autodetect_fc(devs, bauds, Duration::from_millis(fc.reply_timeout_ms.max(250))).await
}

async fn resolve_fc_port(fc: &FcConfig) -> Result<(String, u32)> {
    if fc.autodetect {
        let res = run_fc_autodetect(fc).await?;
        if let Some((dev, baud)) = res.chosen {
            return Ok((dev, baud));
        }
        anyhow::bail!("fc autodetect failed: no MSP reply found");
    } else {
        let dev = fc.serial_dev.clone().context("fc.serial_dev missing (autodetect=false)")?;
        let baud = fc.baud.context("fc.baud missing (autodetect=false)")?;
        Ok((dev, baud))
    }
}

fn open_msp_port(dev: &str, baud: u32) -> Result<SerialStream> {
    tokio_serial::new(dev, baud)
        .open_native_async()
        .with_context(|| format!("open FC serial {} @ {}", dev, baud))
}

/// SBUS: 100000 baud, 8 data bits, even parity, 2 stop bits.
fn open_sbus_port(dev: &str) -> Result<SerialStream> {
    tokio_serial::new(dev, 100_000)
        .data_bits(DataBits::Eight)
        .parity(Parity::Even)
        .stop_bits(StopBits::Two)
        .open_native_async()
        .with_context(|| format!("open SBUS serial {}", dev))
}

/// One-shot link for CLI commands; nobody reads its cells.
async fn open_link(fc: &FcConfig) -> Result<MissionLink<SerialStream>> {
    anyhow::ensure!(fc.enable, "fc.enable=false");
    let (dev, baud) = resolve_fc_port(fc).await?;
    let port = open_msp_port(&dev, baud)?;
    let (health_w, _) = handoff(LinkHealth::default());
    let (telemetry_w, _) = handoff(FcTelemetry::default());
    Ok(MissionLink::new(port, fc.timing(), health_w, telemetry_w))
}
