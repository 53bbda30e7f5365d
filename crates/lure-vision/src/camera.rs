use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::{debug, info};

use crate::Frame;

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub mode: String,   // "libcamera-jpeg" | "v4l2-mjpeg" | "replay"
    pub device: String, // /dev/video0 (v4l2)
    pub width: u32,
    pub height: u32,
    /// Directory of still images played back in name order (replay mode).
    pub replay_dir: Option<String>,
    pub replay_loop: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            mode: "libcamera-jpeg".into(),
            device: "/dev/video0".into(),
            width: crate::FRAME_W,
            height: crate::FRAME_H,
            replay_dir: None,
            replay_loop: true,
        }
    }
}

/// One JPEG still from the camera:
/// - libcamera-jpeg: `libcamera-still -n -t 1 --width ... --height ... -o -`
/// - v4l2-mjpeg: a single MJPEG frame grabbed by `ffmpeg`
pub async fn capture_jpeg(cfg: &CameraConfig) -> Result<Vec<u8>> {
    match cfg.mode.as_str() {
        "libcamera-jpeg" => capture_libcamera(cfg).await,
        "v4l2-mjpeg" => capture_v4l2_ffmpeg(cfg).await,
        other => anyhow::bail!("camera.mode {} does not capture", other),
    }
}

async fn capture_libcamera(cfg: &CameraConfig) -> Result<Vec<u8>> {
    let mut cmd = Command::new("libcamera-still");
    cmd.args([
        "-n",
        "-t", "1",
        "--width", &cfg.width.to_string(),
        "--height", &cfg.height.to_string(),
        "-o", "-",
    ]);

    debug!("capture: libcamera-still");
    let out = cmd.output().await.context("run libcamera-still")?;
    anyhow::ensure!(out.status.success(), "libcamera-still failed");
    Ok(out.stdout)
}

async fn capture_v4l2_ffmpeg(cfg: &CameraConfig) -> Result<Vec<u8>> {
    let mut cmd = Command::new("ffmpeg");
    cmd.args([
        "-hide_banner", "-loglevel", "error",
        "-f", "video4linux2",
        "-input_format", "mjpeg",
        "-video_size", &format!("{}x{}", cfg.width, cfg.height),
        "-i", &cfg.device,
        "-vframes", "1",
        "-f", "image2pipe",
        "-vcodec", "mjpeg",
        "-",
    ]);

    debug!("capture: ffmpeg v4l2");
    let out = cmd.output().await.context("run ffmpeg capture")?;
    anyhow::ensure!(out.status.success(), "ffmpeg capture failed");
    Ok(out.stdout)
}

/// Where frames come from.
#[derive(Debug)]
pub enum FrameSource {
    Camera(CameraConfig),
    Replay { files: Vec<PathBuf>, next: usize, looped: bool },
}

impl FrameSource {
    pub fn from_config(cfg: &CameraConfig) -> Result<Self> {
        if cfg.mode != "replay" {
            return Ok(FrameSource::Camera(cfg.clone()));
        }
        let dir = cfg.replay_dir.as_deref().context("camera.mode = replay needs camera.replay_dir")?;
        let files = list_images(Path::new(dir))?;
        anyhow::ensure!(!files.is_empty(), "no images in {}", dir);
        info!("replaying {} images from {}", files.len(), dir);
        Ok(FrameSource::Replay { files, next: 0, looped: cfg.replay_loop })
    }

    /// Next encoded image, or `None` once a non-looping replay is done.
    pub async fn next_encoded(&mut self) -> Result<Option<Vec<u8>>> {
        match self {
            FrameSource::Camera(cfg) => capture_jpeg(cfg).await.map(Some),
            FrameSource::Replay { files, next, looped } => {
                if *next >= files.len() {
                    if !*looped {
                        return Ok(None);
                    }
                    *next = 0;
                }
                let path = &files[*next];
                *next += 1;
                let bytes = tokio::fs::read(path).await.with_context(|| format!("read {}", path.display()))?;
                Ok(Some(bytes))
            }
        }
    }
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("read replay dir {}", dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).as_deref(),
                Some("jpg" | "jpeg" | "png")
            )
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Decodes a still into a classifier frame stamped now.
pub fn decode(seq: u64, bytes: &[u8], width: u32, height: u32) -> Result<Frame> {
    decode_at(seq, tokio::time::Instant::now().into_std(), bytes, width, height)
}

pub fn decode_at(seq: u64, captured_at: Instant, bytes: &[u8], width: u32, height: u32) -> Result<Frame> {
    Frame::from_encoded(seq, captured_at, bytes, width, height).with_context(|| format!("decode frame {}", seq))
}
