pub mod camera;
pub mod debounce;
pub mod edge;
pub mod pipeline;

use std::time::Instant;

use image::{imageops::FilterType, DynamicImage, GrayImage};
use lure_proto::HazardSignal;
use serde::Deserialize;

pub use camera::{CameraConfig, FrameSource};
pub use debounce::{DebounceConfig, SeverityFilter};
pub use edge::{EdgeClassifier, EdgeConfig};
pub use pipeline::{FrameSlot, VisionStats};

pub const FRAME_W: u32 = 160;
pub const FRAME_H: u32 = 120;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub enable: bool,
    /// Target classifier cadence; also the frame budget.
    pub fps: f32,
    pub width: u32,
    pub height: u32,
    pub edge: EdgeConfig,
    pub debounce: DebounceConfig,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            enable: true,
            fps: 60.0,
            width: FRAME_W,
            height: FRAME_H,
            edge: EdgeConfig::default(),
            debounce: DebounceConfig::default(),
        }
    }
}

impl VisionConfig {
    pub fn frame_budget(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f32(1.0 / self.fps.max(1.0))
    }
}

/// One captured image, reduced to luma at the classifier resolution.
#[derive(Debug, Clone)]
pub struct Frame {
    pub seq: u64,
    pub captured_at: Instant,
    pub luma: GrayImage,
}

impl Frame {
    pub fn from_image(seq: u64, captured_at: Instant, img: &DynamicImage, width: u32, height: u32) -> Self {
        let luma = if img.width() == width && img.height() == height {
            img.to_luma8()
        } else {
            img.resize_exact(width, height, FilterType::Triangle).to_luma8()
        };
        Self { seq, captured_at, luma }
    }

    pub fn from_encoded(seq: u64, captured_at: Instant, bytes: &[u8], width: u32, height: u32) -> anyhow::Result<Self> {
        let img = image::load_from_memory(bytes)?;
        Ok(Self::from_image(seq, captured_at, &img, width, height))
    }
}

/// Per-frame obstacle assessment. Implementations may keep state between
/// frames (e.g. the previous frame for motion estimates).
pub trait HazardClassifier: Send {
    fn classify(&mut self, frame: &Frame) -> HazardSignal;
}
