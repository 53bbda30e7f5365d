//! Reference edge-density classifier.
//!
//! Stage 1 counts coarse edges in the central region and bails out early on
//! featureless frames. Stage 2 weighs edge energy per zone to find where the
//! obstacle is, and compares the frame centre with the previous frame to
//! estimate how fast it is closing in.

use image::GrayImage;
use lure_proto::{HazardSignal, Severity};
use serde::Deserialize;

use crate::{Frame, HazardClassifier};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    /// Stage 1 edge count below which the frame is considered clear.
    pub edge_threshold: u32,
    /// Stage 2 confidence (0..=150) above which an obstacle is reported.
    pub collision_threshold: u32,
    /// Distance reported at the collision threshold and at full confidence.
    pub far_m: f32,
    pub near_m: f32,
    /// Lateral and vertical angles reported for off-centre obstacles.
    pub side_bearing_deg: f32,
    pub vertical_elevation_deg: f32,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            edge_threshold: 800,
            collision_threshold: 60,
            far_m: 8.0,
            near_m: 0.5,
            side_bearing_deg: 45.0,
            vertical_elevation_deg: 30.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Front,
    Left,
    Right,
    Above,
    Below,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Approach {
    Slow,
    Medium,
    Fast,
    Critical,
}

const MAX_CONFIDENCE: u32 = 150;

#[derive(Debug)]
pub struct EdgeClassifier {
    cfg: EdgeConfig,
    prev: Option<GrayImage>,
}

impl EdgeClassifier {
    pub fn new(cfg: EdgeConfig) -> Self {
        Self { cfg, prev: None }
    }

    fn to_signal(&self, frame: &Frame, dir: Direction, confidence: u32, approach: Approach) -> HazardSignal {
        let severity = match approach {
            Approach::Critical | Approach::Fast => Severity::Critical,
            Approach::Medium | Approach::Slow => Severity::Caution,
        };
        let (bearing, elevation) = match dir {
            Direction::Front => (0.0, 0.0),
            Direction::Left => (-self.cfg.side_bearing_deg, 0.0),
            Direction::Right => (self.cfg.side_bearing_deg, 0.0),
            Direction::Above => (0.0, self.cfg.vertical_elevation_deg),
            Direction::Below => (0.0, -self.cfg.vertical_elevation_deg),
        };
        let span = (MAX_CONFIDENCE - self.cfg.collision_threshold.min(MAX_CONFIDENCE - 1)) as f32;
        let closeness = (confidence.saturating_sub(self.cfg.collision_threshold) as f32 / span).clamp(0.0, 1.0);
        let distance = self.cfg.far_m - (self.cfg.far_m - self.cfg.near_m) * closeness;
        HazardSignal::new(severity, bearing, elevation, distance, frame.seq, frame.captured_at)
    }
}

impl HazardClassifier for EdgeClassifier {
    fn classify(&mut self, frame: &Frame) -> HazardSignal {
        let img = &frame.luma;
        let prev = self.prev.replace(img.clone());

        if edge_count(img) < self.cfg.edge_threshold {
            return HazardSignal::clear(frame.seq, frame.captured_at);
        }
        let Some((dir, confidence)) = direction(img) else {
            return HazardSignal::clear(frame.seq, frame.captured_at);
        };
        if confidence <= self.cfg.collision_threshold {
            return HazardSignal::clear(frame.seq, frame.captured_at);
        }
        let approach = match &prev {
            Some(p) if p.dimensions() == img.dimensions() => approach_rate(img, p),
            _ => Approach::Slow,
        };
        self.to_signal(frame, dir, confidence, approach)
    }
}

/// Coarse edges (5-bit luma step > 3) sampled every other pixel over the
/// central 3/5 of the frame.
pub fn edge_count(img: &GrayImage) -> u32 {
    let (w, h) = img.dimensions();
    let (x0, x1) = (w / 5, 4 * w / 5);
    let (y0, y1) = (h / 5, 4 * h / 5);
    let mut count = 0;
    for y in (y0..y1.saturating_sub(1)).step_by(2) {
        for x in (x0..x1.saturating_sub(1)).step_by(2) {
            let c = (img.get_pixel(x, y)[0] >> 3) as i16;
            let r = (img.get_pixel(x + 1, y)[0] >> 3) as i16;
            let b = (img.get_pixel(x, y + 1)[0] >> 3) as i16;
            if (c - r).abs() > 3 || (c - b).abs() > 3 {
                count += 1;
            }
        }
    }
    count
}

/// Where the edge energy sits, and how much of it there is (0..=150).
pub fn direction(img: &GrayImage) -> Option<(Direction, u32)> {
    let (w, h) = img.dimensions();
    if w < 2 || h < 2 {
        return None;
    }
    let (mut left, mut center, mut right, mut top, mut bottom) = (0u64, 0u64, 0u64, 0u64, 0u64);
    for y in 0..h - 1 {
        for x in 0..w - 1 {
            let p = img.get_pixel(x, y)[0] as i32;
            let strength = ((p - img.get_pixel(x + 1, y)[0] as i32).abs()
                + (p - img.get_pixel(x, y + 1)[0] as i32).abs()) as u64;
            if strength <= 20 {
                continue;
            }
            if x < w / 3 {
                left += strength;
            } else if x > 2 * w / 3 {
                right += strength;
            } else {
                center += strength;
            }
            if y < h / 3 {
                top += strength;
            } else if y > 2 * h / 3 {
                bottom += strength;
            }
        }
    }
    center *= 2;

    let total = left + center + right;
    if total < 1000 {
        return None;
    }
    let max_h = left.max(center).max(right);
    let dir = if max_h == left && left as f64 > center as f64 * 1.3 {
        Direction::Left
    } else if max_h == right && right as f64 > center as f64 * 1.3 {
        Direction::Right
    } else if top as f64 > bottom as f64 * 1.5 {
        Direction::Above
    } else if bottom as f64 > top as f64 * 1.5 {
        Direction::Below
    } else {
        Direction::Front
    };
    Some((dir, (total / 100).min(MAX_CONFIDENCE as u64) as u32))
}

/// Mean absolute change of the central third against the previous frame.
pub fn approach_rate(cur: &GrayImage, prev: &GrayImage) -> Approach {
    let (w, h) = cur.dimensions();
    let mut sum = 0u64;
    let mut n = 0u64;
    for y in h / 3..2 * h / 3 {
        for x in w / 3..2 * w / 3 {
            sum += (cur.get_pixel(x, y)[0] as i32 - prev.get_pixel(x, y)[0] as i32).unsigned_abs() as u64;
            n += 1;
        }
    }
    let avg = if n > 0 { sum as f64 / n as f64 } else { 0.0 };
    if avg > 15.0 {
        Approach::Critical
    } else if avg > 10.0 {
        Approach::Fast
    } else if avg > 5.0 {
        Approach::Medium
    } else {
        Approach::Slow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use std::time::Instant;

    fn flat(v: u8) -> GrayImage {
        GrayImage::from_pixel(crate::FRAME_W, crate::FRAME_H, Luma([v]))
    }

    /// Fine checkerboard inside `x0..x1`, flat grey elsewhere.
    fn textured(x0: u32, x1: u32, shift: u32) -> GrayImage {
        GrayImage::from_fn(crate::FRAME_W, crate::FRAME_H, |x, y| {
            if x >= x0 && x < x1 {
                Luma([if (x + y + shift) % 2 == 0 { 20 } else { 230 }])
            } else {
                Luma([128])
            }
        })
    }

    fn frame(seq: u64, luma: GrayImage) -> Frame {
        Frame { seq, captured_at: Instant::now(), luma }
    }

    #[test]
    fn featureless_frame_is_clear() {
        let mut c = EdgeClassifier::new(EdgeConfig::default());
        let s = c.classify(&frame(1, flat(90)));
        assert_eq!(s.severity, Severity::None);
        assert_eq!(s.frame_seq, 1);
        assert_eq!(edge_count(&flat(90)), 0);
    }

    #[test]
    fn dense_texture_ahead_is_reported_in_front() {
        let img = textured(0, crate::FRAME_W, 0);
        assert!(edge_count(&img) >= 800);
        let (dir, conf) = direction(&img).unwrap();
        assert_eq!(dir, Direction::Front);
        assert_eq!(conf, MAX_CONFIDENCE);

        let mut c = EdgeClassifier::new(EdgeConfig::default());
        let s = c.classify(&frame(1, img));
        assert_eq!(s.severity, Severity::Caution);
        assert_eq!(s.bearing_deg, 0.0);
        assert!((s.distance_m - 0.5).abs() < 1e-3);
    }

    #[test]
    fn texture_on_the_right_gives_right_bearing() {
        let img = textured(2 * crate::FRAME_W / 3 - 10, crate::FRAME_W, 0);
        let (dir, _) = direction(&img).unwrap();
        assert_eq!(dir, Direction::Right);
    }

    #[test]
    fn rapid_change_escalates_to_critical() {
        let mut c = EdgeClassifier::new(EdgeConfig::default());
        c.classify(&frame(1, textured(0, crate::FRAME_W, 0)));
        // inverting the checkerboard changes every centre pixel a lot
        let s = c.classify(&frame(2, textured(0, crate::FRAME_W, 1)));
        assert_eq!(s.severity, Severity::Critical);
        assert_eq!(approach_rate(&flat(10), &flat(17)), Approach::Medium);
        assert_eq!(approach_rate(&flat(10), &flat(10)), Approach::Slow);
    }
}
