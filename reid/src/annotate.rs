//! Per-frame summaries and box overlays.

use std::collections::BTreeSet;

use image::{Rgb, RgbImage, imageops};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use serde::Serialize;

use crate::types::{BBox, ReidNum, Status, TrackId};

pub const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
pub const YELLOW: Rgb<u8> = Rgb([255, 255, 0]);
pub const RED: Rgb<u8> = Rgb([255, 0, 0]);

/// Box outline width in pixels.
const THICKNESS: u32 = 2;

/// What is known about one detection in one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceRecord {
    /// `None` for detections identified without tracking.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_id: Option<TrackId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reid: Option<ReidNum>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub bbox: BBox,
    pub confidence: f32,
    pub status: Status,
}

impl FaceRecord {
    /// Display label, e.g. `Alice (ID:3)`.
    pub fn label(&self) -> String {
        match (&self.name, self.reid) {
            (Some(name), Some(reid)) => format!("{name} (ID:{reid})"),
            _ => self.status.to_string(),
        }
    }
}

/// Aggregate view of one processed frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FrameSummary {
    pub head_count: usize,

    /// Distinct names of bound detections, sorted.
    pub names: Vec<String>,

    pub faces: Vec<FaceRecord>,
}

impl FrameSummary {
    pub fn from_faces(faces: Vec<FaceRecord>) -> Self {
        let names: BTreeSet<&str> = faces.iter().filter_map(|f| f.name.as_deref()).collect();
        Self {
            head_count: faces.len(),
            names: names.into_iter().map(str::to_string).collect(),
            faces,
        }
    }

    pub fn count(&self, status: Status) -> usize {
        self.faces.iter().filter(|f| f.status == status).count()
    }
}

pub fn status_color(status: Status) -> Rgb<u8> {
    match status {
        Status::Recognized => GREEN,
        Status::Processing => YELLOW,
        Status::Unknown => RED,
    }
}

/// A copy of `frame` with one hollow box per face.
pub fn draw(frame: &RgbImage, faces: &[FaceRecord]) -> RgbImage {
    let mut out = frame.clone();
    for face in faces {
        let Some((x, y, w, h)) = clamp(frame, &face.bbox) else {
            continue;
        };
        let color = status_color(face.status);
        for i in 0..THICKNESS {
            if w <= 2 * i || h <= 2 * i {
                break;
            }
            let rect = Rect::at((x + i) as i32, (y + i) as i32).of_size(w - 2 * i, h - 2 * i);
            draw_hollow_rect_mut(&mut out, rect, color);
        }
    }
    out
}

/// The part of `frame` under `bbox`, clipped to the frame.
pub fn crop_region(frame: &RgbImage, bbox: &BBox) -> Option<RgbImage> {
    let (x, y, w, h) = clamp(frame, bbox)?;
    Some(imageops::crop_imm(frame, x, y, w, h).to_image())
}

/// `bbox` clipped to the frame as `(x, y, width, height)`, or `None` when
/// nothing is left.
fn clamp(frame: &RgbImage, bbox: &BBox) -> Option<(u32, u32, u32, u32)> {
    if bbox.is_degenerate() {
        return None;
    }
    let (fw, fh) = (frame.width() as f32, frame.height() as f32);
    let x1 = bbox.x1.floor().clamp(0.0, fw);
    let y1 = bbox.y1.floor().clamp(0.0, fh);
    let x2 = bbox.x2.ceil().clamp(0.0, fw);
    let y2 = bbox.y2.ceil().clamp(0.0, fh);
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some((x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32))
}
