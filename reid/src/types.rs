use std::fmt;
use std::str::FromStr;

use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Added to the IoU denominator so degenerate unions never divide by zero.
pub const IOU_EPSILON: f32 = 1e-9;

/// Name prefix of auto-created identities (`Unknown_12`).
pub const UNKNOWN_PREFIX: &str = "Unknown_";

/// Name prefix of identities an operator dismissed (`Dismissed_12`).
pub const DISMISSED_PREFIX: &str = "Dismissed_";

/// Name prefix of superseded identities (`Merged_to_7`).
pub const MERGED_PREFIX: &str = "Merged_to_";

/// Store key prefix (`reid_12`).
pub const KEY_PREFIX: &str = "reid_";

/// Axis-aligned box in pixel coordinates, `(x1, y1)` top-left and
/// `(x2, y2)` bottom-right.
///
/// Serializes as `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// Area, or 0 for inverted, empty or non-finite boxes.
    pub fn area(&self) -> f32 {
        let (w, h) = (self.width(), self.height());
        if w > 0.0 && h > 0.0 && w.is_finite() && h.is_finite() {
            w * h
        } else {
            0.0
        }
    }

    pub fn is_degenerate(&self) -> bool {
        self.area() <= 0.0
    }

    /// Intersection over union. Degenerate boxes yield 0.
    pub fn iou(&self, other: &BBox) -> f32 {
        if self.is_degenerate() || other.is_degenerate() {
            return 0.0;
        }
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        inter / (union + IOU_EPSILON)
    }
}

impl From<[f32; 4]> for BBox {
    fn from(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BBox> for [f32; 4] {
    fn from(b: BBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// Tracker-assigned handle, stable while an object stays in view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(pub u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Durable identity number. Always strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReidNum(u64);

impl ReidNum {
    /// Returns `None` for zero.
    pub fn new(n: u64) -> Option<Self> {
        (n > 0).then_some(Self(n))
    }

    pub fn get(self) -> u64 {
        self.0
    }

    /// Store key, e.g. `reid_12`.
    pub fn key(self) -> String {
        format!("{KEY_PREFIX}{}", self.0)
    }

    /// Parses a store key such as `reid_12`.
    pub fn from_key(key: &str) -> Option<Self> {
        key.strip_prefix(KEY_PREFIX)?.parse().ok()
    }
}

impl fmt::Display for ReidNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ReidNum {
    type Err = String;

    /// Accepts `12` or `reid_12`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let digits = s.strip_prefix(KEY_PREFIX).unwrap_or(s);
        digits
            .parse::<u64>()
            .ok()
            .and_then(ReidNum::new)
            .ok_or_else(|| format!("invalid ReID number: {s:?}"))
    }
}

/// One detected object in one frame.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BBox,
    pub confidence: f32,

    /// Appearance embedding when the detector already computed one.
    pub embedding: Option<Vec<f32>>,

    /// Image region under `bbox`, used for embedding and snapshots.
    pub crop: Option<RgbImage>,
}

impl Detection {
    pub fn new(bbox: BBox, confidence: f32) -> Self {
        Self {
            bbox,
            confidence,
            embedding: None,
            crop: None,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_crop(mut self, crop: RgbImage) -> Self {
        self.crop = Some(crop);
        self
    }

    /// True when a resolution attempt has something to work from.
    pub fn is_resolvable(&self) -> bool {
        self.embedding.is_some() || self.crop.is_some()
    }
}

/// A detection with its track assigned.
#[derive(Debug, Clone)]
pub struct TrackedDetection {
    pub track_id: TrackId,
    pub detection: Detection,
}

/// A track's bound identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Binding {
    pub reid: ReidNum,
    pub name: String,
}

impl Binding {
    pub fn status(&self) -> Status {
        if is_placeholder(&self.name) {
            Status::Unknown
        } else {
            Status::Recognized
        }
    }
}

/// Per-detection resolution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Bound to an operator-named identity.
    Recognized,
    /// Resolution is in flight.
    Processing,
    /// Not yet resolved, or bound to an auto-named identity.
    Unknown,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recognized => write!(f, "recognized"),
            Self::Processing => write!(f, "processing"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A stored identity as seen by operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Identity {
    pub reid: ReidNum,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_into: Option<ReidNum>,
}

/// `Unknown_<n>`.
pub fn placeholder_name(reid: ReidNum) -> String {
    format!("{UNKNOWN_PREFIX}{reid}")
}

/// `Merged_to_<n>`.
pub fn merged_name(target: ReidNum) -> String {
    format!("{MERGED_PREFIX}{target}")
}

/// `Dismissed_<n>`.
pub fn dismissed_name(reid: ReidNum) -> String {
    format!("{DISMISSED_PREFIX}{reid}")
}

pub fn is_placeholder(name: &str) -> bool {
    name.starts_with(UNKNOWN_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(x1: f32, y1: f32, x2: f32, y2: f32) -> BBox {
        BBox::new(x1, y1, x2, y2)
    }

    #[test]
    fn iou_identical_is_one() {
        let a = b(0.0, 0.0, 10.0, 10.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        let c = b(3.5, 7.0, 120.0, 44.0);
        assert!((c.iou(&c) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_disjoint_is_zero() {
        assert_eq!(b(0.0, 0.0, 10.0, 10.0).iou(&b(20.0, 20.0, 30.0, 30.0)), 0.0);
        // Touching edges share no area.
        assert_eq!(b(0.0, 0.0, 10.0, 10.0).iou(&b(10.0, 0.0, 20.0, 10.0)), 0.0);
    }

    #[test]
    fn iou_partial_overlap() {
        // Intersection 9x9 = 81, union 100 + 100 - 81 = 119.
        let iou = b(0.0, 0.0, 10.0, 10.0).iou(&b(1.0, 1.0, 11.0, 11.0));
        assert!((iou - 81.0 / 119.0).abs() < 1e-5);
    }

    #[test]
    fn iou_degenerate_boxes() {
        let good = b(0.0, 0.0, 10.0, 10.0);
        assert_eq!(good.iou(&b(5.0, 5.0, 5.0, 9.0)), 0.0);
        assert_eq!(good.iou(&b(10.0, 10.0, 0.0, 0.0)), 0.0);
        assert_eq!(good.iou(&b(f32::NAN, 0.0, 10.0, 10.0)), 0.0);
        assert_eq!(b(0.0, 0.0, 0.0, 0.0).iou(&b(0.0, 0.0, 0.0, 0.0)), 0.0);
    }

    #[test]
    fn bbox_serializes_as_array() {
        let json = serde_json::to_string(&b(1.0, 2.0, 3.5, 4.0)).unwrap();
        assert_eq!(json, "[1.0,2.0,3.5,4.0]");
        let back: BBox = serde_json::from_str("[0, 0, 10, 10]").unwrap();
        assert_eq!(back, b(0.0, 0.0, 10.0, 10.0));
    }

    #[test]
    fn reid_num_parsing() {
        assert_eq!("12".parse::<ReidNum>().unwrap().get(), 12);
        assert_eq!("reid_7".parse::<ReidNum>().unwrap().get(), 7);
        assert_eq!(" 3 ".parse::<ReidNum>().unwrap().get(), 3);
        assert!("0".parse::<ReidNum>().is_err());
        assert!("-4".parse::<ReidNum>().is_err());
        assert!("abc".parse::<ReidNum>().is_err());
        assert!("".parse::<ReidNum>().is_err());
    }

    #[test]
    fn reid_key_round_trip() {
        let r = ReidNum::new(42).unwrap();
        assert_eq!(r.key(), "reid_42");
        assert_eq!(ReidNum::from_key("reid_42"), Some(r));
        assert_eq!(ReidNum::from_key("reid_0"), None);
        assert_eq!(ReidNum::from_key("face_42"), None);
    }

    #[test]
    fn binding_status_follows_name() {
        let r = ReidNum::new(3).unwrap();
        let auto = Binding { reid: r, name: placeholder_name(r) };
        assert_eq!(auto.status(), Status::Unknown);
        let named = Binding { reid: r, name: "Alice".into() };
        assert_eq!(named.status(), Status::Recognized);
    }

    #[test]
    fn name_helpers() {
        let r = ReidNum::new(9).unwrap();
        assert_eq!(placeholder_name(r), "Unknown_9");
        assert_eq!(merged_name(r), "Merged_to_9");
        assert_eq!(dismissed_name(r), "Dismissed_9");
    }

    #[test]
    fn status_display() {
        assert_eq!(Status::Recognized.to_string(), "recognized");
        assert_eq!(Status::Processing.to_string(), "processing");
        assert_eq!(Status::Unknown.to_string(), "unknown");
    }
}
