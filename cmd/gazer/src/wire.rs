//! JSON shapes shared by the HTTP surface and replay files.

use std::io::Cursor;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use gazer_reid::annotate::crop_region;
use gazer_reid::{BBox, Detection, FrameSummary};
use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};

fn default_confidence() -> f32 {
    1.0
}

fn default_true() -> bool {
    true
}

/// One detection as sent by a client.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionInput {
    pub bbox: BBox,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

impl From<DetectionInput> for Detection {
    fn from(d: DetectionInput) -> Self {
        let det = Detection::new(d.bbox, d.confidence);
        match d.embedding {
            Some(e) => det.with_embedding(e),
            None => det,
        }
    }
}

/// One frame of detections, optionally with the source image as base64.
#[derive(Debug, Clone, Deserialize)]
pub struct FrameInput {
    #[serde(default)]
    pub detections: Vec<DetectionInput>,
    #[serde(default)]
    pub image: Option<String>,

    /// When false, each detection is identified on the spot and no track
    /// is kept.
    #[serde(default = "default_true")]
    pub use_tracking: bool,
}

impl FrameInput {
    /// Decodes the attached image, if any.
    pub fn frame(&self) -> Result<Option<RgbImage>> {
        self.image.as_deref().map(decode_image).transpose()
    }

    /// Converts to tracker input, cropping each box out of `frame`.
    pub fn into_detections(self, frame: Option<&RgbImage>) -> Vec<Detection> {
        self.detections
            .into_iter()
            .map(|d| {
                let mut det = Detection::from(d);
                if let Some(frame) = frame {
                    det.crop = crop_region(frame, &det.bbox);
                }
                det
            })
            .collect()
    }
}

pub fn decode_image(data: &str) -> Result<RgbImage> {
    let bytes = STANDARD.decode(data.trim()).context("invalid base64")?;
    let img = image::load_from_memory(&bytes).context("invalid image file")?;
    Ok(img.to_rgb8())
}

pub fn encode_png(img: &RgbImage) -> Result<String> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)?;
    Ok(STANDARD.encode(buf.into_inner()))
}

#[derive(Debug, Serialize)]
pub struct FrameOutput {
    #[serde(flatten)]
    pub summary: FrameSummary,

    /// Annotated image as base64 PNG, when an image was sent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotated: Option<String>,
}
