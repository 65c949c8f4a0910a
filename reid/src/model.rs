use image::RgbImage;

use crate::error::ReidError;
use crate::types::Detection;

/// Finds objects in a frame.
///
/// Implementations wrap an external model and must be safe for
/// concurrent use. A failed call is logged by the caller and treated as a
/// frame with no detections.
pub trait Detector: Send + Sync {
    fn detect(&self, frame: &RgbImage) -> Result<Vec<Detection>, ReidError>;
}

/// Computes an appearance embedding for an image region.
///
/// The output need not be normalized; the pipeline L2-normalizes it before
/// matching.
pub trait Embedder: Send + Sync {
    fn embed(&self, crop: &RgbImage) -> Result<Vec<f32>, ReidError>;

    /// Dimensionality of the returned vectors (e.g. 512).
    fn dimension(&self) -> usize;
}
