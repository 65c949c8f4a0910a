//! Representative crops saved next to new identities.

use std::fs;
use std::path::{Path, PathBuf};

use image::{ImageFormat, RgbImage};

use crate::error::ReidError;
use crate::types::ReidNum;

/// A directory of `reid_<n>.jpg` files.
#[derive(Debug, Clone)]
pub struct ImageStore {
    dir: PathBuf,
}

impl ImageStore {
    /// Uses `dir`, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ReidError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, reid: ReidNum) -> PathBuf {
        self.dir.join(format!("{}.jpg", reid.key()))
    }

    /// Writes `crop` as the image of `reid`, replacing any earlier one.
    pub fn save(&self, reid: ReidNum, crop: &RgbImage) -> Result<PathBuf, ReidError> {
        if crop.width() == 0 || crop.height() == 0 {
            return Err(ReidError::Image(format!("empty crop for reid {reid}")));
        }
        let path = self.path_for(reid);
        crop.save_with_format(&path, ImageFormat::Jpeg)
            .map_err(|e| ReidError::Image(e.to_string()))?;
        Ok(path)
    }

    pub fn exists(&self, reid: ReidNum) -> bool {
        self.path_for(reid).is_file()
    }

    /// Raw JPEG bytes, or `None` if no image was saved.
    pub fn load(&self, reid: ReidNum) -> Result<Option<Vec<u8>>, ReidError> {
        match fs::read(self.path_for(reid)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
