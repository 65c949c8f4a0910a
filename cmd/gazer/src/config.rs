//! Configuration file loading.
//!
//! Configuration is stored in ~/.gazer/config.yaml unless `--config` names
//! another file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use gazer_reid::ReidConfig;
use serde::{Deserialize, Serialize};

/// Default base configuration directory name.
pub const DEFAULT_BASE_DIR: &str = ".gazer";
/// Default configuration filename.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Default HTTP listen address.
pub const DEFAULT_LISTEN: &str = ":8080";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Tracking and resolution settings.
    pub reid: ReidConfig,

    /// Identity database file. In-memory when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,

    /// Listen address for `serve`, e.g. `:8080` or `127.0.0.1:9000`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
}

impl FileConfig {
    /// ~/.gazer/config.yaml
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(DEFAULT_BASE_DIR).join(DEFAULT_CONFIG_FILE))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&data).with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn parse(data: &str) -> Result<Self> {
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(data)?)
    }

    /// Loads `explicit` (which must exist), else the default file if it
    /// exists, else defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.is_file() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn listen_addr(&self) -> &str {
        self.listen.as_deref().unwrap_or(DEFAULT_LISTEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let cfg = FileConfig::parse(
            "reid:\n  similarity_threshold: 0.55\n  workers: 4\ndb_path: /var/lib/gazer/ids.redb\n",
        )
        .unwrap();
        assert_eq!(cfg.reid.similarity_threshold, 0.55);
        assert_eq!(cfg.reid.workers, 4);
        assert_eq!(cfg.reid.max_age, 5);
        assert_eq!(cfg.db_path, Some(PathBuf::from("/var/lib/gazer/ids.redb")));
        assert_eq!(cfg.listen_addr(), ":8080");
    }

    #[test]
    fn empty_file_is_default() {
        let cfg = FileConfig::parse("\n").unwrap();
        assert!(cfg.db_path.is_none());
        assert_eq!(cfg.reid.iou_threshold, 0.3);
    }

    #[test]
    fn load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "listen: 127.0.0.1:9000\nreid:\n  image_dir: faces\n").unwrap();
        let cfg = FileConfig::resolve(Some(&path)).unwrap();
        assert_eq!(cfg.listen_addr(), "127.0.0.1:9000");
        assert_eq!(cfg.reid.image_dir, Some(PathBuf::from("faces")));

        assert!(FileConfig::resolve(Some(&dir.path().join("missing.yaml"))).is_err());
        fs::write(&path, "reid: [1, 2").unwrap();
        assert!(FileConfig::load(&path).is_err());
    }
}
