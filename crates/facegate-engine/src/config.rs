//! Layered engine configuration: defaults, TOML file, environment.

use crate::store::StorePaths;
use facegate_core::Sensitivity;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// OpenCV's stock frontal-face cascade.
const CASCADE_FILE: &str = "haarcascade_frontalface_default.xml";

/// Where distribution OpenCV packages install their cascades.
const SYSTEM_CASCADE_DIRS: &[&str] = &[
    "/usr/share/opencv4/haarcascades",
    "/usr/share/opencv/haarcascades",
    "/usr/local/share/opencv4/haarcascades",
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Engine configuration.
///
/// Resolved in three layers: built-in defaults, then an optional TOML file,
/// then `FACEGATE_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Frames discarded right after the camera opens (AGC/AE stabilization).
    pub warmup_frames: usize,
    /// Directory holding the sample data and classifier artifact.
    pub data_dir: PathBuf,
    /// Haar cascade file, OpenCV XML or JSON. When unset,
    /// `{data_dir}/haarcascade_frontalface_default.xml` is used, falling back
    /// to the copy shipped by a system OpenCV install.
    pub cascade_path: Option<PathBuf>,
    pub scale_factor: f32,
    pub min_neighbors: u32,
    pub min_face_size: u32,
    /// Scores at or above this are non-matches (0 = perfect match).
    pub rejection_threshold: f64,
    /// Consecutive matching frames required to authenticate.
    pub quorum: u32,
    /// Samples captured per enrollment.
    pub batch_size: usize,
    /// Pause between processed frames.
    pub frame_interval_ms: u64,
    /// Preview frames buffered for the consumer before new ones are dropped.
    pub frame_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        let sensitivity = Sensitivity::default();
        Self {
            camera_device: "/dev/video0".to_string(),
            frame_width: 640,
            frame_height: 480,
            warmup_frames: 4,
            data_dir: default_data_dir(),
            cascade_path: None,
            scale_factor: sensitivity.scale_factor,
            min_neighbors: sensitivity.min_neighbors,
            min_face_size: sensitivity.min_face_size,
            rejection_threshold: 80.0,
            quorum: 3,
            batch_size: 30,
            frame_interval_ms: 30,
            frame_channel_capacity: 8,
        }
    }
}

impl Config {
    /// Load defaults, the config file and environment overrides, then validate.
    ///
    /// The file is `$FACEGATE_CONFIG` if set (and must exist), otherwise
    /// `$XDG_CONFIG_HOME/facegate/config.toml` when present.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("FACEGATE_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => {
                let path = default_config_path();
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Overlay `FACEGATE_*` variables resolved through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FACEGATE_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("FACEGATE_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEGATE_CASCADE_PATH") {
            self.cascade_path = Some(PathBuf::from(v));
        }
        env_parse(&lookup, "FACEGATE_FRAME_WIDTH", &mut self.frame_width);
        env_parse(&lookup, "FACEGATE_FRAME_HEIGHT", &mut self.frame_height);
        env_parse(&lookup, "FACEGATE_WARMUP_FRAMES", &mut self.warmup_frames);
        env_parse(&lookup, "FACEGATE_SCALE_FACTOR", &mut self.scale_factor);
        env_parse(&lookup, "FACEGATE_MIN_NEIGHBORS", &mut self.min_neighbors);
        env_parse(&lookup, "FACEGATE_MIN_FACE_SIZE", &mut self.min_face_size);
        env_parse(&lookup, "FACEGATE_REJECTION_THRESHOLD", &mut self.rejection_threshold);
        env_parse(&lookup, "FACEGATE_QUORUM", &mut self.quorum);
        env_parse(&lookup, "FACEGATE_BATCH_SIZE", &mut self.batch_size);
        env_parse(&lookup, "FACEGATE_FRAME_INTERVAL_MS", &mut self.frame_interval_ms);
        env_parse(&lookup, "FACEGATE_FRAME_CHANNEL_CAPACITY", &mut self.frame_channel_capacity);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.scale_factor.is_finite() && self.scale_factor > 1.0) {
            return Err(ConfigError::Invalid(format!(
                "scale_factor must be > 1, got {}",
                self.scale_factor
            )));
        }
        if !(self.rejection_threshold.is_finite() && self.rejection_threshold > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "rejection_threshold must be a positive number, got {}",
                self.rejection_threshold
            )));
        }
        if self.quorum < 1 {
            return Err(ConfigError::Invalid("quorum must be at least 1".into()));
        }
        if self.batch_size < 1 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".into()));
        }
        if self.frame_channel_capacity < 1 {
            return Err(ConfigError::Invalid(
                "frame_channel_capacity must be at least 1".into(),
            ));
        }
        if self.frame_width == 0 || self.frame_height == 0 {
            return Err(ConfigError::Invalid("frame size must be non-zero".into()));
        }
        Ok(())
    }

    pub fn cascade_path(&self) -> PathBuf {
        if let Some(path) = &self.cascade_path {
            return path.clone();
        }
        let local = self.data_dir.join(CASCADE_FILE);
        std::iter::once(local.clone())
            .chain(SYSTEM_CASCADE_DIRS.iter().map(|dir| Path::new(dir).join(CASCADE_FILE)))
            .find(|path| path.exists())
            .unwrap_or(local)
    }

    pub fn store_paths(&self) -> StorePaths {
        StorePaths::in_dir(&self.data_dir)
    }

    pub fn sensitivity(&self) -> Sensitivity {
        Sensitivity {
            scale_factor: self.scale_factor,
            min_neighbors: self.min_neighbors,
            min_face_size: self.min_face_size,
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegate")
}

fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        })
        .join("facegate/config.toml")
}

fn env_parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.parse() {
        Ok(v) => *target = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable environment override"),
    }
}
