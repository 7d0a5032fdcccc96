//! Pipeline configuration: the single contract between a consumer and the
//! controller. Loadable from TOML; every field has a default.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::decode::frame::PixelLayout;
use crate::decode::select::DecodePreference;
use crate::decode::source::{MediaType, OpenRequest};

pub const DEFAULT_QUEUE_CAPACITY: usize = 5;
pub const DEFAULT_BLOCK_TIMEOUT_SECONDS: u64 = 10;
pub const DEFAULT_CAPTURE_FRAMERATE: u32 = 30;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {source}")]
    Parse {
        #[from]
        source: toml::de::Error,
    },
    #[error("invalid value '{value}' for '{field}'")]
    Invalid { field: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub source: String,
    pub media_type: MediaType,
    pub decode_preference: DecodePreference,
    pub target_layout: PixelLayout,
    pub queue_capacity: usize,
    pub block_timeout_seconds: u64,
    pub capture_framerate: u32, // capture devices only
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source: String::new(),
            media_type: MediaType::File,
            decode_preference: DecodePreference::Software,
            target_layout: PixelLayout::PackedBgr24,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            block_timeout_seconds: DEFAULT_BLOCK_TIMEOUT_SECONDS,
            capture_framerate: DEFAULT_CAPTURE_FRAMERATE,
        }
    }
}

impl PipelineConfig {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }

    pub fn with_media_type(mut self, media_type: MediaType) -> Self {
        self.media_type = media_type;
        self
    }

    pub fn with_decode_preference(mut self, preference: DecodePreference) -> Self {
        self.decode_preference = preference;
        self
    }

    pub fn with_target_layout(mut self, layout: PixelLayout) -> Self {
        self.target_layout = layout;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_block_timeout_seconds(mut self, seconds: u64) -> Self {
        self.block_timeout_seconds = seconds;
        self
    }

    pub fn with_capture_framerate(mut self, framerate: u32) -> Self {
        self.capture_framerate = framerate;
        self
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "source",
                value: self.source.clone(),
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "queue_capacity",
                value: "0".to_string(),
            });
        }
        if self.block_timeout_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "block_timeout_seconds",
                value: "0".to_string(),
            });
        }
        if self.media_type == MediaType::Capture && self.capture_framerate == 0 {
            return Err(ConfigError::Invalid {
                field: "capture_framerate",
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_secs(self.block_timeout_seconds)
    }

    pub fn open_request(&self) -> OpenRequest {
        OpenRequest {
            source: self.source.clone(),
            media_type: self.media_type,
            decode_preference: self.decode_preference,
            capture_framerate: self.capture_framerate,
        }
    }
}
