//! Pipeline configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{CaptureRequest, ScaleMode, Size};

/// Errors raised while loading a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid JSON for this schema.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range.
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Configuration for a preview pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Requested preview width in pixels (default: 1280).
    pub preview_width: u32,

    /// Requested preview height in pixels (default: 720).
    pub preview_height: u32,

    /// Target frame rate in frames per 1000 seconds (default: 60_000).
    pub target_fps_milli: u32,

    /// Capture device index.
    pub camera_id: u32,

    /// Initial scale policy.
    pub scale_mode: ScaleMode,

    /// Run the bridge on its own GPU context shared with the pipeline context.
    pub shared_gpu_context: bool,

    /// Single wait slice while stopping the capture context.
    pub stop_retry_ms: u64,

    /// Overall bound on waiting for the capture context to stop.
    pub stop_deadline_ms: u64,

    /// How long the capture context waits for the bridge input surface.
    pub bridge_ready_timeout_ms: u64,

    /// Color used to clear the display surface.
    pub clear_color: [f32; 4],
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            preview_width: 1280,
            preview_height: 720,
            target_fps_milli: 60_000,
            camera_id: 0,
            scale_mode: ScaleMode::StretchFit,
            shared_gpu_context: false,
            stop_retry_ms: 1000,
            stop_deadline_ms: 10_000,
            bridge_ready_timeout_ms: 2000,
            clear_color: [1.0, 1.0, 0.0, 1.0],
        }
    }
}

impl PipelineConfig {
    /// Parse and validate a JSON document. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.preview_width == 0 || self.preview_height == 0 {
            return Err(ConfigError::Invalid(format!(
                "preview size must be non-zero, got {}x{}",
                self.preview_width, self.preview_height
            )));
        }
        if self.target_fps_milli == 0 {
            return Err(ConfigError::Invalid("target_fps_milli must be non-zero".into()));
        }
        if self.stop_retry_ms == 0 {
            return Err(ConfigError::Invalid("stop_retry_ms must be non-zero".into()));
        }
        if self.stop_deadline_ms < self.stop_retry_ms {
            return Err(ConfigError::Invalid(
                "stop_deadline_ms must be at least stop_retry_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn preview_size(&self) -> Size {
        Size::new(self.preview_width, self.preview_height)
    }

    pub fn capture_request(&self) -> CaptureRequest {
        CaptureRequest::new(self.preview_width, self.preview_height, self.target_fps_milli)
    }

    pub fn stop_retry(&self) -> Duration {
        Duration::from_millis(self.stop_retry_ms)
    }

    pub fn stop_deadline(&self) -> Duration {
        Duration::from_millis(self.stop_deadline_ms)
    }

    pub fn bridge_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.bridge_ready_timeout_ms)
    }
}
