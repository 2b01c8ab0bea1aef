use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::CoreError;

/// Top-level capture configuration, loaded from dxcap.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub capture: CaptureSettings,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub screenshots: ScreenshotConfig,
    #[serde(default)]
    pub debug: DebugConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// What the layer does with intercepted calls
    #[serde(default)]
    pub mode: CaptureModeSetting,
    /// Trace file path (None = platform default)
    pub trace_file: Option<String>,
    /// LZ4-compress trace frames
    #[serde(default = "default_true")]
    pub compress: bool,
    /// Write a state snapshot after this many presented frames
    pub trim_frame: Option<u32>,
}

/// Capture mode selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureModeSetting {
    /// Record calls without maintaining object state
    Write,
    /// Record calls and maintain object state (default)
    #[default]
    WriteAndTrack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// How CPU writes to mapped resources are detected
    #[serde(default)]
    pub tracking_mode: MemoryTrackingMode,
    /// Request OS write watch on upload heaps when tracking_mode = page_guard
    #[serde(default = "default_true")]
    pub use_write_watch: bool,
}

/// Strategy for capturing CPU writes to mapped memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTrackingMode {
    /// Capture the whole mapped range at unmap
    Unassisted,
    /// Capture the range the application reports as written at unmap
    Assisted,
    /// Capture only pages reported dirty by write watch
    #[default]
    PageGuard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenshotConfig {
    /// Frame indices (1-based) to capture after present
    #[serde(default)]
    pub frames: Vec<u32>,
    /// Maximum pending screenshot requests before new ones are dropped
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugConfig {
    /// Enable the native debug layer before device creation
    #[serde(default)]
    pub debug_layer: bool,
    /// Enable device-removed extended data before device creation
    #[serde(default)]
    pub device_removed_diagnostics: bool,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            mode: CaptureModeSetting::default(),
            trace_file: None,
            compress: true,
            trim_frame: None,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            tracking_mode: MemoryTrackingMode::default(),
            use_write_watch: true,
        }
    }
}

impl Default for ScreenshotConfig {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            queue_depth: default_queue_depth(),
        }
    }
}

impl CaptureConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self, CoreError> {
        let config: CaptureConfig = toml::from_str(content)?;
        if config.screenshots.queue_depth == 0 {
            return Err(CoreError::ConfigError(
                "screenshots.queue_depth must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        if !std::path::Path::new(path).exists() {
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => {
                info!("loaded capture configuration from {}", path);
                config
            }
            Err(e) => {
                warn!("ignoring capture configuration {}: {}", path, e);
                Self::default()
            }
        }
    }

    pub fn screenshot_requested(&self, frame: u32) -> bool {
        self.screenshots.frames.contains(&frame)
    }
}

/// Returns the config file path: `DXCAP_CONFIG` if set, else `./dxcap.toml`.
pub fn default_config_path() -> String {
    std::env::var("DXCAP_CONFIG").unwrap_or_else(|_| "dxcap.toml".to_string())
}

fn default_true() -> bool {
    true
}

fn default_queue_depth() -> usize {
    4
}
