//! Configuration for the allocator module
//!
//! Loads configuration from TOML file at `~/.config/gralloc-gbm/config.toml`
//! (or the path in `GRALLOC_GBM_CONFIG`). Missing files and missing fields
//! fall back to defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "GRALLOC_GBM_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub allocator: AllocatorConfig,
    pub display: DisplayConfig,
    pub handoff: HandoffConfig,
}

impl Config {
    /// Load configuration from file, or use defaults if file doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!("Config file not found at {:?}, using defaults", config_path);
            return Ok(Self::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        info!("Configuration loaded from {:?}", path);
        debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Get the path to the config file
    pub fn config_path() -> Result<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }

        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("gralloc-gbm");

        Ok(config_dir.join("config.toml"))
    }

    /// Save default configuration to file
    pub fn save_default(path: &Path) -> Result<()> {
        // Create config directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let toml_string = toml::to_string_pretty(&Self::default())
            .context("Failed to serialize default config")?;

        fs::write(path, toml_string).context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }
}

/// Allocator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Row stride alignment in bytes
    pub stride_align: u32,
    /// Largest single allocation in bytes
    pub max_buffer_bytes: u64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            stride_align: 256,
            max_buffer_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Virtual display output geometry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
    /// Row stride in pixels
    pub stride: u32,
    /// Pixel format code
    pub format: i32,
    pub xdpi: f32,
    pub ydpi: f32,
    /// Refresh rate in frames per second
    pub fps: f32,
    pub min_swap_interval: i32,
    pub max_swap_interval: i32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 720,
            height: 1280,
            stride: 768,
            format: 0x1, // RGBA_8888
            xdpi: 240.0,
            ydpi: 240.0,
            fps: 30.0,
            min_swap_interval: 1,
            max_swap_interval: 1,
        }
    }
}

/// Where the frame handoff exchange runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandoffMode {
    /// On the posting thread, with the device mutex held throughout
    #[default]
    Inline,
    /// On a dedicated worker thread; `post` only queues the frame
    Worker,
}

/// Frame handoff configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffConfig {
    /// Socket path of the display process; defaults to the runtime dir endpoint
    pub endpoint: Option<PathBuf>,
    /// Deadline for the acknowledgement byte
    pub timeout_ms: u64,
    pub mode: HandoffMode,
    /// Frames the worker may hold queued; further posts are dropped
    pub queue_depth: usize,
}

impl HandoffConfig {
    pub fn endpoint(&self) -> PathBuf {
        self.endpoint
            .clone()
            .unwrap_or_else(gralloc_ipc::endpoint_path)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.max(1)
    }
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: 5000,
            mode: HandoffMode::Inline,
            queue_depth: 8,
        }
    }
}
