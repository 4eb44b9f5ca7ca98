use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Top-level wire configuration, loaded from gpuwire.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireConfig {
    #[serde(default)]
    pub client: EndpointConfig,
    #[serde(default)]
    pub server: EndpointConfig,
    #[serde(default)]
    pub trace: TraceConfig,
}

/// Settings for one side of the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// How mapped buffer contents cross the wire: "inline" or "shared"
    #[serde(default)]
    pub memory_transfer: MemoryTransferMode,
    /// Largest single allocation the transport hands out, in bytes.
    /// Commands larger than this are split across allocations.
    #[serde(default = "default_max_allocation_size")]
    pub max_allocation_size: usize,
}

/// Memory transfer strategy selection.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum MemoryTransferMode {
    /// Mapped bytes travel inside the command stream (default)
    #[default]
    #[serde(rename = "inline")]
    Inline,
    /// Mapped bytes live in a shared region; commands carry only its id
    #[serde(rename = "shared")]
    Shared,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceConfig {
    /// Mirror every flushed byte to a trace file
    #[serde(default)]
    pub enabled: bool,
    /// Directory for trace files (None = platform default)
    pub directory: Option<PathBuf>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            memory_transfer: MemoryTransferMode::default(),
            max_allocation_size: default_max_allocation_size(),
        }
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: None,
        }
    }
}

impl TraceConfig {
    /// Directory trace files are written to.
    pub fn directory(&self) -> PathBuf {
        self.directory
            .clone()
            .unwrap_or_else(gpuwire_common::default_trace_dir)
    }

    /// Path of the trace file for one direction of the wire.
    pub fn trace_path(&self, direction: &str) -> PathBuf {
        self.directory().join(format!("{direction}.gwtrace"))
    }
}

impl WireConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: WireConfig = toml::from_str(&content)
            .map_err(|e| CoreError::ConfigError(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(config) => config,
            Err(CoreError::Io(_)) => Self::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring invalid configuration");
                Self::default()
            }
        }
    }

    fn validate(&self) -> Result<(), CoreError> {
        for (side, endpoint) in [("client", &self.client), ("server", &self.server)] {
            if endpoint.max_allocation_size < MIN_ALLOCATION_SIZE {
                return Err(CoreError::ConfigError(format!(
                    "{side}.max_allocation_size must be at least {MIN_ALLOCATION_SIZE} bytes"
                )));
            }
        }
        Ok(())
    }
}

/// Smallest accepted transport allocation; a frame header must always fit.
pub const MIN_ALLOCATION_SIZE: usize = 64;

/// Returns the default config file path.
/// Search order:
/// 1. `GPUWIRE_CONFIG` environment variable
/// 2. System-wide config: `/etc/gpuwire/gpuwire.toml` (non-Windows)
/// 3. Local fallback: `./gpuwire.toml`
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("GPUWIRE_CONFIG") {
        return PathBuf::from(path);
    }
    #[cfg(not(windows))]
    {
        let system_path = Path::new("/etc/gpuwire/gpuwire.toml");
        if system_path.exists() {
            return system_path.to_path_buf();
        }
    }
    PathBuf::from("gpuwire.toml")
}

fn default_max_allocation_size() -> usize {
    1024 * 1024
}
