//! Device configuration.
//!
//! Every field has a default, so a YAML file only needs the values it
//! changes:
//!
//! ```yaml
//! block_ms: 20
//! default_format: slinear_le:16000:1
//! playback: slinear_le:44100:2
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::format::{Encoding, Format};

/// Default hardware format requested in both directions.
pub const DEFAULT_HW_FORMAT: Format = Format::new(Encoding::slinear_ne(), 16, 2, 48000);

/// Configuration of a [`Device`](crate::Device).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Block length in milliseconds.
    pub block_ms: u32,
    /// Blocks in the hardware ring.
    pub hw_blocks: usize,
    /// Blocks in a track's output (playback) or input (capture) ring.
    pub out_blocks: usize,
    /// Minimum user ring size in blocks.
    pub user_min_blocks: usize,
    /// Preferred user ring size in bytes.
    pub user_buffer_bytes: usize,
    /// Bound on a single wait for hardware progress.
    pub io_timeout_ms: u64,
    /// Prefill one block instead of two when starting playback.
    pub single_buffer: bool,
    /// Automatic gain control on the playback mix.
    pub agc: bool,
    /// Format of newly opened tracks.
    pub default_format: Format,
    /// Requested playback hardware format.
    pub playback: Format,
    /// Requested capture hardware format.
    pub capture: Format,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            block_ms: 10,
            hw_blocks: 3,
            out_blocks: 4,
            user_min_blocks: 3,
            user_buffer_bytes: 65536,
            io_timeout_ms: 3000,
            single_buffer: false,
            agc: true,
            default_format: Format::ulaw_8k_mono(),
            playback: DEFAULT_HW_FORMAT,
            capture: DEFAULT_HW_FORMAT,
        }
    }
}

impl DeviceConfig {
    /// Parses a YAML document.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(text).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_yaml(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=100).contains(&self.block_ms) {
            return Err(Error::InvalidConfig(format!(
                "block_ms {} out of range 1..=100",
                self.block_ms
            )));
        }
        if self.hw_blocks < 2 {
            return Err(Error::InvalidConfig("hw_blocks must be at least 2".into()));
        }
        if self.out_blocks < 2 {
            return Err(Error::InvalidConfig("out_blocks must be at least 2".into()));
        }
        if self.user_min_blocks < 1 {
            return Err(Error::InvalidConfig("user_min_blocks must be at least 1".into()));
        }
        if self.io_timeout_ms == 0 {
            return Err(Error::InvalidConfig("io_timeout_ms must be positive".into()));
        }
        for fmt in [&self.default_format, &self.playback, &self.capture] {
            fmt.validate().map_err(|e| Error::InvalidConfig(e.to_string()))?;
        }
        Ok(())
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}
