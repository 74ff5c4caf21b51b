//! Driver configuration
//!
//! Loaded from TOML; every field has a default so an empty file is valid.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::{MAX_BUFFER, NPU_MAX_SESSION};

/// Top-level NPU configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NpuConfig {
    /// Number of concurrently registered sessions
    pub max_session: usize,
    /// Bundle slots per buffer queue
    pub max_buffer: usize,
    /// Delay substituted for the completion wait in forced streamoff
    /// when the device is in emergency state
    pub streamoff_delay_ms: u64,
    /// Golden matcher settings
    pub golden: GoldenConfig,
}

/// Golden matcher configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GoldenConfig {
    /// Accept golden descriptions and compare completed frames
    pub enabled: bool,
    /// Capacity of the compare report in bytes
    pub result_capacity: usize,
}

impl Default for NpuConfig {
    fn default() -> Self {
        Self {
            max_session: NPU_MAX_SESSION,
            max_buffer: MAX_BUFFER,
            streamoff_delay_ms: 500,
            golden: GoldenConfig::default(),
        }
    }
}

impl Default for GoldenConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            result_capacity: 32 * 1024,
        }
    }
}

impl NpuConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: NpuConfig = toml::from_str(text)
            .map_err(|e| Error::InvalidArgument(format!("config: {}", e.message())))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Check limits against the fixed hardware pools
    pub fn validate(&self) -> Result<()> {
        if self.max_session == 0 || self.max_session > NPU_MAX_SESSION {
            return Err(Error::InvalidArgument(format!(
                "max_session must be within 1..={}",
                NPU_MAX_SESSION
            )));
        }
        if self.max_buffer == 0 || self.max_buffer > MAX_BUFFER {
            return Err(Error::InvalidArgument(format!(
                "max_buffer must be within 1..={}",
                MAX_BUFFER
            )));
        }
        if self.golden.result_capacity < 64 {
            return Err(Error::InvalidArgument(
                "golden.result_capacity must be at least 64 bytes".into(),
            ));
        }
        Ok(())
    }

    pub fn streamoff_delay(&self) -> Duration {
        Duration::from_millis(self.streamoff_delay_ms)
    }
}
