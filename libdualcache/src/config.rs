//! Tunables for the page-cache side of the bridge.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const DEFAULT_MAX_READAHEAD_PAGES: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Size of one page-cache page in bytes. Must be a power of two.
    pub page_size: usize,
    /// Largest page vector a single batched fault-in may build.
    pub max_readahead_pages: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_readahead_pages: DEFAULT_MAX_READAHEAD_PAGES,
        }
    }
}

impl BridgeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path.as_ref())?;
        let cfg: BridgeConfig = serde_json::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "page_size {} is not a power of two",
                self.page_size
            )));
        }
        if self.max_readahead_pages == 0 {
            return Err(ConfigError::Invalid(
                "max_readahead_pages must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn page_shift(&self) -> u32 {
        self.page_size.trailing_zeros()
    }
}
