//! Configuration module for the stdio filter
//!
//! Configuration is fixed at construction. It is usually embedded in the
//! supervisor's own config and handed over as JSON bytes.

use serde::Deserialize;
use thiserror::Error;

use crate::streaming::{GrowthPolicy, Tokenizer};

/// Filter configuration
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct FilterConfig {
    /// Initial ring buffer size. At least twice the largest single write
    /// the process is expected to make.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// How records are delimited in the output stream
    #[serde(default)]
    pub tokenizer: Tokenizer,

    /// What happens to a write that does not fit in the buffer
    #[serde(default)]
    pub growth_policy: GrowthPolicy,
}

fn default_buffer_capacity() -> usize {
    4 * 1024 // 4KB
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            tokenizer: Tokenizer::default(),
            growth_policy: GrowthPolicy::default(),
        }
    }
}

impl FilterConfig {
    /// Parse configuration from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        let config_str =
            std::str::from_utf8(bytes).map_err(|e| ConfigError::InvalidUtf8(e.to_string()))?;

        let config: Self =
            serde_json::from_str(config_str).map_err(|e| ConfigError::InvalidJson(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        Ok(())
    }
}

/// Configuration parsing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid UTF-8: {0}")]
    InvalidUtf8(String),
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),
    #[error("buffer_capacity must be greater than zero")]
    ZeroCapacity,
}
