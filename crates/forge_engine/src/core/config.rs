//! Engine configuration
//!
//! Deserialised from TOML. Every field has a default so a missing or partial
//! configuration file still produces a working engine.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Errors produced while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The file contents were not valid TOML
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Shadow-mapping parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShadowConfig {
    /// Resolution of each cascade layer in texels
    pub resolution: u32,

    /// Far distance covered by the cascade range in world units
    pub distance: f32,

    /// Blend factor between uniform and logarithmic cascade splits
    pub split_lambda: f32,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            resolution: 2048,
            distance: 2000.0,
            split_lambda: 0.85,
        }
    }
}

/// Texture-streaming parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Capacity of the bindless texture array
    pub max_textures: u32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self { max_textures: 2048 }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Shadow-mapping parameters
    pub shadow: ShadowConfig,

    /// Texture-streaming parameters
    pub streaming: StreamingConfig,

    /// Record GPU timestamps around every render-graph pass
    pub gpu_timestamps: bool,
}

impl EngineConfig {
    /// Loads a configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_renderer_expectations() {
        let config = EngineConfig::default();
        assert_eq!(config.shadow.resolution, 2048);
        assert_eq!(config.shadow.split_lambda, 0.85);
        assert_eq!(config.streaming.max_textures, 2048);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: EngineConfig = toml::from_str("[shadow]\nresolution = 4096\n").unwrap();
        assert_eq!(config.shadow.resolution, 4096);
        assert_eq!(config.shadow.distance, 2000.0);
        assert_eq!(config.streaming.max_textures, 2048);
    }
}
