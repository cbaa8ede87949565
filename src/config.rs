// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use crate::rhi::definition::DESCRIPTOR_SET_CAPACITY_DEFAULT;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub command: CommandConfig,
    pub debug: DebugConfig,
    pub demo: DemoConfig,
}

/// Which graphics API drives the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Vulkan,
    Headless,
}

/// Device settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub backend: String,
    pub app_name: String,
    pub validation_layers: bool,
    pub gpu_markers: bool,
    pub gpu_profiling: bool,
    pub descriptor_set_capacity: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: "vulkan".to_string(),
            app_name: "rhi-core".to_string(),
            validation_layers: cfg!(debug_assertions),
            gpu_markers: true,
            gpu_profiling: true,
            descriptor_set_capacity: DESCRIPTOR_SET_CAPACITY_DEFAULT,
        }
    }
}

impl DeviceConfig {
    pub fn backend_kind(&self) -> BackendKind {
        match self.backend.to_lowercase().as_str() {
            "vulkan" => BackendKind::Vulkan,
            "headless" => BackendKind::Headless,
            _ => {
                log::warn!("Unknown backend '{}', defaulting to headless", self.backend);
                BackendKind::Headless
            }
        }
    }
}

/// Command list recycling
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Lists per native pool
    pub cmd_list_count: u32,
    /// Native pools per command pool
    pub cmd_pool_count: u32,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            cmd_list_count: 2,
            cmd_pool_count: 2,
        }
    }
}

/// Debug settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_file: false,
            log_file: "rhi_debug.log".to_string(),
        }
    }
}

impl DebugConfig {
    pub fn level_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or_else(|_| {
            log::warn!("Unknown log level '{}', defaulting to info", self.log_level);
            log::LevelFilter::Info
        })
    }
}

/// Demo frame loop
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub frame_count: u32,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self { frame_count: 120 }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sections_use_defaults() {
        let config = Config::parse("[command]\ncmd_list_count = 3\n").unwrap();
        assert_eq!(config.command.cmd_list_count, 3);
        assert_eq!(config.command.cmd_pool_count, 2);
        assert_eq!(config.device.descriptor_set_capacity, DESCRIPTOR_SET_CAPACITY_DEFAULT);
        assert_eq!(config.demo.frame_count, 120);
    }

    #[test]
    fn full_config_parses() {
        let config = Config::parse(
            r#"
            [device]
            backend = "Headless"
            app_name = "viewer"
            validation_layers = false
            gpu_markers = false
            gpu_profiling = false
            descriptor_set_capacity = 512

            [debug]
            log_level = "debug"
            log_to_file = true
            log_file = "out.log"

            [demo]
            frame_count = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.device.backend_kind(), BackendKind::Headless);
        assert_eq!(config.device.descriptor_set_capacity, 512);
        assert_eq!(config.debug.level_filter(), log::LevelFilter::Debug);
        assert!(config.debug.log_to_file);
        assert_eq!(config.demo.frame_count, 8);
    }

    #[test]
    fn unknown_values_fall_back() {
        let config = Config::parse("[device]\nbackend = \"metal\"\n[debug]\nlog_level = \"loud\"\n").unwrap();
        assert_eq!(config.device.backend_kind(), BackendKind::Headless);
        assert_eq!(config.debug.level_filter(), log::LevelFilter::Info);
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(Config::parse("[device\nbackend = 1").is_err());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = Config::load_from_path("does/not/exist.toml").unwrap();
        assert_eq!(config.device.backend_kind(), BackendKind::Vulkan);
    }
}
