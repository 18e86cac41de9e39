// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub shaders: ShaderConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Shaderbox".to_string(),
            width: 900,
            height: 900,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub msaa_samples: u32,
    pub clear_color: [f32; 4],
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "fifo".to_string(),
            msaa_samples: 8,
            clear_color: [0.2, 0.0, 0.3, 0.0],
        }
    }
}

/// Shader source locations, watched for changes at runtime
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub vertex: String,
    pub fragment: String,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            vertex: "shaders/fullscreen.vert".to_string(),
            fragment: "shaders/scene.frag".to_string(),
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            show_fps: true,
        }
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

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Get present mode as Vulkan enum. FIFO is the fallback because it is
    /// the one mode every device must support.
    pub fn get_present_mode(&self) -> ash::vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => ash::vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => ash::vk::PresentModeKHR::MAILBOX,
            "fifo" => ash::vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => ash::vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.graphics.present_mode
                );
                ash::vk::PresentModeKHR::FIFO
            }
        }
    }

    /// Get the MSAA sample count as Vulkan enum
    pub fn get_sample_count(&self) -> ash::vk::SampleCountFlags {
        match self.graphics.msaa_samples {
            1 => ash::vk::SampleCountFlags::TYPE_1,
            2 => ash::vk::SampleCountFlags::TYPE_2,
            4 => ash::vk::SampleCountFlags::TYPE_4,
            8 => ash::vk::SampleCountFlags::TYPE_8,
            other => {
                log::warn!("Unsupported MSAA sample count {}, defaulting to 8", other);
                ash::vk::SampleCountFlags::TYPE_8
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_startup_scenario() {
        let config = Config::default();
        assert_eq!(config.window.width, 900);
        assert_eq!(config.window.height, 900);
        assert_eq!(config.get_present_mode(), ash::vk::PresentModeKHR::FIFO);
        assert_eq!(config.get_sample_count(), ash::vk::SampleCountFlags::TYPE_8);
    }

    #[test]
    fn partial_toml_keeps_section_defaults() {
        let config: Config = toml::from_str(
            r#"
            [window]
            width = 1280
            height = 720

            [graphics]
            present_mode = "mailbox"
            "#,
        )
        .unwrap();

        assert_eq!(config.window.width, 1280);
        assert_eq!(config.window.title, "Shaderbox");
        assert_eq!(config.get_present_mode(), ash::vk::PresentModeKHR::MAILBOX);
        assert_eq!(config.graphics.msaa_samples, 8);
        assert_eq!(config.shaders.fragment, "shaders/scene.frag");
    }

    #[test]
    fn unknown_present_mode_falls_back_to_fifo() {
        let config: Config = toml::from_str(
            r#"
            [graphics]
            present_mode = "adaptive"
            "#,
        )
        .unwrap();
        assert_eq!(config.get_present_mode(), ash::vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn unsupported_sample_count_falls_back_to_eight() {
        let config: Config = toml::from_str(
            r#"
            [graphics]
            msaa_samples = 16
            "#,
        )
        .unwrap();
        assert_eq!(config.get_sample_count(), ash::vk::SampleCountFlags::TYPE_8);
    }
}
