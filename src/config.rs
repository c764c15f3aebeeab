use std::path::PathBuf;

use anyhow::{anyhow, Result};
use vulkanalia::prelude::v1_0::*;

/// Initial window size.
pub const WIDTH: u32 = 800;
pub const HEIGHT: u32 = 600;

/// The name of the validation layers & extensions.
pub const VALIDATION_LAYER: vk::ExtensionName = vk::ExtensionName::from_bytes(b"VK_LAYER_KHRONOS_validation");
pub const DEVICE_EXTENSIONS: &[vk::ExtensionName] = &[vk::KHR_SWAPCHAIN_EXTENSION.name];

/// Only requested on macOS, where MoltenVK is a portability implementation.
pub const PORTABILITY_EXTENSIONS: &[vk::ExtensionName] = &[vk::KHR_PORTABILITY_SUBSET_EXTENSION.name];

/// Max frames in flight to be presented.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// The cube spins about +Z at 90 degrees per second.
pub const SPIN_AXIS: [f32; 3] = [0.0, 0.0, 1.0];
pub const SPIN_RATE_DEGREES: f32 = 90.0;
pub const CAMERA_EYE: [f32; 3] = [2.0, 2.0, 2.0];

const DEFAULT_FRAME_TIMEOUT_MS: u64 = 1_000;

/// Runtime settings handed to every component at construction.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub validation: bool,
    pub title: String,
    pub width: u32,
    pub height: u32,
    /// RGBA or RGB PNG; a checkerboard is generated when unset.
    pub texture: Option<PathBuf>,
    /// Nanoseconds to wait on a frame fence or for an image before recreating.
    pub frame_timeout: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            validation: cfg!(debug_assertions),
            title: "Cube Engine (Rust)".to_string(),
            width: WIDTH,
            height: HEIGHT,
            texture: None,
            frame_timeout: DEFAULT_FRAME_TIMEOUT_MS * 1_000_000,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads overrides through `lookup`, falling back to the defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(value) = lookup("CUBE_VALIDATION") {
            config.validation = parse_flag(&value)
                .ok_or_else(|| anyhow!("CUBE_VALIDATION must be 0/1/true/false, got `{}`.", value))?;
        }
        if let Some(path) = lookup("CUBE_TEXTURE").filter(|p| !p.is_empty()) {
            config.texture = Some(PathBuf::from(path));
        }
        if let Some(value) = lookup("CUBE_FRAME_TIMEOUT_MS") {
            let ms: u64 = value
                .trim()
                .parse()
                .map_err(|e| anyhow!("CUBE_FRAME_TIMEOUT_MS `{}`: {}", value, e))?;
            config.frame_timeout = ms.saturating_mul(1_000_000);
        }
        Ok(config)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}
