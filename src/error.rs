use thiserror::Error;
use vulkanalia::vk;

/// Fatal failures raised by the engine itself (as opposed to Vulkan error codes).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Validation layer requested but not supported.")]
    ValidationUnavailable,
    #[error("Failed to find GPUs with Vulkan support.")]
    NoVulkanDevice,
    #[error("Failed to find a suitable GPU.")]
    NoSuitableDevice,
    #[error("Failed to find suitable memory type (filter {type_bits:#b}, {properties:?}).")]
    NoMemoryType {
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    },
    #[error("Unsupported image layout transition ({0:?} -> {1:?}).")]
    UnsupportedLayoutTransition(vk::ImageLayout, vk::ImageLayout),
    #[error("Failed to find a supported depth format.")]
    NoDepthFormat,
    #[error("Surface offers no formats.")]
    NoSurfaceFormat,
    #[error("Unsupported texture color type {0:?}.")]
    UnsupportedTexture(png::ColorType),
    #[error("Shader compiler unavailable.")]
    ShaderCompiler,
}
