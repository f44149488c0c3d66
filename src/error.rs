// Error taxonomy for the rendering context
//
// Every fallible GPU operation maps onto one of these. All of them are fatal
// during setup; the frame loop only ever sees the last few.

use ash::vk;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Failed to load the Vulkan library: {0}")]
    LibraryLoad(String),

    #[error("Required instance extension not supported: {0}")]
    ExtensionUnsupported(String),

    #[error("Validation layer requested but not available: {0}")]
    ValidationLayerUnavailable(String),

    #[error("Failed to create Vulkan instance: {0:?}")]
    InstanceCreation(vk::Result),

    #[error("Failed to create window surface: {0}")]
    SurfaceCreation(String),

    #[error("Failed to query surface support: {0:?}")]
    SurfaceQuery(vk::Result),

    #[error("No suitable GPU found: {0}")]
    NoSuitableDevice(String),

    #[error("Failed to create logical device: {0:?}")]
    LogicalDeviceCreation(vk::Result),

    #[error("Failed to create swapchain: {0:?}")]
    SwapchainCreation(vk::Result),

    #[error("Failed to create image view: {0:?}")]
    ImageViewCreation(vk::Result),

    #[error("Failed to create render pass: {0:?}")]
    RenderPassCreation(vk::Result),

    #[error("Invalid shader bytecode: {0}")]
    ShaderLoad(String),

    #[error("Failed to create shader module: {0:?}")]
    ShaderModuleCreation(vk::Result),

    #[error("Failed to create pipeline layout: {0:?}")]
    PipelineLayoutCreation(vk::Result),

    #[error("Failed to create graphics pipeline: {0:?}")]
    PipelineCreation(vk::Result),

    #[error("Failed to create framebuffer: {0:?}")]
    FramebufferCreation(vk::Result),

    #[error("Command pool or buffer operation failed: {0:?}")]
    CommandPoolOrBuffer(vk::Result),

    #[error("Failed to create semaphore: {0:?}")]
    SemaphoreCreation(vk::Result),

    #[error("Failed to create fence: {0:?}")]
    FenceCreation(vk::Result),

    #[error("Failed to acquire swapchain image: {0:?}")]
    ImageAcquire(vk::Result),

    #[error("Failed to submit to graphics queue: {0:?}")]
    QueueSubmit(vk::Result),

    #[error("Failed to present swapchain image: {0:?}")]
    Present(vk::Result),

    #[error("Failed waiting on the device: {0:?}")]
    DeviceWait(vk::Result),
}

pub type RenderResult<T> = Result<T, RenderError>;
