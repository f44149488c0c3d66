// Backend module - Vulkan abstraction layer
//
// Each type owns one group of GPU objects and exposes construct / destroy.
// Ordering between them is the caller's job (see `renderer.rs`).

pub mod commands;
pub mod device;
pub mod instance;
pub mod pipeline;
pub mod render_target;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use commands::CommandRecorder;
pub use device::VulkanDevice;
pub use instance::VulkanInstance;
pub use pipeline::Pipeline;
pub use render_target::RenderTargets;
pub use shader::ShaderBytecode;
pub use surface::Surface;
pub use swapchain::{Swapchain, SwapchainSupport};
pub use sync::{FrameSyncRing, PresentSemaphores};
