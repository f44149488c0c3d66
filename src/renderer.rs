// =============================================================================
// RENDERER - owner of every GPU object
// =============================================================================
//
// Construction runs in dependency order, teardown in the exact reverse:
//
//   instance -> surface -> device -> swapchain (+ views) -> render targets
//            -> pipeline -> command buffers -> frame sync ring
//            -> per-image present semaphores
//
// The renderer is also the Vulkan side of the frame loop: it implements
// `FrameDriver`, so `FrameSynchronizer` decides *when* to acquire, submit,
// present and rebuild, and this file decides *how*.
//
// =============================================================================

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::backend::swapchain::choose_extent;
use crate::backend::{
    CommandRecorder, FrameSyncRing, Pipeline, PresentSemaphores, RenderTargets, ShaderBytecode,
    Surface, Swapchain, SwapchainSupport, VulkanDevice, VulkanInstance,
};
use crate::config::Config;
use crate::error::{RenderError, RenderResult};
use crate::frame::{AcquireOutcome, FrameDriver, PresentOutcome, SwapchainState};

/// Everything the renderer needs from configuration.
#[derive(Debug, Clone)]
pub struct RendererSettings {
    pub app_name: String,
    pub enable_validation: bool,
    /// Window size in pixels; only used when the surface leaves the extent to us.
    pub extent: vk::Extent2D,
    pub clear_color: [f32; 4],
    pub frames_in_flight: usize,
}

impl RendererSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            app_name: config.window.title.clone(),
            enable_validation: config.debug.validation_layers,
            extent: vk::Extent2D {
                width: config.window.width,
                height: config.window.height,
            },
            clear_color: config.graphics.clear_color,
            frames_in_flight: config.frames_in_flight(),
        }
    }
}

pub struct Renderer {
    instance: VulkanInstance,
    surface: Surface,
    device: VulkanDevice,
    swapchain: Swapchain,
    render_targets: RenderTargets,
    pipeline: Pipeline,
    shaders: ShaderBytecode,
    commands: CommandRecorder,
    sync: FrameSyncRing,
    present_semaphores: PresentSemaphores,
    requested_extent: vk::Extent2D,
}

impl Renderer {
    /// Build the whole chain for one window.
    ///
    /// The window behind the handles must outlive the renderer.
    pub fn new(
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        settings: &RendererSettings,
        shaders: ShaderBytecode,
    ) -> RenderResult<Self> {
        log::info!("Initializing Vulkan...");

        let instance =
            VulkanInstance::new(&settings.app_name, settings.enable_validation, display_handle)?;
        let surface = Surface::new(&instance, display_handle, window_handle)?;
        let (device, candidate) = VulkanDevice::new(&instance, &surface)?;

        let swapchain = Swapchain::new(
            &instance,
            &device,
            &surface,
            &candidate.support,
            settings.extent,
            vk::SwapchainKHR::null(),
        )?;

        let render_targets = RenderTargets::new(&device.device, &swapchain)?;
        let pipeline = Pipeline::new(
            &device.device,
            render_targets.render_pass,
            swapchain.extent,
            &shaders,
        )?;

        let mut commands =
            CommandRecorder::new(&device.device, device.graphics_family, settings.clear_color)?;
        commands.record(&device.device, &render_targets, &pipeline)?;

        let sync = FrameSyncRing::new(&device.device, settings.frames_in_flight)?;
        let present_semaphores = PresentSemaphores::new(&device.device, swapchain.image_count())?;

        log::info!(
            "Vulkan initialized: {} images, {} framebuffers, {} command buffers, {} present semaphores",
            swapchain.image_count(),
            render_targets.len(),
            commands.len(),
            present_semaphores.len()
        );

        Ok(Self {
            instance,
            surface,
            device,
            swapchain,
            render_targets,
            pipeline,
            shaders,
            commands,
            sync,
            present_semaphores,
            requested_extent: settings.extent,
        })
    }

    pub fn swapchain_extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }
}

/// The extent a rebuild would use, or `None` while the surface has no area.
pub fn rebuild_extent(
    caps: &vk::SurfaceCapabilitiesKHR,
    requested: vk::Extent2D,
) -> Option<vk::Extent2D> {
    let extent = choose_extent(caps, requested);
    (extent.width > 0 && extent.height > 0).then_some(extent)
}

impl FrameDriver for Renderer {
    fn frames_in_flight(&self) -> usize {
        self.sync.len()
    }

    fn image_count(&self) -> usize {
        self.swapchain.image_count()
    }

    fn wait_for_slot(&mut self, slot: usize) -> RenderResult<()> {
        let fences = [self.sync.slot(slot).in_flight_fence];
        unsafe { self.device.device.wait_for_fences(&fences, true, u64::MAX) }
            .map_err(RenderError::DeviceWait)
    }

    fn acquire(&mut self, slot: usize) -> RenderResult<AcquireOutcome> {
        let semaphore = self.sync.slot(slot).image_available;
        self.swapchain.acquire_next_image(u64::MAX, semaphore)
    }

    fn submit(&mut self, slot: usize, image_index: u32) -> RenderResult<()> {
        let frame = self.sync.slot(slot);
        let command_buffer = self
            .commands
            .buffer_for(image_index)
            .ok_or(RenderError::QueueSubmit(vk::Result::ERROR_UNKNOWN))?;

        let wait_semaphores = [frame.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [command_buffer];
        let render_finished = self
            .present_semaphores
            .get(image_index)
            .ok_or(RenderError::QueueSubmit(vk::Result::ERROR_UNKNOWN))?;
        let signal_semaphores = [render_finished];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe {
            // Only unsignal right before the submit that signals it again.
            self.device
                .device
                .reset_fences(&[frame.in_flight_fence])
                .map_err(RenderError::QueueSubmit)?;

            self.device
                .device
                .queue_submit(self.device.graphics_queue, &[submit_info], frame.in_flight_fence)
                .map_err(RenderError::QueueSubmit)
        }
    }

    fn present(&mut self, _slot: usize, image_index: u32) -> RenderResult<PresentOutcome> {
        let render_finished = self
            .present_semaphores
            .get(image_index)
            .ok_or(RenderError::Present(vk::Result::ERROR_UNKNOWN))?;
        let wait = [render_finished];
        self.swapchain.present(self.device.present_queue, image_index, &wait)
    }

    fn rebuild_swapchain(&mut self) -> RenderResult<SwapchainState> {
        self.device.wait_idle()?;

        let support = SwapchainSupport::query(&self.surface, self.device.physical_device)?;
        let Some(extent) = rebuild_extent(&support.capabilities, self.requested_extent) else {
            log::debug!("Surface has zero area, deferring swapchain rebuild");
            return Ok(SwapchainState::NeedsRebuild);
        };

        log::info!("Rebuilding swapchain for {}x{}", extent.width, extent.height);

        let device = &self.device.device;
        let rebuilt = Swapchain::new(
            &self.instance,
            &self.device,
            &self.surface,
            &support,
            self.requested_extent,
            self.swapchain.handle,
        )?;
        let mut retired = std::mem::replace(&mut self.swapchain, rebuilt);
        self.present_semaphores.resize(device, self.swapchain.image_count())?;

        // Framebuffers still reference the retired views; drop them first.
        let format_changed = self.render_targets.rebuild(device, &self.swapchain)?;
        unsafe { retired.destroy(device) };

        if format_changed || self.pipeline.extent != self.swapchain.extent {
            self.pipeline.rebuild(
                device,
                self.render_targets.render_pass,
                self.swapchain.extent,
                &self.shaders,
            )?;
        }

        self.commands.record(device, &self.render_targets, &self.pipeline)?;

        Ok(SwapchainState::Valid)
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.requested_extent = vk::Extent2D { width, height };
    }

    fn wait_idle(&mut self) -> RenderResult<()> {
        self.device.wait_idle()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        if let Err(e) = self.device.wait_idle() {
            log::error!("Device wait before teardown failed: {}", e);
        }

        let device = &self.device.device;
        unsafe {
            self.present_semaphores.destroy(device);
            self.sync.destroy(device);
            self.commands.destroy(device);
            self.pipeline.destroy(device);
            self.render_targets.destroy(device);
            self.swapchain.destroy(device);
            self.device.destroy();
            self.surface.destroy();
            self.instance.destroy();
        }

        log::info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::commands::allocate_info;
    use crate::backend::device::tests::suitable_candidate;
    use crate::backend::device::{required_device_extensions, select_first_suitable};
    use crate::backend::render_target::framebuffer_attachments;
    use crate::backend::swapchain::{image_sharing, SwapchainConfig};
    use crate::frame::tests::{Call, MockDriver, MockWindow};
    use crate::frame::FrameSynchronizer;
    use ash::vk::Handle;

    fn caps(current: vk::Extent2D) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            current_extent: current,
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D { width: 4096, height: 4096 },
            ..Default::default()
        }
    }

    #[test]
    fn test_rebuild_deferred_while_minimized() {
        let requested = vk::Extent2D { width: 800, height: 600 };
        let minimized = caps(vk::Extent2D { width: 0, height: 0 });

        assert_eq!(rebuild_extent(&minimized, requested), None);
    }

    #[test]
    fn test_rebuild_follows_window_when_surface_allows() {
        let requested = vk::Extent2D { width: 1024, height: 768 };
        let free = caps(vk::Extent2D { width: u32::MAX, height: u32::MAX });

        assert_eq!(rebuild_extent(&free, requested), Some(requested));
    }

    #[test]
    fn test_settings_from_config() {
        let config = Config::parse(
            "[window]\nwidth = 640\nheight = 480\n[graphics]\nmax_frames_in_flight = 0\n",
        )
        .unwrap();

        let settings = RendererSettings::from_config(&config);

        assert_eq!(settings.extent, vk::Extent2D { width: 640, height: 480 });
        assert_eq!(settings.frames_in_flight, 1);
        assert_eq!(settings.clear_color, [0.0, 0.0, 0.0, 1.0]);
    }

    /// One shared-family device, BGRA8/sRGB, FIFO only, 2..=2 images at
    /// 800x600: setup yields 2 images and the loop runs until close.
    #[test]
    fn test_single_device_scenario_runs_to_close() {
        let required = required_device_extensions();
        let candidate = select_first_suitable(vec![Ok(suitable_candidate(1))], &required).unwrap();

        let config = SwapchainConfig::choose(
            &candidate.support,
            vk::Extent2D { width: 800, height: 600 },
        );
        assert_eq!(config.image_count, 2);
        assert_eq!(config.extent, vk::Extent2D { width: 800, height: 600 });
        assert_eq!(config.present_mode, vk::PresentModeKHR::FIFO);

        let (graphics, present) = candidate.queue_families.resolved().unwrap();
        assert_eq!(image_sharing(graphics, present).0, vk::SharingMode::EXCLUSIVE);

        // Counts flow view -> framebuffer -> command buffer through the same
        // helpers the GPU path uses.
        let views: Vec<vk::ImageView> =
            (1..=config.image_count as u64).map(vk::ImageView::from_raw).collect();
        let framebuffers = framebuffer_attachments(&views);
        let alloc = allocate_info(vk::CommandPool::null(), framebuffers.len());
        assert_eq!(views.len(), 2);
        assert_eq!(framebuffers.len(), 2);
        assert_eq!(alloc.command_buffer_count, 2);

        let mut driver = MockDriver::new(2, views.len());
        driver.command_buffers = alloc.command_buffer_count as usize;

        let mut window = MockWindow::closing_after(6);
        let mut sync = FrameSynchronizer::for_driver(&driver);

        sync.run(&mut driver, &mut window).unwrap();

        assert_eq!(sync.frames_presented(), 6);
        assert_eq!(driver.count(|c| *c == Call::Rebuild), 0);
        assert_eq!(driver.calls.last(), Some(&Call::WaitIdle));
    }
}
