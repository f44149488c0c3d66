// Swapchain - the chain of presentable images
//
// Negotiates format, present mode, extent and image count against what the
// surface reports, then owns the chain of presentable images and one view
// per image. Views are destroyed together with the chain, never separately.

use ash::extensions::khr;
use ash::vk;

use super::{Surface, VulkanDevice, VulkanInstance};
use crate::error::{RenderError, RenderResult};
use crate::frame::{AcquireOutcome, PresentOutcome};

/// 8-bit BGRA in the non-linear sRGB color space.
pub const PREFERRED_SURFACE_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_UNORM,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// Surface facts for one physical device, cached at selection time.
#[derive(Debug, Clone, Default)]
pub struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupport {
    pub fn query(surface: &Surface, physical_device: vk::PhysicalDevice) -> RenderResult<Self> {
        Ok(Self {
            capabilities: surface.capabilities(physical_device)?,
            formats: surface.formats(physical_device)?,
            present_modes: surface.present_modes(physical_device)?,
        })
    }
}

/// Everything decided before the swapchain object is created.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainConfig {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
}

impl SwapchainConfig {
    pub fn choose(support: &SwapchainSupport, requested: vk::Extent2D) -> Self {
        Self {
            surface_format: choose_surface_format(&support.formats),
            present_mode: choose_present_mode(&support.present_modes),
            extent: choose_extent(&support.capabilities, requested),
            image_count: choose_image_count(&support.capabilities),
        }
    }
}

pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    // A lone UNDEFINED entry means the surface has no preference.
    if let [only] = formats {
        if only.format == vk::Format::UNDEFINED {
            return PREFERRED_SURFACE_FORMAT;
        }
    }

    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == PREFERRED_SURFACE_FORMAT.format
                && f.color_space == PREFERRED_SURFACE_FORMAT.color_space
        })
        .or_else(|| formats.first().copied())
        .unwrap_or(PREFERRED_SURFACE_FORMAT)
}

/// MAILBOX if offered, else IMMEDIATE if offered, else FIFO (always supported).
pub fn choose_present_mode(modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    let mut best = vk::PresentModeKHR::FIFO;

    for &mode in modes {
        if mode == vk::PresentModeKHR::MAILBOX {
            return mode;
        } else if mode == vk::PresentModeKHR::IMMEDIATE {
            best = mode;
        }
    }

    best
}

pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, requested: vk::Extent2D) -> vk::Extent2D {
    // u32::MAX means the surface size follows whatever we ask for.
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }

    vk::Extent2D {
        width: caps
            .min_image_extent
            .width
            .max(caps.max_image_extent.width.min(requested.width)),
        height: caps
            .min_image_extent
            .height
            .max(caps.max_image_extent.height.min(requested.height)),
    }
}

/// One more than the minimum, capped by the maximum (0 = unbounded).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 && count > caps.max_image_count {
        caps.max_image_count
    } else {
        count
    }
}

/// Images shared between distinct graphics and present families need concurrent sharing.
pub fn image_sharing(graphics_family: u32, present_family: u32) -> (vk::SharingMode, Vec<u32>) {
    if graphics_family != present_family {
        (vk::SharingMode::CONCURRENT, vec![graphics_family, present_family])
    } else {
        (vk::SharingMode::EXCLUSIVE, vec![])
    }
}

pub struct Swapchain {
    pub loader: khr::Swapchain,
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    /// Build the chain and its views.
    ///
    /// `old_swapchain` may be a retiring chain on the same surface (or null);
    /// the caller still destroys it afterwards.
    pub fn new(
        instance: &VulkanInstance,
        device: &VulkanDevice,
        surface: &Surface,
        support: &SwapchainSupport,
        requested: vk::Extent2D,
        old_swapchain: vk::SwapchainKHR,
    ) -> RenderResult<Self> {
        let config = SwapchainConfig::choose(support, requested);

        log::info!(
            "Creating swapchain: {}x{}, {:?}/{:?}, {:?}, {} images requested",
            config.extent.width,
            config.extent.height,
            config.surface_format.format,
            config.surface_format.color_space,
            config.present_mode,
            config.image_count
        );

        let (sharing_mode, family_indices) =
            image_sharing(device.graphics_family, device.present_family);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.handle)
            .min_image_count(config.image_count)
            .image_format(config.surface_format.format)
            .image_color_space(config.surface_format.color_space)
            .image_extent(config.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&family_indices)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(config.present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let loader = khr::Swapchain::new(&instance.instance, &device.device);

        let handle = unsafe { loader.create_swapchain(&create_info, None) }
            .map_err(RenderError::SwapchainCreation)?;

        // The driver may hand back more images than requested.
        let images = match unsafe { loader.get_swapchain_images(handle) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { loader.destroy_swapchain(handle, None) };
                return Err(RenderError::SwapchainCreation(e));
            }
        };

        let image_views =
            match create_image_views(&device.device, &images, config.surface_format.format) {
                Ok(views) => views,
                Err(e) => {
                    unsafe { loader.destroy_swapchain(handle, None) };
                    return Err(e);
                }
            };

        log::info!("Created swapchain with {} images", images.len());

        Ok(Self {
            loader,
            handle,
            images,
            image_views,
            format: config.surface_format.format,
            extent: config.extent,
        })
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Ask for the next image; a stale chain is an outcome, not an error.
    pub fn acquire_next_image(
        &self,
        timeout: u64,
        semaphore: vk::Semaphore,
    ) -> RenderResult<AcquireOutcome> {
        let result = unsafe {
            self.loader
                .acquire_next_image(self.handle, timeout, semaphore, vk::Fence::null())
        };

        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Ready { image_index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(RenderError::ImageAcquire(e)),
        }
    }

    /// Queue `image_index` for display once `wait_semaphores` fire.
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> RenderResult<PresentOutcome> {
        let swapchains = [self.handle];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.loader.queue_present(queue, &present_info) };

        match result {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(RenderError::Present(e)),
        }
    }

    /// Destroy the views, then the chain.
    ///
    /// # Safety
    /// No framebuffer referencing the views and no pending GPU work on the images may remain.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for view in self.image_views.drain(..) {
            device.destroy_image_view(view, None);
        }
        self.loader.destroy_swapchain(self.handle, None);
        self.images.clear();
        self.handle = vk::SwapchainKHR::null();
    }
}

/// 2D color view per image, identity swizzle, one mip level, one layer.
fn create_image_views(
    device: &ash::Device,
    images: &[vk::Image],
    format: vk::Format,
) -> RenderResult<Vec<vk::ImageView>> {
    let mut views = Vec::with_capacity(images.len());

    for &image in images {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        match unsafe { device.create_image_view(&create_info, None) } {
            Ok(view) => views.push(view),
            Err(e) => {
                for view in views {
                    unsafe { device.destroy_image_view(view, None) };
                }
                return Err(RenderError::ImageViewCreation(e));
            }
        }
    }

    Ok(views)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn caps(min: u32, max: u32, current: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D { width: current.0, height: current.1 },
            min_image_extent: vk::Extent2D { width: 100, height: 100 },
            max_image_extent: vk::Extent2D { width: 2000, height: 2000 },
            ..Default::default()
        }
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR { format, color_space }
    }

    pub(crate) fn key(f: vk::SurfaceFormatKHR) -> (vk::Format, vk::ColorSpaceKHR) {
        (f.format, f.color_space)
    }

    #[test]
    fn test_undefined_format_means_preferred() {
        let formats = [format(vk::Format::UNDEFINED, vk::ColorSpaceKHR::SRGB_NONLINEAR)];
        assert_eq!(key(choose_surface_format(&formats)), key(PREFERRED_SURFACE_FORMAT));
    }

    #[test]
    fn test_preferred_format_found_anywhere_in_list() {
        let formats = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT),
            PREFERRED_SURFACE_FORMAT,
        ];
        assert_eq!(key(choose_surface_format(&formats)), key(PREFERRED_SURFACE_FORMAT));
    }

    #[test]
    fn test_format_falls_back_to_first() {
        let first = format(vk::Format::R8G8B8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR);
        let formats = [first, format(vk::Format::R16G16B16A16_SFLOAT, vk::ColorSpaceKHR::SRGB_NONLINEAR)];
        assert_eq!(key(choose_surface_format(&formats)), key(first));
    }

    #[test]
    fn test_mailbox_wins_regardless_of_position() {
        use vk::PresentModeKHR as P;
        assert_eq!(choose_present_mode(&[P::FIFO, P::IMMEDIATE, P::MAILBOX]), P::MAILBOX);
        assert_eq!(choose_present_mode(&[P::MAILBOX, P::IMMEDIATE]), P::MAILBOX);
    }

    #[test]
    fn test_immediate_without_mailbox() {
        use vk::PresentModeKHR as P;
        assert_eq!(choose_present_mode(&[P::FIFO, P::IMMEDIATE]), P::IMMEDIATE);
    }

    #[test]
    fn test_fifo_by_default() {
        use vk::PresentModeKHR as P;
        assert_eq!(choose_present_mode(&[P::FIFO_RELAXED, P::FIFO]), P::FIFO);
        assert_eq!(choose_present_mode(&[]), P::FIFO);
    }

    #[test]
    fn test_extent_within_bounds_unchanged() {
        let c = caps(2, 3, (u32::MAX, u32::MAX));
        assert_eq!(choose_extent(&c, extent(800, 600)), extent(800, 600));
    }

    #[test]
    fn test_extent_clamped_to_minimum() {
        let c = caps(2, 3, (u32::MAX, u32::MAX));
        assert_eq!(choose_extent(&c, extent(50, 50)), extent(100, 100));
    }

    #[test]
    fn test_extent_clamped_to_maximum_per_component() {
        let c = caps(2, 3, (u32::MAX, u32::MAX));
        assert_eq!(choose_extent(&c, extent(4000, 500)), extent(2000, 500));
    }

    #[test]
    fn test_current_extent_used_verbatim() {
        let c = caps(2, 3, (1024, 768));
        assert_eq!(choose_extent(&c, extent(800, 600)), extent(1024, 768));
    }

    #[test]
    fn test_image_count() {
        assert_eq!(choose_image_count(&caps(1, 1, (800, 600))), 1);
        assert_eq!(choose_image_count(&caps(2, 0, (800, 600))), 3);
        assert_eq!(choose_image_count(&caps(2, 2, (800, 600))), 2);
        assert_eq!(choose_image_count(&caps(2, 8, (800, 600))), 3);
    }

    #[test]
    fn test_sharing_mode() {
        assert_eq!(image_sharing(0, 0), (vk::SharingMode::EXCLUSIVE, vec![]));
        assert_eq!(image_sharing(0, 2), (vk::SharingMode::CONCURRENT, vec![0, 2]));
    }

    #[test]
    fn test_config_from_support() {
        let support = SwapchainSupport {
            capabilities: caps(2, 2, (800, 600)),
            formats: vec![PREFERRED_SURFACE_FORMAT],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };

        let config = SwapchainConfig::choose(&support, extent(1280, 720));

        assert_eq!(key(config.surface_format), key(PREFERRED_SURFACE_FORMAT));
        assert_eq!(config.present_mode, vk::PresentModeKHR::FIFO);
        assert_eq!(config.extent, extent(800, 600));
        assert_eq!(config.image_count, 2);
    }
}
