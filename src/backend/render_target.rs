// Render pass and per-image framebuffers
//
// One color attachment (the swapchain image), cleared on load, stored, and
// left in the presentable layout. Framebuffer count always equals the number
// of swapchain image views.

use ash::vk;

use super::Swapchain;
use crate::error::{RenderError, RenderResult};

pub struct RenderTargets {
    pub render_pass: vk::RenderPass,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl RenderTargets {
    pub fn new(device: &ash::Device, swapchain: &Swapchain) -> RenderResult<Self> {
        let render_pass = create_render_pass(device, swapchain.format)?;

        let framebuffers = match create_framebuffers(
            device,
            &swapchain.image_views,
            render_pass,
            swapchain.extent,
        ) {
            Ok(framebuffers) => framebuffers,
            Err(e) => {
                unsafe { device.destroy_render_pass(render_pass, None) };
                return Err(e);
            }
        };

        log::info!("Created {} framebuffers", framebuffers.len());

        Ok(Self {
            render_pass,
            framebuffers,
            format: swapchain.format,
            extent: swapchain.extent,
        })
    }

    /// Point the framebuffers at a rebuilt swapchain.
    ///
    /// The render pass is only recreated if the image format changed; the
    /// return value says whether it was, since a pipeline built against the
    /// old pass must then be rebuilt too.
    pub fn rebuild(&mut self, device: &ash::Device, swapchain: &Swapchain) -> RenderResult<bool> {
        unsafe { self.destroy_framebuffers(device) };

        let format_changed = swapchain.format != self.format;
        if format_changed {
            log::info!("Swapchain format changed to {:?}, recreating render pass", swapchain.format);
            let render_pass = create_render_pass(device, swapchain.format)?;
            unsafe { device.destroy_render_pass(self.render_pass, None) };
            self.render_pass = render_pass;
            self.format = swapchain.format;
        }

        self.framebuffers = create_framebuffers(
            device,
            &swapchain.image_views,
            self.render_pass,
            swapchain.extent,
        )?;
        self.extent = swapchain.extent;

        Ok(format_changed)
    }

    pub fn len(&self) -> usize {
        self.framebuffers.len()
    }

    unsafe fn destroy_framebuffers(&mut self, device: &ash::Device) {
        for framebuffer in self.framebuffers.drain(..) {
            device.destroy_framebuffer(framebuffer, None);
        }
    }

    /// # Safety
    /// No pending command buffer may reference the framebuffers, and every
    /// pipeline built against the render pass must already be destroyed.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        self.destroy_framebuffers(device);
        device.destroy_render_pass(self.render_pass, None);
        self.render_pass = vk::RenderPass::null();
    }
}

/// The swapchain image: clear on load, keep on store, end up presentable.
pub fn color_attachment(format: vk::Format) -> vk::AttachmentDescription {
    vk::AttachmentDescription::builder()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .build()
}

/// The acquire semaphore only says the image is available, not that its
/// layout transition may start, so the clear waits on color output too.
pub fn external_dependency() -> vk::SubpassDependency {
    vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
        .build()
}

/// Create a render pass with a single color attachment and a single subpass
pub fn create_render_pass(device: &ash::Device, format: vk::Format) -> RenderResult<vk::RenderPass> {
    let color_attachment_ref = vk::AttachmentReference::builder()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();

    let color_attachments = [color_attachment_ref];
    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_attachments)
        .build();

    let attachments = [color_attachment(format)];
    let subpasses = [subpass];
    let dependencies = [external_dependency()];

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    unsafe { device.create_render_pass(&render_pass_info, None) }
        .map_err(RenderError::RenderPassCreation)
}

/// Attachment list of each framebuffer: framebuffer i binds view i alone.
pub fn framebuffer_attachments(image_views: &[vk::ImageView]) -> Vec<[vk::ImageView; 1]> {
    image_views.iter().map(|&view| [view]).collect()
}

/// Create one framebuffer per swapchain image view
pub fn create_framebuffers(
    device: &ash::Device,
    image_views: &[vk::ImageView],
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
) -> RenderResult<Vec<vk::Framebuffer>> {
    let attachment_sets = framebuffer_attachments(image_views);
    let mut framebuffers = Vec::with_capacity(attachment_sets.len());

    for attachments in &attachment_sets {
        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        match unsafe { device.create_framebuffer(&framebuffer_info, None) } {
            Ok(framebuffer) => framebuffers.push(framebuffer),
            Err(e) => {
                for framebuffer in framebuffers {
                    unsafe { device.destroy_framebuffer(framebuffer, None) };
                }
                return Err(RenderError::FramebufferCreation(e));
            }
        }
    }

    Ok(framebuffers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn test_color_attachment_clears_and_presents() {
        let attachment = color_attachment(vk::Format::B8G8R8A8_UNORM);

        assert_eq!(attachment.format, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(attachment.samples, vk::SampleCountFlags::TYPE_1);
        assert_eq!(attachment.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(attachment.store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(attachment.initial_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(attachment.final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn test_one_framebuffer_per_view() {
        let views: Vec<vk::ImageView> = (1..=3u64).map(vk::ImageView::from_raw).collect();

        let sets = framebuffer_attachments(&views);

        assert_eq!(sets.len(), views.len());
        for (set, view) in sets.iter().zip(&views) {
            assert_eq!(set, &[*view]);
        }
        assert!(framebuffer_attachments(&[]).is_empty());
    }

    #[test]
    fn test_dependency_waits_on_color_output() {
        let dependency = external_dependency();

        assert_eq!(dependency.src_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(dependency.dst_subpass, 0);
        assert_eq!(dependency.src_stage_mask, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(dependency.dst_stage_mask, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(dependency.dst_access_mask, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);
    }
}
