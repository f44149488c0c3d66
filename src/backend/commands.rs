// Command pool and the per-image command buffers
//
// Recording happens once per swapchain (re)build, never per frame: buffer i
// always draws into framebuffer i and is resubmitted unchanged.

use ash::vk;

use super::{Pipeline, RenderTargets};
use crate::error::{RenderError, RenderResult};

/// Vertices emitted by the vertex shader for the single triangle.
pub const TRIANGLE_VERTEX_COUNT: u32 = 3;

pub struct CommandRecorder {
    pub pool: vk::CommandPool,
    pub buffers: Vec<vk::CommandBuffer>,
    clear_color: [f32; 4],
}

impl CommandRecorder {
    pub fn new(device: &ash::Device, queue_family: u32, clear_color: [f32; 4]) -> RenderResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder().queue_family_index(queue_family);

        let pool = unsafe { device.create_command_pool(&pool_info, None) }
            .map_err(RenderError::CommandPoolOrBuffer)?;

        Ok(Self {
            pool,
            buffers: Vec::new(),
            clear_color,
        })
    }

    /// (Re)allocate one buffer per framebuffer and record the triangle into each.
    pub fn record(
        &mut self,
        device: &ash::Device,
        targets: &RenderTargets,
        pipeline: &Pipeline,
    ) -> RenderResult<()> {
        unsafe { self.free_buffers(device) };

        let alloc_info = allocate_info(self.pool, targets.framebuffers.len());

        self.buffers = unsafe { device.allocate_command_buffers(&alloc_info) }
            .map_err(RenderError::CommandPoolOrBuffer)?;

        let clear_values = clear_values(self.clear_color);

        for (&cmd, &framebuffer) in self.buffers.iter().zip(&targets.framebuffers) {
            record_triangle(
                device,
                cmd,
                targets.render_pass,
                framebuffer,
                targets.extent,
                pipeline.pipeline,
                &clear_values,
            )?;
        }

        log::info!("Recorded {} command buffers", self.buffers.len());
        Ok(())
    }

    pub fn buffer_for(&self, image_index: u32) -> Option<vk::CommandBuffer> {
        self.buffers.get(image_index as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    unsafe fn free_buffers(&mut self, device: &ash::Device) {
        if !self.buffers.is_empty() {
            device.free_command_buffers(self.pool, &self.buffers);
            self.buffers.clear();
        }
    }

    /// Destroying the pool frees its buffers.
    ///
    /// # Safety
    /// None of the buffers may be pending execution.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        self.buffers.clear();
        device.destroy_command_pool(self.pool, None);
        self.pool = vk::CommandPool::null();
    }
}

/// Primary buffers, one per framebuffer.
pub fn allocate_info(pool: vk::CommandPool, framebuffer_count: usize) -> vk::CommandBufferAllocateInfo {
    vk::CommandBufferAllocateInfo::builder()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(framebuffer_count as u32)
        .build()
}

pub fn clear_values(color: [f32; 4]) -> [vk::ClearValue; 1] {
    [vk::ClearValue {
        color: vk::ClearColorValue { float32: color },
    }]
}

fn record_triangle(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    render_pass: vk::RenderPass,
    framebuffer: vk::Framebuffer,
    extent: vk::Extent2D,
    pipeline: vk::Pipeline,
    clear_values: &[vk::ClearValue],
) -> RenderResult<()> {
    // Resubmitted every frame, possibly while an earlier submission is pending.
    let begin_info = vk::CommandBufferBeginInfo::builder()
        .flags(vk::CommandBufferUsageFlags::SIMULTANEOUS_USE);

    let render_pass_info = vk::RenderPassBeginInfo::builder()
        .render_pass(render_pass)
        .framebuffer(framebuffer)
        .render_area(vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        })
        .clear_values(clear_values);

    unsafe {
        device
            .begin_command_buffer(cmd, &begin_info)
            .map_err(RenderError::CommandPoolOrBuffer)?;

        device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
        device.cmd_draw(cmd, TRIANGLE_VERTEX_COUNT, 1, 0, 0);
        device.cmd_end_render_pass(cmd);

        device
            .end_command_buffer(cmd)
            .map_err(RenderError::CommandPoolOrBuffer)?;
    }

    Ok(())
}
