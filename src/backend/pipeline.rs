// Graphics pipeline creation and management
//
// The triangle is hard-coded in the vertex shader, so there is no vertex
// input. The pipeline is immutable and tied to one render pass and extent;
// a new extent means an explicit rebuild.

use ash::vk;
use std::ffi::CStr;

use super::shader::{create_shader_module, ShaderBytecode};
use crate::error::{RenderError, RenderResult};

const ENTRY_POINT: &CStr = c"main";

pub struct Pipeline {
    pub layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
    pub extent: vk::Extent2D,
}

impl Pipeline {
    pub fn new(
        device: &ash::Device,
        render_pass: vk::RenderPass,
        extent: vk::Extent2D,
        shaders: &ShaderBytecode,
    ) -> RenderResult<Self> {
        let layout_info = vk::PipelineLayoutCreateInfo::builder();
        let layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
            .map_err(RenderError::PipelineLayoutCreation)?;

        match create_graphics_pipeline(device, render_pass, layout, extent, shaders) {
            Ok(pipeline) => {
                log::info!("Created graphics pipeline for {}x{}", extent.width, extent.height);
                Ok(Self { layout, pipeline, extent })
            }
            Err(e) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                Err(e)
            }
        }
    }

    /// Replace this pipeline with one built for `render_pass` and `extent`.
    ///
    /// The old pipeline is only destroyed once the new one exists.
    pub fn rebuild(
        &mut self,
        device: &ash::Device,
        render_pass: vk::RenderPass,
        extent: vk::Extent2D,
        shaders: &ShaderBytecode,
    ) -> RenderResult<()> {
        let mut rebuilt = Self::new(device, render_pass, extent, shaders)?;
        std::mem::swap(self, &mut rebuilt);
        unsafe { rebuilt.destroy(device) };
        Ok(())
    }

    /// # Safety
    /// No pending command buffer may reference the pipeline.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
        self.pipeline = vk::Pipeline::null();
        self.layout = vk::PipelineLayout::null();
    }
}

/// Fill mode, back-face culling, clockwise front faces.
fn rasterization_state() -> vk::PipelineRasterizationStateCreateInfo {
    vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(vk::CullModeFlags::BACK)
        .front_face(vk::FrontFace::CLOCKWISE)
        .depth_bias_enable(false)
        .build()
}

/// Straight overwrite, all channels written.
fn color_blend_attachment() -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false)
        .build()
}

/// Viewport and scissor covering the whole extent.
fn full_viewport(extent: vk::Extent2D) -> (vk::Viewport, vk::Rect2D) {
    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };

    let scissor = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    };

    (viewport, scissor)
}

fn create_graphics_pipeline(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    layout: vk::PipelineLayout,
    extent: vk::Extent2D,
    shaders: &ShaderBytecode,
) -> RenderResult<vk::Pipeline> {
    let vert_module = create_shader_module(device, &shaders.vertex)?;
    let frag_module = match create_shader_module(device, &shaders.fragment) {
        Ok(module) => module,
        Err(e) => {
            unsafe { device.destroy_shader_module(vert_module, None) };
            return Err(e);
        }
    };

    let result = build_pipeline(device, render_pass, layout, extent, vert_module, frag_module);

    // The pipeline keeps no reference to its modules.
    unsafe {
        device.destroy_shader_module(vert_module, None);
        device.destroy_shader_module(frag_module, None);
    }

    result
}

fn build_pipeline(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    layout: vk::PipelineLayout,
    extent: vk::Extent2D,
    vert_module: vk::ShaderModule,
    frag_module: vk::ShaderModule,
) -> RenderResult<vk::Pipeline> {
    let shader_stages = [
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vert_module)
            .name(ENTRY_POINT)
            .build(),
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(frag_module)
            .name(ENTRY_POINT)
            .build(),
    ];

    // No vertex buffers: positions come from gl_VertexIndex
    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder();

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    let (viewport, scissor) = full_viewport(extent);
    let viewports = [viewport];
    let scissors = [scissor];
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewports(&viewports)
        .scissors(&scissors);

    let rasterizer = rasterization_state();

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let color_blend_attachments = [color_blend_attachment()];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    // Declared but empty: the fixed draw sets no state at record time.
    let dynamic_states: [vk::DynamicState; 0] = [];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(0)
        .build();

    let pipelines = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    }
    .map_err(|(_, e)| RenderError::PipelineCreation(e))?;

    pipelines
        .into_iter()
        .next()
        .ok_or(RenderError::PipelineCreation(vk::Result::ERROR_UNKNOWN))
}
