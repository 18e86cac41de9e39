// Graphics pipeline state
//
// A PipelineState is the complete set of objects a draw needs: both shader
// modules, the pipeline layout, and the pipeline itself. A set is either
// fully built or absent; any failure while building destroys what this build
// created and returns the error, so the render loop never sees a partial set.
// On hot reload the replacement set is built first and the old one destroyed
// only after new command buffers have been recorded against the replacement.

use super::device::DeviceContext;
use super::error::{PipelineError, RendererError};
use super::shader::{create_shader, ShaderStage};
use super::surface::Surface;
use ash::vk;
use std::path::Path;

pub struct PipelineState {
    vert_shader: vk::ShaderModule,
    frag_shader: vk::ShaderModule,
    pub layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
}

impl PipelineState {
    /// Compile both shaders and assemble layout + pipeline against the
    /// surface's render pass and sample count. `push_constant_size` covers
    /// the per-frame uniform block, visible to both stages.
    pub fn build(
        ctx: &DeviceContext,
        surface: &Surface,
        vert_path: &Path,
        frag_path: &Path,
        push_constant_size: u32,
    ) -> Result<Self, PipelineError> {
        let mut state = Self {
            vert_shader: vk::ShaderModule::null(),
            frag_shader: vk::ShaderModule::null(),
            layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
        };

        match state.assemble(ctx, surface, vert_path, frag_path, push_constant_size) {
            Ok(()) => Ok(state),
            Err(err) => {
                state.destroy(ctx);
                Err(err)
            }
        }
    }

    fn assemble(
        &mut self,
        ctx: &DeviceContext,
        surface: &Surface,
        vert_path: &Path,
        frag_path: &Path,
        push_constant_size: u32,
    ) -> Result<(), PipelineError> {
        self.vert_shader = create_shader(ctx, vert_path, ShaderStage::Vertex)?;
        self.frag_shader = create_shader(ctx, frag_path, ShaderStage::Fragment)?;

        let push_constant_ranges = [vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
            offset: 0,
            size: push_constant_size,
        }];

        let layout_info =
            vk::PipelineLayoutCreateInfo::builder().push_constant_ranges(&push_constant_ranges);

        self.layout = unsafe { ctx.device.create_pipeline_layout(&layout_info, None) }
            .map_err(RendererError::from)?;

        let stages = [
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(self.vert_shader)
                .name(c"main")
                .build(),
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(self.frag_shader)
                .name(c"main")
                .build(),
        ];

        // Full-screen triangle: no vertex buffers, positions synthesized in
        // the vertex shader from gl_VertexIndex.
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder();

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        // Viewport and scissor are dynamic; only the counts are baked in.
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::FRONT)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);

        let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(surface.samples())
            .min_sample_shading(1.0);

        let depth_stencil =
            vk::PipelineDepthStencilStateCreateInfo::builder().depth_write_enable(true);

        let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build()];
        let color_blend = vk::PipelineColorBlendStateCreateInfo::builder()
            .attachments(&color_blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(self.layout)
            .render_pass(surface.render_pass())
            .subpass(0)
            .build();

        let pipelines = unsafe {
            ctx.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_, err)| RendererError::from(err))?;

        self.pipeline = pipelines[0];
        Ok(())
    }

    pub fn destroy(&mut self, ctx: &DeviceContext) {
        unsafe {
            if self.pipeline != vk::Pipeline::null() {
                ctx.device.destroy_pipeline(self.pipeline, None);
                self.pipeline = vk::Pipeline::null();
            }
            if self.layout != vk::PipelineLayout::null() {
                ctx.device.destroy_pipeline_layout(self.layout, None);
                self.layout = vk::PipelineLayout::null();
            }
            if self.frag_shader != vk::ShaderModule::null() {
                ctx.device.destroy_shader_module(self.frag_shader, None);
                self.frag_shader = vk::ShaderModule::null();
            }
            if self.vert_shader != vk::ShaderModule::null() {
                ctx.device.destroy_shader_module(self.vert_shader, None);
                self.vert_shader = vk::ShaderModule::null();
            }
        }
    }
}
