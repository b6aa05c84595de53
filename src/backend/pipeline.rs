// Graphics pipeline creation
//
// The graphics pipeline defines how vertices are processed and rasterized:
// vertex input, shaders, rasterization and blending. Viewport and scissor
// are dynamic, so a resize does not require a new pipeline.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::{BufferLayout, Device, Shader};

/// Pipeline state that is set while recording instead of baked in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynamicState {
    Viewport,
    Scissor,
}

impl DynamicState {
    pub fn to_vk(self) -> vk::DynamicState {
        match self {
            DynamicState::Viewport => vk::DynamicState::VIEWPORT,
            DynamicState::Scissor => vk::DynamicState::SCISSOR,
        }
    }
}

/// Everything that varies between pipelines built by this renderer
pub struct PipelineDescription<'a> {
    pub shader: &'a Shader,
    pub vertex_layout: &'a BufferLayout,
    pub dynamic_states: Vec<DynamicState>,
}

impl PipelineDescription<'_> {
    pub fn vk_dynamic_states(&self) -> Vec<vk::DynamicState> {
        self.dynamic_states.iter().map(|s| s.to_vk()).collect()
    }
}

/// Immutable pipeline + layout, bound to one render pass
pub struct Pipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    device: Arc<Device>,
}

impl Pipeline {
    pub fn new(
        device: Arc<Device>,
        render_pass: vk::RenderPass,
        description: &PipelineDescription,
    ) -> Result<Self> {
        let shader_stages = description.shader.stages();

        let bindings = [description.vertex_layout.binding_description()];
        let attributes = description.vertex_layout.attribute_descriptions()?;
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        // Counts only, the actual rectangles are set per frame
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let dynamic_states = description.vk_dynamic_states();
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let color_blend_attachment = vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false);

        let color_blend_attachments = [color_blend_attachment];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        // No descriptors or push constants
        let layout_info = vk::PipelineLayoutCreateInfo::default();

        let layout = unsafe { device.device.create_pipeline_layout(&layout_info, None) }
            .context("Failed to create pipeline layout")?;

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
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
            .subpass(0);

        let pipelines = unsafe {
            device
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        let pipeline = match pipelines {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                unsafe { device.device.destroy_pipeline_layout(layout, None) };
                return Err(e).context("Failed to create graphics pipeline");
            }
        };

        log::info!("Created graphics pipeline");

        Ok(Self {
            pipeline,
            layout,
            device,
        })
    }

    pub fn bind(&self, command_buffer: vk::CommandBuffer) {
        unsafe {
            self.device.device.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline,
            )
        };
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_pipeline(self.pipeline, None);
            self.device.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_states_map_to_vulkan() {
        assert_eq!(DynamicState::Viewport.to_vk(), vk::DynamicState::VIEWPORT);
        assert_eq!(DynamicState::Scissor.to_vk(), vk::DynamicState::SCISSOR);
    }
}
