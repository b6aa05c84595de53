// Vulkan implementation of the frame backend
//
// Owns every GPU object the triangle needs. One command buffer and one
// FrameSync per frame in flight, re-recorded each frame.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::mesh::{Vertex, TRIANGLE};
use super::{AcquireOutcome, FrameBackend, PresentOutcome, MAX_FRAMES_IN_FLIGHT};
use crate::backend::{
    Buffer, BufferDescription, BufferKind, BufferLayout, CommandPool, Device, DynamicState,
    FrameSync, Framebuffer, Pipeline, PipelineDescription, RenderPassChange, Shader,
};
use crate::config::GraphicsConfig;

/// Fence and acquire waits never time out; a hung GPU shows up as DEVICE_LOST
pub const FENCE_TIMEOUT: u64 = u64::MAX;

struct FrameSlot {
    sync: FrameSync,
    command_buffer: vk::CommandBuffer,
}

pub struct VulkanBackend {
    // Field order is drop order: users before the objects they reference
    frames: Vec<FrameSlot>,
    // Only held so the command buffers live as long as the backend
    _command_pool: CommandPool,
    pipeline: Pipeline,
    vertex_buffer: Buffer,
    vertex_count: u32,
    shader: Shader,
    framebuffer: Framebuffer,
    clear_color: [f32; 4],
    device: Arc<Device>,
}

impl VulkanBackend {
    pub fn new(
        device: Arc<Device>,
        graphics: &GraphicsConfig,
        framebuffer_size: vk::Extent2D,
    ) -> Result<Self> {
        let framebuffer = Framebuffer::new(device.clone(), framebuffer_size)?;

        let shader = Shader::load(
            device.clone(),
            &graphics.vertex_shader,
            &graphics.fragment_shader,
        )?;

        let vertex_bytes: &[u8] = bytemuck::cast_slice(&TRIANGLE);
        let mut vertex_buffer = Buffer::new(
            device.clone(),
            BufferDescription {
                kind: BufferKind::Vertex,
                size: vertex_bytes.len() as vk::DeviceSize,
                layout: Vertex::layout(),
            },
        )?;
        vertex_buffer
            .set_data(vertex_bytes)
            .context("Failed to upload vertex data")?;

        // Vertex input comes from the layout the buffer was created with
        let pipeline = create_pipeline(&device, &framebuffer, &shader, vertex_buffer.layout())?;

        let command_pool = CommandPool::new(device.clone())?;
        let command_buffers = command_pool.allocate(MAX_FRAMES_IN_FLIGHT as u32)?;

        let frames = command_buffers
            .into_iter()
            .map(|command_buffer| -> Result<FrameSlot> {
                Ok(FrameSlot {
                    sync: FrameSync::new(device.clone())?,
                    command_buffer,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        log::info!(
            "Renderer ready: {} frames in flight, {} swapchain images",
            frames.len(),
            framebuffer.swapchain().images.len()
        );

        Ok(Self {
            frames,
            _command_pool: command_pool,
            pipeline,
            vertex_buffer,
            vertex_count: TRIANGLE.len() as u32,
            shader,
            framebuffer,
            clear_color: graphics.clear_color,
            device,
        })
    }

    fn frame(&self, slot: usize) -> Result<&FrameSlot> {
        self.frames
            .get(slot)
            .with_context(|| format!("No frame slot {}", slot))
    }
}

fn create_pipeline(
    device: &Arc<Device>,
    framebuffer: &Framebuffer,
    shader: &Shader,
    vertex_layout: &BufferLayout,
) -> Result<Pipeline> {
    Pipeline::new(
        device.clone(),
        framebuffer.render_pass().handle,
        &PipelineDescription {
            shader,
            vertex_layout,
            dynamic_states: vec![DynamicState::Viewport, DynamicState::Scissor],
        },
    )
}

impl FrameBackend for VulkanBackend {
    fn wait_for_fence(&mut self, slot: usize) -> Result<()> {
        let fence = self.frame(slot)?.sync.in_flight_fence;
        unsafe {
            self.device
                .device
                .wait_for_fences(&[fence], true, FENCE_TIMEOUT)
        }
        .context("Failed to wait for in-flight fence")
    }

    fn acquire_next_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
        let semaphore = self.frame(slot)?.sync.image_available;
        let outcome = self
            .framebuffer
            .swapchain()
            .acquire_next_image(FENCE_TIMEOUT, semaphore)?;

        Ok(match outcome {
            Some(index) => AcquireOutcome::Ready(index),
            None => AcquireOutcome::Stale,
        })
    }

    fn reset_fence(&mut self, slot: usize) -> Result<()> {
        let fence = self.frame(slot)?.sync.in_flight_fence;
        unsafe { self.device.device.reset_fences(&[fence]) }.context("Failed to reset fence")
    }

    fn record(&mut self, slot: usize, image_index: u32) -> Result<()> {
        let cmd = self.frame(slot)?.command_buffer;
        let framebuffer = self.framebuffer.framebuffer(image_index)?;
        let extent = self.framebuffer.extent();
        let device = &self.device.device;

        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.clear_color,
            },
        }];

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };

        let render_pass_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.framebuffer.render_pass().handle)
            .framebuffer(framebuffer)
            .render_area(render_area)
            .clear_values(&clear_values);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };

        unsafe {
            device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .context("Failed to reset command buffer")?;

            let begin_info = vk::CommandBufferBeginInfo::default();
            device
                .begin_command_buffer(cmd, &begin_info)
                .context("Failed to begin command buffer")?;

            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);

            self.pipeline.bind(cmd);
            self.vertex_buffer.bind(device, cmd);

            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[render_area]);

            device.cmd_draw(cmd, self.vertex_count, 1, 0, 0);

            device.cmd_end_render_pass(cmd);

            device
                .end_command_buffer(cmd)
                .context("Failed to record command buffer")?;
        }

        Ok(())
    }

    fn submit(&mut self, slot: usize) -> Result<()> {
        let frame = self.frame(slot)?;

        let wait_semaphores = [frame.sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [frame.command_buffer];
        let signal_semaphores = [frame.sync.render_finished];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info],
                frame.sync.in_flight_fence,
            )
        }?;

        Ok(())
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
        let render_finished = self.frame(slot)?.sync.render_finished;
        let presented = self.framebuffer.swapchain().present(
            self.device.present_queue,
            image_index,
            &[render_finished],
        )?;

        Ok(if presented {
            PresentOutcome::Presented
        } else {
            PresentOutcome::Stale
        })
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.device.wait_idle()
    }

    fn rebuild_swapchain(&mut self, framebuffer_size: vk::Extent2D) -> Result<()> {
        let change = self.framebuffer.recreate(framebuffer_size)?;

        if change == RenderPassChange::Replaced {
            self.pipeline = create_pipeline(
                &self.device,
                &self.framebuffer,
                &self.shader,
                self.vertex_buffer.layout(),
            )?;
        }

        for frame in &mut self.frames {
            frame.sync.reset_image_available()?;
        }

        Ok(())
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");
        if let Err(e) = self.device.wait_idle() {
            log::error!("Failed to wait for device idle on shutdown: {:?}", e);
        }
    }
}
