// Render targets - render pass + swapchain + one framebuffer per image
//
// `build` is the single construction path, used both at startup and when
// the swapchain is recreated after a resize or an out-of-date report.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::{Device, Swapchain};

/// Single color attachment render pass, no depth
pub struct RenderPass {
    pub handle: vk::RenderPass,
    pub format: vk::Format,
    device: Arc<Device>,
}

impl RenderPass {
    pub fn new(device: Arc<Device>, format: vk::Format) -> Result<Self> {
        let color_attachment = vk::AttachmentDescription::default()
            .format(format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR);

        let color_attachment_ref = vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        };

        let color_attachments = [color_attachment_ref];
        let subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_attachments);

        // The image-available semaphore is waited on at COLOR_ATTACHMENT_OUTPUT,
        // so the layout transition must not start before that stage either
        let dependency = vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE);

        let attachments = [color_attachment];
        let subpasses = [subpass];
        let dependencies = [dependency];

        let render_pass_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let handle = unsafe { device.device.create_render_pass(&render_pass_info, None) }
            .context("Failed to create render pass")?;

        Ok(Self {
            handle,
            format,
            device,
        })
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_render_pass(self.handle, None) };
    }
}

/// Whether a rebuild kept the render pass or had to replace it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderPassChange {
    Kept,
    Replaced,
}

pub struct Framebuffer {
    // Field order matters for Drop: framebuffers go first (in Drop),
    // then the swapchain views, then the render pass.
    framebuffers: Vec<vk::Framebuffer>,
    swapchain: Swapchain,
    render_pass: RenderPass,
    device: Arc<Device>,
}

impl Framebuffer {
    pub fn new(device: Arc<Device>, framebuffer_size: vk::Extent2D) -> Result<Self> {
        let (swapchain, render_pass, framebuffers) =
            Self::build(&device, framebuffer_size, None, vk::SwapchainKHR::null())?;
        let render_pass = render_pass.context("No render pass built for the first swapchain")?;

        Ok(Self {
            framebuffers,
            swapchain,
            render_pass,
            device,
        })
    }

    /// Swapchain and framebuffers for the given window size.
    ///
    /// A render pass is returned only when `current` is missing or its format
    /// no longer matches the swapchain; otherwise the framebuffers use `current`.
    /// On error everything built so far is released and nothing the caller
    /// owns has been touched.
    fn build(
        device: &Arc<Device>,
        framebuffer_size: vk::Extent2D,
        current: Option<&RenderPass>,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<(Swapchain, Option<RenderPass>, Vec<vk::Framebuffer>)> {
        let support = device.surface_support()?;
        let swapchain = Swapchain::new(device.clone(), &support, framebuffer_size, old_swapchain)?;

        let new_pass = if needs_new_render_pass(current.map(|pass| pass.format), swapchain.format) {
            Some(RenderPass::new(device.clone(), swapchain.format)?)
        } else {
            None
        };

        let render_pass = new_pass
            .as_ref()
            .or(current)
            .context("No render pass for the swapchain format")?;

        let framebuffers = create_framebuffers(
            device,
            &swapchain.image_views,
            render_pass.handle,
            swapchain.extent,
        )?;

        Ok((swapchain, new_pass, framebuffers))
    }

    /// Replace swapchain and framebuffers. The caller must have waited for
    /// the device to go idle.
    ///
    /// Everything new is built before anything old is released. The old
    /// swapchain is handed over as `old_swapchain`, so after a failure it is
    /// retired and only good for teardown.
    pub fn recreate(&mut self, framebuffer_size: vk::Extent2D) -> Result<RenderPassChange> {
        let (swapchain, new_pass, framebuffers) = Self::build(
            &self.device,
            framebuffer_size,
            Some(&self.render_pass),
            self.swapchain.swapchain,
        )?;

        // Old framebuffers reference the old views, so they go first
        self.destroy_framebuffers();
        self.framebuffers = framebuffers;
        self.swapchain = swapchain;

        Ok(match new_pass {
            Some(render_pass) => {
                log::info!(
                    "Surface format changed {:?} -> {:?}",
                    self.render_pass.format,
                    render_pass.format
                );
                self.render_pass = render_pass;
                RenderPassChange::Replaced
            }
            None => RenderPassChange::Kept,
        })
    }

    fn destroy_framebuffers(&mut self) {
        for framebuffer in self.framebuffers.drain(..) {
            unsafe { self.device.device.destroy_framebuffer(framebuffer, None) };
        }
    }

    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    pub fn render_pass(&self) -> &RenderPass {
        &self.render_pass
    }

    pub fn framebuffer(&self, image_index: u32) -> Result<vk::Framebuffer> {
        self.framebuffers
            .get(image_index as usize)
            .copied()
            .with_context(|| format!("No framebuffer for swapchain image {}", image_index))
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        self.destroy_framebuffers();
    }
}

/// A render pass is reusable only for images of the format it was made for
fn needs_new_render_pass(current: Option<vk::Format>, swapchain_format: vk::Format) -> bool {
    current != Some(swapchain_format)
}

fn create_framebuffers(
    device: &Device,
    image_views: &[vk::ImageView],
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
) -> Result<Vec<vk::Framebuffer>> {
    let mut framebuffers = Vec::with_capacity(image_views.len());

    for &image_view in image_views {
        let attachments = [image_view];
        let framebuffer_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        match unsafe { device.device.create_framebuffer(&framebuffer_info, None) } {
            Ok(framebuffer) => framebuffers.push(framebuffer),
            Err(e) => {
                for framebuffer in framebuffers {
                    unsafe { device.device.destroy_framebuffer(framebuffer, None) };
                }
                return Err(e).context("Failed to create framebuffer");
            }
        }
    }

    Ok(framebuffers)
}
