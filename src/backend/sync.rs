// Synchronization primitives and command allocation
//
// Fences for GPU-CPU sync, semaphores for GPU-GPU ordering between
// acquire, submit and present.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::Device;

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
    device: Arc<Device>,
}

impl FrameSync {
    pub fn new(device: Arc<Device>) -> Result<Self> {
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED); // Start signaled

        // Null handles are ignored by destroy calls, so a partially built
        // value can be dropped safely
        let mut sync = Self {
            image_available: vk::Semaphore::null(),
            render_finished: vk::Semaphore::null(),
            in_flight_fence: vk::Fence::null(),
            device,
        };
        sync.image_available = create_semaphore(&sync.device)?;
        sync.render_finished = create_semaphore(&sync.device)?;
        sync.in_flight_fence = unsafe { sync.device.device.create_fence(&fence_info, None) }
            .context("Failed to create fence")?;

        Ok(sync)
    }

    /// Swap in a fresh, unsignaled image-available semaphore.
    ///
    /// An acquire that came back suboptimal still signals its semaphore; the
    /// frame is dropped, so nothing ever waits on it. The device must be idle.
    ///
    /// Device idle does not cover the presentation engine: if that signal is
    /// still pending, destroying the old semaphore is invalid and validation
    /// layers may report it. Consuming it with an empty wait-only submit
    /// would close the gap.
    pub fn reset_image_available(&mut self) -> Result<()> {
        let fresh = create_semaphore(&self.device)?;
        let old = std::mem::replace(&mut self.image_available, fresh);
        unsafe { self.device.device.destroy_semaphore(old, None) };
        Ok(())
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_semaphore(self.image_available, None);
            self.device.device.destroy_semaphore(self.render_finished, None);
            self.device.device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

fn create_semaphore(device: &Device) -> Result<vk::Semaphore> {
    let semaphore_info = vk::SemaphoreCreateInfo::default();
    unsafe { device.device.create_semaphore(&semaphore_info, None) }
        .context("Failed to create semaphore")
}

/// Command pool on the graphics family, buffers individually resettable
pub struct CommandPool {
    pub pool: vk::CommandPool,
    device: Arc<Device>,
}

impl CommandPool {
    pub fn new(device: Arc<Device>) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(device.queue_families.graphics)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        Ok(Self { pool, device })
    }

    pub fn allocate(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        // Also frees the command buffers
        unsafe { self.device.device.destroy_command_pool(self.pool, None) };
    }
}
