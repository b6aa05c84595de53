// Renderer - the per-frame loop
//
// FRAME TIMELINE (one ring slot):
// ┌──────────────────────────────────────────────────────────────────────┐
// │  wait_fence ─> acquire ─┬─> record ─> submit ─> present ─> advance    │
// │                         │                                            │
// │                         └─ stale: drop frame, recreate swapchain     │
// └──────────────────────────────────────────────────────────────────────┘
//
// The GPU side lives behind `FrameBackend`; this module only decides what
// happens in which order.

pub mod mesh;
pub mod vulkan;

use anyhow::{Context, Result};
use ash::vk;

pub use vulkan::VulkanBackend;

/// Frames the CPU may record ahead of the GPU
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Result of asking the swapchain for an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Ready(u32),
    /// Out of date or suboptimal; the frame must not be rendered
    Stale,
}

/// Result of presenting an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Out of date or suboptimal; the swapchain should be rebuilt
    Stale,
}

/// GPU operations the frame loop drives, one call per state.
///
/// `slot` is always in `0..MAX_FRAMES_IN_FLIGHT`.
pub trait FrameBackend {
    /// Block until the slot's previous submission has finished
    fn wait_for_fence(&mut self, slot: usize) -> Result<()>;

    fn acquire_next_image(&mut self, slot: usize) -> Result<AcquireOutcome>;

    /// Unsignal the slot's fence; only called once the frame will be submitted
    fn reset_fence(&mut self, slot: usize) -> Result<()>;

    /// Reset and re-record the slot's command buffer for `image_index`
    fn record(&mut self, slot: usize, image_index: u32) -> Result<()>;

    fn submit(&mut self, slot: usize) -> Result<()>;

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome>;

    fn wait_idle(&mut self) -> Result<()>;

    /// Rebuild swapchain-dependent state for a nonzero window size.
    /// Called only after `wait_idle`.
    fn rebuild_swapchain(&mut self, framebuffer_size: vk::Extent2D) -> Result<()>;
}

/// What `draw_frame` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Rendered,
    /// The acquired image was stale; the swapchain was rebuilt instead
    Dropped,
    /// Window has no area, nothing was touched
    Minimized,
}

/// What `recreate_swapchain` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecreateOutcome {
    /// Window has no area; retried on the next frame
    Deferred,
    /// Swapchain already matches the window
    Unchanged,
    Rebuilt,
}

/// Index of the frame-in-flight slot in use
#[derive(Debug, Clone, Copy)]
pub struct FrameRing {
    current: usize,
    len: usize,
}

impl FrameRing {
    pub fn new(len: usize) -> Self {
        assert!(len > 0, "frame ring needs at least one slot");
        Self { current: 0, len }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.len;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FrameStats {
    pub rendered: u64,
    pub dropped: u64,
    pub stale_presents: u64,
    pub swapchain_rebuilds: u64,
}

pub struct Renderer<B: FrameBackend> {
    backend: B,
    ring: FrameRing,
    /// Window size the current swapchain was built for
    built_for: vk::Extent2D,
    /// Acquire or present reported the swapchain out of date / suboptimal
    stale: bool,
    /// Window reported a resize that hasn't been handled yet
    resize_pending: bool,
    stats: FrameStats,
}

impl<B: FrameBackend> Renderer<B> {
    /// `framebuffer_size` is the window size `backend` was created for
    pub fn new(backend: B, framebuffer_size: vk::Extent2D) -> Self {
        Self {
            backend,
            ring: FrameRing::new(MAX_FRAMES_IN_FLIGHT),
            built_for: framebuffer_size,
            stale: false,
            resize_pending: false,
            stats: FrameStats::default(),
        }
    }

    /// Render one frame into a window currently `framebuffer_size` pixels big
    pub fn draw_frame(&mut self, framebuffer_size: vk::Extent2D) -> Result<FrameStatus> {
        if is_empty(framebuffer_size) {
            return Ok(FrameStatus::Minimized);
        }

        if self.stale || self.resize_pending {
            self.recreate_swapchain(framebuffer_size)?;
        }

        let slot = self.ring.current();

        // The command buffer for this slot may still be executing
        self.backend.wait_for_fence(slot)?;

        let image_index = match self.backend.acquire_next_image(slot)? {
            AcquireOutcome::Ready(index) => index,
            AcquireOutcome::Stale => {
                // Fence stays signaled, so the next wait on this slot won't block
                log::debug!("Swapchain stale on acquire, dropping frame");
                self.stale = true;
                self.stats.dropped += 1;
                self.recreate_swapchain(framebuffer_size)?;
                return Ok(FrameStatus::Dropped);
            }
        };

        self.backend.reset_fence(slot)?;
        self.backend.record(slot, image_index)?;
        self.backend
            .submit(slot)
            .context("Failed to submit draw command buffer")?;

        let presented = self.backend.present(slot, image_index)?;

        self.ring.advance();
        self.stats.rendered += 1;

        if presented == PresentOutcome::Stale {
            log::debug!("Swapchain stale on present");
            self.stale = true;
            self.stats.stale_presents += 1;
            self.recreate_swapchain(framebuffer_size)?;
        }

        log::trace!("Frame rendered: slot {}, image {}", slot, image_index);
        Ok(FrameStatus::Rendered)
    }

    /// Note that the window changed size; handled on the next frame
    pub fn request_resize(&mut self) {
        self.resize_pending = true;
    }

    /// Bring the swapchain in line with the window.
    ///
    /// A zero-sized (minimized) window defers the work; otherwise this waits
    /// for the device to go idle and rebuilds only if the swapchain is stale
    /// or was built for a different size.
    pub fn recreate_swapchain(&mut self, framebuffer_size: vk::Extent2D) -> Result<RecreateOutcome> {
        if is_empty(framebuffer_size) {
            self.resize_pending = true;
            return Ok(RecreateOutcome::Deferred);
        }

        // Nothing in flight may still reference the old images
        self.backend.wait_idle()?;

        if !self.stale && same_extent(self.built_for, framebuffer_size) {
            self.resize_pending = false;
            return Ok(RecreateOutcome::Unchanged);
        }

        self.backend
            .rebuild_swapchain(framebuffer_size)
            .context("Failed to recreate swapchain")?;

        log::info!(
            "Swapchain recreated for {}x{}",
            framebuffer_size.width,
            framebuffer_size.height
        );

        self.built_for = framebuffer_size;
        self.stale = false;
        self.resize_pending = false;
        self.stats.swapchain_rebuilds += 1;

        Ok(RecreateOutcome::Rebuilt)
    }

    pub fn wait_idle(&mut self) -> Result<()> {
        self.backend.wait_idle()
    }

    #[cfg(test)]
    pub fn current_frame(&self) -> usize {
        self.ring.current()
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    #[cfg(test)]
    pub fn backend(&self) -> &B {
        &self.backend
    }
}

fn is_empty(extent: vk::Extent2D) -> bool {
    extent.width == 0 || extent.height == 0
}

fn same_extent(a: vk::Extent2D, b: vk::Extent2D) -> bool {
    a.width == b.width && a.height == b.height
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        WaitFence(usize),
        Acquire(usize),
        ResetFence(usize),
        Record(usize, u32),
        Submit(usize),
        Present(usize, u32),
        WaitIdle,
        Rebuild(u32, u32),
    }

    /// Records every call; GPU work "finishes" when its fence is waited on
    struct MockBackend {
        calls: Vec<Call>,
        acquire_script: VecDeque<AcquireOutcome>,
        present_script: VecDeque<PresentOutcome>,
        next_image: u32,
        image_count: u32,
        in_flight: [bool; MAX_FRAMES_IN_FLIGHT],
        fence_signaled: [bool; MAX_FRAMES_IN_FLIGHT],
        fail_submit: bool,
    }

    impl MockBackend {
        fn new() -> Self {
            Self {
                calls: Vec::new(),
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                next_image: 0,
                image_count: 3,
                in_flight: [false; MAX_FRAMES_IN_FLIGHT],
                fence_signaled: [true; MAX_FRAMES_IN_FLIGHT],
                fail_submit: false,
            }
        }

        fn rebuilds(&self) -> usize {
            self.calls
                .iter()
                .filter(|c| matches!(c, Call::Rebuild(..)))
                .count()
        }
    }

    impl FrameBackend for MockBackend {
        fn wait_for_fence(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::WaitFence(slot));
            if !self.fence_signaled[slot] && !self.in_flight[slot] {
                anyhow::bail!("waiting on a fence that will never signal");
            }
            self.in_flight[slot] = false;
            self.fence_signaled[slot] = true;
            Ok(())
        }

        fn acquire_next_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
            self.calls.push(Call::Acquire(slot));
            let outcome = self.acquire_script.pop_front().unwrap_or_else(|| {
                let index = self.next_image;
                self.next_image = (self.next_image + 1) % self.image_count;
                AcquireOutcome::Ready(index)
            });
            Ok(outcome)
        }

        fn reset_fence(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::ResetFence(slot));
            self.fence_signaled[slot] = false;
            Ok(())
        }

        fn record(&mut self, slot: usize, image_index: u32) -> Result<()> {
            self.calls.push(Call::Record(slot, image_index));
            if self.in_flight[slot] {
                anyhow::bail!("slot {} re-recorded while the GPU may be using it", slot);
            }
            Ok(())
        }

        fn submit(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Submit(slot));
            if self.fail_submit {
                anyhow::bail!("device lost");
            }
            self.in_flight[slot] = true;
            Ok(())
        }

        fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
            self.calls.push(Call::Present(slot, image_index));
            Ok(self
                .present_script
                .pop_front()
                .unwrap_or(PresentOutcome::Presented))
        }

        fn wait_idle(&mut self) -> Result<()> {
            self.calls.push(Call::WaitIdle);
            self.in_flight = [false; MAX_FRAMES_IN_FLIGHT];
            Ok(())
        }

        fn rebuild_swapchain(&mut self, size: vk::Extent2D) -> Result<()> {
            self.calls.push(Call::Rebuild(size.width, size.height));
            self.next_image = 0;
            Ok(())
        }
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    const SIZE: vk::Extent2D = vk::Extent2D {
        width: 800,
        height: 600,
    };

    fn renderer() -> Renderer<MockBackend> {
        Renderer::new(MockBackend::new(), SIZE)
    }

    #[test]
    fn ring_cycles_through_both_slots() -> Result<()> {
        let mut renderer = renderer();
        let mut slots = Vec::new();

        for _ in 0..7 {
            slots.push(renderer.current_frame());
            assert_eq!(renderer.draw_frame(SIZE)?, FrameStatus::Rendered);
        }

        assert_eq!(slots, vec![0, 1, 0, 1, 0, 1, 0]);
        assert_eq!(renderer.stats().rendered, 7);
        Ok(())
    }

    #[test]
    fn fence_is_waited_before_every_command_buffer_reuse() -> Result<()> {
        let mut renderer = renderer();
        for _ in 0..6 {
            renderer.draw_frame(SIZE)?;
        }

        // Between two submissions of a slot there must be a wait on that slot
        let calls = &renderer.backend().calls;
        for slot in 0..MAX_FRAMES_IN_FLIGHT {
            let mut submitted = false;
            for call in calls {
                match *call {
                    Call::WaitFence(s) if s == slot => submitted = false,
                    Call::Record(s, _) if s == slot => {
                        assert!(!submitted, "slot {} recorded without a fence wait", slot)
                    }
                    Call::Submit(s) if s == slot => submitted = true,
                    _ => {}
                }
            }
        }
        Ok(())
    }

    #[test]
    fn frame_follows_state_order() -> Result<()> {
        let mut renderer = renderer();
        renderer.draw_frame(SIZE)?;

        assert_eq!(
            renderer.backend().calls,
            vec![
                Call::WaitFence(0),
                Call::Acquire(0),
                Call::ResetFence(0),
                Call::Record(0, 0),
                Call::Submit(0),
                Call::Present(0, 0),
            ]
        );
        Ok(())
    }

    #[test]
    fn suboptimal_acquire_drops_frame_and_recreates() -> Result<()> {
        let mut backend = MockBackend::new();
        // Frame 1 ready, frame 2 suboptimal, frame 3 served by the rebuilt chain
        backend.acquire_script = VecDeque::from([
            AcquireOutcome::Ready(0),
            AcquireOutcome::Stale,
        ]);
        let mut renderer = Renderer::new(backend, SIZE);

        assert_eq!(renderer.draw_frame(SIZE)?, FrameStatus::Rendered);
        let frame_two_start = renderer.backend().calls.len();

        assert_eq!(renderer.draw_frame(SIZE)?, FrameStatus::Dropped);
        assert_eq!(
            &renderer.backend().calls[frame_two_start..],
            &[
                Call::WaitFence(1),
                Call::Acquire(1),
                Call::WaitIdle,
                Call::Rebuild(800, 600),
            ]
        );
        // Dropped frames do not consume a slot
        assert_eq!(renderer.current_frame(), 1);

        let frame_three_start = renderer.backend().calls.len();
        assert_eq!(renderer.draw_frame(SIZE)?, FrameStatus::Rendered);
        assert_eq!(
            &renderer.backend().calls[frame_three_start..],
            &[
                Call::WaitFence(1),
                Call::Acquire(1),
                Call::ResetFence(1),
                Call::Record(1, 0),
                Call::Submit(1),
                Call::Present(1, 0),
            ]
        );

        let stats = renderer.stats();
        assert_eq!(stats.rendered, 2);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.swapchain_rebuilds, 1);
        Ok(())
    }

    #[test]
    fn stale_acquire_leaves_fence_signaled() -> Result<()> {
        let mut backend = MockBackend::new();
        backend.acquire_script = VecDeque::from([AcquireOutcome::Stale]);
        let mut renderer = Renderer::new(backend, SIZE);

        renderer.draw_frame(SIZE)?;
        assert!(renderer.backend().fence_signaled[0]);
        assert!(!renderer.backend().calls.contains(&Call::ResetFence(0)));

        // Waiting on the same slot again must not deadlock
        assert_eq!(renderer.draw_frame(SIZE)?, FrameStatus::Rendered);
        Ok(())
    }

    #[test]
    fn stale_present_recreates_and_still_advances() -> Result<()> {
        let mut backend = MockBackend::new();
        backend.present_script = VecDeque::from([PresentOutcome::Stale]);
        let mut renderer = Renderer::new(backend, SIZE);

        assert_eq!(renderer.draw_frame(SIZE)?, FrameStatus::Rendered);
        assert_eq!(renderer.current_frame(), 1);
        assert_eq!(renderer.backend().rebuilds(), 1);
        assert_eq!(renderer.stats().stale_presents, 1);
        Ok(())
    }

    #[test]
    fn submit_failure_is_fatal() {
        let mut backend = MockBackend::new();
        backend.fail_submit = true;
        let mut renderer = Renderer::new(backend, SIZE);

        let err = renderer.draw_frame(SIZE).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to submit draw command buffer"));
        assert!(!renderer
            .backend()
            .calls
            .iter()
            .any(|c| matches!(c, Call::Present(..))));
        assert_eq!(renderer.stats().rendered, 0);
    }

    #[test]
    fn recreate_at_same_size_twice_rebuilds_once() -> Result<()> {
        let mut renderer = renderer();
        renderer.stale = true;

        assert_eq!(renderer.recreate_swapchain(SIZE)?, RecreateOutcome::Rebuilt);
        assert_eq!(renderer.recreate_swapchain(SIZE)?, RecreateOutcome::Unchanged);

        let calls = &renderer.backend().calls;
        assert_eq!(
            calls,
            &vec![Call::WaitIdle, Call::Rebuild(800, 600), Call::WaitIdle]
        );
        Ok(())
    }

    #[test]
    fn resize_rebuilds_for_new_size_only() -> Result<()> {
        let mut renderer = renderer();

        renderer.request_resize();
        renderer.draw_frame(SIZE)?;
        assert_eq!(renderer.backend().rebuilds(), 0);

        renderer.request_resize();
        renderer.draw_frame(extent(1024, 768))?;
        assert_eq!(renderer.backend().rebuilds(), 1);
        assert!(renderer.backend().calls.contains(&Call::Rebuild(1024, 768)));
        Ok(())
    }

    #[test]
    fn minimized_window_defers_recreation() -> Result<()> {
        let mut renderer = renderer();
        renderer.request_resize();

        assert_eq!(renderer.draw_frame(extent(0, 600))?, FrameStatus::Minimized);
        assert_eq!(
            renderer.recreate_swapchain(extent(800, 0))?,
            RecreateOutcome::Deferred
        );
        // Nothing touched the GPU while minimized
        assert!(renderer.backend().calls.is_empty());

        assert_eq!(renderer.draw_frame(extent(640, 480))?, FrameStatus::Rendered);
        assert_eq!(renderer.backend().calls[0], Call::WaitIdle);
        assert_eq!(renderer.backend().calls[1], Call::Rebuild(640, 480));
        Ok(())
    }

    #[test]
    fn ring_wraps() {
        let mut ring = FrameRing::new(2);
        assert_eq!(ring.current(), 0);
        ring.advance();
        assert_eq!(ring.current(), 1);
        ring.advance();
        assert_eq!(ring.current(), 0);
    }
}
