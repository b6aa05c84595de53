// Backend module - Vulkan abstraction layer
//
// Thin RAII wrappers around ash. Every wrapper holds an `Arc<Device>` and
// releases its handles on drop.

pub mod buffer;
pub mod device;
pub mod framebuffer;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use buffer::{Buffer, BufferDescription, BufferElement, BufferKind, BufferLayout, ShaderDataType};
pub use device::Device;
pub use framebuffer::{Framebuffer, RenderPassChange};
pub use pipeline::{DynamicState, Pipeline, PipelineDescription};
pub use shader::Shader;
pub use swapchain::Swapchain;
pub use sync::{CommandPool, FrameSync};
