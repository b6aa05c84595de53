// Host-visible GPU buffers and vertex layout description
//
// Buffers are small and static here, so they live in CPU-visible,
// coherent memory and are written directly through the mapped pointer.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::Device;

/// What a buffer is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Vertex,
    Index,
    Uniform,
    Storage,
}

impl BufferKind {
    pub fn usage(self) -> vk::BufferUsageFlags {
        match self {
            BufferKind::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
            BufferKind::Index => vk::BufferUsageFlags::INDEX_BUFFER,
            BufferKind::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
            BufferKind::Storage => vk::BufferUsageFlags::STORAGE_BUFFER,
        }
    }
}

/// Shader-side type of one vertex attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderDataType {
    Float,
    Float2,
    Float3,
    Float4,
    Mat3,
    Mat4,
    UInt,
    Int,
    Int2,
    Int3,
    Int4,
    Bool,
}

impl ShaderDataType {
    /// Size in bytes
    pub fn size(self) -> u32 {
        match self {
            ShaderDataType::Float => 4,
            ShaderDataType::Float2 => 4 * 2,
            ShaderDataType::Float3 => 4 * 3,
            ShaderDataType::Float4 => 4 * 4,
            ShaderDataType::Mat3 => 4 * 3 * 3,
            ShaderDataType::Mat4 => 4 * 4 * 4,
            ShaderDataType::UInt => 4,
            ShaderDataType::Int => 4,
            ShaderDataType::Int2 => 4 * 2,
            ShaderDataType::Int3 => 4 * 3,
            ShaderDataType::Int4 => 4 * 4,
            ShaderDataType::Bool => 1,
        }
    }

    /// Vulkan vertex format. Matrices have none: they take one attribute
    /// location per column.
    pub fn format(self) -> Option<vk::Format> {
        match self {
            ShaderDataType::Float => Some(vk::Format::R32_SFLOAT),
            ShaderDataType::Float2 => Some(vk::Format::R32G32_SFLOAT),
            ShaderDataType::Float3 => Some(vk::Format::R32G32B32_SFLOAT),
            ShaderDataType::Float4 => Some(vk::Format::R32G32B32A32_SFLOAT),
            ShaderDataType::UInt => Some(vk::Format::R32_UINT),
            ShaderDataType::Int => Some(vk::Format::R32_SINT),
            ShaderDataType::Int2 => Some(vk::Format::R32G32_SINT),
            ShaderDataType::Int3 => Some(vk::Format::R32G32B32_SINT),
            ShaderDataType::Int4 => Some(vk::Format::R32G32B32A32_SINT),
            ShaderDataType::Bool => Some(vk::Format::R8_UINT),
            ShaderDataType::Mat3 | ShaderDataType::Mat4 => None,
        }
    }
}

/// One attribute of a vertex
#[derive(Debug, Clone, PartialEq)]
pub struct BufferElement {
    pub name: String,
    pub data_type: ShaderDataType,
    pub offset: u32,
}

impl BufferElement {
    pub fn new(data_type: ShaderDataType, name: &str) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            offset: 0,
        }
    }
}

/// Interleaved vertex layout; offsets and stride are computed on construction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferLayout {
    elements: Vec<BufferElement>,
    stride: u32,
}

impl BufferLayout {
    pub fn new(elements: impl IntoIterator<Item = BufferElement>) -> Self {
        let mut elements: Vec<_> = elements.into_iter().collect();
        let mut offset = 0;
        for element in &mut elements {
            element.offset = offset;
            offset += element.data_type.size();
        }
        Self {
            elements,
            stride: offset,
        }
    }

    pub fn elements(&self) -> &[BufferElement] {
        &self.elements
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Binding description for vertex-input slot 0
    pub fn binding_description(&self) -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: self.stride,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    /// One attribute per element, locations assigned in declaration order
    pub fn attribute_descriptions(&self) -> Result<Vec<vk::VertexInputAttributeDescription>> {
        self.elements
            .iter()
            .enumerate()
            .map(|(location, element)| {
                let format = element.data_type.format().with_context(|| {
                    format!(
                        "Vertex attribute '{}' of type {:?} has no vertex format",
                        element.name, element.data_type
                    )
                })?;
                Ok(vk::VertexInputAttributeDescription {
                    location: location as u32,
                    binding: 0,
                    format,
                    offset: element.offset,
                })
            })
            .collect()
    }
}

/// Parameters for [`Buffer::new`]
#[derive(Debug, Clone)]
pub struct BufferDescription {
    pub kind: BufferKind,
    pub size: vk::DeviceSize,
    pub layout: BufferLayout,
}

/// A buffer backed by host-visible, host-coherent memory.
/// The handle and its memory are released on drop.
pub struct Buffer {
    device: Arc<Device>,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    description: BufferDescription,
}

impl Buffer {
    pub fn new(device: Arc<Device>, description: BufferDescription) -> Result<Self> {
        if description.size == 0 {
            anyhow::bail!("Cannot create an empty {:?} buffer", description.kind);
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(description.size)
            .usage(description.kind.usage())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .context("Failed to create buffer")?;

        // The driver may ask for more than we requested; the allocation is
        // sized to its answer.
        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = device.allocator.lock().allocate(&AllocationCreateDesc {
            name: "buffer",
            requirements,
            location: MemoryLocation::CpuToGpu,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e).context("Failed to allocate buffer memory");
            }
        };

        // Wrap first so every early return below releases the handle
        let buffer = Self {
            device,
            buffer,
            allocation: Some(allocation),
            description,
        };

        let allocation = buffer
            .allocation
            .as_ref()
            .context("Buffer allocation missing")?;
        check_allocation_size(buffer.description.size, allocation.size())?;

        unsafe {
            buffer
                .device
                .device
                .bind_buffer_memory(buffer.buffer, allocation.memory(), allocation.offset())
        }
        .context("Failed to bind buffer memory")?;

        log::debug!(
            "Created {:?} buffer: requested {} bytes, allocated {}",
            buffer.description.kind,
            buffer.description.size,
            allocation.size()
        );

        Ok(buffer)
    }

    /// Copy `data` to the start of the buffer.
    ///
    /// The GPU must not be reading the buffer while this runs.
    pub fn set_data(&mut self, data: &[u8]) -> Result<()> {
        let mapped = self
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .context("Buffer memory is not host visible")?;
        write_bytes(mapped, data)
    }

    /// Bind as vertex buffer at slot 0, offset 0
    pub fn bind(&self, device: &ash::Device, command_buffer: vk::CommandBuffer) {
        unsafe { device.cmd_bind_vertex_buffers(command_buffer, 0, &[self.buffer], &[0]) };
    }

    /// Layout of one element, as declared at creation
    pub fn layout(&self) -> &BufferLayout {
        &self.description.layout
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_buffer(self.buffer, None) };
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.allocator.lock().free(allocation) {
                log::error!("Failed to free buffer memory: {}", e);
            }
        }
    }
}

fn check_allocation_size(requested: vk::DeviceSize, allocated: vk::DeviceSize) -> Result<()> {
    if allocated < requested {
        anyhow::bail!(
            "Allocation of {} bytes is smaller than the requested {} bytes",
            allocated,
            requested
        );
    }
    Ok(())
}

/// Copy `data` into the front of `mapped`, leaving the rest untouched
fn write_bytes(mapped: &mut [u8], data: &[u8]) -> Result<()> {
    let mapped_len = mapped.len();
    let dst = mapped.get_mut(..data.len()).with_context(|| {
        format!(
            "Data of {} bytes does not fit in a buffer of {} bytes",
            data.len(),
            mapped_len
        )
    })?;
    dst.copy_from_slice(data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle_layout() -> BufferLayout {
        BufferLayout::new([
            BufferElement::new(ShaderDataType::Float2, "a_Position"),
            BufferElement::new(ShaderDataType::Float3, "a_Color"),
        ])
    }

    #[test]
    fn layout_offsets_and_stride() {
        let layout = triangle_layout();
        assert_eq!(layout.stride(), 20);
        assert_eq!(layout.elements()[0].offset, 0);
        assert_eq!(layout.elements()[1].offset, 8);
        assert_eq!(layout.binding_description().stride, 20);
        assert_eq!(layout.binding_description().binding, 0);
    }

    #[test]
    fn attributes_follow_declaration_order() -> Result<()> {
        let attributes = triangle_layout().attribute_descriptions()?;
        assert_eq!(attributes.len(), 2);
        assert_eq!(attributes[0].location, 0);
        assert_eq!(attributes[0].format, vk::Format::R32G32_SFLOAT);
        assert_eq!(attributes[1].location, 1);
        assert_eq!(attributes[1].format, vk::Format::R32G32B32_SFLOAT);
        assert_eq!(attributes[1].offset, 8);
        Ok(())
    }

    #[test]
    fn matrices_have_no_vertex_format() {
        let layout = BufferLayout::new([BufferElement::new(ShaderDataType::Mat4, "a_Model")]);
        assert_eq!(layout.stride(), 64);
        assert!(layout.attribute_descriptions().is_err());
    }

    #[test]
    fn kind_maps_to_usage() {
        assert_eq!(BufferKind::Vertex.usage(), vk::BufferUsageFlags::VERTEX_BUFFER);
        assert_eq!(BufferKind::Index.usage(), vk::BufferUsageFlags::INDEX_BUFFER);
        assert_eq!(BufferKind::Uniform.usage(), vk::BufferUsageFlags::UNIFORM_BUFFER);
        assert_eq!(BufferKind::Storage.usage(), vk::BufferUsageFlags::STORAGE_BUFFER);
    }

    #[test]
    fn allocation_must_cover_request() {
        assert!(check_allocation_size(60, 64).is_ok());
        assert!(check_allocation_size(64, 64).is_ok());
        assert!(check_allocation_size(65, 64).is_err());
    }

    #[test]
    fn exact_size_payload_is_copied() -> Result<()> {
        // Requirement rounded up past the request, as drivers do
        let mut mapped = vec![0xAAu8; 64];
        let payload: Vec<u8> = (0..60).collect();

        write_bytes(&mut mapped, &payload)?;

        assert_eq!(&mapped[..60], payload.as_slice());
        assert!(mapped[60..].iter().all(|&b| b == 0xAA));
        Ok(())
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut mapped = vec![0u8; 16];
        let err = write_bytes(&mut mapped, &[1u8; 17]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Data of 17 bytes does not fit in a buffer of 16 bytes"
        );
        assert!(mapped.iter().all(|&b| b == 0));
    }
}
