// Vertex data for the demo triangle

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};

use crate::backend::{BufferElement, BufferLayout, ShaderDataType};

/// Matches the vertex shader inputs: location 0 position, location 1 color
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec2,
    pub color: Vec3,
}

impl Vertex {
    pub const fn new(position: Vec2, color: Vec3) -> Self {
        Self { position, color }
    }

    pub fn layout() -> BufferLayout {
        BufferLayout::new([
            BufferElement::new(ShaderDataType::Float2, "inPosition"),
            BufferElement::new(ShaderDataType::Float3, "inColor"),
        ])
    }
}

/// Clip-space triangle, clockwise: red top, green bottom right, blue bottom left
pub const TRIANGLE: [Vertex; 3] = [
    Vertex::new(Vec2::new(0.0, -0.5), Vec3::new(1.0, 0.0, 0.0)),
    Vertex::new(Vec2::new(0.5, 0.5), Vec3::new(0.0, 1.0, 0.0)),
    Vertex::new(Vec2::new(-0.5, 0.5), Vec3::new(0.0, 0.0, 1.0)),
];

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;

    #[test]
    fn layout_matches_struct() {
        let layout = Vertex::layout();
        assert_eq!(layout.stride() as usize, std::mem::size_of::<Vertex>());
        assert_eq!(layout.elements()[1].offset as usize, std::mem::size_of::<Vec2>());
    }

    #[test]
    fn attributes_use_shader_locations() -> anyhow::Result<()> {
        let attributes = Vertex::layout().attribute_descriptions()?;
        assert_eq!(attributes.len(), 2);
        assert_eq!(attributes[0].location, 0);
        assert_eq!(attributes[0].format, vk::Format::R32G32_SFLOAT);
        assert_eq!(attributes[1].location, 1);
        assert_eq!(attributes[1].format, vk::Format::R32G32B32_SFLOAT);
        Ok(())
    }

    #[test]
    fn triangle_bytes_are_tightly_packed() {
        let bytes: &[u8] = bytemuck::cast_slice(&TRIANGLE);
        assert_eq!(bytes.len(), 3 * 5 * std::mem::size_of::<f32>());
        // First float of vertex 1 is its x position
        assert_eq!(&bytes[20..24], &0.5f32.to_ne_bytes());
    }
}
