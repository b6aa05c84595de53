// Shader module loading
//
// Vulkan consumes SPIR-V bytecode. Shaders are compiled ahead of time
// (see build.rs) and read from disk at startup.

use anyhow::{Context, Result};
use ash::vk;
use std::ffi::CStr;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use super::Device;

/// Entry point every stage is compiled with
pub const ENTRY_POINT: &CStr = c"main";

/// Read a SPIR-V file from disk
pub fn read_shader_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read shader file: {:?}", path))
}

/// Convert SPIR-V bytes into aligned 4-byte words (handles either endianness)
pub fn spirv_words(code: &[u8]) -> Result<Vec<u32>> {
    ash::util::read_spv(&mut Cursor::new(code)).context("Invalid SPIR-V bytecode")
}

/// Create a shader module from SPIR-V bytes
pub fn create_shader_module(device: &Device, code: &[u8]) -> Result<vk::ShaderModule> {
    let words = spirv_words(code)?;
    let create_info = vk::ShaderModuleCreateInfo::default().code(&words);

    unsafe { device.device.create_shader_module(&create_info, None) }
        .context("Failed to create shader module")
}

/// Vertex + fragment shader pair
pub struct Shader {
    vertex: vk::ShaderModule,
    fragment: vk::ShaderModule,
    device: Arc<Device>,
}

impl Shader {
    pub fn load(device: Arc<Device>, vertex_path: &Path, fragment_path: &Path) -> Result<Self> {
        log::info!("Loading shaders {:?} and {:?}", vertex_path, fragment_path);

        let vertex_code = read_shader_file(vertex_path)?;
        let fragment_code = read_shader_file(fragment_path)?;

        Self::from_bytes(device, &vertex_code, &fragment_code)
    }

    pub fn from_bytes(device: Arc<Device>, vertex_code: &[u8], fragment_code: &[u8]) -> Result<Self> {
        let vertex = create_shader_module(&device, vertex_code)
            .context("Failed to create vertex shader")?;
        let fragment = match create_shader_module(&device, fragment_code) {
            Ok(module) => module,
            Err(e) => {
                unsafe { device.device.destroy_shader_module(vertex, None) };
                return Err(e.context("Failed to create fragment shader"));
            }
        };

        Ok(Self {
            vertex,
            fragment,
            device,
        })
    }

    /// Stage descriptions for pipeline creation
    pub fn stages(&self) -> [vk::PipelineShaderStageCreateInfo<'static>; 2] {
        [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(self.vertex)
                .name(ENTRY_POINT),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(self.fragment)
                .name(ENTRY_POINT),
        ]
    }
}

impl Drop for Shader {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_shader_module(self.vertex, None);
            self.device.device.destroy_shader_module(self.fragment, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    #[test]
    fn words_from_valid_header() -> Result<()> {
        let mut bytes = Vec::new();
        for word in [SPIRV_MAGIC, 0x0001_0000, 0, 8, 0] {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        let words = spirv_words(&bytes)?;
        assert_eq!(words.len(), 5);
        assert_eq!(words[0], SPIRV_MAGIC);
        Ok(())
    }

    #[test]
    fn truncated_bytecode_is_rejected() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.push(0);
        assert!(spirv_words(&bytes).is_err());
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = read_shader_file(Path::new("shaders/missing.spv")).unwrap_err();
        assert!(format!("{:#}", err).contains("missing.spv"));
    }
}
