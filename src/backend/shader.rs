// Shader module loading
//
// Vulkan consumes SPIR-V as 32-bit words. `read_spv` copies the bytes into
// an aligned buffer and checks the length and the magic number.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;

/// Create a shader module from SPIR-V bytes
pub fn create_shader_module(device: &ash::Device, code: &[u8]) -> Result<vk::ShaderModule> {
    let words = ash::util::read_spv(&mut Cursor::new(code)).context("Invalid SPIR-V binary")?;

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);

    unsafe {
        device
            .create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}
