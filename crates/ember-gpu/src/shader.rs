//! SPIR-V loading and shader modules.

use std::io::Cursor;
use std::path::Path;

use ash::vk;

use crate::error::{GpuError, Result};

/// Read a SPIR-V binary from disk.
pub fn read_spirv_file(path: impl AsRef<Path>) -> Result<Vec<u32>> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .map_err(|e| GpuError::Shader(format!("{}: {e}", path.display())))?;
    parse_spirv(&bytes).map_err(|e| GpuError::Shader(format!("{}: {e}", path.display())))
}

/// Decode SPIR-V words, checking length and magic number.
pub fn parse_spirv(bytes: &[u8]) -> std::result::Result<Vec<u32>, String> {
    ash::util::read_spv(&mut Cursor::new(bytes)).map_err(|e| e.to_string())
}

/// An owned shader module.
pub struct ShaderModule {
    module: vk::ShaderModule,
}

impl ShaderModule {
    /// Create a module from SPIR-V words.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device, code: &[u32]) -> Result<Self> {
        let info = vk::ShaderModuleCreateInfo::default().code(code);
        let module = device
            .create_shader_module(&info, None)
            .map_err(|e| GpuError::Shader(format!("vkCreateShaderModule failed: {e}")))?;
        Ok(Self { module })
    }

    /// Raw module handle.
    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }

    /// Destroy the module. Calling this again is a no-op.
    ///
    /// # Safety
    /// No pipeline creation may be using the module.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        if self.module != vk::ShaderModule::null() {
            device.destroy_shader_module(self.module, None);
            self.module = vk::ShaderModule::null();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_truncated_bytecode() {
        assert!(parse_spirv(&[0x03, 0x02, 0x23]).is_err());
    }

    #[test]
    fn rejects_wrong_magic() {
        assert!(parse_spirv(&[0u8; 8]).is_err());
    }

    #[test]
    fn accepts_spirv_header() {
        let mut bytes = 0x0723_0203_u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0000_u32.to_le_bytes());
        let words = parse_spirv(&bytes).unwrap();
        assert_eq!(words, vec![0x0723_0203, 0x0001_0000]);
    }

    #[test]
    fn missing_file_names_path() {
        let err = read_spirv_file("does/not/exist.spv").unwrap_err();
        assert!(err.to_string().contains("does/not/exist.spv"));
    }
}
