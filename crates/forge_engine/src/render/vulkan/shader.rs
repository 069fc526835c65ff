//! SPIR-V shader modules
//!
//! Loads a compiled SPIR-V blob, determines its entry point and stage from
//! the binary (handling either endianness), and wraps the Vulkan module.

use std::ffi::CString;

use ash::vk;

use crate::assets::Pack;

use super::context::{Context, VulkanError, VulkanResult};

const SPIRV_MAGIC: u32 = 0x0723_0203;
const OP_ENTRY_POINT: u32 = 15;

/// A shader module with its entry-point metadata.
pub struct Shader {
    device: ash::Device,
    module: vk::ShaderModule,
    stage: vk::ShaderStageFlags,
    entry_point: CString,
}

fn execution_model_to_stage(model: u32) -> VulkanResult<vk::ShaderStageFlags> {
    match model {
        0 => Ok(vk::ShaderStageFlags::VERTEX),
        4 => Ok(vk::ShaderStageFlags::FRAGMENT),
        5 => Ok(vk::ShaderStageFlags::COMPUTE),
        _ => Err(VulkanError::InvalidOperation(format!(
            "unsupported shader execution model {model}"
        ))),
    }
}

fn decode_string(words: &[u32]) -> String {
    let mut bytes = Vec::new();
    'words: for word in words {
        for shift in [0u32, 8, 16, 24] {
            let byte = ((word >> shift) & 0xff) as u8;
            if byte == 0 {
                break 'words;
            }
            bytes.push(byte);
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

impl Shader {
    /// Creates a shader module from SPIR-V bytes.
    pub fn from_spirv(context: &Context, bytes: &[u8]) -> VulkanResult<Self> {
        if bytes.len() < 20 || bytes.len() % 4 != 0 {
            return Err(VulkanError::InvalidOperation(
                "truncated SPIR-V module".to_owned(),
            ));
        }
        let mut words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes(chunk.try_into().unwrap()))
            .collect();
        if words[0] == SPIRV_MAGIC.swap_bytes() {
            for word in &mut words {
                *word = word.swap_bytes();
            }
        }
        if words[0] != SPIRV_MAGIC {
            return Err(VulkanError::InvalidOperation(
                "bad SPIR-V magic number".to_owned(),
            ));
        }

        // Scan for the first OpEntryPoint to learn the stage and name.
        let mut entry = None;
        let mut cursor = 5;
        while cursor < words.len() {
            let opcode = words[cursor] & 0xffff;
            let count = (words[cursor] >> 16) as usize;
            if count == 0 || cursor + count > words.len() {
                return Err(VulkanError::InvalidOperation(
                    "malformed SPIR-V instruction stream".to_owned(),
                ));
            }
            if opcode == OP_ENTRY_POINT {
                let stage = execution_model_to_stage(words[cursor + 1])?;
                let name = decode_string(&words[cursor + 3..cursor + count]);
                entry = Some((stage, name));
                break;
            }
            cursor += count;
        }
        let Some((stage, name)) = entry else {
            return Err(VulkanError::InvalidOperation(
                "SPIR-V module has no entry point".to_owned(),
            ));
        };

        let module_ci = vk::ShaderModuleCreateInfo::builder().code(&words);
        let module = unsafe { context.device().create_shader_module(&module_ci, None) }?;
        log::debug!("[vulkan] loaded {stage:?} shader '{name}'");
        Ok(Self {
            device: context.device().clone(),
            module,
            stage,
            entry_point: CString::new(name).unwrap_or_default(),
        })
    }

    /// Loads a compiled shader blob from a pack.
    pub fn load(context: &Context, pack: &dyn Pack, name: &str) -> VulkanResult<Self> {
        let mut stream = pack
            .open(name)
            .map_err(|error| VulkanError::InvalidOperation(format!("shader '{name}': {error}")))?;
        let mut bytes = Vec::new();
        std::io::Read::read_to_end(&mut stream, &mut bytes)
            .map_err(|error| VulkanError::InvalidOperation(format!("shader '{name}': {error}")))?;
        Self::from_spirv(context, &bytes)
    }

    /// The pipeline stage this shader runs at.
    pub fn stage(&self) -> vk::ShaderStageFlags {
        self.stage
    }

    /// The raw module handle.
    pub fn module(&self) -> vk::ShaderModule {
        self.module
    }

    /// The entry point name.
    pub fn entry_point(&self) -> &std::ffi::CStr {
        &self.entry_point
    }
}

impl Drop for Shader {
    fn drop(&mut self) {
        unsafe { self.device.destroy_shader_module(self.module, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_point_string_decode() {
        // "vertex_main" packed little-endian with nul termination.
        let words = [
            u32::from_le_bytes(*b"vert"),
            u32::from_le_bytes(*b"ex_m"),
            u32::from_le_bytes(*b"ain\0"),
        ];
        assert_eq!(decode_string(&words), "vertex_main");
    }

    #[test]
    fn execution_models_map_to_stages() {
        assert_eq!(execution_model_to_stage(0).unwrap(), vk::ShaderStageFlags::VERTEX);
        assert_eq!(execution_model_to_stage(4).unwrap(), vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(execution_model_to_stage(5).unwrap(), vk::ShaderStageFlags::COMPUTE);
        assert!(execution_model_to_stage(3).is_err());
    }
}
