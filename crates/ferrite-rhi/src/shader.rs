//! Shader modules.

use ash::vk;

use crate::device::Device;
use crate::error::{RhiError, Result};
use crate::handle::{ResourceKind, RhiHandle, ShaderModule};

/// First word of every SPIR-V binary.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Copy SPIR-V bytes into aligned words.
///
/// The input may come from anywhere (`include_bytes!`, a file read) and is not
/// guaranteed to be 4-byte aligned, so it is always copied.
pub fn spirv_words(code: &[u8]) -> Result<Vec<u32>> {
    let kind = ResourceKind::ShaderModule.name();
    if code.is_empty() || code.len() % 4 != 0 {
        return Err(RhiError::invalid(
            kind,
            format!("SPIR-V length {} is not a non-zero multiple of 4", code.len()),
        ));
    }

    let words: Vec<u32> = code
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    if words[0] != SPIRV_MAGIC {
        return Err(RhiError::invalid(
            kind,
            format!("bad SPIR-V magic {:#010x}", words[0]),
        ));
    }
    Ok(words)
}

impl Device {
    pub fn create_shader_module(&self, code: &[u8]) -> Result<ShaderModule> {
        let words = spirv_words(code)?;
        let create_info = vk::ShaderModuleCreateInfo::default().code(&words);
        let module = unsafe { self.raw().create_shader_module(&create_info, None)? };
        tracing::debug!(words = words.len(), "Created shader module");
        Ok(ShaderModule::from_raw(module))
    }

    pub fn destroy_shader_module(&self, module: &mut ShaderModule) {
        unsafe { self.raw().destroy_shader_module(module.take_raw(), None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn words_are_little_endian() {
        let bytes = module_bytes(&[SPIRV_MAGIC, 0x0001_0000, 7]);
        let words = spirv_words(&bytes).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 0x0001_0000, 7]);
    }

    #[test]
    fn unaligned_input_is_copied() {
        let mut padded = vec![0u8];
        padded.extend(module_bytes(&[SPIRV_MAGIC, 1]));
        assert_eq!(spirv_words(&padded[1..]).unwrap(), vec![SPIRV_MAGIC, 1]);
    }

    #[test]
    fn malformed_code_is_rejected() {
        assert!(spirv_words(&[]).is_err());
        assert!(spirv_words(&[0x03, 0x02, 0x23]).is_err());
        assert!(matches!(
            spirv_words(&module_bytes(&[0xdead_beef])),
            Err(RhiError::InvalidDescriptor {
                kind: "shader module",
                ..
            })
        ));
    }
}
