// Shader module loading
//
// Vulkan consumes SPIR-V as a stream of 32-bit words. Bytecode is read once
// from disk, checked, and turned into modules only while a pipeline is built.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;

use crate::error::{RenderError, RenderResult};

pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Vertex and fragment bytecode for the triangle pipeline.
#[derive(Debug, Clone)]
pub struct ShaderBytecode {
    pub vertex: Vec<u32>,
    pub fragment: Vec<u32>,
}

impl ShaderBytecode {
    pub fn load(vertex: &Path, fragment: &Path) -> Result<Self> {
        let vertex_bytes = std::fs::read(vertex)
            .with_context(|| format!("Failed to read vertex shader: {:?}", vertex))?;
        let fragment_bytes = std::fs::read(fragment)
            .with_context(|| format!("Failed to read fragment shader: {:?}", fragment))?;

        let bytecode = Self::from_bytes(&vertex_bytes, &fragment_bytes)
            .with_context(|| format!("Invalid SPIR-V in {:?} or {:?}", vertex, fragment))?;

        log::info!(
            "Loaded shaders: {} + {} words",
            bytecode.vertex.len(),
            bytecode.fragment.len()
        );

        Ok(bytecode)
    }

    pub fn from_bytes(vertex: &[u8], fragment: &[u8]) -> RenderResult<Self> {
        Ok(Self {
            vertex: spirv_words(vertex)?,
            fragment: spirv_words(fragment)?,
        })
    }
}

/// Reinterpret raw bytes as SPIR-V words, fixing endianness if needed.
pub fn spirv_words(bytes: &[u8]) -> RenderResult<Vec<u32>> {
    let words = ash::util::read_spv(&mut Cursor::new(bytes))
        .map_err(|e| RenderError::ShaderLoad(e.to_string()))?;

    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        Some(other) => Err(RenderError::ShaderLoad(format!("bad magic number {:#010x}", other))),
        None => Err(RenderError::ShaderLoad("empty module".to_string())),
    }
}

pub fn create_shader_module(device: &ash::Device, words: &[u32]) -> RenderResult<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(words);

    unsafe { device.create_shader_module(&create_info, None) }
        .map_err(RenderError::ShaderModuleCreation)
}
