// Shader loading
//
// Shaders are referred to by logical name and resolved to
// `<dir>/<name>.spv`, as produced by build.rs.

use anyhow::{Context, Result};
use ash::vk;
use std::fs::File;
use std::path::{Path, PathBuf};

pub struct ShaderLoader {
    dir: PathBuf,
}

impl ShaderLoader {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.spv", name))
    }

    /// Read the SPIR-V words for shader `name`.
    pub fn load(&self, name: &str) -> Result<Vec<u32>> {
        let path = self.path_for(name);
        let mut file = File::open(&path)
            .with_context(|| format!("Failed to open shader: {}", path.display()))?;
        let code = ash::util::read_spv(&mut file)
            .with_context(|| format!("Invalid SPIR-V in {}", path.display()))?;
        log::debug!("Loaded shader '{}' ({} words)", name, code.len());
        Ok(code)
    }
}

pub fn create_shader_module(device: &ash::Device, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

    unsafe {
        device
            .create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}
