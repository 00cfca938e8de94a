//! Shader module cache
//!
//! SPIR-V modules keyed by file path. The cache belongs to one
//! [`RenderDevice`](crate::render::RenderDevice) and is torn down with it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::render::api::{GpuBackend, RawShaderModule};
use crate::render::{RenderError, RenderResult};

/// Loaded shader modules by path
#[derive(Debug)]
pub struct ShaderCache {
    dir: PathBuf,
    modules: HashMap<PathBuf, RawShaderModule>,
}

impl ShaderCache {
    /// Cache resolving relative names against `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            modules: HashMap::new(),
        }
    }

    fn resolve(&self, name: &str) -> PathBuf {
        let path = Path::new(name);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.dir.join(path)
        }
    }

    /// Module for `name`, loading it from disk on first use
    pub fn get_or_load<B: GpuBackend>(&mut self, backend: &mut B, name: &str) -> RenderResult<RawShaderModule> {
        let path = self.resolve(name);
        if let Some(module) = self.modules.get(&path) {
            return Ok(*module);
        }

        let bytes = std::fs::read(&path).map_err(|e| {
            log::error!("Failed to read shader {}: {e}", path.display());
            RenderError::ShaderOrPipelineBuildFailure(format!("cannot read {}: {e}", path.display()))
        })?;
        let words = spirv_words(&bytes)
            .ok_or_else(|| RenderError::ShaderOrPipelineBuildFailure(format!("{} is not SPIR-V", path.display())))?;

        let module = backend.create_shader_module(&words)?;
        log::debug!("Loaded shader {} ({} words)", path.display(), words.len());
        self.modules.insert(path, module);
        Ok(module)
    }

    /// Register in-memory SPIR-V under `name`, replacing nothing already cached
    pub fn preload<B: GpuBackend>(&mut self, backend: &mut B, name: &str, words: &[u32]) -> RenderResult<RawShaderModule> {
        let path = self.resolve(name);
        if let Some(module) = self.modules.get(&path) {
            return Ok(*module);
        }
        let module = backend.create_shader_module(words)?;
        self.modules.insert(path, module);
        Ok(module)
    }

    /// Whether `name` is loaded
    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(&self.resolve(name))
    }

    /// Number of loaded modules
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Whether nothing is loaded
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Destroy every module
    pub fn destroy_all<B: GpuBackend>(&mut self, backend: &mut B) {
        for (_, module) in self.modules.drain() {
            backend.destroy_shader_module(module);
        }
    }
}

/// Reinterpret little-endian SPIR-V bytes as words
fn spirv_words(bytes: &[u8]) -> Option<Vec<u32>> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::{stub_spirv, HeadlessBackend};

    #[test]
    fn test_modules_are_cached_by_path() {
        let dir = std::env::temp_dir().join(format!("render_core_shaders_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let bytes: Vec<u8> = stub_spirv().iter().flat_map(|w| w.to_le_bytes()).collect();
        std::fs::write(dir.join("quad.vert.spv"), bytes).unwrap();

        let mut backend = HeadlessBackend::default();
        let mut cache = ShaderCache::new(&dir);
        let first = cache.get_or_load(&mut backend, "quad.vert.spv").unwrap();
        let second = cache.get_or_load(&mut backend, "quad.vert.spv").unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_or_malformed_shader_is_build_failure() {
        let mut backend = HeadlessBackend::default();
        let mut cache = ShaderCache::new("/nonexistent/shader/dir");
        assert!(matches!(
            cache.get_or_load(&mut backend, "missing.spv"),
            Err(RenderError::ShaderOrPipelineBuildFailure(_))
        ));
        assert!(matches!(
            cache.preload(&mut backend, "bad.spv", &[1, 2, 3, 4, 5]),
            Err(RenderError::ShaderOrPipelineBuildFailure(_))
        ));
        assert!(spirv_words(&[1, 2, 3]).is_none());
    }

    #[test]
    fn test_preloaded_module_satisfies_lookup() {
        let mut backend = HeadlessBackend::default();
        let mut cache = ShaderCache::new("shaders");
        let module = cache.preload(&mut backend, "forward.frag.spv", &stub_spirv()).unwrap();
        assert!(cache.contains("forward.frag.spv"));
        assert_eq!(cache.get_or_load(&mut backend, "forward.frag.spv").unwrap(), module);

        cache.destroy_all(&mut backend);
        assert!(cache.is_empty());
    }
}
