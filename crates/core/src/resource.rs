//! Embedded Resources
//!
//! Reference data (signature lists, known-good hashes, ...) that generators
//! load through an [`EmbeddedResourceLoader`]. The loader is exposed to
//! generators as the shared value [`ResourceLoaderRef`].

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::dependency::{Dependency, GeneratedValues, ResolvedValues};
use crate::error::{CoreError, CoreResult};
use crate::generator::Generator;
use crate::value::{Value, ValueTag};

/// Loads named resource files.
pub trait EmbeddedResourceLoader: Send + Sync {
    fn load_file(&self, path: &Path) -> CoreResult<Vec<u8>>;
}

/// Loader reading from a directory on disk.
#[derive(Debug, Clone)]
pub struct FileResourceLoader {
    root: PathBuf,
}

impl FileResourceLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl EmbeddedResourceLoader for FileResourceLoader {
    fn load_file(&self, path: &Path) -> CoreResult<Vec<u8>> {
        if path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(CoreError::resource(format!(
                "resource path must stay inside the resource root: {}",
                path.display()
            )));
        }
        let full = self.root.join(path);
        std::fs::read(&full)
            .map_err(|e| CoreError::resource(format!("{}: {e}", full.display())))
    }
}

/// Loader serving fixed in-memory files.
#[derive(Debug, Clone, Default)]
pub struct MemoryResourceLoader {
    files: HashMap<PathBuf, Vec<u8>>,
}

impl MemoryResourceLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>, content: impl Into<Vec<u8>>) -> Self {
        self.files.insert(path.into(), content.into());
        self
    }
}

impl EmbeddedResourceLoader for MemoryResourceLoader {
    fn load_file(&self, path: &Path) -> CoreResult<Vec<u8>> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| CoreError::resource(format!("no such resource: {}", path.display())))
    }
}

/// Shared value giving generators access to the resource loader.
#[derive(Clone)]
pub struct ResourceLoaderRef(pub Arc<dyn EmbeddedResourceLoader>);
crate::impl_value!(ResourceLoaderRef, "core.resource_loader");

/// Generator publishing the configured loader as [`ResourceLoaderRef`].
pub struct ResourceLoaderGenerator {
    loader: Arc<dyn EmbeddedResourceLoader>,
}

impl ResourceLoaderGenerator {
    pub fn new(loader: Arc<dyn EmbeddedResourceLoader>) -> Self {
        Self { loader }
    }
}

const RESOURCE_LOADER_OUTPUTS: &[ValueTag] = &[ResourceLoaderRef::TAG];

impl Generator for ResourceLoaderGenerator {
    fn name(&self) -> &'static str {
        "resource_loader"
    }

    fn dependencies(&self) -> &[Dependency] {
        &[]
    }

    fn outputs(&self) -> &[ValueTag] {
        RESOURCE_LOADER_OUTPUTS
    }

    fn generate(&self, _inputs: &ResolvedValues, out: &mut GeneratedValues<'_>) -> CoreResult<()> {
        out.set(ResourceLoaderRef(Arc::clone(&self.loader)))
    }
}
