//! Format classification

use crate::analysis::ModuleAnalysis;
use crate::fs::FileSystem;
use crate::location::{ModuleFormat, ModuleLocation};
use crate::package::PackageCache;
use crate::{LoadError, LoaderConfig, Result};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::debug;

/// Decides whether a location holds a legacy or a declarative module.
///
/// Priority: explicit per-file marker in the nearest package descriptor,
/// then the file extension, then the package `type`, then (optionally)
/// the source syntax. Results are cached for the classifier's lifetime.
#[derive(Debug)]
pub struct FormatClassifier {
    fs: Arc<dyn FileSystem>,
    packages: PackageCache,
    config: Arc<LoaderConfig>,
    cache: RwLock<FxHashMap<ModuleLocation, ModuleFormat>>,
}

impl FormatClassifier {
    /// Create a classifier sharing a descriptor cache
    pub fn new(fs: Arc<dyn FileSystem>, packages: PackageCache, config: Arc<LoaderConfig>) -> Self {
        Self {
            fs,
            packages,
            config,
            cache: RwLock::new(FxHashMap::default()),
        }
    }

    /// Classify a location
    pub fn classify(&self, location: &ModuleLocation) -> Result<ModuleFormat> {
        if let Some(format) = self.cache.read().get(location) {
            return Ok(*format);
        }

        let format = self.classify_uncached(location)?;
        debug!("Classified {} as {}", location, format);
        Ok(*self
            .cache
            .write()
            .entry(location.clone())
            .or_insert(format))
    }

    fn classify_uncached(&self, location: &ModuleLocation) -> Result<ModuleFormat> {
        let scope = self.packages.nearest_scope(location.dir())?;

        if let Some(format) = scope
            .as_ref()
            .and_then(|scope| scope.format_marker(location.path()))
        {
            return Ok(format);
        }

        match location.extension() {
            Some("mjs") => return Ok(ModuleFormat::Declarative),
            Some("cjs") | Some("json") => return Ok(ModuleFormat::Legacy),
            _ => {}
        }

        if let Some(package_type) = scope
            .as_ref()
            .and_then(|scope| scope.descriptor.package_type)
        {
            return Ok(package_type.format());
        }

        if self.config.detect_module_syntax {
            let source = self
                .fs
                .read_to_string(location.path())
                .map_err(|e| LoadError::io(location.path(), e))?;
            if ModuleAnalysis::analyze(&source).has_module_syntax {
                return Ok(ModuleFormat::Declarative);
            }
        }

        Ok(ModuleFormat::Legacy)
    }
}
