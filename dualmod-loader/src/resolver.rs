//! Specifier resolution
//!
//! Turns `(specifier, referrer, mode)` into a canonical [`ModuleLocation`].
//! Blocking requests (`require`) use the legacy rules: extension inference
//! and directory indexes. Everything else uses the declarative rules,
//! where the exact file must exist.

use crate::fs::{normalize_path, FileSystem};
use crate::location::{ModuleLocation, ResolutionMode};
use crate::package::{parse_package_specifier, ExportMap, ExportMatch, PackageCache, PackageScope};
use crate::{LoadError, LoaderConfig, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

/// Resolves module specifiers against the file system and package metadata
#[derive(Debug, Clone)]
pub struct SpecifierResolver {
    fs: Arc<dyn FileSystem>,
    packages: PackageCache,
    config: Arc<LoaderConfig>,
}

impl SpecifierResolver {
    /// Create a resolver sharing a descriptor cache
    pub fn new(fs: Arc<dyn FileSystem>, packages: PackageCache, config: Arc<LoaderConfig>) -> Self {
        Self { fs, packages, config }
    }

    /// Resolve a specifier requested by `referrer`
    pub fn resolve(
        &self,
        specifier: &str,
        referrer: &ModuleLocation,
        mode: ResolutionMode,
    ) -> Result<ModuleLocation> {
        if specifier.is_empty() || specifier.contains('\0') {
            return Err(unresolved(specifier, referrer));
        }

        let legacy = mode.uses_legacy_rules();
        let path = if is_path_specifier(specifier) {
            let base = if specifier.starts_with('/') {
                PathBuf::from(specifier)
            } else {
                referrer.dir().join(specifier)
            };
            self.resolve_path(&normalize_path(&base), specifier, referrer, legacy)?
        } else {
            self.resolve_package(specifier, referrer, mode)?
        };

        let location = self.canonical(&path)?;
        debug!("Resolved '{}' from {} ({}) to {}", specifier, referrer, mode, location);
        Ok(location)
    }

    /// Resolve an entry point handed to the loader by an external caller
    pub fn resolve_entry(&self, path: &Path) -> Result<ModuleLocation> {
        let path = normalize_path(path);
        if self.fs.is_file(&path) {
            self.canonical(&path)
        } else if self.fs.is_dir(&path) {
            Err(LoadError::UnsupportedDirectoryImport {
                path,
                referrer: "<entry>".to_string(),
            })
        } else {
            Err(LoadError::UnresolvedModule {
                specifier: path.display().to_string(),
                referrer: "<entry>".to_string(),
            })
        }
    }

    fn canonical(&self, path: &Path) -> Result<ModuleLocation> {
        let canonical = self
            .fs
            .canonicalize(path)
            .map_err(|e| LoadError::io(path, e))?;
        Ok(ModuleLocation::new(canonical))
    }

    fn resolve_path(
        &self,
        path: &Path,
        specifier: &str,
        referrer: &ModuleLocation,
        legacy: bool,
    ) -> Result<PathBuf> {
        if legacy {
            if let Some(found) = self.legacy_file(path) {
                return Ok(found);
            }
            if self.fs.is_dir(path) {
                if let Some(found) = self.legacy_directory(path)? {
                    return Ok(found);
                }
            }
            return Err(unresolved(specifier, referrer));
        }

        if self.fs.is_file(path) {
            Ok(path.to_path_buf())
        } else if self.fs.is_dir(path) {
            Err(LoadError::UnsupportedDirectoryImport {
                path: path.to_path_buf(),
                referrer: referrer.to_string(),
            })
        } else {
            Err(unresolved(specifier, referrer))
        }
    }

    /// Exact file, then each configured extension appended
    fn legacy_file(&self, path: &Path) -> Option<PathBuf> {
        if self.fs.is_file(path) {
            return Some(path.to_path_buf());
        }
        self.config.legacy_extensions.iter().find_map(|ext| {
            let mut candidate = OsString::from(path.as_os_str());
            candidate.push(ext);
            let candidate = PathBuf::from(candidate);
            trace!("Trying {}", candidate.display());
            self.fs.is_file(&candidate).then_some(candidate)
        })
    }

    /// Descriptor `main`, then index files
    fn legacy_directory(&self, dir: &Path) -> Result<Option<PathBuf>> {
        if let Some(scope) = self.packages.read_scope(dir)? {
            if let Some(main) = scope.descriptor.main.as_deref() {
                let main_path = normalize_path(&dir.join(main));
                if let Some(found) = self.legacy_file(&main_path) {
                    return Ok(Some(found));
                }
                if let Some(found) = self.index_file(&main_path) {
                    return Ok(Some(found));
                }
            }
        }
        Ok(self.index_file(dir))
    }

    fn index_file(&self, dir: &Path) -> Option<PathBuf> {
        self.config
            .index_files
            .iter()
            .map(|index| dir.join(index))
            .find(|candidate| self.fs.is_file(candidate))
    }

    fn resolve_package(
        &self,
        specifier: &str,
        referrer: &ModuleLocation,
        mode: ResolutionMode,
    ) -> Result<PathBuf> {
        let (name, subpath) =
            parse_package_specifier(specifier).ok_or_else(|| unresolved(specifier, referrer))?;

        if let Some(scope) = self.packages.nearest_scope(referrer.dir())? {
            if scope.descriptor.name.as_deref() == Some(name) {
                if let Some(map) = scope.export_map.clone() {
                    trace!("Self-reference to package {}", name);
                    return self.resolve_exports(&scope, &map, &subpath, specifier, referrer, mode);
                }
            }
        }

        for dir in referrer.dir().ancestors() {
            if dir.ends_with(&self.config.modules_dir) {
                continue;
            }
            let package_dir = dir.join(&self.config.modules_dir).join(name);
            if !self.fs.is_dir(&package_dir) {
                continue;
            }
            trace!("Found package {} at {}", name, package_dir.display());
            return match self.packages.read_scope(&package_dir)? {
                Some(scope) => match scope.export_map.clone() {
                    Some(map) => {
                        self.resolve_exports(&scope, &map, &subpath, specifier, referrer, mode)
                    }
                    None => self.resolve_without_exports(&package_dir, &subpath, specifier, referrer, mode),
                },
                None => self.resolve_without_exports(&package_dir, &subpath, specifier, referrer, mode),
            };
        }

        Err(unresolved(specifier, referrer))
    }

    fn resolve_exports(
        &self,
        scope: &PackageScope,
        map: &ExportMap,
        subpath: &str,
        specifier: &str,
        referrer: &ModuleLocation,
        mode: ResolutionMode,
    ) -> Result<PathBuf> {
        let mut conditions = vec![mode.condition().to_string(), "node".to_string()];
        conditions.extend(self.config.conditions.iter().cloned());

        let target = match map.resolve(subpath, &conditions) {
            ExportMatch::Target(target) => target,
            ExportMatch::NotExported => {
                debug!("Subpath {} not exported by {}", subpath, scope.descriptor_path.display());
                return Err(LoadError::PathNotExported {
                    subpath: subpath.to_string(),
                    package: scope.descriptor_path.clone(),
                });
            }
        };

        let invalid = || LoadError::InvalidPackageTarget {
            target: target.clone(),
            subpath: subpath.to_string(),
            package: scope.descriptor_path.clone(),
        };
        // targets stay inside the package
        if !target.starts_with("./")
            || target
                .split('/')
                .skip(1)
                .any(|segment| matches!(segment, "." | ".." | "node_modules"))
        {
            return Err(invalid());
        }
        let path = normalize_path(&scope.dir.join(&target));

        if self.fs.is_file(&path) {
            Ok(path)
        } else if self.fs.is_dir(&path) && !mode.uses_legacy_rules() {
            Err(LoadError::UnsupportedDirectoryImport {
                path,
                referrer: referrer.to_string(),
            })
        } else {
            Err(unresolved(specifier, referrer))
        }
    }

    fn resolve_without_exports(
        &self,
        package_dir: &Path,
        subpath: &str,
        specifier: &str,
        referrer: &ModuleLocation,
        mode: ResolutionMode,
    ) -> Result<PathBuf> {
        if subpath == "." {
            return self
                .legacy_directory(package_dir)?
                .ok_or_else(|| unresolved(specifier, referrer));
        }
        let path = normalize_path(&package_dir.join(subpath));
        self.resolve_path(&path, specifier, referrer, mode.uses_legacy_rules())
    }
}

fn is_path_specifier(specifier: &str) -> bool {
    specifier == "."
        || specifier == ".."
        || specifier.starts_with("./")
        || specifier.starts_with("../")
        || specifier.starts_with('/')
}

fn unresolved(specifier: &str, referrer: &ModuleLocation) -> LoadError {
    LoadError::UnresolvedModule {
        specifier: specifier.to_string(),
        referrer: referrer.to_string(),
    }
}
