//! Package descriptors (`package.json`) and export maps

use crate::fs::FileSystem;
use crate::location::ModuleFormat;
use crate::{LoadError, Result};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

/// Name of the descriptor file looked up in package directories
pub const DESCRIPTOR_FILE: &str = "package.json";

/// Default format declared by a package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum PackageType {
    /// `"type": "module"`
    #[serde(rename = "module")]
    Module,
    /// `"type": "commonjs"`
    #[serde(rename = "commonjs")]
    CommonJs,
}

impl PackageType {
    /// Module format implied by this type
    pub fn format(self) -> ModuleFormat {
        match self {
            PackageType::Module => ModuleFormat::Declarative,
            PackageType::CommonJs => ModuleFormat::Legacy,
        }
    }
}

/// The parts of a package descriptor the loader consumes
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PackageDescriptor {
    /// Package name, used for self-reference
    #[serde(default)]
    pub name: Option<String>,

    /// Default format for `.js` files in the package
    #[serde(default, rename = "type")]
    pub package_type: Option<PackageType>,

    /// Legacy entry point used when there is no export map
    #[serde(default)]
    pub main: Option<String>,

    /// Raw `exports` field
    #[serde(default)]
    pub exports: Option<serde_json::Value>,

    /// Explicit per-file format markers, keyed by `./relative/path`
    #[serde(default)]
    pub formats: BTreeMap<String, PackageType>,
}

/// A package descriptor together with where it was found
#[derive(Debug, Clone)]
pub struct PackageScope {
    /// Directory containing the descriptor
    pub dir: PathBuf,
    /// Path of the descriptor file
    pub descriptor_path: PathBuf,
    /// Parsed descriptor
    pub descriptor: Arc<PackageDescriptor>,
    /// Parsed export map, if the descriptor has one
    pub export_map: Option<Arc<ExportMap>>,
}

impl PackageScope {
    /// Explicit format marker for a file inside this package
    pub fn format_marker(&self, file: &Path) -> Option<ModuleFormat> {
        let relative = file.strip_prefix(&self.dir).ok()?;
        let key = format!("./{}", relative.to_string_lossy().replace('\\', "/"));
        self.descriptor.formats.get(&key).map(|ty| ty.format())
    }
}

/// One target of an export map entry
#[derive(Debug, Clone, PartialEq)]
pub enum ExportTarget {
    /// Package-relative path, possibly containing `*`
    Path(String),
    /// Condition name -> target, in declaration order
    Conditional(Vec<(String, ExportTarget)>),
    /// Alternatives tried in order
    Fallback(Vec<ExportTarget>),
    /// Explicitly not exported
    Excluded,
}

impl ExportTarget {
    fn parse(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(path) => Some(ExportTarget::Path(path.clone())),
            serde_json::Value::Null => Some(ExportTarget::Excluded),
            serde_json::Value::Array(items) => Some(ExportTarget::Fallback(
                items.iter().filter_map(ExportTarget::parse).collect(),
            )),
            serde_json::Value::Object(map) => Some(ExportTarget::Conditional(
                map.iter()
                    .filter_map(|(cond, target)| Some((cond.clone(), ExportTarget::parse(target)?)))
                    .collect(),
            )),
            _ => None,
        }
    }
}

/// Result of matching a subpath against an export map
#[derive(Debug, Clone, PartialEq)]
pub enum ExportMatch {
    /// Package-relative target with any `*` already substituted
    Target(String),
    /// No entry, a `null` entry, or no applicable condition
    NotExported,
}

/// Package-level allow-list of importable subpaths.
///
/// A subpath that matches no entry is unresolvable from outside the
/// package even when the file exists.
#[derive(Debug, Clone, Default)]
pub struct ExportMap {
    exact: FxHashMap<String, ExportTarget>,
    patterns: Vec<(String, String, ExportTarget)>,
}

impl ExportMap {
    /// Build an export map from the raw `exports` field
    pub fn from_value(value: &serde_json::Value) -> Self {
        let mut map = ExportMap::default();
        let subpath_keys = match value {
            serde_json::Value::Object(obj) => obj.keys().any(|key| key.starts_with('.')),
            _ => false,
        };
        match value {
            serde_json::Value::Object(obj) if subpath_keys => {
                for (key, target) in obj {
                    if let Some(target) = ExportTarget::parse(target) {
                        map.insert(key, target);
                    }
                }
            }
            other => {
                if let Some(target) = ExportTarget::parse(other) {
                    map.insert(".", target);
                }
            }
        }
        map
    }

    fn insert(&mut self, key: &str, target: ExportTarget) {
        match key.split_once('*') {
            Some((prefix, suffix)) if !suffix.contains('*') => {
                self.patterns
                    .push((prefix.to_string(), suffix.to_string(), target));
            }
            _ => {
                self.exact.insert(key.to_string(), target);
            }
        }
    }

    /// Whether the map lists a subpath at all (ignoring conditions)
    pub fn has_entry(&self, subpath: &str) -> bool {
        self.exact.contains_key(subpath) || self.best_pattern(subpath).is_some()
    }

    /// Match `subpath` (`.` or `./x`) under the given active conditions
    pub fn resolve(&self, subpath: &str, conditions: &[String]) -> ExportMatch {
        if let Some(target) = self.exact.get(subpath) {
            return Self::select(target, None, conditions);
        }
        match self.best_pattern(subpath) {
            Some((target, star)) => Self::select(target, Some(star), conditions),
            None => ExportMatch::NotExported,
        }
    }

    fn best_pattern<'a>(&'a self, subpath: &'a str) -> Option<(&'a ExportTarget, &'a str)> {
        self.patterns
            .iter()
            .filter(|(prefix, suffix, _)| {
                subpath.len() >= prefix.len() + suffix.len()
                    && subpath.starts_with(prefix.as_str())
                    && subpath.ends_with(suffix.as_str())
            })
            .max_by_key(|(prefix, suffix, _)| (prefix.len(), suffix.len()))
            .map(|(prefix, suffix, target)| {
                (target, &subpath[prefix.len()..subpath.len() - suffix.len()])
            })
    }

    fn select(target: &ExportTarget, star: Option<&str>, conditions: &[String]) -> ExportMatch {
        match target {
            ExportTarget::Path(path) => match star {
                Some(star) => ExportMatch::Target(path.replace('*', star)),
                None => ExportMatch::Target(path.clone()),
            },
            ExportTarget::Excluded => ExportMatch::NotExported,
            ExportTarget::Fallback(items) => items
                .iter()
                .map(|item| Self::select(item, star, conditions))
                .find(|m| matches!(m, ExportMatch::Target(_)))
                .unwrap_or(ExportMatch::NotExported),
            ExportTarget::Conditional(entries) => {
                for (condition, nested) in entries {
                    if condition == "default" || conditions.iter().any(|c| c == condition) {
                        if let found @ ExportMatch::Target(_) = Self::select(nested, star, conditions) {
                            return found;
                        }
                    }
                }
                ExportMatch::NotExported
            }
        }
    }
}

/// Split a bare specifier into package name and subpath (`.` or `./x`)
pub fn parse_package_specifier(specifier: &str) -> Option<(&str, String)> {
    if specifier.is_empty() || specifier.starts_with('.') || specifier.contains('\\') {
        return None;
    }
    let name_end = if specifier.starts_with('@') {
        let first = specifier.find('/')?;
        specifier[first + 1..]
            .find('/')
            .map(|second| first + 1 + second)
            .unwrap_or(specifier.len())
    } else {
        specifier.find('/').unwrap_or(specifier.len())
    };
    let name = &specifier[..name_end];
    if name.is_empty() || name.ends_with('/') {
        return None;
    }
    let rest = &specifier[name_end..];
    let subpath = if rest.is_empty() {
        ".".to_string()
    } else {
        format!(".{}", rest)
    };
    Some((name, subpath))
}

/// Caches parsed descriptors per directory for one loader
#[derive(Debug, Clone)]
pub struct PackageCache {
    fs: Arc<dyn FileSystem>,
    scopes: Arc<RwLock<FxHashMap<PathBuf, Option<PackageScope>>>>,
}

impl PackageCache {
    /// Create an empty cache over a file system
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            scopes: Arc::new(RwLock::new(FxHashMap::default())),
        }
    }

    /// Descriptor located directly in `dir`, if any
    pub fn read_scope(&self, dir: &Path) -> Result<Option<PackageScope>> {
        if let Some(cached) = self.scopes.read().get(dir) {
            trace!("Descriptor cache hit: {}", dir.display());
            return Ok(cached.clone());
        }

        let descriptor_path = dir.join(DESCRIPTOR_FILE);
        let scope = if self.fs.is_file(&descriptor_path) {
            let contents = self
                .fs
                .read_to_string(&descriptor_path)
                .map_err(|e| LoadError::io(&descriptor_path, e))?;
            let descriptor: PackageDescriptor =
                serde_json::from_str(&contents).map_err(|e| LoadError::InvalidPackageDescriptor {
                    path: descriptor_path.clone(),
                    message: e.to_string(),
                })?;
            let export_map = descriptor
                .exports
                .as_ref()
                .map(|exports| Arc::new(ExportMap::from_value(exports)));
            debug!("Read package descriptor {}", descriptor_path.display());
            Some(PackageScope {
                dir: dir.to_path_buf(),
                descriptor_path,
                descriptor: Arc::new(descriptor),
                export_map,
            })
        } else {
            None
        };

        Ok(self
            .scopes
            .write()
            .entry(dir.to_path_buf())
            .or_insert(scope)
            .clone())
    }

    /// Nearest enclosing package of `path` (the path itself included)
    pub fn nearest_scope(&self, path: &Path) -> Result<Option<PackageScope>> {
        for dir in path.ancestors() {
            if dir.file_name().map_or(false, |name| name == "node_modules") {
                break;
            }
            if let Some(scope) = self.read_scope(dir)? {
                return Ok(Some(scope));
            }
        }
        Ok(None)
    }
}
