//! Dual-format module loader
//!
//! This crate resolves, loads and links two interoperating module formats
//! within one module graph:
//! - legacy modules: synchronous bodies sharing one mutable exports object
//! - declarative modules: static import/export declarations with live
//!   bindings and possibly asynchronous evaluation
//!
//! It provides:
//! - Specifier resolution with export maps and per-format rules
//! - Format classification from markers, file names and package defaults
//! - Static export detection for legacy modules
//! - A per-loader module registry with cycle detection
//! - Linking/evaluation with at-most-once semantics
//! - A synchronous bridge from legacy to declarative modules

pub mod analysis;
pub mod body;
mod bridge;
pub mod classify;
pub mod detect;
pub mod environment;
pub mod error;
pub mod fs;
pub mod lexer;
mod linker;
pub mod loader;
pub mod location;
pub mod namespace;
pub mod package;
pub mod registry;
pub mod resolver;
pub mod value;

pub use body::{async_body, sync_body, BodyHost, BodyTable, ModuleBody};
pub use classify::FormatClassifier;
pub use detect::DetectedExports;
pub use environment::ModuleEnvironment;
pub use error::{LoadError, Result};
pub use fs::{FileSystem, MemoryFs, RealFs};
pub use loader::{EvalContext, LoaderBuilder, ModuleLoader};
pub use location::{ModuleFormat, ModuleLocation, ResolutionMode};
pub use namespace::{Binding, BindingKind, Namespace};
pub use registry::{CyclicEdge, Dependency, ModuleRecord, ModuleRegistry, ModuleState};
pub use resolver::SpecifierResolver;
pub use value::{ObjectKind, ObjectRef, Value};

use serde::{Deserialize, Serialize};

/// Loader configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Extensions tried, in order, by legacy resolution
    pub legacy_extensions: Vec<String>,

    /// Index files tried, in order, for legacy directory requests
    pub index_files: Vec<String>,

    /// Directory name searched for bare package specifiers
    pub modules_dir: String,

    /// Extra export map conditions, tried after `import`/`require` and `node`
    pub conditions: Vec<String>,

    /// Classify `.js` files by their syntax when no package type is declared
    pub detect_module_syntax: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            legacy_extensions: vec![".js".to_string(), ".json".to_string()],
            index_files: vec!["index.js".to_string(), "index.json".to_string()],
            modules_dir: "node_modules".to_string(),
            conditions: Vec::new(),
            detect_module_syntax: true,
        }
    }
}
