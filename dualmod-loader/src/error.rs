//! Loader error types

use crate::location::ModuleLocation;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Type alias for loader results
pub type Result<T> = std::result::Result<T, LoadError>;

/// Errors that can occur while resolving, linking or evaluating modules.
///
/// Errors are `Clone` because an errored module record keeps its failure
/// and re-raises it on every later request.
#[derive(Error, Debug, Clone)]
pub enum LoadError {
    /// No file matches the specifier under the active resolution rules
    #[error("Cannot find module '{specifier}' imported from {referrer}")]
    UnresolvedModule {
        /// The specifier as written by the requester
        specifier: String,
        /// Location (or description) of the requester
        referrer: String,
    },

    /// The package has an export map and the subpath is not listed in it
    #[error("Package subpath '{subpath}' is not defined by \"exports\" in {}", .package.display())]
    PathNotExported {
        /// Requested package subpath (`.` or `./x`)
        subpath: String,
        /// Path to the package descriptor
        package: PathBuf,
    },

    /// A directory was named where the declarative rules need a file
    #[error("Directory import '{}' is not supported resolving declarative modules imported from {referrer}", .path.display())]
    UnsupportedDirectoryImport {
        /// The directory that was requested
        path: PathBuf,
        /// Location of the requester
        referrer: String,
    },

    /// A static import asked for a name the target namespace does not provide
    #[error("SyntaxError: Named export '{name}' not found. The requested module '{module}' does not provide an export named '{name}'")]
    NamedExportNotFound {
        /// Missing export name
        name: String,
        /// Module that was expected to provide it
        module: ModuleLocation,
        /// Module holding the import, when known
        importer: Option<ModuleLocation>,
    },

    /// A synchronous request closed a cycle that cannot complete
    #[error("Cannot require() {target} in a cycle. (from {requester})")]
    RequireCycleModule {
        /// Module issuing the blocking request
        requester: ModuleLocation,
        /// Module whose evaluation cannot finish first
        target: ModuleLocation,
    },

    /// A module body failed
    #[error("Error evaluating module {module}: {message}")]
    EvaluationError {
        /// Module whose body failed
        module: ModuleLocation,
        /// Failure reported by the body
        message: String,
    },

    /// The synchronous bridge met a subgraph that needs to suspend
    #[error("require() cannot synchronously load {module}: {reason}")]
    SynchronousBridgeViolation {
        /// Module that would have to suspend
        module: ModuleLocation,
        /// Why synchronous completion is impossible
        reason: String,
    },

    /// A binding was read before its module initialized it
    #[error("ReferenceError: Cannot access '{name}' of {module} before initialization")]
    UninitializedBinding {
        /// Binding name
        name: String,
        /// Module owning the binding
        module: ModuleLocation,
    },

    /// An export map target is malformed
    #[error("Invalid package target '{target}' for '{subpath}' in {}", .package.display())]
    InvalidPackageTarget {
        /// Target string found in the export map
        target: String,
        /// Subpath being resolved
        subpath: String,
        /// Path to the package descriptor
        package: PathBuf,
    },

    /// A package descriptor could not be parsed
    #[error("Invalid package descriptor {}: {message}", .path.display())]
    InvalidPackageDescriptor {
        /// Path to the descriptor
        path: PathBuf,
        /// Parser message
        message: String,
    },

    /// Evaluation was dropped before it completed
    #[error("Evaluation of module {module} was abandoned before completion")]
    EvaluationAbandoned {
        /// Module whose evaluation was dropped
        module: ModuleLocation,
    },

    /// I/O error while reading a module or descriptor
    #[error("IO error reading {}: {error}", .path.display())]
    Io {
        /// Path that failed to read
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        error: Arc<std::io::Error>,
    },
}

impl LoadError {
    /// Stable machine-readable code for this error
    pub fn code(&self) -> &'static str {
        match self {
            LoadError::UnresolvedModule { .. } => "ERR_MODULE_NOT_FOUND",
            LoadError::PathNotExported { .. } => "ERR_PACKAGE_PATH_NOT_EXPORTED",
            LoadError::UnsupportedDirectoryImport { .. } => "ERR_UNSUPPORTED_DIR_IMPORT",
            LoadError::NamedExportNotFound { .. } => "ERR_NAMED_EXPORT_NOT_FOUND",
            LoadError::RequireCycleModule { .. } => "ERR_REQUIRE_CYCLE_MODULE",
            LoadError::EvaluationError { .. } => "ERR_EVALUATION",
            LoadError::SynchronousBridgeViolation { .. } => "ERR_REQUIRE_ASYNC_MODULE",
            LoadError::UninitializedBinding { .. } => "ERR_UNINITIALIZED_BINDING",
            LoadError::InvalidPackageTarget { .. } => "ERR_INVALID_PACKAGE_TARGET",
            LoadError::InvalidPackageDescriptor { .. } => "ERR_INVALID_PACKAGE_CONFIG",
            LoadError::EvaluationAbandoned { .. } => "ERR_EVALUATION_ABANDONED",
            LoadError::Io { .. } => "ERR_IO",
        }
    }

    /// Whether the failure came from resolving a specifier
    pub fn is_resolution_error(&self) -> bool {
        matches!(
            self,
            LoadError::UnresolvedModule { .. }
                | LoadError::PathNotExported { .. }
                | LoadError::UnsupportedDirectoryImport { .. }
                | LoadError::InvalidPackageTarget { .. }
        )
    }

    pub(crate) fn io(path: impl Into<PathBuf>, error: std::io::Error) -> Self {
        LoadError::Io {
            path: path.into(),
            error: Arc::new(error),
        }
    }
}
