//! Module locations, formats and resolution modes

use crate::fs::normalize_path;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;

/// Canonical absolute identifier of a module; the registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleLocation(Arc<Path>);

impl ModuleLocation {
    /// Create a location from a path, normalizing `.` and `..` components
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self(Arc::from(normalize_path(path.as_ref())))
    }

    /// The full path
    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Directory containing the module
    pub fn dir(&self) -> &Path {
        self.0.parent().unwrap_or(&self.0)
    }

    /// File extension without the dot, if any
    pub fn extension(&self) -> Option<&str> {
        self.0.extension().and_then(|ext| ext.to_str())
    }

    /// `file:` URL of the module
    pub fn url(&self) -> String {
        match Url::from_file_path(&self.0) {
            Ok(url) => url.into(),
            Err(()) => format!("file://{}", self.0.display()),
        }
    }

    /// Owned copy of the path
    pub fn to_path_buf(&self) -> PathBuf {
        self.0.to_path_buf()
    }
}

impl fmt::Display for ModuleLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl Serialize for ModuleLocation {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// The two module formats sharing one graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleFormat {
    /// Synchronous format with one mutable exports object
    Legacy,
    /// Statically analyzed format with live bindings
    Declarative,
}

impl fmt::Display for ModuleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleFormat::Legacy => write!(f, "legacy"),
            ModuleFormat::Declarative => write!(f, "declarative"),
        }
    }
}

/// How a specifier was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionMode {
    /// Import declaration, resolved before evaluation
    Static,
    /// Blocking request (`require`)
    DynamicSync,
    /// Asynchronous request (`import()`)
    DynamicAsync,
}

impl ResolutionMode {
    /// Whether the legacy rule set (extension inference, directory
    /// indexes, `require` condition) applies
    pub fn uses_legacy_rules(self) -> bool {
        matches!(self, ResolutionMode::DynamicSync)
    }

    /// Export map condition matching this mode's rule set
    pub fn condition(self) -> &'static str {
        if self.uses_legacy_rules() {
            "require"
        } else {
            "import"
        }
    }
}

impl fmt::Display for ResolutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionMode::Static => write!(f, "static"),
            ResolutionMode::DynamicSync => write!(f, "require"),
            ResolutionMode::DynamicAsync => write!(f, "import()"),
        }
    }
}
