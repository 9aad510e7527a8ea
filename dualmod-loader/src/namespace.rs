//! Module namespaces and their bindings

use crate::location::ModuleLocation;
use crate::value::Value;
use crate::{LoadError, Result};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// How a binding relates to its exporter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingKind {
    /// Shared with the exporting module; reads see the current value
    Live,
    /// Written once when a legacy module finishes evaluating
    Snapshot,
}

/// A named slot in a namespace
#[derive(Clone)]
pub struct Binding {
    kind: BindingKind,
    cell: Arc<RwLock<Option<Value>>>,
}

impl Binding {
    /// An uninitialized live binding
    pub fn live() -> Self {
        Self {
            kind: BindingKind::Live,
            cell: Arc::new(RwLock::new(None)),
        }
    }

    /// An uninitialized snapshot binding
    pub fn snapshot() -> Self {
        Self {
            kind: BindingKind::Snapshot,
            cell: Arc::new(RwLock::new(None)),
        }
    }

    pub fn kind(&self) -> BindingKind {
        self.kind
    }

    /// Current value, `None` while uninitialized
    pub fn get(&self) -> Option<Value> {
        self.cell.read().clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.read().is_some()
    }

    /// Write the binding. Snapshot bindings accept only the first write.
    pub(crate) fn set(&self, value: Value) -> bool {
        let mut cell = self.cell.write();
        if self.kind == BindingKind::Snapshot && cell.is_some() {
            return false;
        }
        *cell = Some(value);
        true
    }

    /// Whether both bindings share one slot
    pub fn ptr_eq(&self, other: &Binding) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("kind", &self.kind)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

struct NamespaceInner {
    module: ModuleLocation,
    /// Sorted by name
    bindings: Vec<(String, Binding)>,
}

/// Export name -> binding mapping of a linked module.
///
/// Cloning is cheap; clones are the same namespace (see [`Namespace::ptr_eq`]).
#[derive(Clone)]
pub struct Namespace(Arc<NamespaceInner>);

impl Namespace {
    pub(crate) fn new(module: ModuleLocation, bindings: impl IntoIterator<Item = (String, Binding)>) -> Self {
        let mut bindings: Vec<_> = bindings.into_iter().collect();
        bindings.sort_by(|a, b| a.0.cmp(&b.0));
        bindings.dedup_by(|a, b| a.0 == b.0);
        Self(Arc::new(NamespaceInner { module, bindings }))
    }

    /// Module this namespace belongs to
    pub fn module(&self) -> &ModuleLocation {
        &self.0.module
    }

    /// Binding slot for an export name
    pub fn binding(&self, name: &str) -> Option<&Binding> {
        self.0
            .bindings
            .binary_search_by(|(n, _)| n.as_str().cmp(name))
            .ok()
            .map(|index| &self.0.bindings[index].1)
    }

    /// Read an export
    pub fn get(&self, name: &str) -> Result<Value> {
        let binding = self.binding(name).ok_or_else(|| LoadError::NamedExportNotFound {
            name: name.to_string(),
            module: self.module().clone(),
            importer: None,
        })?;
        binding.get().ok_or_else(|| LoadError::UninitializedBinding {
            name: name.to_string(),
            module: self.module().clone(),
        })
    }

    pub fn has(&self, name: &str) -> bool {
        self.binding(name).is_some()
    }

    /// Export names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.bindings.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.bindings.is_empty()
    }

    /// Whether both handles are the same namespace object
    pub fn ptr_eq(&self, other: &Namespace) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace")
            .field("module", self.module())
            .field("names", &self.names().collect::<Vec<_>>())
            .finish()
    }
}
