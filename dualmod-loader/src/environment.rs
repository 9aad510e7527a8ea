//! Module execution environments

use crate::location::{ModuleFormat, ModuleLocation};
use crate::namespace::Binding;
use crate::value::{ObjectRef, Value};
use crate::{LoadError, Result};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// Scope a module body runs against.
///
/// Declarative modules own live bindings for their local exports and see
/// the bindings of their static imports. Legacy modules own the `exports`
/// object and the current `module.exports` value, plus the snapshot
/// bindings filled when their evaluation completes.
#[derive(Debug)]
pub struct ModuleEnvironment {
    module: ModuleLocation,
    format: ModuleFormat,

    /// Bindings owned by this module, by local name
    locals: FxHashMap<String, Binding>,

    /// The same bindings, by exported name
    exported: FxHashMap<String, Binding>,

    /// Imported bindings, by local name
    imports: FxHashMap<String, Binding>,

    /// Initial `exports` object
    exports: ObjectRef,

    /// Current `module.exports`
    module_exports: RwLock<Value>,
}

impl ModuleEnvironment {
    /// Create an empty environment for a module
    pub(crate) fn new(module: ModuleLocation, format: ModuleFormat) -> Self {
        let exports = ObjectRef::plain();
        Self {
            module,
            format,
            locals: FxHashMap::default(),
            exported: FxHashMap::default(),
            imports: FxHashMap::default(),
            module_exports: RwLock::new(Value::Object(exports.clone())),
            exports,
        }
    }

    /// Define a binding owned by this module
    pub(crate) fn define_local(&mut self, local: &str, exported: &str, binding: Binding) {
        self.locals.entry(local.to_string()).or_insert_with(|| binding.clone());
        self.exported.insert(exported.to_string(), binding);
    }

    /// Make an imported binding visible under `local`
    pub(crate) fn bind_import(&mut self, local: &str, binding: Binding) {
        self.imports.insert(local.to_string(), binding);
    }

    pub fn module(&self) -> &ModuleLocation {
        &self.module
    }

    pub fn format(&self) -> ModuleFormat {
        self.format
    }

    /// Binding owned by this module, looked up by local then exported name
    pub fn local(&self, name: &str) -> Option<&Binding> {
        self.locals.get(name).or_else(|| self.exported.get(name))
    }

    /// Imported binding by local name
    pub fn imported(&self, local: &str) -> Option<&Binding> {
        self.imports.get(local)
    }

    /// The `exports` object the module started with
    pub fn exports_object(&self) -> &ObjectRef {
        &self.exports
    }

    /// Current `module.exports`
    pub fn module_exports(&self) -> Value {
        self.module_exports.read().clone()
    }

    pub fn set_module_exports(&self, value: Value) {
        *self.module_exports.write() = value;
    }

    /// Write an export of this module.
    ///
    /// Declarative modules write their live binding; legacy modules set the
    /// property on their current `module.exports`.
    pub(crate) fn write_export(&self, name: &str, value: Value) -> Result<()> {
        match self.format {
            ModuleFormat::Declarative => {
                let binding = self.local(name).ok_or_else(|| LoadError::EvaluationError {
                    module: self.module.clone(),
                    message: format!("'{}' is not a local export", name),
                })?;
                binding.set(value);
                Ok(())
            }
            ModuleFormat::Legacy => match self.module_exports() {
                Value::Object(object) => {
                    object.set(name, value);
                    Ok(())
                }
                other => Err(LoadError::EvaluationError {
                    module: self.module.clone(),
                    message: format!("cannot set '{}' on module.exports value {}", name, other),
                }),
            },
        }
    }

    /// Fill the snapshot bindings from the final `module.exports` value
    pub(crate) fn snapshot(&self) {
        let value = self.module_exports();
        for (name, binding) in &self.exported {
            let snapshot = if name == "default" {
                value.clone()
            } else {
                value.get(name)
            };
            binding.set(snapshot);
        }
    }
}
