//! Values exchanged between module bodies

use crate::namespace::Namespace;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// A value visible to module bodies
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Arc<str>),
    Object(ObjectRef),
    Namespace(Namespace),
}

/// What an object represents
#[derive(Debug, Clone)]
pub enum ObjectKind {
    /// Plain object
    Plain,
    /// Array; elements are stored under their index
    Array,
    /// Callable
    Function { name: Arc<str> },
    /// Class; `parent` is the class it extends
    Class {
        name: Arc<str>,
        parent: Option<ObjectRef>,
    },
}

struct ObjectCell {
    kind: ObjectKind,
    /// Class this object was constructed from
    constructor: Option<ObjectRef>,
    properties: RwLock<Vec<(Arc<str>, Value)>>,
}

/// Shared, identity-compared object with insertion-ordered properties
#[derive(Clone)]
pub struct ObjectRef(Arc<ObjectCell>);

impl ObjectRef {
    fn with_kind(kind: ObjectKind, constructor: Option<ObjectRef>) -> Self {
        Self(Arc::new(ObjectCell {
            kind,
            constructor,
            properties: RwLock::new(Vec::new()),
        }))
    }

    /// A new empty plain object
    pub fn plain() -> Self {
        Self::with_kind(ObjectKind::Plain, None)
    }

    /// A new array holding `items`
    pub fn array(items: impl IntoIterator<Item = Value>) -> Self {
        let array = Self::with_kind(ObjectKind::Array, None);
        for (index, item) in items.into_iter().enumerate() {
            array.set(&index.to_string(), item);
        }
        array
    }

    /// A new function object
    pub fn function(name: &str) -> Self {
        Self::with_kind(ObjectKind::Function { name: Arc::from(name) }, None)
    }

    /// A new class, optionally extending `parent`
    pub fn class(name: &str, parent: Option<&ObjectRef>) -> Self {
        Self::with_kind(
            ObjectKind::Class {
                name: Arc::from(name),
                parent: parent.cloned(),
            },
            None,
        )
    }

    /// A new plain instance constructed from this class
    pub fn construct(&self) -> Self {
        Self::with_kind(ObjectKind::Plain, Some(self.clone()))
    }

    pub fn kind(&self) -> &ObjectKind {
        &self.0.kind
    }

    /// Class the object was constructed from
    pub fn constructor(&self) -> Option<&ObjectRef> {
        self.0.constructor.as_ref()
    }

    /// Whether `class` appears in this object's constructor chain
    pub fn instance_of(&self, class: &ObjectRef) -> bool {
        let mut current = self.0.constructor.clone();
        while let Some(candidate) = current {
            if candidate.ptr_eq(class) {
                return true;
            }
            current = match candidate.kind() {
                ObjectKind::Class { parent, .. } => parent.clone(),
                _ => None,
            };
        }
        false
    }

    /// Property value, `undefined` when absent
    pub fn get(&self, key: &str) -> Value {
        self.0
            .properties
            .read()
            .iter()
            .find(|(k, _)| &**k == key)
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    }

    /// Whether the object has an own property `key`
    pub fn has(&self, key: &str) -> bool {
        self.0.properties.read().iter().any(|(k, _)| &**k == key)
    }

    /// Set a property, keeping the position of an existing key
    pub fn set(&self, key: &str, value: Value) {
        let mut properties = self.0.properties.write();
        match properties.iter_mut().find(|(k, _)| &**k == key) {
            Some(slot) => slot.1 = value,
            None => properties.push((Arc::from(key), value)),
        }
    }

    /// Own property names in insertion order
    pub fn keys(&self) -> Vec<String> {
        self.0
            .properties
            .read()
            .iter()
            .map(|(k, _)| k.to_string())
            .collect()
    }

    /// Whether two references point at the same object
    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Properties may refer back to this object; print only the shape.
        f.debug_struct("ObjectRef")
            .field("kind", &self.to_string())
            .field("keys", &self.keys())
            .finish()
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            ObjectKind::Plain => match self.constructor().map(|c| c.kind()) {
                Some(ObjectKind::Class { name, .. }) => write!(f, "{} {{}}", name),
                _ => write!(f, "[object Object]"),
            },
            ObjectKind::Array => write!(f, "[Array({})]", self.keys().len()),
            ObjectKind::Function { name } => write!(f, "[Function: {}]", name),
            ObjectKind::Class { name, .. } => write!(f, "[class {}]", name),
        }
    }
}

impl Value {
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn as_namespace(&self) -> Option<&Namespace> {
        match self {
            Value::Namespace(namespace) => Some(namespace),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Property access; namespaces read their bindings, primitives have no properties
    pub fn get(&self, key: &str) -> Value {
        match self {
            Value::Object(object) => object.get(key),
            Value::Namespace(namespace) => namespace.get(key).unwrap_or_default(),
            _ => Value::Undefined,
        }
    }

    /// Whether this value is an object constructed from `class` (or a subclass)
    pub fn instance_of(&self, class: &Value) -> bool {
        match (self, class) {
            (Value::Object(object), Value::Object(class)) => object.instance_of(class),
            _ => false,
        }
    }

    /// Identity for objects and namespaces, value equality otherwise
    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::Namespace(a), Value::Namespace(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// Build a value from a JSON document
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(Arc::from(s.as_str())),
            serde_json::Value::Array(items) => {
                Value::Object(ObjectRef::array(items.iter().map(Value::from_json)))
            }
            serde_json::Value::Object(map) => {
                let object = ObjectRef::plain();
                for (key, value) in map {
                    object.set(key, Value::from_json(value));
                }
                Value::Object(object)
            }
        }
    }
}

/// Largest integer a number holds exactly (2^53 - 1)
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER => write!(f, "{}", *n as i64),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::Object(object) => write!(f, "{}", object),
            Value::Namespace(namespace) => write!(f, "[Module: {}]", namespace.module()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(Arc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Arc::from(s))
    }
}

impl From<ObjectRef> for Value {
    fn from(object: ObjectRef) -> Self {
        Value::Object(object)
    }
}

impl From<Namespace> for Value {
    fn from(namespace: Namespace) -> Self {
        Value::Namespace(namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_instance_of_follows_class_chain() {
        let base = ObjectRef::class("Base", None);
        let logger = ObjectRef::class("Logger", Some(&base));
        let other = ObjectRef::class("Other", None);
        let instance = Value::from(logger.construct());

        assert!(instance.instance_of(&Value::from(logger.clone())));
        assert!(instance.instance_of(&Value::from(base)));
        assert!(!instance.instance_of(&Value::from(other)));
        assert_eq!(instance.to_string(), "Logger {}");
    }

    #[test]
    fn test_properties_keep_insertion_order() {
        let object = ObjectRef::plain();
        object.set("b", Value::from(1i64));
        object.set("a", Value::from(2i64));
        object.set("b", Value::from(3i64));
        assert_eq!(object.keys(), vec!["b", "a"]);
        assert_eq!(object.get("b").as_number(), Some(3.0));
        assert!(object.get("missing").is_undefined());
    }

    #[test]
    fn test_strict_equality() {
        let a = ObjectRef::plain();
        assert!(Value::from(a.clone()).strict_equals(&Value::from(a)));
        assert!(!Value::from(ObjectRef::plain()).strict_equals(&Value::from(ObjectRef::plain())));
        assert!(Value::from("x").strict_equals(&Value::from("x")));
        assert!(!Value::Null.strict_equals(&Value::Undefined));
    }

    #[test]
    fn test_number_display() {
        assert_eq!(Value::from(3i64).to_string(), "3");
        assert_eq!(Value::Number(1.5).to_string(), "1.5");
        assert_eq!(Value::Number(1e20).to_string(), "100000000000000000000");
        assert_eq!(Value::Number(-1e300).to_string(), format!("{}", -1e300));
        assert_eq!(Value::Number(f64::NAN).to_string(), "NaN");
    }

    #[test]
    fn test_from_json() {
        let value = Value::from_json(&json!({"name": "pkg", "tags": ["a", "b"], "n": 2}));
        assert_eq!(value.get("name").as_str(), Some("pkg"));
        assert_eq!(value.get("n").to_string(), "2");
        assert_eq!(value.get("tags").get("1").as_str(), Some("b"));
        assert_eq!(value.as_object().map(|o| o.keys()), Some(vec!["name".into(), "tags".into(), "n".into()]));
    }
}
