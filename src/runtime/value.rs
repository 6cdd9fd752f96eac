//! Script value types
//!
//! This module defines the host-side representation of values exchanged with
//! the script engine: primitives, objects with data and accessor properties,
//! callables, promises and host objects wrapping Rust state.

use crate::error::{messages, Error, Result};
use crate::event_loop::Promise;
use rustc_hash::FxHashMap as HashMap;
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Type alias for native function implementations: `(this, args) -> result`
pub type NativeFn = Rc<dyn Fn(&Value, &[Value]) -> Result<Value>>;

/// A script value
#[derive(Clone, Default)]
pub enum Value {
    /// undefined
    #[default]
    Undefined,
    /// null
    Null,
    /// Boolean value
    Boolean(bool),
    /// Number (IEEE 754 double)
    Number(f64),
    /// String
    String(String),
    /// Object (includes arrays, functions, promises and host objects)
    Object(Rc<RefCell<Object>>),
}

impl Value {
    /// Check if value is undefined
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Check if value is nullish (null or undefined)
    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    /// Check if value is an object
    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    /// Check if value can be invoked
    pub fn is_callable(&self) -> bool {
        match self {
            Value::Object(obj) => matches!(obj.borrow().kind, ObjectKind::Function { .. }),
            _ => false,
        }
    }

    /// Convert to boolean (truthiness)
    pub fn to_boolean(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Boolean(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::Object(_) => true,
        }
    }

    /// Convert to number
    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Boolean(true) => 1.0,
            Value::Boolean(false) => 0.0,
            Value::Number(n) => *n,
            Value::String(s) if s.trim().is_empty() => 0.0,
            Value::String(s) => s.trim().parse().unwrap_or(f64::NAN),
            Value::Object(_) => f64::NAN,
        }
    }

    /// Convert to the script string representation
    pub fn to_js_string(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Boolean(true) => "true".to_string(),
            Value::Boolean(false) => "false".to_string(),
            Value::Number(n) => {
                if n.is_nan() {
                    "NaN".to_string()
                } else if n.is_infinite() {
                    if *n > 0.0 {
                        "Infinity".to_string()
                    } else {
                        "-Infinity".to_string()
                    }
                } else if *n == 0.0 {
                    "0".to_string()
                } else {
                    format!("{}", n)
                }
            }
            Value::String(s) => s.clone(),
            Value::Object(obj) => {
                let obj = obj.borrow();
                match &obj.kind {
                    ObjectKind::Array(arr) => {
                        let elements: Vec<String> = arr.iter().map(|v| v.to_js_string()).collect();
                        elements.join(",")
                    }
                    ObjectKind::Function { name, .. } => format!("function {}() {{ [native code] }}", name),
                    ObjectKind::Error { name, message } if message.is_empty() => name.clone(),
                    ObjectKind::Error { name, message } => format!("{}: {}", name, message),
                    ObjectKind::Promise(_) => "[object Promise]".to_string(),
                    _ => "[object Object]".to_string(),
                }
            }
        }
    }

    /// Get the typeof string
    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "object",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Object(_) if self.is_callable() => "function",
            Value::Object(_) => "object",
        }
    }

    /// Strict equality (===); objects compare by identity
    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Create a new object value
    pub fn new_object() -> Value {
        Value::from_kind(ObjectKind::Ordinary)
    }

    /// Create a new object value with data properties, in order
    pub fn new_object_with_properties<K: Into<String>>(
        properties: impl IntoIterator<Item = (K, Value)>,
    ) -> Value {
        let mut object = Object::new(ObjectKind::Ordinary);
        for (key, value) in properties {
            object.insert(key.into(), Property::Data(value));
        }
        Value::Object(Rc::new(RefCell::new(object)))
    }

    /// Create a new array value
    pub fn new_array(elements: Vec<Value>) -> Value {
        Value::from_kind(ObjectKind::Array(elements))
    }

    /// Create an error object (`name` + `message`), also used for DOMException
    pub fn new_error(name: &str, message: &str) -> Value {
        Value::from_kind(ObjectKind::Error {
            name: name.to_string(),
            message: message.to_string(),
        })
    }

    /// Create a native function value
    pub fn new_function(
        name: &str,
        func: impl Fn(&Value, &[Value]) -> Result<Value> + 'static,
    ) -> Value {
        Value::from_kind(ObjectKind::Function {
            name: name.to_string(),
            func: Rc::new(func),
        })
    }

    /// Create a host object wrapping Rust state
    pub fn new_host<T: Any>(data: Rc<T>) -> Value {
        Value::from_kind(ObjectKind::Host(data))
    }

    /// Create a value wrapping a promise
    pub fn new_promise(promise: Promise) -> Value {
        Value::from_kind(ObjectKind::Promise(promise))
    }

    fn from_kind(kind: ObjectKind) -> Value {
        Value::Object(Rc::new(RefCell::new(Object::new(kind))))
    }

    /// Name of an error object (`TypeError`, `AbortError`, ...)
    pub fn error_name(&self) -> Option<String> {
        match self {
            Value::Object(obj) => match &obj.borrow().kind {
                ObjectKind::Error { name, .. } => Some(name.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Elements of an array value
    pub fn array_elements(&self) -> Option<Vec<Value>> {
        match self {
            Value::Object(obj) => match &obj.borrow().kind {
                ObjectKind::Array(arr) => Some(arr.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    /// The promise wrapped by this value, if any
    pub fn as_promise(&self) -> Option<Promise> {
        match self {
            Value::Object(obj) => match &obj.borrow().kind {
                ObjectKind::Promise(p) => Some(p.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Downcast the Rust state behind a host object
    pub fn host_data<T: Any>(&self) -> Option<Rc<T>> {
        match self {
            Value::Object(obj) => match &obj.borrow().kind {
                ObjectKind::Host(data) => data.clone().downcast::<T>().ok(),
                _ => None,
            },
            _ => None,
        }
    }

    /// Identity of the underlying object, for identity-keyed maps
    pub fn object_id(&self) -> Option<usize> {
        match self {
            Value::Object(obj) => Some(Rc::as_ptr(obj) as *const () as usize),
            _ => None,
        }
    }

    /// Read a property, running accessors. Missing properties read as
    /// `undefined`.
    pub fn get_property(&self, key: &str) -> Result<Value> {
        let Value::Object(obj) = self else {
            return Ok(Value::Undefined);
        };
        // The borrow must end before an accessor runs: getters may touch `self`.
        let property = obj.borrow().lookup(key);
        match property {
            Some(Property::Data(value)) => Ok(value),
            Some(Property::Accessor { get: Some(get), .. }) => get(self, &[]),
            Some(Property::Accessor { get: None, .. }) | None => Ok(Value::Undefined),
        }
    }

    /// Read a property; accessor failures read as `undefined`
    pub fn get(&self, key: &str) -> Value {
        self.get_property(key).unwrap_or_default()
    }

    /// Write a property, running setters
    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        let Value::Object(obj) = self else {
            return Err(Error::type_error(format!(
                "Cannot set property '{}' of {}",
                key,
                self.to_js_string()
            )));
        };
        let existing = obj.borrow().properties.get(key).cloned();
        match existing {
            Some(Property::Accessor { set: Some(set), .. }) => {
                set(self, &[value])?;
                Ok(())
            }
            Some(Property::Accessor { set: None, .. }) => Ok(()),
            _ => {
                obj.borrow_mut().insert(key.to_string(), Property::Data(value));
                Ok(())
            }
        }
    }

    /// Define an accessor property backed by host functions
    pub fn define_accessor(
        &self,
        key: &str,
        get: Option<NativeFn>,
        set: Option<NativeFn>,
    ) {
        if let Value::Object(obj) = self {
            obj.borrow_mut()
                .insert(key.to_string(), Property::Accessor { get, set });
        }
    }

    /// Define a read-only accessor
    pub fn define_getter(&self, key: &str, get: impl Fn(&Value) -> Result<Value> + 'static) {
        self.define_accessor(key, Some(Rc::new(move |this, _| get(this))), None);
    }

    /// Define a method (a data property holding a native function)
    pub fn define_method(
        &self,
        name: &str,
        func: impl Fn(&Value, &[Value]) -> Result<Value> + 'static,
    ) {
        if let Value::Object(obj) = self {
            obj.borrow_mut()
                .insert(name.to_string(), Property::Data(Value::new_function(name, func)));
        }
    }

    /// Invoke this value as a function
    pub fn call(&self, this: &Value, args: &[Value]) -> Result<Value> {
        let func = match self {
            Value::Object(obj) => match &obj.borrow().kind {
                ObjectKind::Function { func, .. } => Some(func.clone()),
                _ => None,
            },
            _ => None,
        };
        match func {
            Some(func) => func(this, args),
            None => Err(Error::type_error(messages::not_a_function(&self.to_js_string()))),
        }
    }

    /// Invoke a method found on this value
    pub fn call_method(&self, name: &str, args: &[Value]) -> Result<Value> {
        let method = self.get_property(name)?;
        if !method.is_callable() {
            return Err(Error::type_error(messages::not_a_function(name)));
        }
        method.call(self, args)
    }

    /// Convert parsed JSON into a script value
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::new_array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::new_object_with_properties(
                map.iter().map(|(k, v)| (k.clone(), Value::from_json(v))),
            ),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "\"{}\"", s),
            Value::Object(obj) => match obj.try_borrow() {
                Ok(obj) => match &obj.kind {
                    ObjectKind::Ordinary => write!(f, "Object {{ {} }}", obj.keys.join(", ")),
                    ObjectKind::Array(arr) => write!(f, "Array({})", arr.len()),
                    ObjectKind::Function { name, .. } => write!(f, "[Function: {}]", name),
                    ObjectKind::Error { name, message } => write!(f, "{}: {}", name, message),
                    ObjectKind::Promise(p) => write!(f, "Promise {{ <{:?}> }}", p.state()),
                    ObjectKind::Host(_) => write!(f, "[HostObject]"),
                },
                Err(_) => write!(f, "[Object <borrowed>]"),
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_js_string())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

/// A property slot
#[derive(Clone)]
pub enum Property {
    /// Plain value
    Data(Value),
    /// Host-defined getter/setter pair
    Accessor {
        get: Option<NativeFn>,
        set: Option<NativeFn>,
    },
}

/// Script object
pub struct Object {
    /// Object kind
    pub kind: ObjectKind,
    properties: HashMap<String, Property>,
    keys: Vec<String>,
}

impl Object {
    /// Create an object of the given kind with no properties
    pub fn new(kind: ObjectKind) -> Self {
        Self {
            kind,
            properties: HashMap::default(),
            keys: Vec::new(),
        }
    }

    fn insert(&mut self, key: String, property: Property) {
        if self.properties.insert(key.clone(), property).is_none() {
            self.keys.push(key);
        }
    }

    fn lookup(&self, key: &str) -> Option<Property> {
        if let Some(property) = self.properties.get(key) {
            return Some(property.clone());
        }
        let value = match &self.kind {
            ObjectKind::Array(arr) => {
                if key == "length" {
                    Some(Value::Number(arr.len() as f64))
                } else {
                    key.parse::<usize>().ok().and_then(|idx| arr.get(idx).cloned())
                }
            }
            ObjectKind::Error { name, message } => match key {
                "name" => Some(Value::String(name.clone())),
                "message" => Some(Value::String(message.clone())),
                _ => None,
            },
            ObjectKind::Function { name, .. } if key == "name" => Some(Value::String(name.clone())),
            _ => None,
        };
        value.map(Property::Data)
    }

    /// Own property keys in insertion order
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

/// Object kinds
pub enum ObjectKind {
    /// Plain object
    Ordinary,
    /// Array
    Array(Vec<Value>),
    /// Host-supplied callable
    Function { name: String, func: NativeFn },
    /// Error or DOMException
    Error { name: String, message: String },
    /// Promise
    Promise(Promise),
    /// Host object wrapping Rust state
    Host(Rc<dyn Any>),
}
