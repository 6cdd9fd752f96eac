//! Header lists
//!
//! Names are compared case-insensitively and stored lowercased; insertion
//! order is preserved and `get` combines repeated headers with `", "`.

use crate::error::{Error, Result};
use crate::runtime::Value;
use std::cell::RefCell;
use std::rc::Rc;

/// Ordered, case-insensitive header list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

fn validate_name(name: &str) -> Result<String> {
    let valid = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b));
    if valid {
        Ok(name.to_ascii_lowercase())
    } else {
        Err(Error::type_error(format!("Invalid header name: '{}'", name)))
    }
}

fn normalize_value(value: &str) -> Result<String> {
    let value = value.trim_matches(|c| c == ' ' || c == '\t');
    if value.contains(['\r', '\n', '\0']) {
        return Err(Error::type_error(format!("Invalid header value: '{}'", value)));
    }
    Ok(value.to_string())
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from name/value pairs, validating each
    pub fn from_pairs<N: AsRef<str>, V: AsRef<str>>(pairs: impl IntoIterator<Item = (N, V)>) -> Result<Self> {
        let mut headers = Headers::new();
        for (name, value) in pairs {
            headers.append(name.as_ref(), value.as_ref())?;
        }
        Ok(headers)
    }

    pub fn append(&mut self, name: &str, value: &str) -> Result<()> {
        let name = validate_name(name)?;
        let value = normalize_value(value)?;
        self.entries.push((name, value));
        Ok(())
    }

    /// Replace every header called `name` with one entry
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        let name = validate_name(name)?;
        let value = normalize_value(value)?;
        match self.entries.iter().position(|(n, _)| *n == name) {
            Some(first) => {
                self.entries[first].1 = value;
                let mut index = 0;
                self.entries.retain(|(n, _)| {
                    let keep = index <= first || *n != name;
                    index += 1;
                    keep
                });
            }
            None => self.entries.push((name, value)),
        }
        Ok(())
    }

    /// All values for `name` joined with `", "`
    pub fn get(&self, name: &str) -> Option<String> {
        let name = name.to_ascii_lowercase();
        let values: Vec<&str> = self
            .entries
            .iter()
            .filter(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.join(", "))
        }
    }

    pub fn has(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        self.entries.iter().any(|(n, _)| *n == name)
    }

    pub fn delete(&mut self, name: &str) {
        let name = name.to_ascii_lowercase();
        self.entries.retain(|(n, _)| *n != name);
    }

    /// Entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_pairs(&self) -> Vec<(String, String)> {
        self.entries.clone()
    }

    /// Read headers from a script value: a `Headers` wrapper, an array of
    /// `[name, value]` pairs or a plain object
    pub fn from_value(value: &Value) -> Result<Self> {
        if value.is_nullish() {
            return Ok(Headers::new());
        }
        if let Some(shared) = value.host_data::<RefCell<Headers>>() {
            return Ok(shared.borrow().clone());
        }
        if let Some(items) = value.array_elements() {
            let mut headers = Headers::new();
            for item in items {
                let pair = item
                    .array_elements()
                    .filter(|pair| pair.len() == 2)
                    .ok_or_else(|| Error::type_error("header pairs must be [name, value]"))?;
                headers.append(&pair[0].to_js_string(), &pair[1].to_js_string())?;
            }
            return Ok(headers);
        }
        let Value::Object(obj) = value else {
            return Err(Error::type_error("headers must be an object"));
        };
        let keys = obj.borrow().keys().to_vec();
        let mut headers = Headers::new();
        for key in keys {
            headers.append(&key, &value.get_property(&key)?.to_js_string())?;
        }
        Ok(headers)
    }
}

/// Script-visible `Headers` object sharing `headers`
pub fn headers_value(headers: Rc<RefCell<Headers>>) -> Value {
    let value = Value::new_host(headers);
    value.define_method("get", |this, args| {
        let shared = shared_headers(this)?;
        let name = args.first().map(Value::to_js_string).unwrap_or_default();
        let found = shared.borrow().get(&name);
        Ok(found.map(Value::String).unwrap_or(Value::Null))
    });
    value.define_method("has", |this, args| {
        let shared = shared_headers(this)?;
        let name = args.first().map(Value::to_js_string).unwrap_or_default();
        let found = shared.borrow().has(&name);
        Ok(Value::Boolean(found))
    });
    value.define_method("set", |this, args| {
        let (name, val) = name_value(args)?;
        shared_headers(this)?.borrow_mut().set(&name, &val)?;
        Ok(Value::Undefined)
    });
    value.define_method("append", |this, args| {
        let (name, val) = name_value(args)?;
        shared_headers(this)?.borrow_mut().append(&name, &val)?;
        Ok(Value::Undefined)
    });
    value.define_method("delete", |this, args| {
        let name = args.first().map(Value::to_js_string).unwrap_or_default();
        shared_headers(this)?.borrow_mut().delete(&name);
        Ok(Value::Undefined)
    });
    value.define_method("entries", |this, _| {
        let shared = shared_headers(this)?;
        let pairs = shared
            .borrow()
            .iter()
            .map(|(n, v)| Value::new_array(vec![Value::from(n), Value::from(v)]))
            .collect();
        Ok(Value::new_array(pairs))
    });
    value
}

fn shared_headers(this: &Value) -> Result<Rc<RefCell<Headers>>> {
    this.host_data::<RefCell<Headers>>()
        .ok_or_else(|| Error::type_error("receiver is not a Headers object"))
}

fn name_value(args: &[Value]) -> Result<(String, String)> {
    match args {
        [name, value, ..] => Ok((name.to_js_string(), value.to_js_string())),
        _ => Err(Error::type_error(crate::error::messages::requires(
            "Headers mutation",
            "a name and a value",
        ))),
    }
}
