//! Script value surface
//!
//! The script engine itself is an opaque collaborator. This module holds the
//! values exchanged with it: primitives, objects with data and accessor
//! properties, host-supplied callables and host objects wrapping Rust state.

mod value;

pub use value::{NativeFn, Object, ObjectKind, Property, Value};
