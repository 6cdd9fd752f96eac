//! Listener registry
//!
//! Listeners are stored per target in registration order. A listener's
//! identity is `(type, callback, capture)`; adding a duplicate is a no-op.
//! Removal flips the entry's `removed` flag so a dispatch that already took
//! a snapshot skips it.

use super::event::Event;
use super::tree::NodeId;
use crate::abort::{AbortSignal, AlgorithmId};
use crate::error::{Error, Result};
use crate::runtime::Value;
use rustc_hash::FxHashMap as HashMap;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

/// Anything that can receive events
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventTargetKey {
    Node(NodeId),
    Window,
    /// An `AbortSignal`, by signal id
    Signal(u64),
    /// Host-defined standalone targets
    Other(u64),
}

impl EventTargetKey {
    pub fn node(&self) -> Option<NodeId> {
        match self {
            EventTargetKey::Node(id) => Some(*id),
            _ => None,
        }
    }
}

/// Host listener: `(event, event wrapper)`
pub type HostListener = Rc<dyn Fn(&Event, &Value) -> Result<()>>;

/// What a listener invokes
#[derive(Clone)]
pub enum ListenerCallback {
    /// Callable script value
    Function(Value),
    /// Object whose `handleEvent` is looked up at each invocation
    HandlerObject(Value),
    Host(HostListener),
}

impl ListenerCallback {
    /// Classify a script value; `None` for null/undefined
    pub fn from_value(value: &Value) -> Result<Option<Self>> {
        if value.is_nullish() {
            return Ok(None);
        }
        if value.is_callable() {
            return Ok(Some(ListenerCallback::Function(value.clone())));
        }
        if value.is_object() {
            return Ok(Some(ListenerCallback::HandlerObject(value.clone())));
        }
        Err(Error::type_error("listener must be a function or an object"))
    }

    pub fn host(f: impl Fn(&Event, &Value) -> Result<()> + 'static) -> Self {
        ListenerCallback::Host(Rc::new(f))
    }

    pub fn same_as(&self, other: &ListenerCallback) -> bool {
        match (self, other) {
            (ListenerCallback::Function(a), ListenerCallback::Function(b))
            | (ListenerCallback::HandlerObject(a), ListenerCallback::HandlerObject(b)) => a.strict_equals(b),
            (ListenerCallback::Host(a), ListenerCallback::Host(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Invoke with `this` bound to the current target's wrapper
    pub fn invoke(&self, this: &Value, event: &Event, event_value: &Value) -> Result<()> {
        match self {
            ListenerCallback::Function(callable) => callable.call(this, &[event_value.clone()]).map(|_| ()),
            ListenerCallback::HandlerObject(object) => {
                let handler = object.get_property("handleEvent")?;
                if !handler.is_callable() {
                    return Err(Error::type_error(crate::error::messages::not_a_function("handleEvent")));
                }
                handler.call(object, &[event_value.clone()]).map(|_| ())
            }
            ListenerCallback::Host(f) => f(event, event_value),
        }
    }
}

impl fmt::Debug for ListenerCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerCallback::Function(v) => write!(f, "Function({:?})", v),
            ListenerCallback::HandlerObject(v) => write!(f, "HandlerObject({:?})", v),
            ListenerCallback::Host(_) => write!(f, "Host"),
        }
    }
}

/// `addEventListener` options
#[derive(Debug, Clone, Default)]
pub struct ListenerOptions {
    pub capture: bool,
    pub once: bool,
    /// `None` lets the registry pick the default for the event type
    pub passive: Option<bool>,
    pub signal: Option<AbortSignal>,
}

impl ListenerOptions {
    pub fn capture() -> Self {
        ListenerOptions {
            capture: true,
            ..Default::default()
        }
    }

    /// Read the options argument: a boolean means `capture`
    pub fn from_value(value: &Value, signal: Option<AbortSignal>) -> Result<Self> {
        match value {
            Value::Undefined | Value::Null => Ok(ListenerOptions::default()),
            Value::Object(_) => {
                let passive = value.get_property("passive")?;
                Ok(ListenerOptions {
                    capture: value.get_property("capture")?.to_boolean(),
                    once: value.get_property("once")?.to_boolean(),
                    passive: (!passive.is_undefined()).then(|| passive.to_boolean()),
                    signal,
                })
            }
            other => Ok(ListenerOptions {
                capture: other.to_boolean(),
                ..Default::default()
            }),
        }
    }
}

/// Types whose listeners on the window default to passive
const DEFAULT_PASSIVE_TYPES: &[&str] = &["touchstart", "touchmove", "wheel", "mousewheel"];

/// A registered listener
#[derive(Debug)]
pub struct ListenerEntry {
    pub event_type: String,
    pub callback: ListenerCallback,
    pub capture: bool,
    pub once: bool,
    pub passive: bool,
    removed: Cell<bool>,
    signal: RefCell<Option<(AbortSignal, AlgorithmId)>>,
}

impl ListenerEntry {
    pub fn is_removed(&self) -> bool {
        self.removed.get()
    }

    fn mark_removed(&self) {
        self.removed.set(true);
        if let Some((signal, id)) = self.signal.borrow_mut().take() {
            signal.remove_algorithm(id);
        }
    }
}

type ListenerMap = RefCell<HashMap<EventTargetKey, Vec<Rc<ListenerEntry>>>>;

/// Per-target listener lists. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    map: Rc<ListenerMap>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `addEventListener`. Returns whether a listener was added: duplicates
    /// and already-aborted signals add nothing.
    pub fn add(&self, target: EventTargetKey, event_type: &str, callback: ListenerCallback, options: ListenerOptions) -> bool {
        if options.signal.as_ref().is_some_and(AbortSignal::aborted) {
            return false;
        }
        let passive = options
            .passive
            .unwrap_or(target == EventTargetKey::Window && DEFAULT_PASSIVE_TYPES.contains(&event_type));
        let entry = {
            let mut map = self.map.borrow_mut();
            let list = map.entry(target.clone()).or_default();
            let duplicate = list.iter().any(|e| {
                e.event_type == event_type && e.capture == options.capture && e.callback.same_as(&callback)
            });
            if duplicate {
                return false;
            }
            let entry = Rc::new(ListenerEntry {
                event_type: event_type.to_string(),
                callback,
                capture: options.capture,
                once: options.once,
                passive,
                removed: Cell::new(false),
                signal: RefCell::new(None),
            });
            list.push(entry.clone());
            entry
        };

        if let Some(signal) = options.signal {
            let map: Weak<ListenerMap> = Rc::downgrade(&self.map);
            let weak_entry = Rc::downgrade(&entry);
            let key = target;
            let id = signal.add_algorithm(move |_, _| {
                if let (Some(map), Some(entry)) = (map.upgrade(), weak_entry.upgrade()) {
                    entry.signal.borrow_mut().take();
                    remove_from(&map, &key, &entry);
                }
                Ok(())
            });
            *entry.signal.borrow_mut() = Some((signal, id));
        }
        true
    }

    /// `removeEventListener`: removes the listener with the same
    /// `(type, callback, capture)`, if any
    pub fn remove(&self, target: &EventTargetKey, event_type: &str, callback: &ListenerCallback, capture: bool) -> bool {
        let found = self.map.borrow().get(target).and_then(|list| {
            list.iter()
                .find(|e| e.event_type == event_type && e.capture == capture && e.callback.same_as(callback))
                .cloned()
        });
        match found {
            Some(entry) => {
                remove_from(&self.map, target, &entry);
                true
            }
            None => false,
        }
    }

    /// Remove one specific entry (used for `once`)
    pub fn remove_entry(&self, target: &EventTargetKey, entry: &Rc<ListenerEntry>) {
        remove_from(&self.map, target, entry);
    }

    /// Listeners for `event_type` on `target`, in registration order. The
    /// snapshot is fixed: listeners added later are not included.
    pub fn snapshot(&self, target: &EventTargetKey, event_type: &str) -> Vec<Rc<ListenerEntry>> {
        self.map
            .borrow()
            .get(target)
            .map(|list| {
                list.iter()
                    .filter(|e| e.event_type == event_type)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_listeners(&self, target: &EventTargetKey, event_type: &str) -> bool {
        self.map
            .borrow()
            .get(target)
            .is_some_and(|list| list.iter().any(|e| e.event_type == event_type))
    }

    /// Drop every listener of `target`
    pub fn clear_target(&self, target: &EventTargetKey) {
        let removed = self.map.borrow_mut().remove(target).unwrap_or_default();
        for entry in removed {
            entry.mark_removed();
        }
    }

    pub fn len(&self, target: &EventTargetKey) -> usize {
        self.map.borrow().get(target).map_or(0, Vec::len)
    }
}

fn remove_from(map: &ListenerMap, target: &EventTargetKey, entry: &Rc<ListenerEntry>) {
    entry.mark_removed();
    let mut map = map.borrow_mut();
    if let Some(list) = map.get_mut(target) {
        list.retain(|e| !Rc::ptr_eq(e, entry));
        if list.is_empty() {
            map.remove(target);
        }
    }
}
