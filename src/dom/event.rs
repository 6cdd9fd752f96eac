//! Events
//!
//! An [`Event`] is shared (`Rc`) between its script wrapper and the
//! dispatcher. Mutable dispatch state lives in cells so listeners can call
//! `preventDefault` or `stopPropagation` while the dispatcher holds it.

use super::listener::EventTargetKey;
use crate::error::{Error, Result};
use crate::runtime::Value;
use bitflags::bitflags;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

bitflags! {
    /// Event flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventFlags: u16 {
        const BUBBLES = 1 << 0;
        const CANCELABLE = 1 << 1;
        const COMPOSED = 1 << 2;
        const STOP_PROPAGATION = 1 << 3;
        const STOP_IMMEDIATE_PROPAGATION = 1 << 4;
        /// `defaultPrevented`
        const CANCELED = 1 << 5;
        const DISPATCHING = 1 << 6;
        const IN_PASSIVE_LISTENER = 1 << 7;
        /// `isTrusted`: created by the host, not by script
        const TRUSTED = 1 << 8;
    }
}

/// `eventPhase`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EventPhase {
    #[default]
    None = 0,
    Capturing = 1,
    AtTarget = 2,
    Bubbling = 3,
}

/// Options accepted by the event constructors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventInit {
    pub bubbles: bool,
    pub cancelable: bool,
    pub composed: bool,
}

impl EventInit {
    pub fn bubbling() -> Self {
        EventInit {
            bubbles: true,
            ..Default::default()
        }
    }

    /// Read `{ bubbles, cancelable, composed }` from a script dictionary
    pub fn from_value(value: &Value) -> Result<Self> {
        if value.is_nullish() {
            return Ok(EventInit::default());
        }
        Ok(EventInit {
            bubbles: value.get_property("bubbles")?.to_boolean(),
            cancelable: value.get_property("cancelable")?.to_boolean(),
            composed: value.get_property("composed")?.to_boolean(),
        })
    }

    fn flags(self) -> EventFlags {
        let mut flags = EventFlags::empty();
        flags.set(EventFlags::BUBBLES, self.bubbles);
        flags.set(EventFlags::CANCELABLE, self.cancelable);
        flags.set(EventFlags::COMPOSED, self.composed);
        flags
    }
}

/// Interface-specific payload
#[derive(Debug, Clone, Default)]
pub enum EventDetail {
    #[default]
    Plain,
    /// `CustomEvent`
    Custom { detail: Value },
    /// `MouseEvent`; clicks carry activation behavior
    Mouse { button: i16 },
    /// `ErrorEvent`
    Error { message: String, error: Value },
    /// `PromiseRejectionEvent`
    PromiseRejection { reason: Value },
}

/// One entry of the propagation path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathEntry {
    pub item: EventTargetKey,
    /// Retargeted target when this entry is at-target, `None` otherwise
    pub shadow_adjusted_target: Option<EventTargetKey>,
    /// Item is a closed shadow root
    pub root_of_closed_tree: bool,
    /// Item lives inside a shadow tree
    pub in_shadow_tree: bool,
}

pub struct Event {
    event_type: String,
    flags: Cell<EventFlags>,
    phase: Cell<EventPhase>,
    target: RefCell<Option<EventTargetKey>>,
    current_target: RefCell<Option<EventTargetKey>>,
    path: RefCell<Vec<PathEntry>>,
    time_stamp: f64,
    detail: EventDetail,
}

impl Event {
    /// Script-constructed event (`isTrusted` false)
    pub fn new(event_type: &str, init: EventInit, time_stamp: f64) -> Self {
        Self::with_detail(event_type, init, time_stamp, EventDetail::Plain)
    }

    pub fn with_detail(event_type: &str, init: EventInit, time_stamp: f64, detail: EventDetail) -> Self {
        Event {
            event_type: event_type.to_string(),
            flags: Cell::new(init.flags()),
            phase: Cell::new(EventPhase::None),
            target: RefCell::new(None),
            current_target: RefCell::new(None),
            path: RefCell::new(Vec::new()),
            time_stamp,
            detail,
        }
    }

    /// Host-created event (`isTrusted` true)
    pub fn trusted(event_type: &str, init: EventInit, time_stamp: f64, detail: EventDetail) -> Self {
        let event = Self::with_detail(event_type, init, time_stamp, detail);
        event.insert_flags(EventFlags::TRUSTED);
        event
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn flags(&self) -> EventFlags {
        self.flags.get()
    }

    pub(crate) fn insert_flags(&self, flags: EventFlags) {
        self.flags.set(self.flags.get() | flags);
    }

    pub(crate) fn remove_flags(&self, flags: EventFlags) {
        self.flags.set(self.flags.get() - flags);
    }

    pub fn bubbles(&self) -> bool {
        self.flags().contains(EventFlags::BUBBLES)
    }

    pub fn cancelable(&self) -> bool {
        self.flags().contains(EventFlags::CANCELABLE)
    }

    pub fn composed(&self) -> bool {
        self.flags().contains(EventFlags::COMPOSED)
    }

    pub fn is_trusted(&self) -> bool {
        self.flags().contains(EventFlags::TRUSTED)
    }

    pub fn default_prevented(&self) -> bool {
        self.flags().contains(EventFlags::CANCELED)
    }

    pub fn is_dispatching(&self) -> bool {
        self.flags().contains(EventFlags::DISPATCHING)
    }

    pub fn phase(&self) -> EventPhase {
        self.phase.get()
    }

    pub(crate) fn set_phase(&self, phase: EventPhase) {
        self.phase.set(phase);
    }

    pub fn target(&self) -> Option<EventTargetKey> {
        self.target.borrow().clone()
    }

    pub(crate) fn set_target(&self, target: Option<EventTargetKey>) {
        *self.target.borrow_mut() = target;
    }

    pub fn current_target(&self) -> Option<EventTargetKey> {
        self.current_target.borrow().clone()
    }

    pub(crate) fn set_current_target(&self, target: Option<EventTargetKey>) {
        *self.current_target.borrow_mut() = target;
    }

    pub(crate) fn set_path(&self, path: Vec<PathEntry>) {
        *self.path.borrow_mut() = path;
    }

    pub fn time_stamp(&self) -> f64 {
        self.time_stamp
    }

    pub fn detail(&self) -> &EventDetail {
        &self.detail
    }

    /// Sets the canceled flag unless the event is not cancelable or a
    /// passive listener is running
    pub fn prevent_default(&self) {
        let flags = self.flags();
        if flags.contains(EventFlags::CANCELABLE) && !flags.contains(EventFlags::IN_PASSIVE_LISTENER) {
            self.insert_flags(EventFlags::CANCELED);
        }
    }

    pub fn stop_propagation(&self) {
        self.insert_flags(EventFlags::STOP_PROPAGATION);
    }

    pub fn stop_immediate_propagation(&self) {
        self.insert_flags(EventFlags::STOP_PROPAGATION | EventFlags::STOP_IMMEDIATE_PROPAGATION);
    }

    /// `composedPath()`: the propagation path as seen from the current
    /// target, hiding closed shadow trees it cannot see into. Empty outside
    /// dispatch.
    pub fn composed_path(&self) -> Vec<EventTargetKey> {
        let path = self.path.borrow();
        let Some(current) = self.current_target() else {
            return Vec::new();
        };
        if path.is_empty() {
            return Vec::new();
        }

        let mut hidden_level = 0usize;
        let mut current_index = 0;
        for (index, entry) in path.iter().enumerate().rev() {
            if entry.root_of_closed_tree {
                hidden_level += 1;
            }
            if entry.item == current {
                current_index = index;
                break;
            }
        }

        let mut before = Vec::new();
        let mut level = hidden_level;
        let mut max_level = hidden_level;
        for entry in path[..current_index].iter().rev() {
            if entry.root_of_closed_tree {
                level += 1;
            }
            if level <= max_level {
                before.push(entry.item.clone());
            }
        }
        before.reverse();

        let mut composed = before;
        composed.push(current);
        level = hidden_level;
        max_level = hidden_level;
        for entry in &path[current_index + 1..] {
            if level <= max_level {
                composed.push(entry.item.clone());
            }
            if entry.root_of_closed_tree {
                level = level.saturating_sub(1);
                max_level = max_level.min(level);
            }
        }
        composed
    }

    /// Error for a second dispatch of the same event
    pub(crate) fn already_dispatching() -> Error {
        Error::invalid_state(crate::error::messages::ALREADY_DISPATCHING)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("type", &self.event_type)
            .field("flags", &self.flags())
            .field("phase", &self.phase())
            .finish()
    }
}

/// Resolves an event target to its script wrapper
pub type TargetResolver = Rc<dyn Fn(&EventTargetKey) -> Value>;

fn target_value(resolve: &TargetResolver, key: Option<EventTargetKey>) -> Value {
    key.map(|k| resolve(&k)).unwrap_or(Value::Null)
}

fn event_of(this: &Value) -> Result<Rc<Event>> {
    this.host_data::<Event>()
        .ok_or_else(|| Error::type_error("receiver is not an Event"))
}

/// Script-visible wrapper for `event`; `resolve` maps targets to their
/// wrappers
pub fn event_value(event: Rc<Event>, resolve: TargetResolver) -> Value {
    let value = Value::new_host(event.clone());
    value.define_getter("type", |this| Ok(Value::from(event_of(this)?.event_type())));
    value.define_getter("bubbles", |this| Ok(Value::Boolean(event_of(this)?.bubbles())));
    value.define_getter("cancelable", |this| Ok(Value::Boolean(event_of(this)?.cancelable())));
    value.define_getter("composed", |this| Ok(Value::Boolean(event_of(this)?.composed())));
    value.define_getter("isTrusted", |this| Ok(Value::Boolean(event_of(this)?.is_trusted())));
    value.define_getter("defaultPrevented", |this| {
        Ok(Value::Boolean(event_of(this)?.default_prevented()))
    });
    value.define_getter("eventPhase", |this| Ok(Value::Number(event_of(this)?.phase() as u8 as f64)));
    value.define_getter("timeStamp", |this| Ok(Value::Number(event_of(this)?.time_stamp())));
    let resolver = resolve.clone();
    value.define_getter("target", move |this| Ok(target_value(&resolver, event_of(this)?.target())));
    let resolver = resolve.clone();
    value.define_getter("currentTarget", move |this| {
        Ok(target_value(&resolver, event_of(this)?.current_target()))
    });

    value.define_method("preventDefault", |this, _| {
        event_of(this)?.prevent_default();
        Ok(Value::Undefined)
    });
    value.define_method("stopPropagation", |this, _| {
        event_of(this)?.stop_propagation();
        Ok(Value::Undefined)
    });
    value.define_method("stopImmediatePropagation", |this, _| {
        event_of(this)?.stop_immediate_propagation();
        Ok(Value::Undefined)
    });
    value.define_method("composedPath", move |this, _| {
        let path = event_of(this)?.composed_path();
        Ok(Value::new_array(path.iter().map(|key| resolve(key)).collect()))
    });

    match event.detail() {
        EventDetail::Plain => {}
        EventDetail::Custom { detail } => {
            let _ = value.set("detail", detail.clone());
        }
        EventDetail::Mouse { button } => {
            let _ = value.set("button", Value::Number(*button as f64));
        }
        EventDetail::Error { message, error } => {
            let _ = value.set("message", Value::from(message.as_str()));
            let _ = value.set("error", error.clone());
        }
        EventDetail::PromiseRejection { reason } => {
            let _ = value.set("reason", reason.clone());
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn key(n: u64) -> EventTargetKey {
        EventTargetKey::Other(n)
    }

    fn entry(n: u64, closed: bool) -> PathEntry {
        PathEntry {
            item: key(n),
            shadow_adjusted_target: None,
            root_of_closed_tree: closed,
            in_shadow_tree: false,
        }
    }

    #[test]
    fn test_prevent_default_requires_cancelable() {
        let event = Event::new("x", EventInit::default(), 0.0);
        event.prevent_default();
        assert!(!event.default_prevented());

        let event = Event::new(
            "x",
            EventInit {
                cancelable: true,
                ..Default::default()
            },
            0.0,
        );
        event.prevent_default();
        assert!(event.default_prevented());
    }

    #[test]
    fn test_passive_ignores_prevent_default() {
        let event = Event::new(
            "x",
            EventInit {
                cancelable: true,
                ..Default::default()
            },
            0.0,
        );
        event.insert_flags(EventFlags::IN_PASSIVE_LISTENER);
        event.prevent_default();
        assert!(!event.default_prevented());
    }

    #[test]
    fn test_stop_immediate_implies_stop() {
        let event = Event::new("x", EventInit::default(), 0.0);
        event.stop_immediate_propagation();
        assert!(event.flags().contains(EventFlags::STOP_PROPAGATION));
    }

    #[test]
    fn test_trusted_flag() {
        assert!(!Event::new("x", EventInit::default(), 0.0).is_trusted());
        assert!(Event::trusted("x", EventInit::default(), 0.0, EventDetail::Plain).is_trusted());
    }

    #[test]
    fn test_composed_path_hides_closed_tree() {
        // target(1) in closed root(2), host(3), document(4)
        let event = Event::new("x", EventInit::default(), 0.0);
        event.set_path(vec![entry(1, false), entry(2, true), entry(3, false), entry(4, false)]);

        event.set_current_target(Some(key(1)));
        assert_eq!(event.composed_path(), vec![key(1), key(2), key(3), key(4)]);

        event.set_current_target(Some(key(3)));
        assert_eq!(event.composed_path(), vec![key(3), key(4)]);
    }

    #[test]
    fn test_composed_path_empty_outside_dispatch() {
        let event = Event::new("x", EventInit::default(), 0.0);
        assert!(event.composed_path().is_empty());
    }

    #[test]
    fn test_event_wrapper_reads_state() {
        let event = Rc::new(Event::with_detail(
            "ping",
            EventInit::bubbling(),
            12.0,
            EventDetail::Custom {
                detail: Value::Number(7.0),
            },
        ));
        let resolve: TargetResolver = Rc::new(|_: &EventTargetKey| Value::Null);
        let value = event_value(event.clone(), resolve);
        assert_eq!(value.get("type").to_js_string(), "ping");
        assert!(value.get("bubbles").to_boolean());
        assert_eq!(value.get("detail").to_number(), 7.0);
        assert_eq!(value.get("timeStamp").to_number(), 12.0);
        value.call_method("stopPropagation", &[]).unwrap();
        assert!(event.flags().contains(EventFlags::STOP_PROPAGATION));
    }
}
