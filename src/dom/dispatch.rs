//! Event dispatch
//!
//! `dispatch` computes the propagation path once, before any listener
//! runs, and then walks it:
//!
//! * capture: capture listeners from the outermost item inward, stopping
//!   short of the target
//! * at-target: every listener on the target, in registration order
//! * bubble: non-capture listeners from the target's parent outward, only
//!   if the event bubbles
//!
//! Shadow roots end the path unless the event is composed; when it crosses
//! into the host's tree the host becomes the retargeted target. The main
//! document's parent is the window, except for `load`.

use super::activation;
use super::event::{event_value, Event, EventDetail, EventFlags, EventInit, EventPhase, PathEntry, TargetResolver};
use super::listener::{EventTargetKey, ListenerRegistry};
use super::tree::{NodeArena, NodeId, ShadowRootMode, TreeAccess};
use crate::error::{Error, Result};
use crate::runtime::Value;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tracing::{debug, error, trace, warn};

/// Builds the script wrapper for a host-created event
pub type EventWrapperFn = Rc<dyn Fn(&Rc<Event>) -> Value>;

/// Receives listener failures
pub type ErrorReporter = Rc<dyn Fn(Error)>;

#[derive(Clone)]
struct DispatchHooks {
    target_value: TargetResolver,
    event_value: EventWrapperFn,
    reporter: ErrorReporter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Capture,
    Bubble,
    /// The dispatch target itself: every listener, in registration order
    Target,
}

/// The parent of `item` on the propagation path
fn get_the_parent(tree: &dyn TreeAccess, item: &EventTargetKey, event: &Event, origin: Option<NodeId>) -> Option<EventTargetKey> {
    let node = item.node()?;
    if tree.is_shadow_root(node) {
        let origin_root = origin.map(|o| tree.root_of(o));
        if !event.composed() && origin_root == Some(node) {
            return None;
        }
        return tree.shadow_host(node).map(EventTargetKey::Node);
    }
    if tree.is_document(node) {
        if event.event_type() == "load" || !tree.is_main_document(node) {
            return None;
        }
        return Some(EventTargetKey::Window);
    }
    tree.parent_of(node).map(EventTargetKey::Node)
}

fn path_entry(tree: &dyn TreeAccess, item: EventTargetKey, adjusted: Option<EventTargetKey>) -> PathEntry {
    let (closed, in_shadow) = match item.node() {
        Some(node) => (
            tree.shadow_root_mode(node) == Some(ShadowRootMode::Closed),
            tree.is_shadow_root(tree.root_of(node)),
        ),
        None => (false, false),
    };
    PathEntry {
        item,
        shadow_adjusted_target: adjusted,
        root_of_closed_tree: closed,
        in_shadow_tree: in_shadow,
    }
}

fn is_activation_event(event: &Event) -> bool {
    event.event_type() == "click" && matches!(event.detail(), EventDetail::Mouse { .. })
}

/// Propagation path for dispatching `event` at `target`, plus the node
/// whose activation behavior the dispatch triggers
pub fn build_path(tree: &dyn TreeAccess, target: &EventTargetKey, event: &Event) -> (Vec<PathEntry>, Option<NodeId>) {
    let activating = is_activation_event(event);
    let origin = target.node();
    let mut activation_target = origin.filter(|&n| activating && tree.has_activation_behavior(n));

    let mut path = vec![path_entry(tree, target.clone(), Some(target.clone()))];
    let mut retargeted = target.clone();
    let mut parent = get_the_parent(tree, target, event, origin);
    while let Some(item) = parent {
        parent = get_the_parent(tree, &item, event, origin);
        let Some(node) = item.node() else {
            path.push(path_entry(tree, item, None));
            continue;
        };
        let same_tree = retargeted
            .node()
            .map_or(true, |t| tree.is_shadow_including_inclusive_ancestor(tree.root_of(t), node));
        let may_activate = activating && activation_target.is_none() && tree.has_activation_behavior(node);
        if same_tree {
            if may_activate && event.bubbles() {
                activation_target = Some(node);
            }
            path.push(path_entry(tree, item, None));
        } else {
            retargeted = item.clone();
            if may_activate {
                activation_target = Some(node);
            }
            path.push(path_entry(tree, item.clone(), Some(item)));
        }
    }
    (path, activation_target)
}

/// Dispatches events along tree paths using a shared listener registry
pub struct EventDispatcher {
    listeners: ListenerRegistry,
    hooks: RefCell<DispatchHooks>,
    current_event: RefCell<Option<Value>>,
    depth: Cell<u32>,
}

impl EventDispatcher {
    pub fn new(listeners: ListenerRegistry) -> Self {
        let target_value: TargetResolver = Rc::new(|_: &EventTargetKey| Value::Undefined);
        let resolver = target_value.clone();
        let event_wrapper: EventWrapperFn = Rc::new(move |event: &Rc<Event>| event_value(event.clone(), resolver.clone()));
        let reporter: ErrorReporter = Rc::new(|err: Error| error!(error = %err, "uncaught listener error"));
        EventDispatcher {
            listeners,
            hooks: RefCell::new(DispatchHooks {
                target_value,
                event_value: event_wrapper,
                reporter,
            }),
            current_event: RefCell::new(None),
            depth: Cell::new(0),
        }
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    /// How targets surface to script (`this`, `event.target`, ...)
    pub fn set_target_resolver(&self, resolve: TargetResolver) {
        self.hooks.borrow_mut().target_value = resolve;
    }

    /// How host-created events are wrapped for script
    pub fn set_event_wrapper(&self, wrap: EventWrapperFn) {
        self.hooks.borrow_mut().event_value = wrap;
    }

    /// Where listener failures go
    pub fn set_error_reporter(&self, reporter: ErrorReporter) {
        self.hooks.borrow_mut().reporter = reporter;
    }

    /// The global `event`: the event being handled, or `undefined` outside
    /// listeners and inside shadow trees
    pub fn current_event(&self) -> Value {
        self.current_event.borrow().clone().unwrap_or_default()
    }

    /// Nesting depth of in-progress dispatches
    pub fn depth(&self) -> u32 {
        self.depth.get()
    }

    /// Dispatch `event` at `target`. Returns `false` if the event was
    /// canceled. `wrapper` is the event's existing script object, if any.
    pub fn dispatch(
        &self,
        tree: &RefCell<NodeArena>,
        target: EventTargetKey,
        event: &Rc<Event>,
        wrapper: Option<Value>,
    ) -> Result<bool> {
        if event.is_dispatching() {
            return Err(Event::already_dispatching());
        }
        event.insert_flags(EventFlags::DISPATCHING);
        let hooks = self.hooks.borrow().clone();
        let wrapper = wrapper.unwrap_or_else(|| (hooks.event_value)(event));

        let (path, activation_target) = {
            let tree = tree.borrow();
            build_path(&*tree, &target, event)
        };
        trace!(event = event.event_type(), ?target, path = path.len(), "dispatching");
        event.set_path(path.clone());
        self.depth.set(self.depth.get() + 1);

        let activation = match activation_target {
            Some(node) => activation::pre_activate(&mut tree.borrow_mut(), node).unwrap_or_else(|err| {
                warn!(error = %err, "pre-activation failed");
                None
            }),
            None => None,
        };

        for index in (1..path.len()).rev() {
            // Shadow hosts are at-target but still only see capture listeners here.
            if path[index].shadow_adjusted_target.is_some() {
                event.set_phase(EventPhase::AtTarget);
            } else {
                event.set_phase(EventPhase::Capturing);
            }
            self.invoke(&hooks, &path, index, event, &wrapper, Pass::Capture);
        }
        for index in 0..path.len() {
            let pass = if index == 0 {
                event.set_phase(EventPhase::AtTarget);
                Pass::Target
            } else if path[index].shadow_adjusted_target.is_some() {
                event.set_phase(EventPhase::AtTarget);
                Pass::Bubble
            } else if event.bubbles() {
                event.set_phase(EventPhase::Bubbling);
                Pass::Bubble
            } else {
                continue;
            };
            self.invoke(&hooks, &path, index, event, &wrapper, pass);
        }

        self.depth.set(self.depth.get() - 1);
        event.set_phase(EventPhase::None);
        event.set_current_target(None);
        event.set_path(Vec::new());
        event.remove_flags(
            EventFlags::DISPATCHING | EventFlags::STOP_PROPAGATION | EventFlags::STOP_IMMEDIATE_PROPAGATION,
        );
        if path.first().is_some_and(|entry| entry.in_shadow_tree) {
            event.set_target(None);
        }

        if let Some(state) = activation {
            if event.default_prevented() {
                activation::cancel_activation(&mut tree.borrow_mut(), &state)?;
            } else {
                for event_type in activation::post_activation_events(&state) {
                    self.fire(tree, EventTargetKey::Node(state.target), event_type, EventInit::bubbling(), event.time_stamp())?;
                }
            }
        }
        Ok(!event.default_prevented())
    }

    /// Create a trusted event with `init` and dispatch it at `target`
    pub fn fire(
        &self,
        tree: &RefCell<NodeArena>,
        target: EventTargetKey,
        event_type: &str,
        init: EventInit,
        time_stamp: f64,
    ) -> Result<bool> {
        let event = Rc::new(Event::trusted(event_type, init, time_stamp, EventDetail::Plain));
        self.dispatch(tree, target, &event, None)
    }

    fn invoke(&self, hooks: &DispatchHooks, path: &[PathEntry], index: usize, event: &Event, wrapper: &Value, pass: Pass) {
        let entry = &path[index];
        let target = path[..=index]
            .iter()
            .rev()
            .find_map(|e| e.shadow_adjusted_target.clone());
        event.set_target(target);
        if event.flags().contains(EventFlags::STOP_PROPAGATION) {
            return;
        }
        event.set_current_target(Some(entry.item.clone()));

        let listeners = self.listeners.snapshot(&entry.item, event.event_type());
        if listeners.is_empty() {
            return;
        }
        let this = (hooks.target_value)(&entry.item);
        for listener in listeners {
            if listener.is_removed() {
                continue;
            }
            match pass {
                Pass::Capture if !listener.capture => continue,
                Pass::Bubble if listener.capture => continue,
                _ => {}
            }
            if listener.once {
                self.listeners.remove_entry(&entry.item, &listener);
            }

            let visible = (!entry.in_shadow_tree).then(|| wrapper.clone());
            let previous = self.current_event.replace(visible);
            if listener.passive {
                event.insert_flags(EventFlags::IN_PASSIVE_LISTENER);
            }
            let result = listener.callback.invoke(&this, event, wrapper);
            event.remove_flags(EventFlags::IN_PASSIVE_LISTENER);
            *self.current_event.borrow_mut() = previous;

            if let Err(err) = result {
                debug!(event = event.event_type(), error = %err, "listener failed");
                (hooks.reporter)(Error::Listener {
                    event_type: event.event_type().to_string(),
                    source: Box::new(err),
                });
            }
            if event.flags().contains(EventFlags::STOP_IMMEDIATE_PROPAGATION) {
                break;
            }
        }
    }
}
