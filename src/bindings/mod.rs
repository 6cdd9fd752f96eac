//! Script bindings
//!
//! Builds the script-visible objects for a [`Window`]: the global object
//! with its timer, fetch and constructor surface, node wrappers, signal
//! wrappers and mutation records. Every closure holds a `Weak<Window>`; once
//! the window is gone, calls fail with an `InvalidStateError`.
//!
//! Wrappers are created lazily through [`Window::wrapper_for`] and cached in
//! the window's identity cache, so a node or signal always surfaces as the
//! same object.

use crate::abort::{AbortController, AbortSignal};
use crate::dom::{
    event_value, Event, EventDetail, EventFlags, EventInit, EventTargetKey, ListenerCallback, ListenerOptions,
    MutationObserver, MutationObserverInit, MutationRecord, NodeData, NodeId, ObserverCallback, ShadowRootMode,
    TreeAccess,
};
use crate::error::{messages, Error, Result};
use crate::event_loop::{Promise, Task, TimerId};
use crate::net::{headers_value, Headers, RequestInit};
use crate::runtime::{NativeFn, Value};
use crate::window::{target_resolver, Window};
use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// Host data behind a node wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRef {
    pub id: NodeId,
}

fn upgrade(window: &Weak<Window>) -> Result<Rc<Window>> {
    window
        .upgrade()
        .ok_or_else(|| Error::invalid_state("the window has been closed"))
}

fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or_default()
}

fn require_args(args: &[Value], count: usize, what: &str) -> Result<()> {
    if args.len() < count {
        let plural = if count == 1 { "argument" } else { "arguments" };
        return Err(Error::type_error(messages::requires(
            what,
            &format!("{} {}", count, plural),
        )));
    }
    Ok(())
}

fn node_arg(value: &Value) -> Result<NodeId> {
    value
        .host_data::<NodeRef>()
        .map(|node| node.id)
        .ok_or_else(|| Error::type_error("parameter is not of type 'Node'"))
}

fn signal_arg(value: &Value) -> Option<AbortSignal> {
    value.host_data::<AbortSignal>().map(|signal| (*signal).clone())
}

/// The `signal` member of an options dictionary
fn options_signal(options: &Value) -> Result<Option<AbortSignal>> {
    if !options.is_object() {
        return Ok(None);
    }
    let signal = options.get_property("signal")?;
    if signal.is_nullish() {
        return Ok(None);
    }
    signal_arg(&signal)
        .map(Some)
        .ok_or_else(|| Error::type_error("member signal is not of type 'AbortSignal'"))
}

fn node_or_null(window: &Window, node: Option<NodeId>) -> Value {
    match node {
        Some(id) => window.wrapper_for(&EventTargetKey::Node(id)),
        None => Value::Null,
    }
}

fn node_list(window: &Window, nodes: &[NodeId]) -> Value {
    Value::new_array(
        nodes
            .iter()
            .map(|id| window.wrapper_for(&EventTargetKey::Node(*id)))
            .collect(),
    )
}

/// Script wrapper for `event`, resolving targets through `window`
pub fn event_wrapper(window: &Window, event: Rc<Event>) -> Value {
    event_value(event, target_resolver(window.weak()))
}

// ── EventTarget ─────────────────────────────────────────────────────────

/// Install `addEventListener`, `removeEventListener` and `dispatchEvent`
fn install_event_target(value: &Value, key: EventTargetKey, window: Weak<Window>) {
    let (w, k) = (window.clone(), key.clone());
    value.define_method("addEventListener", move |_, args| {
        require_args(args, 2, "addEventListener")?;
        let window = upgrade(&w)?;
        let Some(callback) = ListenerCallback::from_value(&args[1])? else {
            return Ok(Value::Undefined);
        };
        let options_value = arg(args, 2);
        let options = ListenerOptions::from_value(&options_value, options_signal(&options_value)?)?;
        window.add_event_listener(k.clone(), &args[0].to_js_string(), callback, options);
        Ok(Value::Undefined)
    });

    let (w, k) = (window.clone(), key.clone());
    value.define_method("removeEventListener", move |_, args| {
        require_args(args, 2, "removeEventListener")?;
        let window = upgrade(&w)?;
        let Some(callback) = ListenerCallback::from_value(&args[1])? else {
            return Ok(Value::Undefined);
        };
        let options = arg(args, 2);
        let capture = if options.is_object() {
            options.get_property("capture")?.to_boolean()
        } else {
            options.to_boolean()
        };
        window.remove_event_listener(&k, &args[0].to_js_string(), &callback, capture);
        Ok(Value::Undefined)
    });

    value.define_method("dispatchEvent", move |_, args| {
        require_args(args, 1, "dispatchEvent")?;
        let window = upgrade(&window)?;
        let event = args[0]
            .host_data::<Event>()
            .ok_or_else(|| Error::type_error("parameter 1 is not of type 'Event'"))?;
        // Only a dispatch that actually starts makes the event untrusted.
        if event.is_dispatching() {
            return Err(Event::already_dispatching());
        }
        event.remove_flags(EventFlags::TRUSTED);
        let not_canceled = window.dispatch_event(key.clone(), &event, Some(args[0].clone()))?;
        Ok(Value::Boolean(not_canceled))
    });
}

// ── global object ───────────────────────────────────────────────────────

/// The window's global object
pub(crate) fn global_object(window: &Window) -> Value {
    let global = Value::new_object();
    let weak = window.weak();
    install_event_target(&global, EventTargetKey::Window, weak.clone());
    install_task_functions(&global, &weak);
    install_fetch(&global, &weak);
    install_abort_constructors(&global, &weak);
    install_event_constructors(&global, &weak);
    install_mutation_observer(&global, &weak);

    global.define_method("Headers", |_, args| {
        let headers = Headers::from_value(&arg(args, 0))?;
        Ok(headers_value(Rc::new(RefCell::new(headers))))
    });

    let w = weak.clone();
    global.define_getter("event", move |_| Ok(upgrade(&w)?.current_event()));
    let w = weak.clone();
    global.define_getter("document", move |_| {
        let window = upgrade(&w)?;
        Ok(window.wrapper_for(&EventTargetKey::Node(window.document())))
    });
    for name in ["window", "self", "globalThis"] {
        let w = weak.clone();
        global.define_getter(name, move |_| Ok(upgrade(&w)?.global()));
    }
    global
}

fn install_task_functions(global: &Value, weak: &Weak<Window>) {
    let w = weak.clone();
    global.define_method("queueMicrotask", move |_, args| {
        let callback = arg(args, 0);
        if !callback.is_callable() {
            return Err(Error::type_error(messages::not_a_function("queueMicrotask callback")));
        }
        let window = upgrade(&w)?;
        window.enter(|| {
            window
                .scheduler()
                .queue_microtask(Task::callback(callback, Vec::new()))
        });
        Ok(Value::Undefined)
    });

    for (name, repeating) in [("setTimeout", false), ("setInterval", true)] {
        let w = weak.clone();
        global.define_method(name, move |_, args| {
            let callback = arg(args, 0);
            if !callback.is_callable() {
                return Err(Error::type_error(messages::not_a_function(&format!("{} handler", name))));
            }
            let delay = arg(args, 1).to_number();
            let extra = args.iter().skip(2).cloned().collect();
            let window = upgrade(&w)?;
            let id = window.enter(|| window.scheduler().arm_timer(callback, delay, extra, repeating));
            Ok(Value::Number(id.0 as f64))
        });
    }

    for name in ["clearTimeout", "clearInterval"] {
        let w = weak.clone();
        global.define_method(name, move |_, args| {
            let id = arg(args, 0).to_number();
            if id.is_finite() && id >= 0.0 {
                upgrade(&w)?.scheduler().cancel_timer(TimerId(id as u64));
            }
            Ok(Value::Undefined)
        });
    }
}

fn install_fetch(global: &Value, weak: &Weak<Window>) {
    let w = weak.clone();
    global.define_method("fetch", move |_, args| {
        let window = upgrade(&w)?;
        let sched = window.scheduler();
        let input = arg(args, 0).to_js_string();
        let init_value = arg(args, 1);
        let init = options_signal(&init_value).and_then(|signal| RequestInit::from_value(&init_value, signal));
        let promise = match init {
            Ok(init) => window.fetch(&input, init),
            Err(err) => window.enter(|| Promise::rejected(sched, err.to_value())),
        };
        Ok(promise.to_value(sched))
    });
}

fn install_abort_constructors(global: &Value, weak: &Weak<Window>) {
    let w = weak.clone();
    global.define_method("AbortController", move |_, _| {
        let window = upgrade(&w)?;
        let controller = Rc::new(AbortController::new());
        let signal = signal_value(&window, controller.signal());
        let value = Value::new_host(controller);
        value.set("signal", signal)?;
        let w = w.clone();
        value.define_method("abort", move |this, args| {
            let controller = this
                .host_data::<AbortController>()
                .ok_or_else(|| Error::type_error("Illegal invocation"))?;
            let window = upgrade(&w)?;
            window.enter(|| controller.abort(window.scheduler(), args.first().cloned()));
            Ok(Value::Undefined)
        });
        Ok(value)
    });

    let statics = Value::new_object();
    let w = weak.clone();
    statics.define_method("abort", move |_, args| {
        let window = upgrade(&w)?;
        Ok(signal_value(&window, &AbortSignal::aborted_with(args.first().cloned())))
    });
    let w = weak.clone();
    statics.define_method("timeout", move |_, args| {
        require_args(args, 1, "AbortSignal.timeout")?;
        let ms = args[0].to_number();
        if !ms.is_finite() || ms < 0.0 {
            return Err(Error::type_error("timeout must be a non-negative number"));
        }
        let window = upgrade(&w)?;
        let signal = window.enter(|| AbortSignal::timeout(window.scheduler(), ms));
        Ok(signal_value(&window, &signal))
    });
    let w = weak.clone();
    statics.define_method("any", move |_, args| {
        let items = arg(args, 0)
            .array_elements()
            .ok_or_else(|| Error::type_error("AbortSignal.any expects an array"))?;
        let signals = items
            .iter()
            .map(|item| signal_arg(item).ok_or_else(|| Error::type_error("array item is not an AbortSignal")))
            .collect::<Result<Vec<_>>>()?;
        let window = upgrade(&w)?;
        Ok(signal_value(&window, &AbortSignal::any(&signals)))
    });
    // A plain object; the script engine decides how statics hang off constructors.
    let _ = global.set("AbortSignal", statics);
}

fn install_event_constructors(global: &Value, weak: &Weak<Window>) {
    let w = weak.clone();
    global.define_method("Event", move |_, args| {
        require_args(args, 1, "Event")?;
        let window = upgrade(&w)?;
        let init = EventInit::from_value(&arg(args, 1))?;
        let event = Rc::new(Event::new(&args[0].to_js_string(), init, window.now()));
        Ok(event_wrapper(&window, event))
    });

    let w = weak.clone();
    global.define_method("CustomEvent", move |_, args| {
        require_args(args, 1, "CustomEvent")?;
        let window = upgrade(&w)?;
        let init_value = arg(args, 1);
        let init = EventInit::from_value(&init_value)?;
        let detail = if init_value.is_object() {
            init_value.get_property("detail")?
        } else {
            Value::Null
        };
        let detail = if detail.is_undefined() { Value::Null } else { detail };
        let event = Rc::new(Event::with_detail(
            &args[0].to_js_string(),
            init,
            window.now(),
            EventDetail::Custom { detail },
        ));
        Ok(event_wrapper(&window, event))
    });
}

fn observer_of(this: &Value) -> Result<Rc<MutationObserver>> {
    this.host_data::<MutationObserver>()
        .ok_or_else(|| Error::type_error("Illegal invocation"))
}

fn install_mutation_observer(global: &Value, weak: &Weak<Window>) {
    let w = weak.clone();
    global.define_method("MutationObserver", move |_, args| {
        let callable = arg(args, 0);
        if !callable.is_callable() {
            return Err(Error::type_error(messages::not_a_function("MutationObserver callback")));
        }
        let observer = MutationObserver::host(|_| Ok(()));
        let value = Value::new_host(observer.clone());
        observer.set_callback(ObserverCallback::Script {
            callable,
            observer: value.clone(),
        });

        let w = w.clone();
        let observe_window = w.clone();
        value.define_method("observe", move |this, args| {
            let observer = observer_of(this)?;
            let window = upgrade(&observe_window)?;
            let target = node_arg(&arg(args, 0))?;
            let options = MutationObserverInit::from_value(&arg(args, 1))?;
            window.observe(&observer, target, options)?;
            Ok(Value::Undefined)
        });
        value.define_method("disconnect", |this, _| {
            observer_of(this)?.disconnect();
            Ok(Value::Undefined)
        });
        value.define_method("takeRecords", move |this, _| {
            let observer = observer_of(this)?;
            let window = upgrade(&w)?;
            let records = observer.take_records();
            Ok(Value::new_array(
                records.iter().map(|record| record_value(&window, record)).collect(),
            ))
        });
        Ok(value)
    });
}

// ── nodes ───────────────────────────────────────────────────────────────

fn node_getter(value: &Value, name: &str, window: &Weak<Window>, id: NodeId, get: impl Fn(&Window, NodeId) -> Result<Value> + 'static) {
    let w = window.clone();
    value.define_getter(name, move |_| get(&*upgrade(&w)?, id));
}

fn node_method(
    value: &Value,
    name: &str,
    window: &Weak<Window>,
    id: NodeId,
    method: impl Fn(&Window, NodeId, &[Value]) -> Result<Value> + 'static,
) {
    let w = window.clone();
    value.define_method(name, move |_, args| method(&*upgrade(&w)?, id, args));
}

/// The wrapper for node `id`
pub(crate) fn node_value(window: &Window, id: NodeId) -> Value {
    let value = Value::new_host(Rc::new(NodeRef { id }));
    let weak = window.weak();
    install_event_target(&value, EventTargetKey::Node(id), weak.clone());

    node_getter(&value, "nodeName", &weak, id, |window, id| {
        Ok(Value::String(window.tree().node_name(id)))
    });
    node_getter(&value, "parentNode", &weak, id, |window, id| {
        let parent = window.tree().parent_of(id);
        Ok(node_or_null(window, parent))
    });
    node_getter(&value, "childNodes", &weak, id, |window, id| {
        let children = window.tree().children(id).to_vec();
        Ok(node_list(window, &children))
    });
    node_getter(&value, "firstChild", &weak, id, |window, id| {
        let first = window.tree().children(id).first().copied();
        Ok(node_or_null(window, first))
    });
    node_getter(&value, "previousSibling", &weak, id, |window, id| {
        let sibling = window.tree().previous_sibling(id);
        Ok(node_or_null(window, sibling))
    });
    node_getter(&value, "nextSibling", &weak, id, |window, id| {
        let sibling = window.tree().next_sibling(id);
        Ok(node_or_null(window, sibling))
    });
    node_getter(&value, "ownerDocument", &weak, id, |window, id| {
        let tree = window.tree();
        let owner = if tree.is_document(id) { None } else { tree.owner_document(id) };
        drop(tree);
        Ok(node_or_null(window, owner))
    });
    node_getter(&value, "isConnected", &weak, id, |window, id| {
        let tree = window.tree();
        let root = tree.root_of(id);
        Ok(Value::Boolean(tree.is_document(root)))
    });

    let w = weak.clone();
    let get_text: NativeFn = Rc::new(move |_, _| {
        let window = upgrade(&w)?;
        let text = window.tree().text_content(id);
        Ok(text.map(Value::String).unwrap_or(Value::Null))
    });
    let w = weak.clone();
    let set_text: NativeFn = Rc::new(move |_, args| {
        let window = upgrade(&w)?;
        let text = arg(args, 0);
        let text = if text.is_nullish() { String::new() } else { text.to_js_string() };
        window.set_text(id, &text)?;
        Ok(Value::Undefined)
    });
    value.define_accessor("textContent", Some(get_text), Some(set_text));

    node_method(&value, "appendChild", &weak, id, |window, id, args| {
        let child = node_arg(&arg(args, 0))?;
        window.append_child(id, child)?;
        Ok(arg(args, 0))
    });
    node_method(&value, "insertBefore", &weak, id, |window, id, args| {
        let child = node_arg(&arg(args, 0))?;
        let reference = arg(args, 1);
        let reference = if reference.is_nullish() { None } else { Some(node_arg(&reference)?) };
        window.insert_before(id, child, reference)?;
        Ok(arg(args, 0))
    });
    node_method(&value, "removeChild", &weak, id, |window, id, args| {
        let child = node_arg(&arg(args, 0))?;
        window.remove_child(id, child)?;
        Ok(arg(args, 0))
    });
    node_method(&value, "contains", &weak, id, |window, id, args| {
        let other = arg(args, 0);
        if other.is_nullish() {
            return Ok(Value::Boolean(false));
        }
        let other = node_arg(&other)?;
        let tree = window.tree();
        let mut node = Some(other);
        while let Some(current) = node {
            if current == id {
                return Ok(Value::Boolean(true));
            }
            node = tree.parent_of(current);
        }
        Ok(Value::Boolean(false))
    });

    let kind = window.tree().data(id).cloned();
    match kind {
        Some(NodeData::Element(_)) => install_element(&value, &weak, id),
        Some(NodeData::Document) => install_document(&value, &weak, id),
        Some(NodeData::ShadowRoot { host, mode }) => {
            let w = weak.clone();
            value.define_getter("host", move |_| Ok(upgrade(&w)?.wrapper_for(&EventTargetKey::Node(host))));
            let mode = match mode {
                ShadowRootMode::Open => "open",
                ShadowRootMode::Closed => "closed",
            };
            value.define_getter("mode", move |_| Ok(Value::from(mode)));
        }
        _ => {}
    }
    value
}

fn install_element(value: &Value, weak: &Weak<Window>, id: NodeId) {
    node_getter(value, "tagName", weak, id, |window, id| {
        Ok(Value::String(window.tree().node_name(id)))
    });
    node_method(value, "getAttribute", weak, id, |window, id, args| {
        let name = arg(args, 0).to_js_string().to_ascii_lowercase();
        let found = window.tree().attribute(id, &name).map(str::to_string);
        Ok(found.map(Value::String).unwrap_or(Value::Null))
    });
    node_method(value, "hasAttribute", weak, id, |window, id, args| {
        let name = arg(args, 0).to_js_string().to_ascii_lowercase();
        let found = window.tree().attribute(id, &name).is_some();
        Ok(Value::Boolean(found))
    });
    node_method(value, "setAttribute", weak, id, |window, id, args| {
        require_args(args, 2, "setAttribute")?;
        window.set_attribute(id, &args[0].to_js_string(), &args[1].to_js_string())?;
        Ok(Value::Undefined)
    });
    node_method(value, "removeAttribute", weak, id, |window, id, args| {
        window.remove_attribute(id, &arg(args, 0).to_js_string())?;
        Ok(Value::Undefined)
    });
    node_method(value, "attachShadow", weak, id, |window, id, args| {
        let mode = arg(args, 0).get_property("mode")?.to_js_string();
        let mode = match mode.as_str() {
            "open" => ShadowRootMode::Open,
            "closed" => ShadowRootMode::Closed,
            other => return Err(Error::type_error(format!("invalid shadow root mode '{}'", other))),
        };
        let root = window.attach_shadow(id, mode)?;
        Ok(window.wrapper_for(&EventTargetKey::Node(root)))
    });
    node_getter(value, "shadowRoot", weak, id, |window, id| {
        let tree = window.tree();
        let open = tree
            .shadow_root(id)
            .filter(|root| tree.shadow_root_mode(*root) == Some(ShadowRootMode::Open));
        drop(tree);
        Ok(node_or_null(window, open))
    });
    node_method(value, "click", weak, id, |window, id, _| {
        window.click(id)?;
        Ok(Value::Undefined)
    });

    let w = weak.clone();
    let get_checked: NativeFn =
        Rc::new(move |_, _| Ok(Value::Boolean(upgrade(&w)?.tree().checked(id))));
    let w = weak.clone();
    let set_checked: NativeFn = Rc::new(move |_, args| {
        upgrade(&w)?.set_checked(id, arg(args, 0).to_boolean())?;
        Ok(Value::Undefined)
    });
    value.define_accessor("checked", Some(get_checked), Some(set_checked));
}

fn install_document(value: &Value, weak: &Weak<Window>, id: NodeId) {
    node_method(value, "createElement", weak, id, |window, document, args| {
        require_args(args, 1, "createElement")?;
        let element = window.create_element_in(document, &args[0].to_js_string());
        Ok(window.wrapper_for(&EventTargetKey::Node(element)))
    });
    node_method(value, "createTextNode", weak, id, |window, document, args| {
        let text = window.create_text_in(document, &arg(args, 0).to_js_string());
        Ok(window.wrapper_for(&EventTargetKey::Node(text)))
    });
    node_method(value, "createDocumentFragment", weak, id, |window, document, _| {
        let fragment = window.create_fragment_in(document);
        Ok(window.wrapper_for(&EventTargetKey::Node(fragment)))
    });
    node_method(value, "adoptNode", weak, id, |window, document, args| {
        let node = node_arg(&arg(args, 0))?;
        window.adopt_node(node, document)?;
        Ok(window.wrapper_for(&EventTargetKey::Node(node)))
    });
    node_method(value, "getElementById", weak, id, |window, document, args| {
        let wanted = arg(args, 0).to_js_string();
        let tree = window.tree();
        let found = tree
            .inclusive_descendants(document)
            .into_iter()
            .find(|node| tree.attribute(*node, "id") == Some(wanted.as_str()));
        drop(tree);
        Ok(node_or_null(window, found))
    });
    node_getter(value, "documentElement", weak, id, |window, document| {
        let tree = window.tree();
        let root = tree
            .children(document)
            .iter()
            .copied()
            .find(|child| tree.element(*child).is_some());
        drop(tree);
        Ok(node_or_null(window, root))
    });
}

// ── signals and records ─────────────────────────────────────────────────

fn signal_of(this: &Value) -> Result<Rc<AbortSignal>> {
    this.host_data::<AbortSignal>()
        .ok_or_else(|| Error::type_error("Illegal invocation"))
}

/// The wrapper for `signal`; binding it makes the signal fire `abort`
/// events at its wrapper
pub fn signal_value(window: &Window, signal: &AbortSignal) -> Value {
    let key = EventTargetKey::Signal(signal.id());
    if let Some(existing) = window.identity().get(&key) {
        return existing;
    }
    window.bind_signal(signal);
    let value = Value::new_host(Rc::new(signal.clone()));
    value.define_getter("aborted", |this| Ok(Value::Boolean(signal_of(this)?.aborted())));
    value.define_getter("reason", |this| Ok(signal_of(this)?.reason()));
    value.define_method("throwIfAborted", |this, _| {
        signal_of(this)?.throw_if_aborted()?;
        Ok(Value::Undefined)
    });
    install_event_target(&value, key.clone(), window.weak());
    window.bind_wrapper(key, value)
}

/// Script view of a mutation record
pub(crate) fn record_value(window: &Window, record: &MutationRecord) -> Value {
    let optional = |text: &Option<String>| text.clone().map(Value::String).unwrap_or(Value::Null);
    Value::new_object_with_properties([
        ("type", Value::from(record.kind.as_str())),
        ("target", window.wrapper_for(&EventTargetKey::Node(record.target))),
        ("addedNodes", node_list(window, &record.added_nodes)),
        ("removedNodes", node_list(window, &record.removed_nodes)),
        ("previousSibling", node_or_null(window, record.previous_sibling)),
        ("nextSibling", node_or_null(window, record.next_sibling)),
        ("attributeName", optional(&record.attribute_name)),
        ("oldValue", optional(&record.old_value)),
    ])
}
