//! Window context
//!
//! A [`Window`] is one browsing context: it owns its node arena, listener
//! registry, dispatcher, identity cache, per-document mutation queues and
//! fetch bridge. Several windows can share one [`TaskScheduler`]; none of
//! their registries are global.
//!
//! Errors that escape script (listener failures, failing tasks, unhandled
//! rejections) surface as `error` and `unhandledrejection` events on the
//! window that queued the failing work. Only if no listener cancels them
//! are they logged.

use crate::abort::AbortSignal;
use crate::bindings;
use crate::config::RuntimeConfig;
use crate::dom::{
    event_value, Event, EventDetail, EventDispatcher, EventInit, EventTargetKey, ListenerCallback, ListenerOptions,
    ListenerRegistry, MutationObserver, MutationObserverInit, MutationQueue, NodeArena, NodeId, ObjectIdentityCache,
    ShadowRootMode, TargetResolver, TreeChange,
};
use crate::error::{Error, Result};
use crate::event_loop::{Promise, SinkId, TaskScheduler};
use crate::net::{AsyncBridge, HttpTransport, RequestInit, Transport};
use crate::runtime::Value;
use rustc_hash::FxHashMap as HashMap;
use std::cell::{Cell, Ref, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use tracing::{debug, error, warn};
use url::Url;

pub struct Window {
    this: Weak<Window>,
    sched: Rc<TaskScheduler>,
    config: RuntimeConfig,
    tree: RefCell<NodeArena>,
    dispatcher: EventDispatcher,
    identity: RefCell<ObjectIdentityCache>,
    mutations: RefCell<HashMap<NodeId, Rc<MutationQueue>>>,
    bridge: AsyncBridge,
    sink: SinkId,
    reporting: Cell<bool>,
}

impl Window {
    /// Window fetching over plain HTTP
    pub fn new(sched: Rc<TaskScheduler>, config: RuntimeConfig) -> Result<Rc<Self>> {
        let transport = Arc::new(HttpTransport::new(config.net.clone()));
        Self::with_transport(sched, config, transport)
    }

    /// Window fetching through `transport`. Registers its own error sink
    /// with the scheduler.
    pub fn with_transport(sched: Rc<TaskScheduler>, config: RuntimeConfig, transport: Arc<dyn Transport>) -> Result<Rc<Self>> {
        config.validate()?;
        let base_url = config
            .document_url
            .as_deref()
            .map(Url::parse)
            .transpose()
            .map_err(|e| Error::config(format!("invalid document URL: {}", e)))?;

        let window = Rc::new_cyclic(|this: &Weak<Window>| {
            let weak = this.clone();
            let sink = sched.register_error_sink(move |err| match weak.upgrade() {
                Some(window) => match err {
                    Error::UnhandledRejection(reason) => window.report_unhandled_rejection(reason),
                    other => window.report_exception(other),
                },
                None => error!(error = %err, "uncaught error after window closed"),
            });
            let bridge = sched.with_origin(sink, || AsyncBridge::new(&sched, transport, config.net.clone(), base_url));

            let dispatcher = EventDispatcher::new(ListenerRegistry::new());
            let resolver = target_resolver(this.clone());
            dispatcher.set_target_resolver(resolver.clone());
            dispatcher.set_event_wrapper(Rc::new(move |event: &Rc<Event>| event_value(event.clone(), resolver.clone())));
            let weak = this.clone();
            dispatcher.set_error_reporter(Rc::new(move |err: Error| match weak.upgrade() {
                Some(window) => window.report_exception(err),
                None => error!(error = %err, "uncaught listener error"),
            }));
            Window {
                this: this.clone(),
                sched: sched.clone(),
                config,
                tree: RefCell::new(NodeArena::new()),
                dispatcher,
                identity: RefCell::new(ObjectIdentityCache::new()),
                mutations: RefCell::new(HashMap::default()),
                bridge,
                sink,
                reporting: Cell::new(false),
            }
        });
        debug!(document = %window.document(), "window created");
        Ok(window)
    }

    pub fn scheduler(&self) -> &Rc<TaskScheduler> {
        &self.sched
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The main document
    pub fn document(&self) -> NodeId {
        self.tree.borrow().main_document()
    }

    pub fn tree(&self) -> Ref<'_, NodeArena> {
        self.tree.borrow()
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        self.dispatcher.listeners()
    }

    pub fn bridge(&self) -> &AsyncBridge {
        &self.bridge
    }

    /// Run `f` with this window as the owner of any work it queues
    pub fn enter<R>(&self, f: impl FnOnce() -> R) -> R {
        self.sched.with_origin(self.sink, f)
    }

    /// This window's error sink on the shared scheduler
    pub fn sink(&self) -> SinkId {
        self.sink
    }

    /// Event time stamp: ms on the scheduler's clock
    pub fn now(&self) -> f64 {
        self.sched.now_ms() as f64
    }

    // ── tree ─────────────────────────────────────────────────────────────

    pub fn create_element(&self, tag: &str) -> NodeId {
        self.create_element_in(self.document(), tag)
    }

    /// `document.createElement(tag)` for any document in this window
    pub fn create_element_in(&self, document: NodeId, tag: &str) -> NodeId {
        self.tree.borrow_mut().create_element(document, tag)
    }

    pub fn create_text(&self, text: &str) -> NodeId {
        self.create_text_in(self.document(), text)
    }

    pub fn create_text_in(&self, document: NodeId, text: &str) -> NodeId {
        self.tree.borrow_mut().create_text(document, text)
    }

    pub fn create_fragment(&self) -> NodeId {
        self.create_fragment_in(self.document())
    }

    pub fn create_fragment_in(&self, document: NodeId) -> NodeId {
        self.tree.borrow_mut().create_fragment(document)
    }

    /// A separate document without a browsing context
    pub fn create_document(&self) -> NodeId {
        self.tree.borrow_mut().create_document()
    }

    pub fn append_child(&self, parent: NodeId, child: NodeId) -> Result<()> {
        let change = self.tree.borrow_mut().append_child(parent, child)?;
        self.apply(change);
        Ok(())
    }

    pub fn insert_before(&self, parent: NodeId, child: NodeId, reference: Option<NodeId>) -> Result<()> {
        let change = self.tree.borrow_mut().insert_before(parent, child, reference)?;
        self.apply(change);
        Ok(())
    }

    pub fn remove_child(&self, parent: NodeId, child: NodeId) -> Result<()> {
        let change = self.tree.borrow_mut().remove_child(parent, child)?;
        self.apply(change);
        Ok(())
    }

    pub fn set_attribute(&self, element: NodeId, name: &str, value: &str) -> Result<()> {
        let change = self.tree.borrow_mut().set_attribute(element, name, value)?;
        self.apply(change);
        Ok(())
    }

    pub fn remove_attribute(&self, element: NodeId, name: &str) -> Result<()> {
        let change = self.tree.borrow_mut().remove_attribute(element, name)?;
        self.apply(change);
        Ok(())
    }

    /// `textContent` setter
    pub fn set_text(&self, node: NodeId, text: &str) -> Result<()> {
        let change = self.tree.borrow_mut().set_text_content(node, text)?;
        self.apply(change);
        Ok(())
    }

    pub fn attach_shadow(&self, host: NodeId, mode: ShadowRootMode) -> Result<NodeId> {
        self.tree.borrow_mut().attach_shadow(host, mode)
    }

    /// `document.adoptNode(node)`: adopted nodes get fresh wrappers
    pub fn adopt_node(&self, node: NodeId, document: NodeId) -> Result<()> {
        let change = self.tree.borrow_mut().adopt(node, document)?;
        self.apply(change);
        Ok(())
    }

    pub fn set_checked(&self, node: NodeId, checked: bool) -> Result<()> {
        self.tree.borrow_mut().set_checked(node, checked)
    }

    fn apply(&self, change: TreeChange) {
        {
            let mut identity = self.identity.borrow_mut();
            for node in &change.adopted {
                identity.invalidate(&EventTargetKey::Node(*node));
            }
        }
        for record in change.records {
            let Some(document) = self.tree.borrow().owner_document(record.target) else {
                continue;
            };
            let queue = self.mutation_queue(document);
            let tree = self.tree.borrow();
            self.enter(|| queue.record(&self.sched, &*tree, record));
        }
    }

    // ── mutation observers ───────────────────────────────────────────────

    /// The mutation queue of `document`, created on first use
    pub fn mutation_queue(&self, document: NodeId) -> Rc<MutationQueue> {
        if let Some(queue) = self.mutations.borrow().get(&document) {
            return queue.clone();
        }
        let queue = MutationQueue::new();
        let weak = self.this.clone();
        queue.set_record_converter(Rc::new(move |record| match weak.upgrade() {
            Some(window) => bindings::record_value(&window, record),
            None => Value::Undefined,
        }));
        self.mutations.borrow_mut().insert(document, queue.clone());
        queue
    }

    /// `observer.observe(target, options)`
    pub fn observe(&self, observer: &Rc<MutationObserver>, target: NodeId, options: MutationObserverInit) -> Result<()> {
        let document = self
            .tree
            .borrow()
            .owner_document(target)
            .ok_or_else(|| Error::type_error(format!("unknown node {}", target)))?;
        self.mutation_queue(document).register(observer);
        observer.observe(target, options);
        Ok(())
    }

    // ── events ───────────────────────────────────────────────────────────

    pub fn add_event_listener(
        &self,
        target: EventTargetKey,
        event_type: &str,
        callback: ListenerCallback,
        options: ListenerOptions,
    ) -> bool {
        self.listeners().add(target, event_type, callback, options)
    }

    pub fn remove_event_listener(
        &self,
        target: &EventTargetKey,
        event_type: &str,
        callback: &ListenerCallback,
        capture: bool,
    ) -> bool {
        self.listeners().remove(target, event_type, callback, capture)
    }

    /// `target.dispatchEvent(event)`
    pub fn dispatch_event(&self, target: EventTargetKey, event: &Rc<Event>, wrapper: Option<Value>) -> Result<bool> {
        self.enter(|| self.dispatcher.dispatch(&self.tree, target, event, wrapper))
    }

    /// Fire a trusted event of `event_type` at `target`
    pub fn fire_event(&self, target: EventTargetKey, event_type: &str, init: EventInit) -> Result<bool> {
        self.enter(|| self.dispatcher.fire(&self.tree, target, event_type, init, self.now()))
    }

    /// A trusted primary-button click, running activation behavior
    pub fn click(&self, node: NodeId) -> Result<bool> {
        let event = Rc::new(Event::trusted(
            "click",
            EventInit {
                bubbles: true,
                cancelable: true,
                composed: true,
            },
            self.now(),
            EventDetail::Mouse { button: 0 },
        ));
        self.dispatch_event(EventTargetKey::Node(node), &event, None)
    }

    /// The global `event`
    pub fn current_event(&self) -> Value {
        self.dispatcher.current_event()
    }

    /// Fire `abort` at `signal` when it aborts
    pub fn bind_signal(&self, signal: &AbortSignal) {
        let weak = self.this.clone();
        signal.set_event_hook(Rc::new(move |_: &TaskScheduler, signal: &AbortSignal| {
            match weak.upgrade() {
                Some(window) => window
                    .fire_event(EventTargetKey::Signal(signal.id()), "abort", EventInit::default())
                    .map(|_| ()),
                None => Ok(()),
            }
        }));
    }

    /// Surface `err` as an `error` event on the window; logged unless a
    /// listener cancels it. Errors raised while reporting are only logged.
    pub fn report_exception(&self, err: Error) {
        if self.reporting.replace(true) {
            error!(error = %err, "error while reporting an error");
            return;
        }
        let event = Rc::new(Event::trusted(
            "error",
            EventInit {
                cancelable: true,
                ..Default::default()
            },
            self.now(),
            EventDetail::Error {
                message: err.to_string(),
                error: err.to_value(),
            },
        ));
        let outcome = self.dispatch_event(EventTargetKey::Window, &event, None);
        self.reporting.set(false);
        match outcome {
            Ok(true) => error!(error = %err, "uncaught error"),
            Ok(false) => debug!(error = %err, "error handled by an error listener"),
            Err(dispatch_err) => error!(error = %err, %dispatch_err, "could not report error"),
        }
    }

    /// Surface an unhandled rejection as an `unhandledrejection` event
    pub fn report_unhandled_rejection(&self, reason: Value) {
        let event = Rc::new(Event::trusted(
            "unhandledrejection",
            EventInit {
                cancelable: true,
                ..Default::default()
            },
            self.now(),
            EventDetail::PromiseRejection { reason: reason.clone() },
        ));
        match self.dispatch_event(EventTargetKey::Window, &event, None) {
            Ok(true) => warn!(%reason, "unhandled promise rejection"),
            Ok(false) => debug!(%reason, "rejection handled by a listener"),
            Err(err) => error!(error = %err, "could not report unhandled rejection"),
        }
    }

    // ── fetch ────────────────────────────────────────────────────────────

    pub fn fetch(&self, input: &str, init: RequestInit) -> Promise {
        if let Some(signal) = &init.signal {
            self.bind_signal(signal);
        }
        self.enter(|| self.bridge.fetch(&self.sched, input, init))
    }

    // ── script wrappers ──────────────────────────────────────────────────

    /// The script object for `key`, created once and cached. Signals and
    /// host-defined targets only resolve once something has bound them.
    pub fn wrapper_for(&self, key: &EventTargetKey) -> Value {
        if let Some(cached) = self.identity.borrow_mut().lookup(key) {
            return cached;
        }
        let created = match key {
            EventTargetKey::Window => bindings::global_object(self),
            EventTargetKey::Node(id) => bindings::node_value(self, *id),
            EventTargetKey::Signal(_) | EventTargetKey::Other(_) => return Value::Undefined,
        };
        self.identity.borrow_mut().insert(key.clone(), created)
    }

    /// Cache `value` as the wrapper for `key`
    pub fn bind_wrapper(&self, key: EventTargetKey, value: Value) -> Value {
        self.identity.borrow_mut().insert(key, value)
    }

    pub fn identity(&self) -> Ref<'_, ObjectIdentityCache> {
        self.identity.borrow()
    }

    /// The script global object
    pub fn global(&self) -> Value {
        self.wrapper_for(&EventTargetKey::Window)
    }

    pub(crate) fn weak(&self) -> Weak<Window> {
        self.this.clone()
    }

    /// Tear down: cancel in-flight transport calls, close the bridge's port,
    /// drop wrappers and listeners and unregister the error sink
    pub fn close(&self) {
        self.bridge.close();
        self.sched.unregister_error_sink(self.sink);
        self.identity.borrow_mut().clear();
        self.mutations.borrow_mut().clear();
        self.listeners().clear_target(&EventTargetKey::Window);
        debug!("window closed");
    }
}

impl Drop for Window {
    fn drop(&mut self) {
        self.sched.unregister_error_sink(self.sink);
    }
}

pub(crate) fn target_resolver(window: Weak<Window>) -> TargetResolver {
    Rc::new(move |key: &EventTargetKey| match window.upgrade() {
        Some(window) => window.wrapper_for(key),
        None => Value::Undefined,
    })
}
