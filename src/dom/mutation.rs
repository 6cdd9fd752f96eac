//! Mutation observers
//!
//! Tree operations produce [`MutationRecord`]s. A document's
//! [`MutationQueue`] routes each record to the observers interested in it
//! and schedules a single microtask that delivers every buffered record,
//! one callback per observer, in observer registration order.

use super::tree::{NodeId, TreeAccess};
use crate::error::{Error, Result};
use crate::event_loop::{Task, TaskScheduler};
use crate::runtime::Value;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

static OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationType {
    Attributes,
    CharacterData,
    ChildList,
}

impl MutationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationType::Attributes => "attributes",
            MutationType::CharacterData => "characterData",
            MutationType::ChildList => "childList",
        }
    }
}

/// One observed change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRecord {
    pub kind: MutationType,
    pub target: NodeId,
    pub added_nodes: Vec<NodeId>,
    pub removed_nodes: Vec<NodeId>,
    pub previous_sibling: Option<NodeId>,
    pub next_sibling: Option<NodeId>,
    pub attribute_name: Option<String>,
    pub old_value: Option<String>,
}

impl MutationRecord {
    fn empty(kind: MutationType, target: NodeId) -> Self {
        MutationRecord {
            kind,
            target,
            added_nodes: Vec::new(),
            removed_nodes: Vec::new(),
            previous_sibling: None,
            next_sibling: None,
            attribute_name: None,
            old_value: None,
        }
    }

    pub fn child_list(target: NodeId) -> Self {
        Self::empty(MutationType::ChildList, target)
    }

    pub fn attribute(target: NodeId, name: &str, old_value: Option<String>) -> Self {
        let mut record = Self::empty(MutationType::Attributes, target);
        record.attribute_name = Some(name.to_string());
        record.old_value = old_value;
        record
    }

    pub fn character_data(target: NodeId, old_value: String) -> Self {
        let mut record = Self::empty(MutationType::CharacterData, target);
        record.old_value = Some(old_value);
        record
    }
}

/// `observe()` options after normalization
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationObserverInit {
    pub child_list: bool,
    pub attributes: bool,
    pub character_data: bool,
    pub subtree: bool,
    pub attribute_old_value: bool,
    pub character_data_old_value: bool,
    pub attribute_filter: Option<Vec<String>>,
}

impl MutationObserverInit {
    /// Normalize raw options: `attributes` and `characterData` are implied by
    /// their old-value and filter options; at least one of the three kinds
    /// must be observed.
    pub fn normalize(
        child_list: bool,
        attributes: Option<bool>,
        character_data: Option<bool>,
        subtree: bool,
        attribute_old_value: Option<bool>,
        character_data_old_value: Option<bool>,
        attribute_filter: Option<Vec<String>>,
    ) -> Result<Self> {
        let attributes = attributes
            .unwrap_or(attribute_old_value.is_some() || attribute_filter.is_some());
        let character_data = character_data.unwrap_or(character_data_old_value.is_some());
        if !child_list && !attributes && !character_data {
            return Err(Error::type_error(
                "The options object must set at least one of 'attributes', 'characterData', or 'childList' to true.",
            ));
        }
        if attribute_old_value == Some(true) && !attributes {
            return Err(Error::type_error("attributeOldValue requires attributes"));
        }
        if attribute_filter.is_some() && !attributes {
            return Err(Error::type_error("attributeFilter requires attributes"));
        }
        if character_data_old_value == Some(true) && !character_data {
            return Err(Error::type_error("characterDataOldValue requires characterData"));
        }
        Ok(MutationObserverInit {
            child_list,
            attributes,
            character_data,
            subtree,
            attribute_old_value: attribute_old_value.unwrap_or(false),
            character_data_old_value: character_data_old_value.unwrap_or(false),
            attribute_filter,
        })
    }

    /// Read a script options dictionary
    pub fn from_value(value: &Value) -> Result<Self> {
        let opt = |key: &str| -> Result<Option<bool>> {
            let v = value.get_property(key)?;
            Ok((!v.is_undefined()).then(|| v.to_boolean()))
        };
        let filter = value.get_property("attributeFilter")?;
        let attribute_filter = if filter.is_undefined() {
            None
        } else {
            let items = filter
                .array_elements()
                .ok_or_else(|| Error::type_error("attributeFilter must be an array"))?;
            Some(items.iter().map(Value::to_js_string).collect())
        };
        Self::normalize(
            opt("childList")?.unwrap_or(false),
            opt("attributes")?,
            opt("characterData")?,
            opt("subtree")?.unwrap_or(false),
            opt("attributeOldValue")?,
            opt("characterDataOldValue")?,
            attribute_filter,
        )
    }

    /// Copy of `record` this registration wants, if any. `direct` is true
    /// when the record's target is the observed node itself.
    fn filter(&self, record: &MutationRecord, direct: bool) -> Option<MutationRecord> {
        if !direct && !self.subtree {
            return None;
        }
        let mut copy = record.clone();
        match record.kind {
            MutationType::ChildList if self.child_list => {}
            MutationType::Attributes if self.attributes => {
                if let (Some(filter), Some(name)) = (&self.attribute_filter, &record.attribute_name) {
                    if !filter.iter().any(|f| f == name) {
                        return None;
                    }
                }
                if !self.attribute_old_value {
                    copy.old_value = None;
                }
            }
            MutationType::CharacterData if self.character_data => {
                if !self.character_data_old_value {
                    copy.old_value = None;
                }
            }
            _ => return None,
        }
        Some(copy)
    }
}

/// Callback receiving a batch of records
pub type HostObserverFn = Rc<dyn Fn(&[MutationRecord]) -> Result<()>>;

#[derive(Clone)]
pub enum ObserverCallback {
    /// Called as `callback(records, observer)`
    Script { callable: Value, observer: Value },
    Host(HostObserverFn),
}

/// A `MutationObserver`
pub struct MutationObserver {
    id: u64,
    callback: RefCell<ObserverCallback>,
    observations: RefCell<Vec<(NodeId, MutationObserverInit)>>,
    records: RefCell<Vec<MutationRecord>>,
}

impl MutationObserver {
    pub fn new(callback: ObserverCallback) -> Rc<Self> {
        Rc::new(MutationObserver {
            id: OBSERVER_ID.fetch_add(1, Ordering::Relaxed),
            callback: RefCell::new(callback),
            observations: RefCell::new(Vec::new()),
            records: RefCell::new(Vec::new()),
        })
    }

    pub fn host(f: impl Fn(&[MutationRecord]) -> Result<()> + 'static) -> Rc<Self> {
        Self::new(ObserverCallback::Host(Rc::new(f)))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Point the script callback at the observer's own wrapper
    pub(crate) fn set_callback(&self, callback: ObserverCallback) {
        *self.callback.borrow_mut() = callback;
    }

    /// Start (or replace) observing `target`
    pub fn observe(&self, target: NodeId, options: MutationObserverInit) {
        let mut observations = self.observations.borrow_mut();
        match observations.iter_mut().find(|(node, _)| *node == target) {
            Some(slot) => slot.1 = options,
            None => observations.push((target, options)),
        }
    }

    /// Stop observing and drop undelivered records
    pub fn disconnect(&self) {
        self.observations.borrow_mut().clear();
        self.records.borrow_mut().clear();
    }

    /// `takeRecords()`: undelivered records, emptying the buffer
    pub fn take_records(&self) -> Vec<MutationRecord> {
        std::mem::take(&mut *self.records.borrow_mut())
    }

    pub fn is_observing(&self) -> bool {
        !self.observations.borrow().is_empty()
    }

    /// The record as this observer should see it, if interested. The
    /// nearest matching registration on an inclusive ancestor wins.
    fn interest(&self, tree: &dyn TreeAccess, record: &MutationRecord) -> Option<MutationRecord> {
        let observations = self.observations.borrow();
        let mut node = Some(record.target);
        while let Some(current) = node {
            if let Some((_, options)) = observations.iter().find(|(n, _)| *n == current) {
                if let Some(copy) = options.filter(record, current == record.target) {
                    return Some(copy);
                }
            }
            node = tree.parent_of(current);
        }
        None
    }

    fn deliver(&self, records: Vec<MutationRecord>, to_value: &RecordConverter) -> Result<()> {
        let callback = self.callback.borrow().clone();
        match callback {
            ObserverCallback::Host(f) => f(&records),
            ObserverCallback::Script { callable, observer } => {
                let list = Value::new_array(records.iter().map(|r| to_value(r)).collect());
                callable.call(&observer, &[list, observer.clone()]).map(|_| ())
            }
        }
    }
}

impl fmt::Debug for MutationObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationObserver")
            .field("id", &self.id)
            .field("observations", &self.observations.borrow().len())
            .field("records", &self.records.borrow().len())
            .finish()
    }
}

/// Turns records into script values for script callbacks
pub type RecordConverter = Rc<dyn Fn(&MutationRecord) -> Value>;

/// Per-document record buffer and flush scheduling
pub struct MutationQueue {
    this: Weak<MutationQueue>,
    observers: RefCell<Vec<Weak<MutationObserver>>>,
    flush_scheduled: Cell<bool>,
    to_value: RefCell<RecordConverter>,
}

impl MutationQueue {
    pub fn new() -> Rc<Self> {
        let to_value: RecordConverter = Rc::new(|record: &MutationRecord| {
            Value::new_object_with_properties([("type", Value::from(record.kind.as_str()))])
        });
        Rc::new_cyclic(|this| MutationQueue {
            this: this.clone(),
            observers: RefCell::new(Vec::new()),
            flush_scheduled: Cell::new(false),
            to_value: RefCell::new(to_value),
        })
    }

    pub fn set_record_converter(&self, to_value: RecordConverter) {
        *self.to_value.borrow_mut() = to_value;
    }

    /// Register an observer; registering twice is a no-op
    pub fn register(&self, observer: &Rc<MutationObserver>) {
        let mut observers = self.observers.borrow_mut();
        observers.retain(|w| w.strong_count() > 0);
        if !observers
            .iter()
            .any(|w| w.upgrade().is_some_and(|o| Rc::ptr_eq(&o, observer)))
        {
            observers.push(Rc::downgrade(observer));
        }
    }

    pub fn is_flush_scheduled(&self) -> bool {
        self.flush_scheduled.get()
    }

    /// Route `record` to interested observers. The first record buffered
    /// while no flush is pending schedules exactly one flush microtask.
    pub fn record(&self, sched: &TaskScheduler, tree: &dyn TreeAccess, record: MutationRecord) {
        let observers: Vec<Rc<MutationObserver>> =
            self.observers.borrow().iter().filter_map(Weak::upgrade).collect();
        let mut queued = false;
        for observer in observers {
            if let Some(copy) = observer.interest(tree, &record) {
                observer.records.borrow_mut().push(copy);
                queued = true;
            }
        }
        if queued && !self.flush_scheduled.replace(true) {
            let weak = self.this.clone();
            trace!(kind = record.kind.as_str(), "scheduling mutation flush");
            sched.queue_microtask(Task::host(move |sched| {
                if let Some(queue) = weak.upgrade() {
                    queue.flush(sched);
                }
                Ok(())
            }));
        }
    }

    /// Deliver buffered records in observer creation order; one failing
    /// callback does not stop the rest
    pub fn flush(&self, sched: &TaskScheduler) {
        self.flush_scheduled.set(false);
        let mut observers: Vec<Rc<MutationObserver>> =
            self.observers.borrow().iter().filter_map(Weak::upgrade).collect();
        observers.sort_by_key(|observer| observer.id());
        let to_value = self.to_value.borrow().clone();
        for observer in observers {
            let records = observer.take_records();
            if records.is_empty() {
                continue;
            }
            trace!(observer = observer.id(), count = records.len(), "delivering mutation records");
            if let Err(err) = observer.deliver(records, &to_value) {
                sched.report_error(err);
            }
        }
    }
}
