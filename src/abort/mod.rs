//! AbortController / AbortSignal
//!
//! A signal is a shareable cancellation token. The first `abort` wins: it
//! stores the reason, notifies abort listeners in registration order and
//! then fires the `abort` event through the signal's event hook. Everything
//! here runs on the script thread; background work only ever observes a
//! signal through the cancel contexts the bridge derives from it.

use crate::error::{messages, Error, Result};
use crate::event_loop::{TaskScheduler, TimerId};
use crate::runtime::Value;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

static SIGNAL_ID: AtomicU64 = AtomicU64::new(1);

/// Host abort algorithm
pub type AbortAlgorithm = Rc<dyn Fn(&TaskScheduler, &AbortSignal) -> Result<()>>;

/// Hook that fires the script-visible `abort` event for a signal
pub type AbortEventHook = Rc<dyn Fn(&TaskScheduler, &AbortSignal) -> Result<()>>;

/// Handle returned by [`AbortSignal::add_algorithm`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlgorithmId(u64);

#[derive(Clone)]
enum AbortListener {
    Script(Value),
    Host(AlgorithmId, AbortAlgorithm),
}

struct SignalInner {
    id: u64,
    aborted: Cell<bool>,
    reason: RefCell<Value>,
    listeners: RefCell<Vec<AbortListener>>,
    next_algorithm: Cell<u64>,
    dependents: RefCell<Vec<Weak<SignalInner>>>,
    event_hook: RefCell<Option<AbortEventHook>>,
    timer: Cell<Option<TimerId>>,
}

/// Shareable cancellation token
#[derive(Clone)]
pub struct AbortSignal(Rc<SignalInner>);

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// `DOMException` with name `AbortError` used when no reason is given
pub fn default_abort_reason() -> Value {
    Value::new_error("AbortError", messages::ABORTED_WITHOUT_REASON)
}

/// `DOMException` with name `TimeoutError` used by timeout signals
pub fn timeout_reason() -> Value {
    Value::new_error("TimeoutError", messages::TIMED_OUT)
}

impl AbortSignal {
    /// A signal that is not aborted
    pub fn new() -> Self {
        AbortSignal(Rc::new(SignalInner {
            id: SIGNAL_ID.fetch_add(1, Ordering::Relaxed),
            aborted: Cell::new(false),
            reason: RefCell::new(Value::Undefined),
            listeners: RefCell::new(Vec::new()),
            next_algorithm: Cell::new(0),
            dependents: RefCell::new(Vec::new()),
            event_hook: RefCell::new(None),
            timer: Cell::new(None),
        }))
    }

    /// `AbortSignal.abort(reason)`: already aborted at return
    pub fn aborted_with(reason: Option<Value>) -> Self {
        let signal = AbortSignal::new();
        signal.mark_aborted(reason);
        signal
    }

    /// `AbortSignal.timeout(ms)`: aborts with a `TimeoutError` once the
    /// scheduler fires its timer
    pub fn timeout(sched: &TaskScheduler, ms: f64) -> Self {
        let signal = AbortSignal::new();
        let weak = Rc::downgrade(&signal.0);
        let timer = sched.arm_host_timer(ms, false, move |sched| {
            if let Some(inner) = weak.upgrade() {
                AbortSignal(inner).abort(sched, Some(timeout_reason()));
            }
            Ok(())
        });
        signal.0.timer.set(Some(timer));
        signal
    }

    /// `AbortSignal.any(signals)`: aborts as soon as any input does; aborted
    /// immediately if an input already is
    pub fn any(signals: &[AbortSignal]) -> Self {
        if let Some(source) = signals.iter().find(|s| s.aborted()) {
            return AbortSignal::aborted_with(Some(source.reason()));
        }
        let combined = AbortSignal::new();
        for source in signals {
            source
                .0
                .dependents
                .borrow_mut()
                .push(Rc::downgrade(&combined.0));
        }
        combined
    }

    /// Process-unique signal id
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn aborted(&self) -> bool {
        self.0.aborted.get()
    }

    /// The abort reason; `undefined` while not aborted
    pub fn reason(&self) -> Value {
        self.0.reason.borrow().clone()
    }

    pub fn ptr_eq(&self, other: &AbortSignal) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Timer backing a timeout signal
    pub fn timer(&self) -> Option<TimerId> {
        self.0.timer.get()
    }

    fn mark_aborted(&self, reason: Option<Value>) -> bool {
        if self.0.aborted.replace(true) {
            return false;
        }
        *self.0.reason.borrow_mut() = match reason {
            Some(reason) if !reason.is_undefined() => reason,
            _ => default_abort_reason(),
        };
        true
    }

    /// Abort the signal. Returns `false` if it already was aborted, in which
    /// case nothing changes.
    pub fn abort(&self, sched: &TaskScheduler, reason: Option<Value>) -> bool {
        if !self.mark_aborted(reason) {
            return false;
        }
        debug!(signal = self.id(), reason = %self.reason(), "signal aborted");

        let listeners = std::mem::take(&mut *self.0.listeners.borrow_mut());
        for listener in listeners {
            let result = match listener {
                AbortListener::Script(callable) => callable.call(&Value::Undefined, &[]).map(|_| ()),
                AbortListener::Host(_, algorithm) => algorithm(sched, self),
            };
            if let Err(err) = result {
                sched.report_error(err);
            }
        }

        let hook = self.0.event_hook.borrow().clone();
        if let Some(hook) = hook {
            if let Err(err) = hook(sched, self) {
                sched.report_error(err);
            }
        }

        let dependents = std::mem::take(&mut *self.0.dependents.borrow_mut());
        let reason = self.reason();
        for dependent in dependents.iter().filter_map(Weak::upgrade) {
            AbortSignal(dependent).abort(sched, Some(reason.clone()));
        }
        true
    }

    /// Register a script abort listener. Re-adding the same callable is a
    /// no-op; nothing is registered once the signal has aborted.
    pub fn add_abort_listener(&self, callable: Value) {
        if self.aborted() {
            return;
        }
        let mut listeners = self.0.listeners.borrow_mut();
        let exists = listeners.iter().any(|l| match l {
            AbortListener::Script(existing) => existing.strict_equals(&callable),
            AbortListener::Host(..) => false,
        });
        if !exists {
            listeners.push(AbortListener::Script(callable));
        }
    }

    pub fn remove_abort_listener(&self, callable: &Value) {
        self.0.listeners.borrow_mut().retain(|l| match l {
            AbortListener::Script(existing) => !existing.strict_equals(callable),
            AbortListener::Host(..) => true,
        });
    }

    /// Register a host algorithm run on abort, in order with script listeners
    pub fn add_algorithm(
        &self,
        algorithm: impl Fn(&TaskScheduler, &AbortSignal) -> Result<()> + 'static,
    ) -> AlgorithmId {
        let id = AlgorithmId(self.0.next_algorithm.get() + 1);
        self.0.next_algorithm.set(id.0);
        if !self.aborted() {
            self.0
                .listeners
                .borrow_mut()
                .push(AbortListener::Host(id, Rc::new(algorithm)));
        }
        id
    }

    pub fn remove_algorithm(&self, id: AlgorithmId) {
        self.0.listeners.borrow_mut().retain(|l| match l {
            AbortListener::Host(existing, _) => *existing != id,
            AbortListener::Script(_) => true,
        });
    }

    /// Install the hook that fires the `abort` event at this signal
    pub fn set_event_hook(&self, hook: AbortEventHook) {
        *self.0.event_hook.borrow_mut() = Some(hook);
    }

    /// `throwIfAborted()`
    pub fn throw_if_aborted(&self) -> Result<()> {
        if self.aborted() {
            Err(Error::from_value(self.reason()))
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("id", &self.id())
            .field("aborted", &self.aborted())
            .finish()
    }
}

/// Owner of a signal that can abort it
#[derive(Debug, Clone, Default)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) -> &AbortSignal {
        &self.signal
    }

    /// Abort the controller's signal
    pub fn abort(&self, sched: &TaskScheduler, reason: Option<Value>) -> bool {
        self.signal.abort(sched, reason)
    }
}
