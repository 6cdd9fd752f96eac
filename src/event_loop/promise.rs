//! Promises
//!
//! A promise is explicit state (pending, fulfilled, rejected) plus a list of
//! reactions. Reactions never run at settle time: each one is queued as a
//! microtask on the scheduler that settled the promise.

use crate::error::{Error, Result};
use crate::runtime::Value;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use super::{Task, TaskScheduler};

/// Outcome delivered to reactions: `Ok(value)` or `Err(reason)`
pub type Settlement = std::result::Result<Value, Value>;

type Reaction = Box<dyn FnOnce(&TaskScheduler, Settlement) -> Result<()>>;

/// Observable promise state
#[derive(Clone)]
pub enum PromiseState {
    Pending,
    Fulfilled(Value),
    Rejected(Value),
}

impl PromiseState {
    pub fn is_pending(&self) -> bool {
        matches!(self, PromiseState::Pending)
    }
}

impl fmt::Debug for PromiseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromiseState::Pending => write!(f, "pending"),
            PromiseState::Fulfilled(v) => write!(f, "fulfilled: {:?}", v),
            PromiseState::Rejected(r) => write!(f, "rejected: {:?}", r),
        }
    }
}

struct PromiseInner {
    state: PromiseState,
    reactions: Vec<Reaction>,
    /// Set once `resolve` locked the promise onto a value or another promise
    locked: bool,
    handled: bool,
}

/// Host handle to a promise
#[derive(Clone)]
pub struct Promise(Rc<RefCell<PromiseInner>>);

impl Default for Promise {
    fn default() -> Self {
        Self::new()
    }
}

impl Promise {
    /// Create a pending promise
    pub fn new() -> Self {
        Promise(Rc::new(RefCell::new(PromiseInner {
            state: PromiseState::Pending,
            reactions: Vec::new(),
            locked: false,
            handled: false,
        })))
    }

    /// A promise already fulfilled with `value`
    pub fn resolved(sched: &TaskScheduler, value: Value) -> Self {
        let promise = Promise::new();
        promise.resolve(sched, value);
        promise
    }

    /// A promise already rejected with `reason`
    pub fn rejected(sched: &TaskScheduler, reason: Value) -> Self {
        let promise = Promise::new();
        promise.reject(sched, reason);
        promise
    }

    pub fn state(&self) -> PromiseState {
        self.0.borrow().state.clone()
    }

    pub fn is_pending(&self) -> bool {
        self.0.borrow().state.is_pending()
    }

    /// Whether anything subscribed to this promise's outcome
    pub fn is_handled(&self) -> bool {
        self.0.borrow().handled
    }

    pub fn ptr_eq(&self, other: &Promise) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Resolve with `value`. Promises are adopted; objects with a callable
    /// `then` are followed in a microtask. Calls after the first are ignored.
    pub fn resolve(&self, sched: &TaskScheduler, value: Value) {
        {
            let mut inner = self.0.borrow_mut();
            if inner.locked || !inner.state.is_pending() {
                return;
            }
            inner.locked = true;
        }

        if let Some(other) = value.as_promise() {
            if other.ptr_eq(self) {
                self.settle(
                    sched,
                    Err(Value::new_error("TypeError", "Chaining cycle detected for promise")),
                );
                return;
            }
            let target = self.clone();
            other.on_settled(sched, move |sched, outcome| {
                target.settle(sched, outcome);
                Ok(())
            });
            return;
        }

        if value.is_object() {
            match value.get_property("then") {
                Ok(then) if then.is_callable() => {
                    let target = self.clone();
                    sched.queue_microtask(Task::host(move |sched| {
                        let (resolve_fn, reject_fn) = target.settle_functions(sched);
                        if let Err(err) = then.call(&value, &[resolve_fn, reject_fn]) {
                            target.settle(sched, Err(err.to_value()));
                        }
                        Ok(())
                    }));
                    return;
                }
                Ok(_) => {}
                Err(err) => {
                    self.settle(sched, Err(err.to_value()));
                    return;
                }
            }
        }

        self.settle(sched, Ok(value));
    }

    /// Reject with `reason`; ignored if already resolved
    pub fn reject(&self, sched: &TaskScheduler, reason: Value) {
        {
            let mut inner = self.0.borrow_mut();
            if inner.locked || !inner.state.is_pending() {
                return;
            }
            inner.locked = true;
        }
        self.settle(sched, Err(reason));
    }

    fn settle(&self, sched: &TaskScheduler, outcome: Settlement) {
        let (reactions, unhandled) = {
            let mut inner = self.0.borrow_mut();
            if !inner.state.is_pending() {
                return;
            }
            inner.state = match &outcome {
                Ok(value) => PromiseState::Fulfilled(value.clone()),
                Err(reason) => PromiseState::Rejected(reason.clone()),
            };
            (std::mem::take(&mut inner.reactions), outcome.is_err() && !inner.handled)
        };
        if unhandled {
            sched.track_rejection(self.clone());
        }
        for reaction in reactions {
            let outcome = outcome.clone();
            sched.queue_microtask(Task::host(move |sched| reaction(sched, outcome)));
        }
    }

    /// Resolve/reject functions handed to script (thenable adoption)
    fn settle_functions(&self, sched: &TaskScheduler) -> (Value, Value) {
        let weak = sched.weak();
        let target = self.clone();
        let resolve_fn = Value::new_function("resolve", move |_, args| {
            if let Some(sched) = weak.upgrade() {
                target.resolve(&sched, args.first().cloned().unwrap_or_default());
            }
            Ok(Value::Undefined)
        });
        let weak = sched.weak();
        let target = self.clone();
        let reject_fn = Value::new_function("reject", move |_, args| {
            if let Some(sched) = weak.upgrade() {
                target.reject(&sched, args.first().cloned().unwrap_or_default());
            }
            Ok(Value::Undefined)
        });
        (resolve_fn, reject_fn)
    }

    /// Register a host reaction. It runs as a microtask once the promise
    /// settles (immediately queued if it already has).
    pub fn on_settled(
        &self,
        sched: &TaskScheduler,
        reaction: impl FnOnce(&TaskScheduler, Settlement) -> Result<()> + 'static,
    ) {
        let state = {
            let mut inner = self.0.borrow_mut();
            inner.handled = true;
            inner.state.clone()
        };
        match state {
            PromiseState::Pending => self.0.borrow_mut().reactions.push(Box::new(reaction)),
            PromiseState::Fulfilled(value) => {
                sched.queue_microtask(Task::host(move |sched| reaction(sched, Ok(value))))
            }
            PromiseState::Rejected(reason) => {
                sched.queue_microtask(Task::host(move |sched| reaction(sched, Err(reason))))
            }
        }
    }

    /// `promise.then(onFulfilled, onRejected)`; non-callable handlers pass
    /// the outcome through
    pub fn then(&self, sched: &TaskScheduler, on_fulfilled: Option<Value>, on_rejected: Option<Value>) -> Promise {
        let derived = Promise::new();
        let target = derived.clone();
        self.on_settled(sched, move |sched, outcome| {
            let (handler, arg, passthrough) = match outcome {
                Ok(value) => (on_fulfilled, value.clone(), Ok(value)),
                Err(reason) => (on_rejected, reason.clone(), Err(reason)),
            };
            match handler.filter(Value::is_callable) {
                Some(handler) => match handler.call(&Value::Undefined, &[arg]) {
                    Ok(result) => target.resolve(sched, result),
                    Err(err) => target.reject(sched, err.to_value()),
                },
                None => match passthrough {
                    Ok(value) => target.resolve(sched, value),
                    Err(reason) => target.reject(sched, reason),
                },
            }
            Ok(())
        });
        derived
    }

    pub fn catch(&self, sched: &TaskScheduler, on_rejected: Value) -> Promise {
        self.then(sched, None, Some(on_rejected))
    }

    /// `promise.finally(onFinally)`: the handler sees no arguments and the
    /// original outcome is kept unless the handler throws
    pub fn finally(&self, sched: &TaskScheduler, on_finally: Value) -> Promise {
        let derived = Promise::new();
        let target = derived.clone();
        self.on_settled(sched, move |sched, outcome| {
            if on_finally.is_callable() {
                if let Err(err) = on_finally.call(&Value::Undefined, &[]) {
                    target.reject(sched, err.to_value());
                    return Ok(());
                }
            }
            match outcome {
                Ok(value) => target.resolve(sched, value),
                Err(reason) => target.reject(sched, reason),
            }
            Ok(())
        });
        derived
    }

    /// Script-visible promise object with `then`, `catch` and `finally`
    pub fn to_value(&self, sched: &TaskScheduler) -> Value {
        let value = Value::new_promise(self.clone());
        let weak = sched.weak();
        value.define_method("then", promise_method(weak.clone(), |sched, promise, args| {
            promise.then(sched, args.first().cloned(), args.get(1).cloned())
        }));
        value.define_method("catch", promise_method(weak.clone(), |sched, promise, args| {
            promise.catch(sched, args.first().cloned().unwrap_or_default())
        }));
        value.define_method("finally", promise_method(weak, |sched, promise, args| {
            promise.finally(sched, args.first().cloned().unwrap_or_default())
        }));
        value
    }
}

fn promise_method(
    sched: Weak<TaskScheduler>,
    op: impl Fn(&TaskScheduler, &Promise, &[Value]) -> Promise + 'static,
) -> impl Fn(&Value, &[Value]) -> Result<Value> + 'static {
    move |this, args| {
        let promise = this
            .as_promise()
            .ok_or_else(|| Error::type_error("receiver is not a promise"))?;
        let sched = sched
            .upgrade()
            .ok_or_else(|| Error::invalid_state("scheduler has shut down"))?;
        Ok(op(&sched, &promise, args).to_value(&sched))
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Promise {{ <{:?}> }}", self.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use std::cell::RefCell;

    fn recorder() -> (Rc<RefCell<Vec<String>>>, impl Fn(&str) -> Value) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        (log, move |tag: &str| {
            let sink = sink.clone();
            let tag = tag.to_string();
            Value::new_function(&tag.clone(), move |_, args| {
                let arg = args.first().cloned().unwrap_or_default();
                sink.borrow_mut().push(format!("{}:{}", tag, arg));
                Ok(arg)
            })
        })
    }

    #[test]
    fn test_reactions_are_microtasks() {
        let sched = TaskScheduler::new(SchedulerConfig::default());
        let (log, cb) = recorder();
        let promise = Promise::new();
        promise.then(&sched, Some(cb("a")), None);
        promise.resolve(&sched, Value::Number(1.0));
        assert!(log.borrow().is_empty());
        sched.tick();
        assert_eq!(*log.borrow(), vec!["a:1".to_string()]);
    }

    #[test]
    fn test_then_chain_passes_values() {
        let sched = TaskScheduler::new(SchedulerConfig::default());
        let (log, cb) = recorder();
        let promise = Promise::resolved(&sched, Value::from("x"));
        promise
            .then(&sched, None, Some(cb("skipped")))
            .then(&sched, Some(cb("b")), None);
        sched.run_until_idle().unwrap();
        assert_eq!(*log.borrow(), vec!["b:x".to_string()]);
    }

    #[test]
    fn test_catch_recovers() {
        let sched = TaskScheduler::new(SchedulerConfig::default());
        let (log, cb) = recorder();
        let promise = Promise::rejected(&sched, Value::from("bad"));
        promise.catch(&sched, cb("caught")).then(&sched, Some(cb("after")), None);
        sched.run_until_idle().unwrap();
        assert_eq!(
            *log.borrow(),
            vec!["caught:bad".to_string(), "after:bad".to_string()]
        );
        assert_eq!(sched.stats().unhandled_rejections, 0);
    }

    #[test]
    fn test_adopts_other_promise() {
        let sched = TaskScheduler::new(SchedulerConfig::default());
        let inner = Promise::new();
        let outer = Promise::new();
        outer.resolve(&sched, inner.to_value(&sched));
        inner.resolve(&sched, Value::Number(5.0));
        sched.run_until_idle().unwrap();
        assert!(matches!(outer.state(), PromiseState::Fulfilled(Value::Number(n)) if n == 5.0));
    }

    #[test]
    fn test_second_resolve_ignored() {
        let sched = TaskScheduler::new(SchedulerConfig::default());
        let promise = Promise::new();
        promise.resolve(&sched, Value::Number(1.0));
        promise.reject(&sched, Value::Number(2.0));
        assert!(matches!(promise.state(), PromiseState::Fulfilled(_)));
    }

    #[test]
    fn test_unhandled_rejection_reported() {
        let sched = TaskScheduler::new(SchedulerConfig::default());
        let reported = Rc::new(RefCell::new(Vec::new()));
        let sink = reported.clone();
        sched.set_error_sink(move |err| sink.borrow_mut().push(err.to_string()));
        let _ = Promise::rejected(&sched, Value::from("nobody listens"));
        sched.tick();
        assert_eq!(
            *reported.borrow(),
            vec!["Uncaught (in promise) nobody listens".to_string()]
        );
    }

    #[test]
    fn test_script_then_method() {
        let sched = TaskScheduler::new(SchedulerConfig::default());
        let (log, cb) = recorder();
        let value = Promise::resolved(&sched, Value::Number(3.0)).to_value(&sched);
        let chained = value.call_method("then", &[cb("s")]).unwrap();
        assert!(chained.as_promise().is_some());
        sched.run_until_idle().unwrap();
        assert_eq!(*log.borrow(), vec!["s:3".to_string()]);
    }

    #[test]
    fn test_finally_keeps_outcome() {
        let sched = TaskScheduler::new(SchedulerConfig::default());
        let (log, cb) = recorder();
        let promise = Promise::resolved(&sched, Value::Number(9.0));
        promise
            .finally(&sched, cb("fin"))
            .then(&sched, Some(cb("then")), None);
        sched.run_until_idle().unwrap();
        assert_eq!(
            *log.borrow(),
            vec!["fin:undefined".to_string(), "then:9".to_string()]
        );
    }
}
