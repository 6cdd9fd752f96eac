//! Task scheduler
//!
//! Owns the three work sources of the script thread: a FIFO microtask queue,
//! a FIFO macrotask queue and a timer set ordered by due time. Background
//! threads never touch any of them; they post to the cross-thread inbox
//! through typed ports, and `tick` turns those messages into macrotasks.
//!
//! One `tick` is:
//!   1. drain the microtask queue, including microtasks queued while draining
//!   2. move due timers and inbox messages onto the macrotask queue
//!   3. run at most one macrotask
//!   4. report whether work remains
//!
//! Task failures (errors and panics) are isolated and handed to an error
//! sink; they never reach the caller of `tick`. Several windows can share
//! one scheduler: each registers its own sink, and every task, timer, port
//! and tracked rejection remembers the sink that was current when it was
//! queued. Failures go back to that sink.

mod clock;
mod inbox;
mod promise;
mod timers;

pub use clock::{Clock, ManualClock, SystemClock};
pub use inbox::{PortId, RemoteSender};
pub use promise::{Promise, PromiseState, Settlement};
pub use timers::{HostTimerFn, TimerCallback, TimerId};

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::runtime::Value;
use inbox::Inbox;
use rustc_hash::FxHashMap as HashMap;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;
use timers::{FiredTimer, TimerSet};
use tracing::{debug, error, trace};

/// Host function run as a task on the script thread
pub type HostFn = Box<dyn FnOnce(&TaskScheduler) -> Result<()>>;

/// Receives every error isolated by the scheduler
pub type ErrorSink = Rc<dyn Fn(Error)>;

type PortHandler = Rc<dyn Fn(&TaskScheduler, Box<dyn Any + Send>) -> Result<()>>;

/// Identifies a registered error sink (one per window)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SinkId(pub(crate) u64);

/// A queued task and the sink its failures go to
struct Queued {
    origin: Option<SinkId>,
    task: Task,
}

/// A deferred unit of work, invoked exactly once
pub enum Task {
    /// Script callable with bound arguments
    Callback { callable: Value, args: Vec<Value> },
    /// Opaque host function
    Host(HostFn),
}

impl Task {
    pub fn callback(callable: Value, args: Vec<Value>) -> Self {
        Task::Callback { callable, args }
    }

    pub fn host(f: impl FnOnce(&TaskScheduler) -> Result<()> + 'static) -> Self {
        Task::Host(Box::new(f))
    }
}

/// Counters for the scheduler
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Number of `tick` calls
    pub ticks: u64,
    /// Microtasks invoked
    pub microtasks: u64,
    /// Macrotasks invoked
    pub macrotasks: u64,
    /// Timer firings moved onto the macrotask queue
    pub timers_fired: u64,
    /// Inbox messages delivered to ports
    pub messages: u64,
    /// Errors handed to the error sink
    pub errors_reported: u64,
    /// Rejections still unhandled after a microtask drain
    pub unhandled_rejections: u64,
}

/// Outcome of a driver run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunResult {
    /// Ticks executed
    pub ticks: u64,
    /// Time on the scheduler's clock when the run ended (ms)
    pub final_time: u64,
}

/// Single-threaded task scheduler
///
/// Always handled through an `Rc`; host closures that outlive the current
/// call keep a [`Weak`] to it (see [`TaskScheduler::weak`]).
pub struct TaskScheduler {
    this: Weak<TaskScheduler>,
    config: SchedulerConfig,
    clock: Rc<dyn Clock>,
    microtasks: RefCell<VecDeque<Queued>>,
    macrotasks: RefCell<VecDeque<Queued>>,
    timers: RefCell<TimerSet>,
    inbox: Arc<Inbox>,
    ports: RefCell<HashMap<PortId, (Option<SinkId>, PortHandler)>>,
    next_port: Cell<u64>,
    external: Cell<usize>,
    error_sink: RefCell<Option<ErrorSink>>,
    sinks: RefCell<BTreeMap<SinkId, ErrorSink>>,
    next_sink: Cell<u64>,
    origin: Cell<Option<SinkId>>,
    rejections: RefCell<Vec<(Option<SinkId>, Promise)>>,
    stats: RefCell<SchedulerStats>,
}

impl TaskScheduler {
    /// Scheduler driven by the system clock
    pub fn new(config: SchedulerConfig) -> Rc<Self> {
        Self::with_clock(config, Rc::new(SystemClock::new()))
    }

    /// Scheduler driven by a caller-supplied clock
    pub fn with_clock(config: SchedulerConfig, clock: Rc<dyn Clock>) -> Rc<Self> {
        Rc::new_cyclic(|this| TaskScheduler {
            this: this.clone(),
            config,
            clock,
            microtasks: RefCell::new(VecDeque::new()),
            macrotasks: RefCell::new(VecDeque::new()),
            timers: RefCell::new(TimerSet::default()),
            inbox: Arc::new(Inbox::default()),
            ports: RefCell::new(HashMap::default()),
            next_port: Cell::new(0),
            external: Cell::new(0),
            error_sink: RefCell::new(None),
            sinks: RefCell::new(BTreeMap::new()),
            next_sink: Cell::new(0),
            origin: Cell::new(None),
            rejections: RefCell::new(Vec::new()),
            stats: RefCell::new(SchedulerStats::default()),
        })
    }

    /// Weak handle for closures that must not keep the scheduler alive
    pub fn weak(&self) -> Weak<TaskScheduler> {
        self.this.clone()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Current time on the scheduler's clock (ms)
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    // ── queues ───────────────────────────────────────────────────────────

    /// Append to the microtask queue; never runs synchronously
    pub fn queue_microtask(&self, task: Task) {
        let origin = self.origin.get();
        self.microtasks.borrow_mut().push_back(Queued { origin, task });
    }

    /// Append to the macrotask queue
    pub fn queue_macrotask(&self, task: Task) {
        self.push_macrotask(self.origin.get(), task);
    }

    fn push_macrotask(&self, origin: Option<SinkId>, task: Task) {
        self.macrotasks.borrow_mut().push_back(Queued { origin, task });
    }

    // ── timers ───────────────────────────────────────────────────────────

    /// Arm a timer running a script callable. Negative and NaN delays count
    /// as 0; repeating timers are floored to `min_interval_ms`.
    pub fn arm_timer(&self, callable: Value, delay_ms: f64, args: Vec<Value>, repeating: bool) -> TimerId {
        self.arm(TimerCallback::Script { callable, args }, delay_ms, repeating)
    }

    /// Arm a timer running a host function on the script thread
    pub fn arm_host_timer(
        &self,
        delay_ms: f64,
        repeating: bool,
        f: impl Fn(&TaskScheduler) -> Result<()> + 'static,
    ) -> TimerId {
        self.arm(TimerCallback::Host(Rc::new(f)), delay_ms, repeating)
    }

    fn arm(&self, callback: TimerCallback, delay_ms: f64, repeating: bool) -> TimerId {
        let mut delay = if delay_ms.is_finite() && delay_ms > 0.0 {
            delay_ms as u64
        } else {
            0
        };
        if repeating && delay < self.config.min_interval_ms {
            delay = self.config.min_interval_ms;
        }
        let due = self.clock.now_ms().saturating_add(delay);
        let id = self
            .timers
            .borrow_mut()
            .arm(due, callback, repeating.then_some(delay), self.origin.get());
        trace!(timer = %id, delay, repeating, "timer armed");
        id
    }

    /// Cancel a timer; idempotent, unknown ids are ignored
    pub fn cancel_timer(&self, id: TimerId) {
        if self.timers.borrow_mut().cancel(id) {
            trace!(timer = %id, "timer cancelled");
        }
    }

    // ── ports ────────────────────────────────────────────────────────────

    /// Open a port: messages sent through the returned sender (from any
    /// thread) are handed to `handler` by a macrotask on this thread. The
    /// current sink is captured for those macrotasks.
    pub fn open_port<M: Send + 'static>(
        &self,
        handler: impl Fn(&TaskScheduler, M) -> Result<()> + 'static,
    ) -> RemoteSender<M> {
        let id = PortId(self.next_port.get() + 1);
        self.next_port.set(id.0);
        let handler: PortHandler = Rc::new(move |sched, message| match message.downcast::<M>() {
            Ok(message) => handler(sched, *message),
            Err(_) => Err(Error::type_error("message of unexpected type posted to port")),
        });
        self.ports.borrow_mut().insert(id, (self.origin.get(), handler));
        RemoteSender::new(self.inbox.clone(), id)
    }

    /// Close a port; later messages for it are dropped
    pub fn close_port(&self, id: PortId) {
        self.ports.borrow_mut().remove(&id);
    }

    /// Number of ports still open
    pub fn open_ports(&self) -> usize {
        self.ports.borrow().len()
    }

    /// Count one piece of background work in flight; keeps
    /// `has_pending_work` true until the matching `release_external`
    pub fn retain_external(&self) {
        self.external.set(self.external.get() + 1);
    }

    pub fn release_external(&self) {
        self.external.set(self.external.get().saturating_sub(1));
    }

    // ── errors ───────────────────────────────────────────────────────────

    /// Set the fallback sink for errors queued outside any registered sink.
    /// Without one, those go to the oldest registered sink, or are logged.
    pub fn set_error_sink(&self, sink: impl Fn(Error) + 'static) {
        *self.error_sink.borrow_mut() = Some(Rc::new(sink));
    }

    /// Register a sink; work queued while it is current reports to it
    pub fn register_error_sink(&self, sink: impl Fn(Error) + 'static) -> SinkId {
        let id = SinkId(self.next_sink.get() + 1);
        self.next_sink.set(id.0);
        self.sinks.borrow_mut().insert(id, Rc::new(sink));
        id
    }

    /// Remove a sink; work it still owns falls back like unowned work
    pub fn unregister_error_sink(&self, id: SinkId) {
        self.sinks.borrow_mut().remove(&id);
    }

    /// Run `f` with `sink` as the current sink
    pub fn with_origin<R>(&self, sink: SinkId, f: impl FnOnce() -> R) -> R {
        let previous = self.origin.replace(Some(sink));
        let result = f();
        self.origin.set(previous);
        result
    }

    /// The sink work queued right now would report to
    pub fn current_origin(&self) -> Option<SinkId> {
        self.origin.get()
    }

    /// Hand an error to the current sink
    pub fn report_error(&self, err: Error) {
        self.report_error_to(self.origin.get(), err);
    }

    /// Hand an error to `origin`'s sink, falling back when it is gone
    pub fn report_error_to(&self, origin: Option<SinkId>, err: Error) {
        self.stats.borrow_mut().errors_reported += 1;
        let sink = origin
            .and_then(|id| self.sinks.borrow().get(&id).cloned())
            .or_else(|| self.error_sink.borrow().clone())
            .or_else(|| self.sinks.borrow().values().next().cloned());
        match sink {
            Some(sink) => sink(err),
            None => error!(error = %err, "uncaught task error"),
        }
    }

    /// Remember a rejected promise; reported after the next microtask drain
    /// unless a handler is attached by then
    pub(crate) fn track_rejection(&self, promise: Promise) {
        self.rejections.borrow_mut().push((self.origin.get(), promise));
    }

    fn report_unhandled_rejections(&self) {
        let pending = std::mem::take(&mut *self.rejections.borrow_mut());
        for (origin, promise) in pending {
            if promise.is_handled() {
                continue;
            }
            if let PromiseState::Rejected(reason) = promise.state() {
                self.stats.borrow_mut().unhandled_rejections += 1;
                self.report_error_to(origin, Error::UnhandledRejection(reason));
            }
        }
    }

    // ── tick ─────────────────────────────────────────────────────────────

    /// One scheduler step; returns whether more work remains
    pub fn tick(&self) -> bool {
        self.stats.borrow_mut().ticks += 1;

        let drained = self.drain_microtasks();
        self.report_unhandled_rejections();
        self.collect_due_timers();
        self.collect_inbox();

        let queued = self.macrotasks.borrow_mut().pop_front();
        if let Some(queued) = queued {
            self.stats.borrow_mut().macrotasks += 1;
            self.run_task(queued);
        }
        trace!(microtasks = drained, "tick");
        self.has_pending_work()
    }

    fn drain_microtasks(&self) -> u64 {
        let mut count = 0;
        loop {
            let queued = self.microtasks.borrow_mut().pop_front();
            let Some(queued) = queued else { break };
            count += 1;
            self.run_task(queued);
        }
        self.stats.borrow_mut().microtasks += count;
        count
    }

    fn collect_due_timers(&self) {
        let now = self.clock.now_ms();
        let fired = self.timers.borrow_mut().take_due(now);
        for timer in fired {
            self.stats.borrow_mut().timers_fired += 1;
            trace!(timer = %timer.id, "timer due");
            let origin = timer.origin;
            self.push_macrotask(origin, Task::Host(Box::new(move |sched| sched.fire_timer(timer))));
        }
    }

    fn fire_timer(&self, timer: FiredTimer) -> Result<()> {
        if !timer.repeating {
            self.timers.borrow_mut().finish(timer.id);
        }
        if timer.cancelled.get() {
            return Ok(());
        }
        match timer.callback {
            TimerCallback::Script { callable, args } => callable.call(&Value::Undefined, &args).map(|_| ()),
            TimerCallback::Host(f) => f(self),
        }
    }

    fn collect_inbox(&self) {
        for (port, message) in self.inbox.drain() {
            let entry = self.ports.borrow().get(&port).cloned();
            match entry {
                Some((origin, handler)) => {
                    self.stats.borrow_mut().messages += 1;
                    self.push_macrotask(origin, Task::Host(Box::new(move |sched| handler(sched, message))));
                }
                None => debug!(?port, "dropping message for closed port"),
            }
        }
    }

    fn run_task(&self, queued: Queued) {
        let Queued { origin, task } = queued;
        let previous = self.origin.replace(origin);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match task {
            Task::Callback { callable, args } => callable.call(&Value::Undefined, &args).map(|_| ()),
            Task::Host(f) => f(self),
        }));
        self.origin.set(previous);
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.report_error_to(origin, err),
            Err(payload) => self.report_error_to(
                origin,
                Error::HostPanic {
                    message: panic_message(payload.as_ref()),
                },
            ),
        }
    }

    // ── state ────────────────────────────────────────────────────────────

    /// True if any queue is non-empty, a rejection awaits reporting, a timer
    /// is armed or background work is in flight
    pub fn has_pending_work(&self) -> bool {
        !self.microtasks.borrow().is_empty()
            || !self.macrotasks.borrow().is_empty()
            || !self.rejections.borrow().is_empty()
            || self.timers.borrow().armed() > 0
            || !self.inbox.is_empty()
            || self.external.get() > 0
    }

    /// True if a `tick` right now would do something
    fn has_runnable_work(&self) -> bool {
        !self.microtasks.borrow().is_empty()
            || !self.macrotasks.borrow().is_empty()
            || !self.rejections.borrow().is_empty()
            || !self.inbox.is_empty()
            || self
                .timers
                .borrow()
                .next_due()
                .is_some_and(|due| due <= self.clock.now_ms())
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.borrow().clone()
    }

    // ── drivers ──────────────────────────────────────────────────────────

    /// Tick until nothing is pending. Blocks on the inbox (or jumps a
    /// virtual clock) when only future timers or background work remain.
    pub fn run_until_idle(&self) -> Result<RunResult> {
        let mut ticks = 0;
        while self.has_pending_work() {
            if ticks >= self.config.max_ticks {
                return Err(Error::invalid_state(format!(
                    "still busy after {} ticks",
                    self.config.max_ticks
                )));
            }
            if self.has_runnable_work() {
                self.tick();
                ticks += 1;
            } else {
                self.idle_wait();
            }
        }
        debug!(ticks, "scheduler idle");
        Ok(RunResult {
            ticks,
            final_time: self.clock.now_ms(),
        })
    }

    /// Tick until `done` returns true. Fails if the scheduler runs out of
    /// work first or `max_ticks` is exceeded.
    pub fn run_until(&self, mut done: impl FnMut() -> bool) -> Result<RunResult> {
        let mut ticks = 0;
        loop {
            if done() {
                break;
            }
            if !self.has_pending_work() {
                return Err(Error::invalid_state("scheduler went idle before the condition was met"));
            }
            if ticks >= self.config.max_ticks {
                return Err(Error::invalid_state(format!(
                    "condition not met after {} ticks",
                    self.config.max_ticks
                )));
            }
            if self.has_runnable_work() {
                self.tick();
                ticks += 1;
            } else {
                self.idle_wait();
            }
        }
        Ok(RunResult {
            ticks,
            final_time: self.clock.now_ms(),
        })
    }

    /// Wait for the next timer or inbox message
    fn idle_wait(&self) {
        let next_due = self.timers.borrow().next_due();
        if self.external.get() == 0 {
            if let Some(due) = next_due {
                if self.clock.advance_to(due) {
                    return;
                }
            }
        }
        let now = self.clock.now_ms();
        let wait_ms = next_due
            .map(|due| due.saturating_sub(now))
            .unwrap_or(self.config.max_idle_wait_ms)
            .clamp(1, self.config.max_idle_wait_ms.max(1));
        self.inbox.wait(Duration::from_millis(wait_ms));
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn logger() -> (Rc<RefCell<Vec<String>>>, impl Fn(&str) -> Task) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        (log, move |tag: &str| {
            let sink = sink.clone();
            let tag = tag.to_string();
            Task::host(move |_| {
                sink.borrow_mut().push(tag);
                Ok(())
            })
        })
    }

    fn manual() -> (Rc<ManualClock>, Rc<TaskScheduler>) {
        let clock = Rc::new(ManualClock::new());
        let sched = TaskScheduler::with_clock(SchedulerConfig::default(), clock.clone());
        (clock, sched)
    }

    // ── microtasks ──

    #[test]
    fn test_microtasks_before_macrotask() {
        let (_, sched) = manual();
        let (log, task) = logger();
        sched.queue_macrotask(task("macro"));
        sched.queue_microtask(task("micro1"));
        sched.queue_microtask(task("micro2"));
        sched.tick();
        assert_eq!(*log.borrow(), vec!["micro1", "micro2", "macro"]);
    }

    #[test]
    fn test_nested_microtasks_drain_same_tick() {
        let (_, sched) = manual();
        let log = Rc::new(RefCell::new(Vec::new()));
        let inner_log = log.clone();
        sched.queue_macrotask(Task::host({
            let log = log.clone();
            move |_| {
                log.borrow_mut().push("macro");
                Ok(())
            }
        }));
        sched.queue_microtask(Task::host(move |sched| {
            inner_log.borrow_mut().push("outer");
            let log = inner_log.clone();
            sched.queue_microtask(Task::host(move |_| {
                log.borrow_mut().push("inner");
                Ok(())
            }));
            Ok(())
        }));
        sched.tick();
        assert_eq!(*log.borrow(), vec!["outer", "inner", "macro"]);
    }

    #[test]
    fn test_one_macrotask_per_tick() {
        let (_, sched) = manual();
        let (log, task) = logger();
        sched.queue_macrotask(task("a"));
        sched.queue_macrotask(task("b"));
        assert!(sched.tick());
        assert_eq!(*log.borrow(), vec!["a"]);
        assert!(!sched.tick());
        assert_eq!(*log.borrow(), vec!["a", "b"]);
    }

    // ── timers ──

    #[test]
    fn test_zero_delay_timer_fires_on_tick_not_sync() {
        let (_, sched) = manual();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        sched.arm_host_timer(0.0, false, move |_| {
            flag.set(true);
            Ok(())
        });
        assert!(!fired.get());
        sched.tick();
        assert!(fired.get());
        assert!(!sched.has_pending_work());
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let (clock, sched) = manual();
        let fired = Rc::new(Cell::new(0));
        let count = fired.clone();
        let id = sched.arm_host_timer(10.0, false, move |_| {
            count.set(count.get() + 1);
            Ok(())
        });
        sched.cancel_timer(id);
        sched.cancel_timer(id);
        clock.advance(100);
        for _ in 0..5 {
            sched.tick();
        }
        assert_eq!(fired.get(), 0);
        assert!(!sched.has_pending_work());
    }

    #[test]
    fn test_cancel_after_due_before_run() {
        let (_, sched) = manual();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        let (_, task) = logger();
        sched.queue_macrotask(task("first"));
        let id = sched.arm_host_timer(0.0, false, move |_| {
            flag.set(true);
            Ok(())
        });
        // The timer is moved to the macrotask queue behind "first".
        sched.tick();
        sched.cancel_timer(id);
        sched.tick();
        assert!(!fired.get());
    }

    #[test]
    fn test_interval_floor_and_repeat() {
        let (clock, sched) = manual();
        let fired = Rc::new(Cell::new(0));
        let count = fired.clone();
        let id = sched.arm_host_timer(1.0, true, move |_| {
            count.set(count.get() + 1);
            Ok(())
        });
        clock.advance(3);
        sched.tick();
        assert_eq!(fired.get(), 0);
        clock.advance(1);
        sched.tick();
        assert_eq!(fired.get(), 1);
        clock.advance(4);
        sched.tick();
        assert_eq!(fired.get(), 2);
        sched.cancel_timer(id);
        assert!(!sched.has_pending_work());
    }

    #[test]
    fn test_same_due_timers_keep_order() {
        let (clock, sched) = manual();
        let log = Rc::new(RefCell::new(Vec::new()));
        for name in ["t1", "t2", "t3"] {
            let log = log.clone();
            sched.arm_host_timer(5.0, false, move |_| {
                log.borrow_mut().push(name);
                Ok(())
            });
        }
        clock.advance(5);
        sched.run_until_idle().unwrap();
        assert_eq!(*log.borrow(), vec!["t1", "t2", "t3"]);
    }

    #[test]
    fn test_run_until_idle_jumps_virtual_clock() {
        let (clock, sched) = manual();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        sched.arm_host_timer(1_000.0, false, move |_| {
            flag.set(true);
            Ok(())
        });
        let result = sched.run_until_idle().unwrap();
        assert!(fired.get());
        assert_eq!(clock.now_ms(), 1_000);
        assert_eq!(result.final_time, 1_000);
    }

    // ── isolation ──

    #[test]
    fn test_errors_and_panics_are_isolated() {
        let (_, sched) = manual();
        let errors = Rc::new(RefCell::new(Vec::new()));
        let sink = errors.clone();
        sched.set_error_sink(move |err| sink.borrow_mut().push(err.kind().name()));
        let (log, task) = logger();
        sched.queue_microtask(Task::host(|_| Err(Error::type_error("boom"))));
        sched.queue_microtask(Task::host(|_| panic!("host bug")));
        sched.queue_microtask(task("still runs"));
        sched.tick();
        assert_eq!(*log.borrow(), vec!["still runs"]);
        assert_eq!(*errors.borrow(), vec!["TypeError", "InternalError"]);
        assert_eq!(sched.stats().errors_reported, 2);
    }

    #[test]
    fn test_errors_go_to_the_queuing_sink() {
        let (_, sched) = manual();
        let errors = Rc::new(RefCell::new(Vec::new()));
        let sink_for = |tag: &'static str| {
            let errors = errors.clone();
            move |err: Error| errors.borrow_mut().push(format!("{}: {}", tag, err.kind().name()))
        };
        let a = sched.register_error_sink(sink_for("a"));
        let b = sched.register_error_sink(sink_for("b"));

        sched.with_origin(a, || {
            sched.arm_host_timer(0.0, false, |_| Err(Error::type_error("timer")));
        });
        sched.with_origin(b, || {
            sched.queue_microtask(Task::host(|sched| {
                // Work queued from inside a task inherits its sink.
                sched.queue_macrotask(Task::host(|_| panic!("nested")));
                Ok(())
            }));
        });
        sched.run_until_idle().unwrap();
        assert_eq!(*errors.borrow(), vec!["b: InternalError", "a: TypeError"]);
    }

    #[test]
    fn test_unowned_errors_fall_back_to_oldest_sink() {
        let (_, sched) = manual();
        let errors = Rc::new(RefCell::new(Vec::new()));
        let (first, second) = (errors.clone(), errors.clone());
        let a = sched.register_error_sink(move |_| first.borrow_mut().push("a"));
        sched.register_error_sink(move |_| second.borrow_mut().push("b"));
        sched.queue_macrotask(Task::host(|_| Err(Error::type_error("unowned"))));
        sched.tick();
        sched.unregister_error_sink(a);
        sched.queue_macrotask(Task::host(|_| Err(Error::type_error("unowned"))));
        sched.tick();
        assert_eq!(*errors.borrow(), vec!["a", "b"]);
        assert_eq!(sched.current_origin(), None);
    }

    #[test]
    fn test_script_callback_task() {
        let (_, sched) = manual();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let callable = Value::new_function("cb", move |_, args| {
            sink.borrow_mut().extend(args.iter().map(|a| a.to_number()));
            Ok(Value::Undefined)
        });
        sched.queue_macrotask(Task::callback(callable, vec![Value::Number(1.0), Value::Number(2.0)]));
        sched.tick();
        assert_eq!(*seen.borrow(), vec![1.0, 2.0]);
    }

    // ── ports ──

    #[test]
    fn test_port_messages_become_macrotasks() {
        let sched = TaskScheduler::new(SchedulerConfig::default());
        let received = Rc::new(RefCell::new(Vec::new()));
        let sink = received.clone();
        let sender = sched.open_port(move |_, n: u32| {
            sink.borrow_mut().push(n);
            Ok(())
        });
        sched.retain_external();
        let handle = std::thread::spawn(move || {
            sender.send(1);
            sender.send(2);
        });
        let done = received.clone();
        sched.run_until(|| done.borrow().len() == 2).unwrap();
        sched.release_external();
        handle.join().unwrap();
        assert_eq!(*received.borrow(), vec![1, 2]);
        assert!(!sched.has_pending_work());
    }

    #[test]
    fn test_closed_port_drops_messages() {
        let (_, sched) = manual();
        let sender = sched.open_port(|_, _: ()| Err(Error::type_error("should not run")));
        sched.close_port(sender.port());
        sender.send(());
        sched.tick();
        assert_eq!(sched.stats().errors_reported, 0);
        assert_eq!(sched.stats().messages, 0);
    }

    #[test]
    fn test_run_until_fails_when_idle() {
        let (_, sched) = manual();
        let err = sched.run_until(|| false).unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }
}
