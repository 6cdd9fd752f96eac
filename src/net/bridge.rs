//! Async bridge
//!
//! `start_operation` launches a transport call on its own thread and hands
//! back a promise. Each in-flight call has a settle-once guard shared by the
//! two racers that can end it:
//!
//! * the abort algorithm on the request's signal (script thread), and
//! * the background thread finishing the transport call.
//!
//! Whoever wins the guard enqueues the single macrotask that settles the
//! promise. The abort path queues it locally; the background thread posts
//! through the bridge's port. The loser changes nothing script can see.
//! A transport that panics still posts a completion, as an error.

use super::fetch::{RedirectMode, Request, RequestInit, Response};
use super::transport::{CancelContext, Transport, TransportError, TransportRequest, TransportResponse};
use crate::abort::{default_abort_reason, AlgorithmId};
use crate::config::NetConfig;
use crate::error::Error;
use crate::event_loop::{panic_message, Promise, RemoteSender, Task, TaskScheduler};
use rustc_hash::FxHashMap as HashMap;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, trace, warn};
use url::Url;

const OPEN: u8 = 0;
const SETTLED_BY_ABORT: u8 = 1;
const SETTLED_BY_COMPLETION: u8 = 2;

/// Settle-once guard shared between the script thread and a background thread
#[derive(Debug, Default)]
pub struct SettleGuard(AtomicU8);

impl SettleGuard {
    fn claim(&self, by: u8) -> bool {
        self.0
            .compare_exchange(OPEN, by, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_settled(&self) -> bool {
        self.0.load(Ordering::Acquire) != OPEN
    }
}

/// Script-thread state for one in-flight operation
pub struct PendingOperation {
    promise: Promise,
    request: Request,
    guard: Arc<SettleGuard>,
    cancel: CancelContext,
    algorithm: Option<AlgorithmId>,
}

impl PendingOperation {
    fn detach_signal(&self) {
        if let (Some(signal), Some(id)) = (&self.request.signal, self.algorithm) {
            signal.remove_algorithm(id);
        }
    }
}

/// Posted by a background thread when its transport call ends
struct Completion {
    op: u64,
    won: bool,
    outcome: Result<TransportResponse, TransportError>,
}

type Operations = RefCell<HashMap<u64, PendingOperation>>;

/// Launches background transport calls and settles their promises
pub struct AsyncBridge {
    sched: Weak<TaskScheduler>,
    transport: Arc<dyn Transport>,
    config: NetConfig,
    base_url: Option<Url>,
    pending: Rc<Operations>,
    completions: RemoteSender<Completion>,
    /// Workers whose completion has not been handled yet
    outstanding: Rc<Cell<usize>>,
    next_op: Cell<u64>,
    closed: Cell<bool>,
}

impl AsyncBridge {
    pub fn new(sched: &TaskScheduler, transport: Arc<dyn Transport>, config: NetConfig, base_url: Option<Url>) -> Self {
        let pending: Rc<Operations> = Rc::new(RefCell::new(HashMap::default()));
        let registry = Rc::downgrade(&pending);
        let outstanding = Rc::new(Cell::new(0));
        let workers = outstanding.clone();
        let completions = sched.open_port(move |sched, completion: Completion| {
            // Closing the bridge already released every worker's hold.
            if workers.get() == 0 {
                trace!(op = completion.op, "completion after bridge closed");
                return Ok(());
            }
            workers.set(workers.get() - 1);
            sched.release_external();
            let Some(registry) = registry.upgrade() else {
                return Ok(());
            };
            on_completion(sched, &registry, completion);
            Ok(())
        });
        Self {
            sched: sched.weak(),
            transport,
            config,
            base_url,
            pending,
            completions,
            outstanding,
            next_op: Cell::new(0),
            closed: Cell::new(false),
        }
    }

    /// Number of operations whose promise has not been settled yet
    pub fn in_flight(&self) -> usize {
        self.pending.borrow().len()
    }

    /// `fetch(input, init)`: request construction errors become rejections
    pub fn fetch(&self, sched: &TaskScheduler, input: &str, init: RequestInit) -> Promise {
        match Request::new(input, self.base_url.as_ref(), init) {
            Ok(request) => self.start_operation(sched, request),
            Err(err) => Promise::rejected(sched, err.to_value()),
        }
    }

    /// Start `request` on a background thread. Always returns a promise;
    /// a pre-aborted signal rejects it without touching the transport.
    pub fn start_operation(&self, sched: &TaskScheduler, request: Request) -> Promise {
        if self.closed.get() {
            return Promise::rejected(sched, Error::invalid_state("the bridge has been closed").to_value());
        }
        if let Some(signal) = &request.signal {
            if signal.aborted() {
                debug!(url = %request.url, "signal already aborted; not starting");
                return Promise::rejected(sched, signal.reason());
            }
        }

        let op = self.next_op.get() + 1;
        self.next_op.set(op);
        let promise = Promise::new();
        let guard = Arc::new(SettleGuard::default());
        let cancel = CancelContext::new();

        let algorithm = request.signal.as_ref().map(|signal| {
            let guard = guard.clone();
            let cancel = cancel.clone();
            let registry = Rc::downgrade(&self.pending);
            signal.add_algorithm(move |sched, signal| {
                if !guard.claim(SETTLED_BY_ABORT) {
                    return Ok(());
                }
                cancel.cancel();
                trace!(op, "abort won the settle guard");
                let reason = signal.reason();
                let registry = registry.clone();
                sched.queue_macrotask(Task::host(move |sched| {
                    let Some(registry) = registry.upgrade() else {
                        return Ok(());
                    };
                    let pending = registry.borrow_mut().remove(&op);
                    if let Some(pending) = pending {
                        debug!(op, "operation aborted");
                        pending.promise.reject(sched, reason);
                    }
                    Ok(())
                }));
                Ok(())
            })
        });

        debug!(op, method = %request.method, url = %request.url, "operation started");
        let transport_request = request.to_transport();
        let redirect = request.redirect;
        self.pending.borrow_mut().insert(
            op,
            PendingOperation {
                promise: promise.clone(),
                request,
                guard: guard.clone(),
                cancel: cancel.clone(),
                algorithm,
            },
        );

        sched.retain_external();
        self.outstanding.set(self.outstanding.get() + 1);
        let transport = self.transport.clone();
        let sender = self.completions.clone();
        let max_redirects = self.config.max_redirects;
        let spawned = thread::Builder::new()
            .name(format!("mercury-op-{}", op))
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    perform_with_redirects(transport.as_ref(), transport_request, redirect, max_redirects, &cancel)
                }))
                .unwrap_or_else(|payload| Err(TransportError::Panicked(panic_message(payload.as_ref()))));
                let won = guard.claim(SETTLED_BY_COMPLETION);
                sender.send(Completion { op, won, outcome });
            });

        if let Err(e) = spawned {
            sched.release_external();
            self.outstanding.set(self.outstanding.get().saturating_sub(1));
            if let Some(pending) = self.pending.borrow_mut().remove(&op) {
                pending.detach_signal();
                if pending.guard.claim(SETTLED_BY_COMPLETION) {
                    promise.reject(sched, Error::transport(format!("could not start worker: {}", e)).to_value());
                }
            }
        }
        promise
    }

    /// Cancel every in-flight operation's transport call. Their promises
    /// stay pending until the background threads report back.
    pub fn cancel_all(&self) {
        for pending in self.pending.borrow().values() {
            pending.cancel.cancel();
        }
    }

    /// Close the completions port. Workers still running finish on their
    /// own; their completions are dropped and their holds on the scheduler
    /// are released here. Later operations reject.
    pub fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        self.cancel_all();
        let Some(sched) = self.sched.upgrade() else {
            return;
        };
        sched.close_port(self.completions.port());
        for _ in 0..self.outstanding.replace(0) {
            sched.release_external();
        }
        debug!(pending = self.pending.borrow().len(), "bridge closed");
    }

    pub fn scheduler(&self) -> Option<Rc<TaskScheduler>> {
        self.sched.upgrade()
    }
}

impl Drop for AsyncBridge {
    fn drop(&mut self) {
        self.close();
    }
}

fn on_completion(sched: &TaskScheduler, registry: &Operations, completion: Completion) {
    let Completion { op, won, outcome } = completion;
    if !won {
        trace!(op, "discarding completion that lost the settle guard");
        return;
    }
    let Some(pending) = registry.borrow_mut().remove(&op) else {
        warn!(op, "completion for unknown operation");
        return;
    };
    pending.detach_signal();
    let signal = pending.request.signal.clone();

    // Script may have aborted after the transport finished but before this
    // macrotask ran; the signal decides.
    if let Some(signal) = signal.as_ref().filter(|s| s.aborted()) {
        debug!(op, "signal aborted before delivery");
        pending.promise.reject(sched, signal.reason());
        return;
    }

    match outcome {
        Ok(response) => {
            debug!(op, status = response.status, "operation completed");
            let response = Rc::new(Response::from_transport(response, signal));
            pending.promise.resolve(sched, response.to_value(sched));
        }
        Err(TransportError::Cancelled) => {
            pending.promise.reject(sched, default_abort_reason());
        }
        Err(TransportError::RedirectRefused(location)) => {
            debug!(op, %location, "redirect refused");
            pending.promise.reject(sched, Error::RedirectPolicy { location }.to_value());
        }
        Err(err) => {
            debug!(op, error = %err, "operation failed");
            pending.promise.reject(sched, Error::transport(err.to_string()).to_value());
        }
    }
}

/// Run the transport, following redirects per `mode`. Runs on the
/// background thread.
fn perform_with_redirects(
    transport: &dyn Transport,
    mut request: TransportRequest,
    mode: RedirectMode,
    max_redirects: u32,
    cancel: &CancelContext,
) -> Result<TransportResponse, TransportError> {
    let mut hops = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        let mut response = transport.perform_request(&request, cancel)?;
        response.redirected = hops > 0;

        let is_redirect = matches!(response.status, 301 | 302 | 303 | 307 | 308);
        let location = response.header("location").map(str::to_string);
        let (true, Some(location)) = (is_redirect, location) else {
            return Ok(response);
        };

        match mode {
            RedirectMode::Manual => return Ok(response),
            RedirectMode::Error => return Err(TransportError::RedirectRefused(location)),
            RedirectMode::Follow => {}
        }
        if hops >= max_redirects {
            return Err(TransportError::TooManyRedirects(max_redirects));
        }
        let next = request
            .url
            .join(&location)
            .map_err(|e| TransportError::Protocol(format!("bad redirect location '{}': {}", location, e)))?;

        let downgrade = (response.status == 303 && request.method != "HEAD")
            || (matches!(response.status, 301 | 302) && request.method == "POST");
        if downgrade {
            request.method = "GET".to_string();
            request.body = None;
            request.headers.retain(|(name, _)| {
                !matches!(
                    name.to_ascii_lowercase().as_str(),
                    "content-type" | "content-length" | "content-encoding" | "content-language" | "content-location"
                )
            });
        }
        request.url = next;
        hops += 1;
    }
}
