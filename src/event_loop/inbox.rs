//! Cross-thread inbox
//!
//! The only data structure shared between background threads and the script
//! thread. Background threads post messages through a [`RemoteSender`]; the
//! scheduler drains them during `tick` and turns each into a macrotask.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Identifies a port opened on a scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(pub(crate) u64);

pub(crate) type Envelope = (PortId, Box<dyn Any + Send>);

/// Mutex-guarded message queue with a wake-up condition
#[derive(Default)]
pub(crate) struct Inbox {
    queue: Mutex<VecDeque<Envelope>>,
    ready: Condvar,
}

impl Inbox {
    fn lock(&self) -> MutexGuard<'_, VecDeque<Envelope>> {
        // A panicking sender cannot leave the deque half-updated.
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn push(&self, envelope: Envelope) {
        self.lock().push_back(envelope);
        self.ready.notify_all();
    }

    pub(crate) fn drain(&self) -> Vec<Envelope> {
        self.lock().drain(..).collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Block until a message arrives or `timeout` elapses
    pub(crate) fn wait(&self, timeout: Duration) {
        let guard = self.lock();
        if !guard.is_empty() {
            return;
        }
        let _ = self
            .ready
            .wait_timeout_while(guard, timeout, |queue| queue.is_empty());
    }
}

/// `Send` handle posting typed messages to a port on the script thread
pub struct RemoteSender<M> {
    inbox: Arc<Inbox>,
    port: PortId,
    _marker: PhantomData<fn(M)>,
}

impl<M: Send + 'static> RemoteSender<M> {
    pub(crate) fn new(inbox: Arc<Inbox>, port: PortId) -> Self {
        Self {
            inbox,
            port,
            _marker: PhantomData,
        }
    }

    /// Post a message; it is handled by a macrotask on the script thread
    pub fn send(&self, message: M) {
        self.inbox.push((self.port, Box::new(message)));
    }

    pub fn port(&self) -> PortId {
        self.port
    }
}

impl<M> Clone for RemoteSender<M> {
    fn clone(&self) -> Self {
        Self {
            inbox: self.inbox.clone(),
            port: self.port,
            _marker: PhantomData,
        }
    }
}

impl<M> fmt::Debug for RemoteSender<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSender").field("port", &self.port).finish()
    }
}
