//! Mercury: the scripting-runtime coordination core of a browser engine
//!
//! Mercury sits between a script engine and the rest of the browser. It owns
//! the single-threaded task scheduler, bridges background I/O back onto the
//! script thread, and dispatches DOM events along shadow-aware propagation
//! paths. The script engine itself is an opaque collaborator: values cross the
//! boundary as [`Value`]s and script callables are invoked through them.
//!
//! # Quick Start
//!
//! ```no_run
//! use mercury::{RuntimeConfig, TaskScheduler, Window};
//!
//! fn main() -> mercury::Result<()> {
//!     let config = RuntimeConfig::default();
//!     let sched = TaskScheduler::new(config.scheduler.clone());
//!     let window = Window::new(sched.clone(), config)?;
//!     let global = window.global();
//!     global.call_method("fetch", &["http://127.0.0.1:8080/".into()])?;
//!     sched.run_until_idle()?;
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Core** | [`runtime`], [`error`](Error), [`config`] |
//! | **Scheduling** | [`event_loop`], [`abort`] |
//! | **I/O** | [`net`] |
//! | **DOM** | [`dom`], [`window`] |
//! | **Embedding** | [`bindings`] |
// Clippy configuration for Mercury.
//
// - type_complexity: listener and hook types are nested Rc<dyn Fn(..)> aliases
// - arc_with_non_send_sync: Value uses Rc<RefCell> (single-threaded by design)
// - new_without_default: some types have required initialization logic
#![allow(clippy::type_complexity)]
#![allow(clippy::arc_with_non_send_sync)]
#![allow(clippy::new_without_default)]

pub mod abort;
pub mod bindings;
pub mod config;
pub mod dom;
pub mod event_loop;
pub mod net;
pub mod runtime;
pub mod window;

mod error;

pub use abort::{AbortController, AbortSignal};
pub use config::{NetConfig, RuntimeConfig, SchedulerConfig};
pub use dom::{Event, EventDispatcher, EventInit, EventTargetKey, MutationObserver, NodeId};
pub use error::{messages, Error, ErrorKind, Result};
pub use event_loop::{Promise, Task, TaskScheduler};
pub use net::{AsyncBridge, Headers, HttpTransport, RequestInit, Response, Transport};
pub use runtime::Value;
pub use window::Window;

/// Mercury version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
