//! Document model and events
//!
//! - `tree`: node arena and the [`TreeAccess`] view the dispatcher uses
//! - `event`: events, flags and their script wrappers
//! - `listener`: per-target listener registry
//! - `dispatch`: propagation path and the three dispatch phases
//! - `activation`: checkbox and radio click behavior
//! - `mutation`: mutation records, observers and batched delivery
//! - `identity`: stable script wrappers for host entities

pub mod activation;
pub mod dispatch;
pub mod event;
pub mod identity;
pub mod listener;
pub mod mutation;
pub mod tree;

pub use dispatch::{build_path, ErrorReporter, EventDispatcher, EventWrapperFn};
pub use event::{event_value, Event, EventDetail, EventFlags, EventInit, EventPhase, PathEntry, TargetResolver};
pub use identity::{IdentityStats, ObjectIdentityCache};
pub use listener::{EventTargetKey, HostListener, ListenerCallback, ListenerEntry, ListenerOptions, ListenerRegistry};
pub use mutation::{
    MutationObserver, MutationObserverInit, MutationQueue, MutationRecord, MutationType, ObserverCallback,
    RecordConverter,
};
pub use tree::{ElementData, NodeArena, NodeData, NodeId, ShadowRootMode, TreeAccess, TreeChange};
