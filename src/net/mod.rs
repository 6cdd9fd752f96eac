//! Networking: fetch value objects, the transport collaborator and the
//! bridge that runs transport calls off the script thread.

mod bridge;
mod fetch;
mod headers;
mod transport;

pub use bridge::{AsyncBridge, PendingOperation, SettleGuard};
pub use fetch::{RedirectMode, Request, RequestInit, Response};
pub use headers::{headers_value, Headers};
pub use transport::{
    CancelContext, HttpTransport, Transport, TransportError, TransportRequest, TransportResponse,
};
