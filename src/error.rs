//! Error types for the Mercury scripting-runtime core

use crate::runtime::Value;
use std::fmt;
use thiserror::Error;

/// Main error type for Mercury
#[derive(Error, Debug)]
pub enum Error {
    /// Transport failure that was not caused by cancellation
    #[error("TypeError: Failed to fetch: {message}")]
    Transport { message: String },

    /// Signal-driven cancellation; carries the signal's abort reason
    #[error("aborted: {reason}")]
    Abort { reason: Value },

    /// Derived abort caused by a timeout signal firing
    #[error("TimeoutError: {message}")]
    Timeout { message: String },

    /// Operation not valid in the object's current state
    #[error("InvalidStateError: {message}")]
    InvalidState { message: String },

    /// Redirect returned while the request's redirect mode is `error`
    #[error("TypeError: redirect to {location} refused by redirect mode 'error'")]
    RedirectPolicy { location: String },

    /// A listener threw while an event was being dispatched
    #[error("ListenerError: listener for '{event_type}' failed: {source}")]
    Listener {
        event_type: String,
        #[source]
        source: Box<Error>,
    },

    /// Wrong type for an operation (bad argument, non-callable, ...)
    #[error("TypeError: {message}")]
    Type { message: String },

    /// Arbitrary value thrown by script
    #[error("Uncaught {0}")]
    Thrown(Value),

    /// Promise rejected without a handler by the end of a microtask drain
    #[error("Uncaught (in promise) {0}")]
    UnhandledRejection(Value),

    /// A host function panicked while running as a task
    #[error("InternalError: host task panicked: {message}")]
    HostPanic { message: String },

    /// Invalid runtime configuration
    #[error("ConfigError: {message}")]
    Config { message: String },

    /// IO error
    #[error("IOError: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// Script-visible error names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::enum_variant_names)]
pub enum ErrorKind {
    /// TypeError - wrong type or failed network request
    TypeError,
    /// AbortError - operation was cancelled
    AbortError,
    /// TimeoutError - operation timed out
    TimeoutError,
    /// InvalidStateError - object is in the wrong state
    InvalidStateError,
    /// Generic Error - user-thrown values and listener failures
    GenericError,
    /// InternalError - host-side failure
    InternalError,
}

impl ErrorKind {
    /// The `name` property script sees for this kind
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::TypeError => "TypeError",
            ErrorKind::AbortError => "AbortError",
            ErrorKind::TimeoutError => "TimeoutError",
            ErrorKind::InvalidStateError => "InvalidStateError",
            ErrorKind::GenericError => "Error",
            ErrorKind::InternalError => "InternalError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Error {
    /// Create a TypeError
    pub fn type_error(message: impl Into<String>) -> Self {
        Error::Type {
            message: message.into(),
        }
    }

    /// Create an InvalidStateError
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Error::InvalidState {
            message: message.into(),
        }
    }

    /// Create a transport (network) error
    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
        }
    }

    /// Wrap a value thrown by script. Abort and timeout exceptions keep their
    /// taxonomy so callers can match on them.
    pub fn from_value(value: Value) -> Self {
        match value.error_name().as_deref() {
            Some("AbortError") | Some("TimeoutError") => Error::Abort { reason: value },
            _ => Error::Thrown(value),
        }
    }

    /// Script-visible name of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport { .. } | Error::RedirectPolicy { .. } | Error::Type { .. } => {
                ErrorKind::TypeError
            }
            Error::Abort { reason } => match reason.error_name().as_deref() {
                Some("TimeoutError") => ErrorKind::TimeoutError,
                _ => ErrorKind::AbortError,
            },
            Error::Timeout { .. } => ErrorKind::TimeoutError,
            Error::InvalidState { .. } => ErrorKind::InvalidStateError,
            Error::Listener { source, .. } => source.kind(),
            Error::Thrown(_) | Error::UnhandledRejection(_) => ErrorKind::GenericError,
            Error::HostPanic { .. } | Error::Config { .. } | Error::Io { .. } => {
                ErrorKind::InternalError
            }
        }
    }

    /// Convert into the value script observes (a rejection reason or the
    /// `error` of an error event).
    pub fn to_value(&self) -> Value {
        match self {
            Error::Abort { reason } => reason.clone(),
            Error::Thrown(value) | Error::UnhandledRejection(value) => value.clone(),
            Error::Listener { source, .. } => source.to_value(),
            Error::Transport { message } => {
                Value::new_error("TypeError", &format!("Failed to fetch: {}", message))
            }
            Error::Timeout { message } => Value::new_error("TimeoutError", message),
            Error::InvalidState { message } => Value::new_error("InvalidStateError", message),
            Error::RedirectPolicy { .. } | Error::Type { .. } => {
                let text = self.to_string();
                let message = text.strip_prefix("TypeError: ").unwrap_or(&text);
                Value::new_error("TypeError", message)
            }
            other => Value::new_error(other.kind().name(), &other.to_string()),
        }
    }
}

/// Result type alias for Mercury
pub type Result<T> = std::result::Result<T, Error>;

/// Standardized error message templates
pub mod messages {
    pub const NOT_A_FUNCTION: &str = "is not a function";
    pub const ALREADY_DISPATCHING: &str = "The event is already being dispatched";
    pub const BODY_USED: &str = "Body has already been consumed";
    pub const ABORTED_WITHOUT_REASON: &str = "signal is aborted without reason";
    pub const TIMED_OUT: &str = "signal timed out";

    /// Format a "X is not a function" error message
    pub fn not_a_function(name: &str) -> String {
        format!("'{}' {}", name, NOT_A_FUNCTION)
    }

    /// Format a "X requires Y" error message
    pub fn requires(what: &str, requirement: &str) -> String {
        format!("{} requires {}", what, requirement)
    }
}
