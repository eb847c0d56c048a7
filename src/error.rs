use std::time::Duration;

use thiserror::Error;

use crate::bridge::correlation::RequestId;
use crate::bridge::handlers::Route;

/// A failure reported by a handler. Travels back to the caller as a normal
/// `success: false` envelope, never as a transport error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    pub kind: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new("invalid_params", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub fn panicked(message: impl Into<String>) -> Self {
        Self::new("panic", message)
    }
}

/// Why a start attempt was refused without touching the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    ResetPending,
    Compiling,
    ShuttingDown,
}

impl std::fmt::Display for SuppressReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::ResetPending => "runtime reset pending",
            Self::Compiling => "host is compiling",
            Self::ShuttingDown => "bridge is shutting down",
        })
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("request {id} timed out after {}ms", after.as_millis())]
    Timeout { id: RequestId, after: Duration },

    #[error("request {id} was discarded by a runtime reset")]
    Reset { id: RequestId },

    #[error("request {id} was dropped before completing")]
    Cancelled { id: RequestId },

    #[error("bridge unavailable: {0}")]
    Unavailable(SuppressReason),

    #[error("no {route} named '{name}'")]
    UnknownHandler { route: Route, name: String },

    #[error("no free port in {first}..={last}")]
    NoFreePort { first: u16, last: u16 },

    #[error("start suppressed: {0}")]
    Suppressed(SuppressReason),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Stable name used as `error.type` in response envelopes.
    pub fn kind(&self) -> &str {
        match self {
            Self::Handler(err) => &err.kind,
            Self::Timeout { .. } => "timeout",
            Self::Reset { .. } => "reset",
            Self::Cancelled { .. } => "cancelled",
            Self::Unavailable(_) => "unavailable",
            Self::UnknownHandler {
                route: Route::Tool, ..
            } => "unknown_tool",
            Self::UnknownHandler {
                route: Route::Resource,
                ..
            } => "unknown_resource",
            Self::NoFreePort { .. } => "bind_failed",
            Self::Suppressed(_) => "suppressed",
            Self::Io(_) => "io",
        }
    }
}
