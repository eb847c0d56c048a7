//! Conduit: lets external processes call into a running Bevy app over HTTP
//! while every touch of the `World` stays on the main schedule.

pub mod api;
pub mod bridge;
pub mod buffers;
pub mod config;
pub mod error;
pub mod host;
#[cfg(test)]
mod test_support;

pub use bridge::handlers::{HandlerRegistry, HandlerResult};
pub use bridge::{Bridge, BridgeHandle, BridgePlugin, BridgeStatus, LifecycleState, StopMode};
pub use config::BridgeConfig;
pub use error::{BridgeError, HandlerError};
pub use host::{HostListener, HostSignals};
