//! Helpers shared by the bridge and api test modules.

use std::future::Future;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use bevy::prelude::*;
use serde_json::Value;

use crate::bridge::dispatcher::Dispatcher;
use crate::bridge::handlers::HandlerRegistry;
use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::host::HostSignals;

pub(crate) fn config_on(port: u16) -> BridgeConfig {
    BridgeConfig {
        port,
        port_scan: 20,
        request_timeout: Duration::from_secs(2),
        stop_grace: Duration::from_secs(1),
        auto_start: false,
        ..BridgeConfig::default()
    }
}

pub(crate) fn bridge_with(
    config: BridgeConfig,
    handlers: HandlerRegistry,
) -> (Arc<Bridge>, Dispatcher) {
    let bridge = Bridge::new(config, handlers, HostSignals::default());
    let dispatcher = Dispatcher::new(bridge.clone());
    (bridge, dispatcher)
}

/// Polls `fut` to completion, ticking the dispatcher every few milliseconds
/// so queued work gets run on `world` meanwhile.
pub(crate) async fn tick_until<F: Future>(
    dispatcher: &mut Dispatcher,
    world: &mut World,
    fut: F,
) -> F::Output {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return out,
            _ = tokio::time::sleep(Duration::from_millis(5)) => {
                dispatcher.tick(world);
            }
        }
    }
}

/// Minimal blocking HTTP/1.1 client. Returns the status code and the parsed
/// JSON body (`Value::Null` when the body is not JSON).
pub(crate) fn http(
    port: u16,
    method: &str,
    path: &str,
    body: &str,
) -> std::io::Result<(u16, Value)> {
    let mut stream = TcpStream::connect(("127.0.0.1", port))?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    write!(
        stream,
        "{method} {path} HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\
         Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )?;
    let mut raw = String::new();
    stream.read_to_string(&mut raw)?;
    let status = raw
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    let json = raw
        .split_once("\r\n\r\n")
        .and_then(|(_, body)| serde_json::from_str(body).ok())
        .unwrap_or(Value::Null);
    Ok((status, json))
}
