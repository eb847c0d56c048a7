//! HTTP surface of the bridge: an axum server on its own tokio runtime thread.

mod cors;
mod router;
mod routes;
pub mod types;

use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, Path, Query, Request, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bevy::prelude::*;
use serde_json::Value;
use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::net::TcpStream;

use crate::bridge::handlers::Route;
use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use cors::cors;
pub(crate) use router::build_router;
use routes::*;
use types::*;

/// Binds the preferred port, or the first free one in the fallback range.
pub(crate) fn bind_with_fallback(config: &BridgeConfig) -> Result<TcpListener, BridgeError> {
    let first = config.port;
    let last = config.last_port();
    for port in first..=last {
        match TcpListener::bind((config.host, port)) {
            Ok(listener) => {
                if port != first {
                    warn!("[Conduit API] Port {first} unavailable, using fallback {port}");
                }
                return Ok(listener);
            }
            Err(e) => debug!("[Conduit API] Cannot bind {}:{port}: {e}", config.host),
        }
    }
    Err(BridgeError::NoFreePort { first, last })
}

/// How long `shutdown` waits for the socket to be released.
const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Owns the accept thread and its tokio runtime. Only the lifecycle code in
/// `Bridge` creates or closes one.
pub(crate) struct ListenerHandle {
    port: u16,
    listening: Arc<AtomicBool>,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    closed: crossbeam_channel::Receiver<()>,
    done: crossbeam_channel::Receiver<()>,
    thread: Option<JoinHandle<()>>,
}

/// The bound socket as axum sees it. Signals `closed` when axum lets go of
/// it, which happens as soon as a graceful shutdown stops the accept loop.
struct ClosingListener {
    inner: tokio::net::TcpListener,
    closed: crossbeam_channel::Sender<()>,
}

impl axum::serve::Listener for ClosingListener {
    type Io = TcpStream;
    type Addr = std::net::SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        axum::serve::Listener::accept(&mut self.inner).await
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

impl Drop for ClosingListener {
    fn drop(&mut self) {
        let _ = self.closed.try_send(());
    }
}

/// Clears the liveness flag however the accept thread exits.
struct ListeningGuard(Arc<AtomicBool>);

impl Drop for ListeningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ListenerHandle {
    pub(crate) fn spawn(bridge: Arc<Bridge>, listener: TcpListener) -> Result<Self, BridgeError> {
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("conduit-worker")
            .build()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let (closed_tx, closed_rx) = crossbeam_channel::bounded::<()>(1);
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        let listening = Arc::new(AtomicBool::new(true));
        let guard = ListeningGuard(listening.clone());
        let flag = listening.clone();

        let thread = std::thread::Builder::new()
            .name(format!("conduit-accept-{port}"))
            .spawn(move || {
                runtime.block_on(async move {
                    let listener = match tokio::net::TcpListener::from_std(listener) {
                        Ok(inner) => ClosingListener {
                            inner,
                            closed: closed_tx,
                        },
                        Err(e) => {
                            warn!("[Conduit API] Listener on port {port} unusable: {e}");
                            return;
                        }
                    };
                    let app = build_router(bridge);
                    let shutdown = async move {
                        // A dropped sender counts as a shutdown request too.
                        let _ = shutdown_rx.await;
                        flag.store(false, Ordering::Release);
                    };
                    if let Err(e) = axum::serve(listener, app)
                        .with_graceful_shutdown(shutdown)
                        .await
                    {
                        warn!("[Conduit API] Accept loop on port {port} failed: {e}");
                    }
                });
                drop(guard);
                runtime.shutdown_timeout(Duration::from_millis(100));
                let _ = done_tx.send(());
            })?;

        Ok(Self {
            port,
            listening,
            shutdown: Some(shutdown_tx),
            closed: closed_rx,
            done: done_rx,
            thread: Some(thread),
        })
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn probe(&self) -> Arc<AtomicBool> {
        self.listening.clone()
    }

    /// Stops accepting and returns once the port is released, or after
    /// `CLOSE_TIMEOUT`. In-flight connections finish in the background.
    pub(crate) fn shutdown(&mut self) {
        let Some(tx) = self.shutdown.take() else {
            return;
        };
        let _ = tx.send(());
        match self.closed.recv_timeout(CLOSE_TIMEOUT) {
            Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {}
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                warn!(
                    "[Conduit API] Port {} still open {CLOSE_TIMEOUT:?} after shutdown",
                    self.port
                );
            }
        }
    }

    /// Waits up to `grace` for the accept thread to exit.
    pub(crate) fn join(&mut self, grace: Duration) -> bool {
        match self.done.recv_timeout(grace) {
            Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                if let Some(thread) = self.thread.take() {
                    let _ = thread.join();
                }
                true
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => false,
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
