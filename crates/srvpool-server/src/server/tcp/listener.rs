//! A plain TCP listener that the pool can start, restart and stop.
//!
//! [`TcpServer`] binds a [`TcpListener`] on `listen` and runs an accept loop in
//! a background task. Every accepted connection is served by the shared
//! [`Handler`] in its own task. The loop and its connections are tied to a
//! [`CancellationToken`] that `shutdown` cancels; the server then waits up to
//! its grace period for the loop to exit before aborting it.
//!
//! Lifecycle calls are serialized by an async mutex, so a `restart` racing a
//! `shutdown` never leaves two accept loops behind.

use super::handler::SharedHandler;
use async_trait::async_trait;
use core::time::Duration;
use parking_lot::{Mutex, RwLock};
use srvpool::{Error, Result, Server};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;

// Pause after a failed `accept` so a full descriptor table does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
struct Identity {
    name: String,
    expose: String,
}

struct Running {
    token: CancellationToken,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// A TCP server managed by a [`srvpool::Pool`].
pub struct TcpServer {
    bind: String,
    identity: RwLock<Identity>,
    grace: Duration,
    running: Mutex<Option<Running>>,
    handler: Mutex<Option<SharedHandler>>,
    last_error: Arc<Mutex<Option<String>>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl TcpServer {
    pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

    /// Creates a stopped server. `expose` defaults to `bind` when empty.
    pub fn new(name: impl Into<String>, bind: impl Into<String>, expose: impl Into<String>) -> Self {
        let bind = bind.into();
        let expose = expose.into();
        let expose = if expose.is_empty() { bind.clone() } else { expose };
        Self {
            identity: RwLock::new(Identity {
                name: name.into(),
                expose,
            }),
            bind,
            grace: Self::DEFAULT_GRACE,
            running: Mutex::new(None),
            handler: Mutex::new(None),
            last_error: Arc::new(Mutex::new(None)),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Sets how long `shutdown` waits for the accept loop before aborting it.
    #[must_use]
    pub const fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub const fn grace(&self) -> Duration {
        self.grace
    }

    /// Address actually bound while running. Differs from the bind address
    /// when it asks for port `0`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    /// `Ok` while the accept loop is alive. Otherwise reports the last accept
    /// failure, or [`Error::NotRunning`] if there was none.
    pub fn health_check(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        match self.last_error.lock().clone() {
            Some(err) => Err(Error::Io(std::io::Error::other(err))),
            None => Err(Error::NotRunning {
                bind: self.bind.clone(),
            }),
        }
    }

    async fn start(&self, handler: SharedHandler) -> Result<()> {
        if self.is_running() {
            tracing::debug!("{} on {} is already listening", self.name(), self.bind);
            return Ok(());
        }

        *self.handler.lock() = Some(Arc::clone(&handler));

        let listener = TcpListener::bind(&self.bind)
            .await
            .map_err(|source| Error::Bind {
                bind: self.bind.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let token = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            listener,
            handler,
            token.clone(),
            Arc::clone(&self.last_error),
        ));

        *self.last_error.lock() = None;
        *self.running.lock() = Some(Running {
            token,
            task,
            local_addr,
        });

        tracing::info!(
            "{} listening on {local_addr} (exposed as {})",
            self.name(),
            self.expose()
        );
        Ok(())
    }

    async fn stop(&self) {
        let Some(mut running) = self.running.lock().take() else {
            return;
        };
        running.token.cancel();

        match timeout(self.grace, &mut running.task).await {
            Ok(Ok(())) => tracing::info!("{} on {} stopped", self.name(), self.bind),
            Ok(Err(e)) => tracing::error!("Accept loop for {} failed: {e}", self.bind),
            Err(_) => {
                tracing::warn!(
                    "Accept loop for {} did not stop within {:?}; aborting",
                    self.bind,
                    self.grace
                );
                running.task.abort();
            }
        }
    }
}

impl core::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let identity = self.identity.read();
        f.debug_struct("TcpServer")
            .field("name", &identity.name)
            .field("bind", &self.bind)
            .field("expose", &identity.expose)
            .field("grace", &self.grace)
            .field("local_addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: SharedHandler,
    token: CancellationToken,
    last_error: Arc<Mutex<Option<String>>>,
) {
    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let handler = Arc::clone(&handler);
                        let conn_token = token.child_token();
                        tokio::spawn(async move {
                            tokio::select! {
                                () = conn_token.cancelled() => {
                                    tracing::debug!("Dropping connection from {peer} on shutdown");
                                }
                                served = handler.handle(stream, peer) => {
                                    if let Err(e) = served {
                                        tracing::debug!("Connection from {peer} failed: {e}");
                                    }
                                }
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Accept failed: {e}");
                        *last_error.lock() = Some(e.to_string());
                        tokio::select! {
                            () = token.cancelled() => break,
                            () = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Server<SharedHandler> for TcpServer {
    fn bindable(&self) -> String {
        self.bind.clone()
    }

    fn expose(&self) -> String {
        self.identity.read().expose.clone()
    }

    fn name(&self) -> String {
        self.identity.read().name.clone()
    }

    fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    async fn listen(&self, handler: SharedHandler) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.start(handler).await
    }

    async fn restart(&self) {
        let _guard = self.lifecycle.lock().await;
        self.stop().await;

        let Some(handler) = self.handler.lock().clone() else {
            tracing::warn!("{} on {} was never started; nothing to restart", self.name(), self.bind);
            return;
        };
        if let Err(e) = self.start(handler).await {
            tracing::error!("Restarting {} on {} failed: {e}", self.name(), self.bind);
            *self.last_error.lock() = Some(e.to_string());
        }
    }

    async fn shutdown(&self) {
        let _guard = self.lifecycle.lock().await;
        self.stop().await;
    }

    fn merge(&self, other: &dyn Server<SharedHandler>) -> bool {
        if other.bindable() != self.bind {
            return false;
        }
        let expose = other.expose();
        let running = self.is_running();

        let mut identity = self.identity.write();
        if running && identity.expose != expose {
            return false;
        }
        identity.name = other.name();
        identity.expose = expose;
        true
    }
}
