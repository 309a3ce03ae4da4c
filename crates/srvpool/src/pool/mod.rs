//! Ordered collection of servers keyed by bind address.
//!
//! A [`Pool`] is a value: structural operations ([`Pool::add`],
//! [`Pool::del`], [`Pool::map_update`]) leave `self` untouched and return the
//! updated pool. Members are shared handles, so both values observe the same
//! running servers.
//!
//! Group operations:
//!
//! - [`Pool::listen`] starts every member in turn and aggregates failures.
//! - [`Pool::restart`] and [`Pool::shutdown`] fan out through a [`Limiter`]
//!   under a fixed time budget and never report per-member failures.
//! - [`Pool::wait_notify`] parks until a termination signal or cancellation,
//!   then shuts the pool down.
//!
//! Structural mutation must be serialized by the caller and must not overlap
//! an in-flight fan-out.
//!
//! [`Limiter`]: crate::Limiter

mod config;
mod fanout;
mod matcher;
#[cfg(test)]
mod tests;

pub use config::*;
pub use fanout::{FanOutReport, Lifecycle};

use crate::{Error, FieldKind, ListenErrors, Notice, Result, SharedServer, os_signal};
use matcher::Matcher;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A set of servers with unique bind addresses.
pub struct Pool<H: Send + 'static> {
    servers: Vec<SharedServer<H>>,
    config: PoolConfig,
    generation: u64,
}

impl<H: Send + 'static> Clone for Pool<H> {
    fn clone(&self) -> Self {
        Self {
            servers: self.servers.clone(),
            config: self.config,
            generation: self.generation,
        }
    }
}

impl<H: Send + 'static> Default for Pool<H> {
    fn default() -> Self {
        Self::with_config(PoolConfig::default())
    }
}

impl<H: Send + 'static> core::fmt::Debug for Pool<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pool")
            .field("len", &self.servers.len())
            .field("config", &self.config)
            .field("generation", &self.generation)
            .finish()
    }
}

impl<H: Send + 'static> Pool<H> {
    /// An empty pool using `config` for its group operations.
    pub const fn with_config(config: PoolConfig) -> Self {
        Self {
            servers: Vec::new(),
            config,
            generation: 0,
        }
    }

    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Counter bumped by every structural change that produced this value.
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Members in insertion order.
    pub fn iter(&self) -> core::slice::Iter<'_, SharedServer<H>> {
        self.servers.iter()
    }

    fn derive(&self, servers: Vec<SharedServer<H>>) -> Self {
        Self {
            servers,
            config: self.config,
            generation: self.generation + 1,
        }
    }
}

impl<H> Pool<H>
where
    H: Send + 'static,
{
    /// Builds a pool from `servers` with the default configuration.
    ///
    /// Entries rejected by [`Pool::add`] are skipped.
    pub async fn new(servers: impl IntoIterator<Item = SharedServer<H>>) -> Self {
        Self::default().seeded(servers).await
    }

    /// Adds `servers` to `self` one by one, skipping rejected entries.
    pub async fn seeded(self, servers: impl IntoIterator<Item = SharedServer<H>>) -> Self {
        let mut pool = self;
        for server in servers {
            match pool.add([server]).await {
                Ok(next) => pool = next,
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Skipping server: {_e}");
                }
            }
        }
        pool
    }

    /// Returns a pool containing `servers` in addition to the current members.
    ///
    /// A server whose bind address is already present is first offered to the
    /// existing member through [`Server::merge`](crate::Server::merge). If the
    /// merge is refused, the existing member is shut down and replaced.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidBindAddress`] if any server reports an empty bind
    /// address. Nothing is merged, replaced or shut down in that case.
    pub async fn add(&self, servers: impl IntoIterator<Item = SharedServer<H>>) -> Result<Self> {
        let incoming: Vec<(String, SharedServer<H>)> =
            servers.into_iter().map(|s| (s.bindable(), s)).collect();
        if let Some((bind, _)) = incoming.iter().find(|(bind, _)| bind.trim().is_empty()) {
            return Err(Error::InvalidBindAddress(bind.clone()));
        }

        let mut next = self.servers.clone();

        for (bind, server) in incoming {
            let Some(idx) = next.iter().position(|s| s.bindable() == bind) else {
                next.push(server);
                continue;
            };

            if next[idx].merge(&*server) {
                #[cfg(feature = "tracing")]
                tracing::debug!("Merged server {} into existing entry for {bind}", server.name());
                continue;
            }

            #[cfg(feature = "tracing")]
            tracing::info!("Replacing server on {bind} with {}", server.name());
            let old = next.remove(idx);
            if old.is_running() {
                old.shutdown().await;
            }
            next.push(server);
        }

        Ok(self.derive(next))
    }

    /// Member bound to `bind`, if any.
    pub fn get(&self, bind: &str) -> Option<SharedServer<H>> {
        self.servers
            .iter()
            .find(|s| s.bindable() == bind)
            .map(Arc::clone)
    }

    pub fn has(&self, bind: &str) -> bool {
        self.servers.iter().any(|s| s.bindable() == bind)
    }

    /// Returns a pool without the member bound to `bind`.
    ///
    /// The removed member is shut down first when it is running. If no member
    /// matches, an unchanged copy is returned.
    pub async fn del(&self, bind: &str) -> Self {
        let Some(idx) = self.servers.iter().position(|s| s.bindable() == bind) else {
            return self.clone();
        };

        let mut next = self.servers.clone();
        let removed = next.remove(idx);
        if removed.is_running() {
            #[cfg(feature = "tracing")]
            tracing::info!("Stopping removed server {} on {bind}", removed.name());
            removed.shutdown().await;
        }

        self.derive(next)
    }

    /// Calls `f` for every member, in order.
    pub fn map_run(&self, mut f: impl FnMut(&SharedServer<H>)) {
        for server in &self.servers {
            f(server);
        }
    }

    /// Returns a pool where every member is replaced by `f(member)`.
    ///
    /// If two results share a bind address, the first one is kept.
    pub fn map_update(&self, mut f: impl FnMut(SharedServer<H>) -> SharedServer<H>) -> Self {
        let mut next: Vec<SharedServer<H>> = Vec::with_capacity(self.servers.len());
        for server in &self.servers {
            let updated = f(Arc::clone(server));
            let bind = updated.bindable();
            if next.iter().any(|s| s.bindable() == bind) {
                #[cfg(feature = "tracing")]
                tracing::warn!("Dropping duplicate server for {bind} after update");
                continue;
            }
            next.push(updated);
        }
        self.derive(next)
    }

    /// Projects `ret` of every member matching `pattern` on `filter`, or whose
    /// name matches `regex`.
    ///
    /// `pattern` is compared case-insensitively as a substring. With both
    /// `pattern` and `regex` empty, nothing matches.
    pub fn list(&self, filter: FieldKind, ret: FieldKind, pattern: &str, regex: &str) -> Vec<String> {
        let matcher = Matcher::new(filter, pattern, regex);
        if matcher.is_void() {
            return Vec::new();
        }

        self.servers
            .iter()
            .filter(|s| matcher.matches(&***s))
            .map(|s| ret.value_of(&**s))
            .collect()
    }

    /// Sub-pool of the members selected by the same rule as [`Pool::list`].
    pub fn filter(&self, field: FieldKind, pattern: &str, regex: &str) -> Self {
        let matcher = Matcher::new(field, pattern, regex);
        let servers = if matcher.is_void() {
            Vec::new()
        } else {
            self.servers
                .iter()
                .filter(|s| matcher.matches(&***s))
                .map(Arc::clone)
                .collect()
        };
        self.derive(servers)
    }

    /// With `at_least_one == false`, `true` when every member runs; otherwise
    /// `true` when any member runs. An empty pool is never running.
    pub fn is_running(&self, at_least_one: bool) -> bool {
        if self.servers.is_empty() {
            return false;
        }

        if at_least_one {
            self.servers.iter().any(|s| s.is_running())
        } else {
            self.servers.iter().all(|s| s.is_running())
        }
    }

    /// Starts every member with a clone of `handler`, one after another.
    ///
    /// Every member is attempted even when earlier ones fail.
    ///
    /// # Errors
    ///
    /// [`Error::Listen`] listing each member that failed.
    pub async fn listen(&self, handler: H) -> Result<()>
    where
        H: Clone,
    {
        if self.servers.is_empty() {
            return Ok(());
        }

        #[cfg(feature = "tracing")]
        tracing::info!("Starting {} server(s)", self.servers.len());

        let mut errors = ListenErrors::new();
        for server in &self.servers {
            if let Err(e) = server.listen(handler.clone()).await {
                #[cfg(feature = "tracing")]
                tracing::error!("Server {} failed to listen: {e}", server.name());
                errors.push(server.bindable(), e);
            }
        }

        #[cfg(feature = "tracing")]
        tracing::info!(
            "Started {} of {} server(s)",
            self.servers.len() - errors.len(),
            self.servers.len()
        );

        errors.into_result()
    }

    /// Restarts every member, bounded by
    /// [`PoolConfig::restart_timeout`].
    pub async fn restart(&self) {
        let _ = self.fan_out(Lifecycle::Restart).await;
    }

    /// Stops every member, bounded by [`PoolConfig::shutdown_timeout`].
    pub async fn shutdown(&self) {
        let _ = self.fan_out(Lifecycle::Shutdown).await;
    }

    /// Dispatches `op` to every member and reports what finished in time.
    ///
    /// This is what [`Pool::restart`] and [`Pool::shutdown`] run; they drop
    /// the report.
    pub async fn fan_out(&self, op: Lifecycle) -> FanOutReport {
        let budget = match op {
            Lifecycle::Restart => self.config.restart_timeout,
            Lifecycle::Shutdown => self.config.shutdown_timeout,
        };
        fanout::fan_out(&self.servers, op, budget, self.config.concurrency).await
    }

    /// Waits for `SIGINT`, `SIGTERM`, `SIGQUIT` or for `token` to be
    /// cancelled, then shuts the pool down once.
    pub async fn wait_notify(&self, token: CancellationToken) -> Notice {
        self.wait_notify_with(os_signal(), token).await
    }

    /// Like [`Pool::wait_notify`] with an arbitrary notification source.
    ///
    /// If `source` fails, only `token` is awaited afterwards.
    pub async fn wait_notify_with<S>(&self, source: S, token: CancellationToken) -> Notice
    where
        S: Future<Output = std::io::Result<Notice>>,
    {
        let notice = tokio::select! {
            res = source => match res {
                Ok(notice) => notice,
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Cannot subscribe to termination signals: {_e}");
                    token.cancelled().await;
                    Notice::Cancelled
                }
            },
            () = token.cancelled() => Notice::Cancelled,
        };

        #[cfg(feature = "tracing")]
        tracing::info!("Received {notice}, shutting down {} server(s)", self.servers.len());

        self.shutdown().await;
        notice
    }
}

impl<'a, H: Send + 'static> IntoIterator for &'a Pool<H> {
    type Item = &'a SharedServer<H>;
    type IntoIter = core::slice::Iter<'a, SharedServer<H>>;

    fn into_iter(self) -> Self::IntoIter {
        self.servers.iter()
    }
}
