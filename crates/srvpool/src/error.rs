//! Error types for the server pool and its limiter.
//!
//! This module defines the central [`Error`] enum, which captures every
//! reportable failure of the crate. Only a few operations surface errors to
//! callers:
//!
//! - [`Limiter::acquire`](crate::Limiter::acquire) and
//!   [`Limiter::wait_all`](crate::Limiter::wait_all) fail with `Cancelled`,
//!   `DeadlineExceeded` or `Closed`.
//! - [`Pool::add`](crate::Pool::add) rejects entries with `InvalidBindAddress`.
//! - [`Pool::listen`](crate::Pool::listen) aggregates per-server failures into
//!   a single `Listen` error.
//!
//! `Bind`, `Io` and `NotRunning` are provided for [`Server`](crate::Server)
//! implementations so that their failures compose with the pool's.

use core::fmt;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the server pool.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The limiter's cancellation token fired before capacity was available.
    #[error("limiter cancelled")]
    Cancelled,

    /// The limiter's deadline passed before capacity was available.
    #[error("limiter deadline exceeded")]
    DeadlineExceeded,

    /// The limiter's underlying semaphore was closed.
    #[error("limiter closed")]
    Closed,

    /// A server with an empty (or otherwise unusable) bind address was
    /// offered to the pool.
    #[error("invalid bind address: {0:?}")]
    InvalidBindAddress(String),

    /// A server could not bind its listener.
    #[error("cannot bind {bind}: {source}")]
    Bind {
        bind: String,
        #[source]
        source: std::io::Error,
    },

    /// A server was asked for its health while stopped.
    #[error("server {bind} is not running")]
    NotRunning { bind: String },

    /// Generic I/O failure inside a server implementation.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// One or more members of the pool failed to start listening.
    #[error("{0}")]
    Listen(ListenErrors),
}

impl Error {
    /// Returns `true` for the limiter outcomes that mean "the budget is gone"
    /// rather than a fault.
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded | Self::Closed)
    }
}

/// Per-server failures collected by [`Pool::listen`](crate::Pool::listen).
///
/// Entries are kept in pool order, keyed by bind address.
#[derive(Debug, Default)]
pub struct ListenErrors {
    failures: Vec<(String, Error)>,
}

impl ListenErrors {
    pub const fn new() -> Self {
        Self {
            failures: Vec::new(),
        }
    }

    pub fn push(&mut self, bind: impl Into<String>, err: Error) {
        self.failures.push((bind.into(), err));
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Bind addresses of the failing servers, in pool order.
    pub fn binds(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|(bind, _)| bind.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Error)> {
        self.failures.iter().map(|(bind, err)| (bind.as_str(), err))
    }

    /// Converts into `Ok(())` when nothing failed.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Listen(self))
        }
    }
}

impl fmt::Display for ListenErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to listen on {} server(s)", self.failures.len())?;
        for (i, (bind, err)) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}[{bind}] {err}")?;
        }
        Ok(())
    }
}
