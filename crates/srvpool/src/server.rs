//! The contract every pooled server implements.
//!
//! The pool never touches sockets itself. It only calls the lifecycle methods
//! of [`Server`] and reads the three identifying fields described by
//! [`FieldKind`]. Variants such as plain or TLS listeners are simply
//! different types implementing the same trait.

use crate::Result;
use async_trait::async_trait;
use core::{fmt, str::FromStr};
use std::sync::Arc;

/// A server held by a [`Pool`](crate::Pool), shared with fan-out tasks.
pub type SharedServer<H> = Arc<dyn Server<H>>;

/// A network server that can be started, restarted and stopped by the pool.
///
/// `H` is the handler passed to [`Server::listen`]; the pool clones it once
/// per member.
#[async_trait]
pub trait Server<H: Send + 'static>: Send + Sync {
    /// Bind address (`host:port`). This is the server's identity in the pool
    /// and must be stable for the server's lifetime.
    fn bindable(&self) -> String;

    /// Externally advertised address. May differ from the bind address.
    fn expose(&self) -> String;

    /// Human-readable label.
    fn name(&self) -> String;

    fn is_running(&self) -> bool;

    /// Starts serving with `handler`.
    async fn listen(&self, handler: H) -> Result<()>;

    /// Stops (if running) and starts again. Failures are handled by the
    /// server itself.
    async fn restart(&self);

    /// Best-effort stop. Must not block indefinitely.
    async fn shutdown(&self);

    /// Folds the configuration of `other` into `self`.
    ///
    /// Returns `true` when the merge happened in place. On `false` the pool
    /// replaces `self` with `other`.
    fn merge(&self, other: &dyn Server<H>) -> bool;
}

/// Attribute of a server used to filter or project pool members.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum FieldKind {
    #[default]
    Name,
    BindAddress,
    ExposedAddress,
}

impl FieldKind {
    pub const ALL: [Self; 3] = [Self::Name, Self::BindAddress, Self::ExposedAddress];

    /// Reads this field from `server`.
    pub fn value_of<H: Send + 'static>(self, server: &dyn Server<H>) -> String {
        match self {
            Self::Name => server.name(),
            Self::BindAddress => server.bindable(),
            Self::ExposedAddress => server.expose(),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::BindAddress => "bind",
            Self::ExposedAddress => "expose",
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown [`FieldKind`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown field {0:?} (expected one of: name, bind, expose)")]
pub struct ParseFieldKindError(String);

impl FromStr for FieldKind {
    type Err = ParseFieldKindError;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "name" => Ok(Self::Name),
            "bind" | "bindable" | "bind_address" => Ok(Self::BindAddress),
            "expose" | "exposed" | "exposed_address" => Ok(Self::ExposedAddress),
            _ => Err(ParseFieldKindError(s.to_string())),
        }
    }
}
