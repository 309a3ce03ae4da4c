#![doc = include_str!("../README.md")]

mod error;
mod limiter;
mod notify;
mod pool;
mod server;

pub use crate::error::*;
pub use crate::limiter::*;
pub use crate::notify::*;
pub use crate::pool::*;
pub use crate::server::*;
// Public re-export so servers and callers share the same token type.
pub use tokio_util::sync::CancellationToken;
