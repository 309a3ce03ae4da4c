//! Weighted concurrency limiter bound to a cancellation token.
//!
//! A [`Limiter`] bounds how many units of work may run at once. Each unit
//! holds a [`LimiterPermit`] which returns its capacity when dropped, so the
//! release happens on every exit path of the worker, panics included.
//!
//! The limiter is also a join barrier: [`Limiter::wait_all`] reacquires the
//! *entire* capacity at once and therefore only succeeds after every
//! outstanding permit has been dropped.
//!
//! Waiting is bounded by the limiter's [`CancellationToken`] and an optional
//! deadline. Once either fires, blocked and future waits fail with
//! [`Error::Cancelled`] or [`Error::DeadlineExceeded`]. Dropping the limiter
//! cancels its token.

use crate::{Error, Result};
use core::time::Duration;
use std::sync::Arc;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;

/// Number of units used when a limiter is created with a capacity of `0`.
///
/// Matches the number of logical CPUs available to the process.
pub fn default_capacity() -> usize {
    num_cpus::get().max(1)
}

/// A counting semaphore with context-scoped cancellation.
pub struct Limiter {
    capacity: u32,
    semaphore: Arc<Semaphore>,
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Limiter {
    /// Creates a limiter with its own root cancellation token.
    ///
    /// A `capacity` of `0` is normalized to [`default_capacity`].
    pub fn new(capacity: usize) -> Self {
        Self::from_token(CancellationToken::new(), capacity)
    }

    /// Creates a limiter whose token is a child of `parent`.
    ///
    /// Cancelling `parent` cancels the limiter; cancelling (or dropping) the
    /// limiter never affects `parent`.
    pub fn with_cancellation(parent: &CancellationToken, capacity: usize) -> Self {
        Self::from_token(parent.child_token(), capacity)
    }

    fn from_token(token: CancellationToken, capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            default_capacity()
        } else {
            capacity
        };
        let capacity = capacity.min(Semaphore::MAX_PERMITS).min(u32::MAX as usize) as u32;

        Self {
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity as usize)),
            token,
            deadline: None,
        }
    }

    /// Bounds every wait by `timeout`, measured from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Bounds every wait by an absolute `deadline`.
    pub const fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Total capacity in units.
    pub const fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Units currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Units currently held by outstanding permits.
    pub fn in_use(&self) -> usize {
        self.capacity().saturating_sub(self.available())
    }

    /// Point after which waits fail with [`Error::DeadlineExceeded`], if set.
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The token bounding this limiter's waits.
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Returns `true` once the token is cancelled or the deadline has passed.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Cancels the limiter. Blocked waits fail with [`Error::Cancelled`].
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Waits for one unit of capacity.
    ///
    /// # Errors
    ///
    /// - [`Error::Cancelled`] if the token is or becomes cancelled.
    /// - [`Error::DeadlineExceeded`] if the deadline passes first.
    /// - [`Error::Closed`] if the semaphore was closed.
    pub async fn acquire(&self) -> Result<LimiterPermit> {
        self.acquire_many(1).await
    }

    /// Takes one unit of capacity without waiting.
    ///
    /// Returns `None` when the limiter is full or already cancelled.
    pub fn try_acquire(&self) -> Option<LimiterPermit> {
        if self.is_cancelled() {
            return None;
        }
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(LimiterPermit::new)
    }

    /// Waits until the whole capacity can be taken at once, i.e. until every
    /// outstanding permit has been released.
    ///
    /// The returned permit holds the full capacity until it is dropped.
    ///
    /// # Errors
    ///
    /// Same as [`Limiter::acquire`].
    pub async fn wait_all(&self) -> Result<LimiterPermit> {
        self.acquire_many(self.capacity).await
    }

    async fn acquire_many(&self, units: u32) -> Result<LimiterPermit> {
        let expired = async {
            match self.deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => core::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(Error::Cancelled),
            () = expired => Err(Error::DeadlineExceeded),
            permit = Arc::clone(&self.semaphore).acquire_many_owned(units) => {
                permit.map(LimiterPermit::new).map_err(|_| Error::Closed)
            }
        }
    }
}

impl Drop for Limiter {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl core::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Limiter")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .field("cancelled", &self.token.is_cancelled())
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// Capacity held by a worker. Released when dropped.
#[derive(Debug)]
#[must_use = "capacity is released as soon as the permit is dropped"]
pub struct LimiterPermit {
    inner: OwnedSemaphorePermit,
}

impl LimiterPermit {
    const fn new(inner: OwnedSemaphorePermit) -> Self {
        Self { inner }
    }

    /// Number of units this permit holds.
    pub fn units(&self) -> usize {
        self.inner.num_permits()
    }

    /// Releases the capacity now. Equivalent to dropping the permit.
    pub fn release(self) {
        drop(self);
    }
}
