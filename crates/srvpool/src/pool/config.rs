use core::time::Duration;

/// Time budget for [`Pool::restart`](crate::Pool::restart).
pub const DEFAULT_RESTART_TIMEOUT: Duration = Duration::from_secs(30);

/// Time budget for [`Pool::shutdown`](crate::Pool::shutdown).
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Tuning for the pool's group operations.
///
/// The timeouts are hard ceilings: a fan-out returns once its budget is spent
/// even if some members are still working.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    pub restart_timeout: Duration,
    pub shutdown_timeout: Duration,
    /// Maximum members restarted or stopped at once. `0` means one per CPU.
    pub concurrency: usize,
}

impl PoolConfig {
    pub const fn new() -> Self {
        Self {
            restart_timeout: DEFAULT_RESTART_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            concurrency: 0,
        }
    }

    pub const fn with_restart_timeout(mut self, timeout: Duration) -> Self {
        self.restart_timeout = timeout;
        self
    }

    pub const fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub const fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}
