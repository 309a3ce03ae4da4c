//! Bounded, time-limited dispatch of a lifecycle operation to every member.

use crate::{Limiter, SharedServer};
use core::{fmt, time::Duration};
use portable_atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Group operation dispatched by [`Pool::fan_out`](crate::Pool::fan_out).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    Restart,
    Shutdown,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Restart => "restart",
            Self::Shutdown => "shutdown",
        })
    }
}

/// Outcome of one fan-out, as observed when the pool call returned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FanOutReport {
    /// Members in the pool.
    pub members: usize,
    /// Members whose operation was started before the budget ran out.
    pub dispatched: usize,
    /// Members whose operation finished before the pool call returned.
    pub completed: usize,
}

impl FanOutReport {
    /// Members never started or still running past the budget.
    pub const fn abandoned(&self) -> usize {
        self.members.saturating_sub(self.completed)
    }

    pub const fn is_complete(&self) -> bool {
        self.completed == self.members
    }
}

/// Runs `op` on every server, at most `concurrency` at a time, and returns
/// once all of them are done or `budget` has elapsed.
///
/// Operations still running when the budget expires are left detached.
pub(crate) async fn fan_out<H>(
    servers: &[SharedServer<H>],
    op: Lifecycle,
    budget: Duration,
    concurrency: usize,
) -> FanOutReport
where
    H: Send + 'static,
{
    let mut report = FanOutReport {
        members: servers.len(),
        ..FanOutReport::default()
    };
    if servers.is_empty() {
        return report;
    }

    let limiter = Limiter::new(concurrency).with_timeout(budget);
    let completed = Arc::new(AtomicUsize::new(0));

    #[cfg(feature = "tracing")]
    tracing::debug!(
        "Dispatching {op} to {} server(s) (concurrency {}, budget {budget:?})",
        servers.len(),
        limiter.capacity()
    );

    for server in servers {
        let permit = match limiter.acquire().await {
            Ok(permit) => permit,
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "Stopped dispatching {op}: {_e} ({} server(s) not started)",
                    servers.len() - report.dispatched
                );
                break;
            }
        };

        let server = Arc::clone(server);
        let completed = Arc::clone(&completed);
        tokio::spawn(async move {
            let _permit = permit;
            match op {
                Lifecycle::Restart => server.restart().await,
                Lifecycle::Shutdown => server.shutdown().await,
            }
            completed.fetch_add(1, Ordering::AcqRel);
        });
        report.dispatched += 1;
    }

    match limiter.wait_all().await {
        Ok(_all) => {
            #[cfg(feature = "tracing")]
            tracing::debug!("All {op} tasks finished");
        }
        Err(_e) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                "Abandoning {} {op} task(s): {_e}",
                report.dispatched - completed.load(Ordering::Acquire).min(report.dispatched)
            );
        }
    }
    limiter.cancel();

    report.completed = completed.load(Ordering::Acquire);
    report
}
