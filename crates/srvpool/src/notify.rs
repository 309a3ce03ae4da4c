//! Termination notifications.
//!
//! [`Pool::wait_notify_with`](crate::Pool::wait_notify_with) accepts any
//! future resolving to a [`Notice`]; [`os_signal`] is the production source
//! wired to process signals.

use core::fmt;

/// What woke a waiting pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Notice {
    /// `SIGINT` (or Ctrl-C on non-unix hosts).
    Interrupt,
    /// `SIGTERM`.
    Terminate,
    /// `SIGQUIT`.
    Quit,
    /// The caller's cancellation token fired.
    Cancelled,
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
            Self::Quit => "SIGQUIT",
            Self::Cancelled => "cancelled",
        })
    }
}

/// Waits for the first of `SIGINT`, `SIGTERM` or `SIGQUIT`.
///
/// All three handlers are registered before waiting and the streams are
/// dropped on return.
///
/// # Errors
///
/// Returns the I/O error raised while registering a handler.
#[cfg(unix)]
pub async fn os_signal() -> std::io::Result<Notice> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    let notice = tokio::select! {
        _ = interrupt.recv() => Notice::Interrupt,
        _ = terminate.recv() => Notice::Terminate,
        _ = quit.recv() => Notice::Quit,
    };
    Ok(notice)
}

/// Waits for Ctrl-C.
///
/// # Errors
///
/// Returns the I/O error raised while registering the handler.
#[cfg(not(unix))]
pub async fn os_signal() -> std::io::Result<Notice> {
    tokio::signal::ctrl_c().await?;
    Ok(Notice::Interrupt)
}
