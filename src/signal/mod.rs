//! Console-signal delivery to a foreign process.
//!
//! [`deliver`] sends a control signal to a PID for graceful shutdown.
//! On Unix this is a plain PID-targeted `kill(2)`. On Windows console
//! control events fan out to every process attached to the same console,
//! so targeting one PID means generating the event for the whole group
//! while a temporarily-registered local handler masks it for ourselves;
//! see the platform module for the protocol.
//!
//! The returned boolean reports apparent success; delivery failures never
//! surface as errors.

#[cfg(unix)]
mod unix;
#[cfg(windows)]
pub(crate) mod windows;

use crate::error::Result;

/// A console control signal.
///
/// [`ConsoleSignal::CtrlC`] is supported on every platform; the others are
/// best-effort and OS-specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleSignal {
    /// Interrupt (SIGINT / CTRL_C_EVENT).
    CtrlC,
    /// Break (SIGQUIT / CTRL_BREAK_EVENT).
    CtrlBreak,
    /// Termination request (SIGTERM; forceful termination on Windows).
    Terminate,
    /// Unconditional kill (SIGKILL; forceful termination on Windows).
    Kill,
}

/// Deliver `signal` to `pid`. Returns whether delivery appeared to
/// succeed; a dead or unreachable target yields `Ok(false)`.
pub async fn deliver(pid: u32, signal: ConsoleSignal) -> Result<bool> {
    #[cfg(unix)]
    {
        unix::deliver(pid, signal)
    }
    #[cfg(windows)]
    {
        windows::deliver(pid, signal).await
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (pid, signal);
        Err(crate::error::Error::PlatformNotSupported("console signals"))
    }
}
