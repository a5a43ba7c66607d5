//! PID-targeted signals via `kill(2)`.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::debug;

use super::ConsoleSignal;
use crate::error::Result;

#[allow(clippy::cast_possible_wrap)]
pub(super) fn deliver(pid: u32, signal: ConsoleSignal) -> Result<bool> {
    let target = Pid::from_raw(pid as i32);
    let sig = match signal {
        ConsoleSignal::CtrlC => Signal::SIGINT,
        ConsoleSignal::CtrlBreak => Signal::SIGQUIT,
        ConsoleSignal::Terminate => Signal::SIGTERM,
        ConsoleSignal::Kill => Signal::SIGKILL,
    };
    match kill(target, sig) {
        Ok(()) => Ok(true),
        Err(errno) => {
            debug!("kill({pid}, {sig}) failed: {errno}");
            Ok(false)
        }
    }
}
