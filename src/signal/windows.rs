//! Console control events with local masking.
//!
//! `GenerateConsoleCtrlEvent` delivers to every process on the console, so
//! a targeted send works like this, serialized by a process-wide mutex
//! (the handler list is global state):
//!
//! 1. register an ignoring ctrl handler that records having seen the event;
//! 2. generate the event for the console group;
//! 3. wait (bounded at 30 s) until our own handler observes it;
//! 4. deregister the handler.
//!
//! The handler swallows the event for this process unless the target *is*
//! this process. A target on a different console cannot be reached this
//! way and reports `Ok(false)`; `Terminate`/`Kill` fall back to
//! `TerminateProcess`.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;
use winapi::shared::minwindef::{BOOL, DWORD, FALSE, TRUE};
use winapi::um::consoleapi::SetConsoleCtrlHandler;
use winapi::um::handleapi::CloseHandle;
use winapi::um::processthreadsapi::{GetCurrentProcessId, OpenProcess, TerminateProcess};
use winapi::um::wincon::{
    GenerateConsoleCtrlEvent, GetConsoleProcessList, CTRL_BREAK_EVENT, CTRL_C_EVENT,
};
use winapi::um::winnt::PROCESS_TERMINATE;

use super::ConsoleSignal;
use crate::error::Result;

/// Serializes every same-console delivery: the ctrl-handler list is
/// process-wide state.
static DELIVERY: Mutex<()> = Mutex::const_new(());

/// Event type the in-flight delivery is waiting to observe.
static EXPECTED: AtomicU32 = AtomicU32::new(u32::MAX);
/// Whether the handler should swallow the event for this process.
static SWALLOW: AtomicBool = AtomicBool::new(false);
/// Set by the handler once it sees the expected event.
static OBSERVED: AtomicBool = AtomicBool::new(false);

/// How long to wait for our own handler to observe the generated event.
const OBSERVATION_TIMEOUT: Duration = Duration::from_secs(30);

unsafe extern "system" fn ctrl_handler(ctrl_type: DWORD) -> BOOL {
    if ctrl_type == EXPECTED.load(Ordering::SeqCst) {
        OBSERVED.store(true, Ordering::SeqCst);
        if SWALLOW.load(Ordering::SeqCst) {
            return TRUE;
        }
    }
    FALSE
}

pub(super) async fn deliver(pid: u32, signal: ConsoleSignal) -> Result<bool> {
    let event = match signal {
        ConsoleSignal::CtrlC => CTRL_C_EVENT,
        ConsoleSignal::CtrlBreak => CTRL_BREAK_EVENT,
        ConsoleSignal::Terminate | ConsoleSignal::Kill => return Ok(terminate(pid)),
    };

    if !shares_our_console(pid) {
        // Reaching a foreign console would require a helper process
        // attached to it; report the miss instead.
        debug!("pid {pid} is not attached to this console");
        return Ok(false);
    }

    let _lock = DELIVERY.lock().await;
    EXPECTED.store(event, Ordering::SeqCst);
    SWALLOW.store(pid != unsafe { GetCurrentProcessId() }, Ordering::SeqCst);
    OBSERVED.store(false, Ordering::SeqCst);

    if unsafe { SetConsoleCtrlHandler(Some(ctrl_handler), TRUE) } == 0 {
        debug!("SetConsoleCtrlHandler failed: {}", std::io::Error::last_os_error());
        return Ok(false);
    }
    let generated = unsafe { GenerateConsoleCtrlEvent(event, 0) } != 0;

    let mut observed = false;
    if generated {
        let deadline = tokio::time::Instant::now() + OBSERVATION_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            if OBSERVED.load(Ordering::SeqCst) {
                observed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    unsafe {
        SetConsoleCtrlHandler(Some(ctrl_handler), FALSE);
    }
    EXPECTED.store(u32::MAX, Ordering::SeqCst);
    Ok(generated && observed)
}

/// Whether `pid` is attached to the same console as this process.
fn shares_our_console(pid: u32) -> bool {
    let mut pids = vec![0u32; 64];
    loop {
        #[allow(clippy::cast_possible_truncation)]
        let n = unsafe { GetConsoleProcessList(pids.as_mut_ptr(), pids.len() as DWORD) } as usize;
        if n == 0 {
            return false;
        }
        if n <= pids.len() {
            return pids[..n].contains(&pid);
        }
        pids.resize(n, 0);
    }
}

/// Forceful termination fallback for non-console signals.
pub(crate) fn terminate(pid: u32) -> bool {
    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, FALSE, pid);
        if handle.is_null() {
            return false;
        }
        let ok = TerminateProcess(handle, 1) != 0;
        CloseHandle(handle);
        ok
    }
}
