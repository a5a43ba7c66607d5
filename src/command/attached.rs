//! Attaching to a process this library did not spawn.
//!
//! An attached command offers the same lifecycle surface as a spawned one
//! (wait, kill, timeout, cancellation, signals) but no stdio: the target's
//! streams belong to whoever started it. Exit is observed by a monitor
//! task; on Unix a foreign pid cannot be reaped, so liveness is polled and
//! the exit code reported as `-1`, while Windows holds a process handle
//! that keeps the real code readable after exit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::process::kill_pid;
use super::{Command, CommandKind, OutputCapture, StdinSlot};
use crate::error::{Error, Result};
use crate::shell::Options;

/// Liveness poll cadence for the monitor task.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Live handle to an attached (foreign) process.
pub(crate) struct AttachedHandle {
    pid: u32,
    exited: Arc<AtomicBool>,
    completion: Option<JoinHandle<Result<i32>>>,
}

impl AttachedHandle {
    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) async fn wait(&mut self) -> Result<i32> {
        match self.completion.take() {
            Some(task) => match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(Error::Io(format!("monitor task failed: {e}"))),
            },
            None => Err(Error::Io("completion already consumed".into())),
        }
    }

    pub(crate) fn kill(&self) {
        if self.exited.load(Ordering::SeqCst) {
            return;
        }
        kill_pid(self.pid);
    }
}

/// Attach to `pid`. `Ok(None)` when the process is gone or the pid is
/// invalid — a soft failure, distinct from misconfigured options.
pub(crate) fn try_attach(pid: u32, options: &Options) -> Result<Option<Command>> {
    if options.spawn_only_configured() {
        return Err(Error::InvalidAttachOptions);
    }
    let Some(watch) = sys::Watch::open(pid) else {
        return Ok(None);
    };
    if watch.exit_code().is_some() {
        return Ok(None);
    }

    let exited = Arc::new(AtomicBool::new(false));
    let completion = tokio::spawn(monitor(
        watch,
        pid,
        options.timeout,
        options.cancellation.clone().unwrap_or_default(),
        options.throw_on_error,
        Arc::clone(&exited),
    ));

    Ok(Some(Command {
        kind: CommandKind::Attached(AttachedHandle {
            pid,
            exited,
            completion: Some(completion),
        }),
        stdin: StdinSlot::Absent,
        stdout: Arc::new(OutputCapture::absent()),
        stderr: Arc::new(OutputCapture::absent()),
        io_tasks: Vec::new(),
        outcome: None,
    }))
}

async fn monitor(
    watch: sys::Watch,
    pid: u32,
    timeout: Option<Duration>,
    ct: CancellationToken,
    throw_on_error: bool,
    exited: Arc<AtomicBool>,
) -> Result<i32> {
    let interrupt_timer = async {
        match timeout {
            Some(after) => tokio::time::sleep(after).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(interrupt_timer);

    let mut interrupted: Option<Error> = None;
    let code = loop {
        // Exit check first: catches a process that died between attach
        // and the monitor's first poll.
        if let Some(code) = watch.exit_code() {
            break code;
        }
        tokio::select! {
            () = tokio::time::sleep(POLL_INTERVAL) => {}
            () = &mut interrupt_timer, if interrupted.is_none() => {
                interrupted = Some(Error::Timeout);
                kill_pid(pid);
            }
            () = ct.cancelled(), if interrupted.is_none() => {
                interrupted = Some(Error::Cancelled);
                kill_pid(pid);
            }
        }
    };
    exited.store(true, Ordering::SeqCst);

    if let Some(e) = interrupted {
        return Err(e);
    }
    if throw_on_error && code != 0 {
        return Err(Error::ErrorExitCode(code));
    }
    Ok(code)
}

#[cfg(unix)]
mod sys {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    /// Poll-based liveness watch over a foreign pid.
    pub(super) struct Watch {
        pid: Pid,
    }

    impl Watch {
        pub(super) fn open(pid: u32) -> Option<Self> {
            #[allow(clippy::cast_possible_wrap)]
            let pid = Pid::from_raw(pid as i32);
            if pid.as_raw() <= 0 {
                return None;
            }
            alive(pid).then_some(Self { pid })
        }

        /// `None` while running. A foreign pid cannot be reaped, so the
        /// code itself is unknowable; `-1` is the crate-wide sentinel.
        pub(super) fn exit_code(&self) -> Option<i32> {
            if alive(self.pid) {
                None
            } else {
                Some(-1)
            }
        }
    }

    fn alive(pid: Pid) -> bool {
        match kill(pid, None) {
            Ok(()) => true,
            // Exists but belongs to someone we may not signal.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

#[cfg(windows)]
mod sys {
    use winapi::shared::minwindef::{DWORD, FALSE};
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::{GetExitCodeProcess, OpenProcess};
    use winapi::um::winbase::STILL_ACTIVE;
    use winapi::um::winnt::{HANDLE, PROCESS_QUERY_LIMITED_INFORMATION, SYNCHRONIZE};

    /// Process handle kept open so the exit code stays readable after the
    /// target exits.
    pub(super) struct Watch {
        handle: HANDLE,
    }

    // HANDLE is a kernel object reference, not a pointer into our memory.
    unsafe impl Send for Watch {}

    impl Watch {
        pub(super) fn open(pid: u32) -> Option<Self> {
            let handle =
                unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION | SYNCHRONIZE, FALSE, pid) };
            if handle.is_null() {
                None
            } else {
                Some(Self { handle })
            }
        }

        pub(super) fn exit_code(&self) -> Option<i32> {
            let mut code: DWORD = 0;
            let ok = unsafe { GetExitCodeProcess(self.handle, &mut code) };
            if ok == 0 || code == STILL_ACTIVE {
                None
            } else {
                #[allow(clippy::cast_possible_wrap)]
                Some(code as i32)
            }
        }
    }

    impl Drop for Watch {
        fn drop(&mut self) {
            unsafe {
                CloseHandle(self.handle);
            }
        }
    }
}
