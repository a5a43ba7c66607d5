//! Spawning and lifecycle of a directly-launched child process.
//!
//! The lifecycle task is spawned eagerly at construction so a command
//! makes progress without being polled: it races child exit against the
//! configured timeout and cancellation token (killing the child when
//! either fires), captures the exit code *before* releasing the OS
//! handle, joins the stdout/stderr drain tasks, and only then settles the
//! command's outcome.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Command, CommandKind, OutputCapture, StdinSlot};
use crate::error::{Error, Result};
use crate::shell::Options;
use crate::stdio::{InputWriter, OutputReader};
use crate::syntax::ArgumentSyntax;

/// Live handle to a spawned process.
pub(crate) struct ProcessHandle {
    pid: std::result::Result<u32, Error>,
    /// Set by the lifecycle task once the exit code is captured; disarms
    /// [`ProcessHandle::kill`] so a recycled pid is never signaled.
    exited: Arc<AtomicBool>,
    completion: Option<JoinHandle<Result<i32>>>,
}

impl ProcessHandle {
    pub(crate) fn pid(&self) -> Result<u32> {
        self.pid.clone()
    }

    pub(crate) async fn wait(&mut self) -> Result<i32> {
        match self.completion.take() {
            Some(task) => match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(Error::Io(format!("lifecycle task failed: {e}"))),
            },
            None => Err(Error::Io("completion already consumed".into())),
        }
    }

    /// Best-effort terminate; safe to call repeatedly and after exit.
    pub(crate) fn kill(&self) {
        if self.exited.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(pid) = &self.pid {
            kill_pid(*pid);
        }
    }
}

/// SIGKILL / TerminateProcess by pid, errors ignored.
pub(crate) fn kill_pid(pid: u32) {
    #[cfg(unix)]
    {
        #[allow(clippy::cast_possible_wrap)]
        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }
    }
    #[cfg(windows)]
    {
        crate::signal::windows::terminate(pid);
    }
}

/// Launch `program` with `args` under the resolved options.
pub(crate) fn spawn(program: &str, args: &[String], options: &mut Options) -> Result<Command> {
    if program.is_empty() {
        return Err(Error::InvalidArgument("program name is empty".into()));
    }
    if options.timeout == Some(Duration::ZERO) {
        return Err(Error::InvalidArgument("timeout must be positive".into()));
    }

    let mut cmd = tokio::process::Command::new(program);
    apply_arguments(&mut cmd, args, options.syntax);
    for mutate in &mut options.start_mutators {
        mutate(&mut cmd);
    }
    cmd.stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(options.dispose_on_exit);
    #[cfg(windows)]
    cmd.creation_flags(winapi::um::winbase::CREATE_NO_WINDOW);

    let mut child = cmd.spawn().map_err(|e| Error::io(&e))?;
    let pid = child
        .id()
        .ok_or_else(|| Error::ProcessIdUnavailable("not reported at start".into()));

    // Stdio is taken before the lifecycle task can observe exit.
    let stdin = child
        .stdin
        .take()
        .map(InputWriter::new)
        .map_or(StdinSlot::Absent, StdinSlot::Present);
    let (stdout, stdout_drain) = match child.stdout.take() {
        Some(os) => {
            let (reader, drain) = OutputReader::spawn(os, options.encoding);
            (OutputCapture::present(reader), Some(drain))
        }
        None => (OutputCapture::absent(), None),
    };
    let (stderr, stderr_drain) = match child.stderr.take() {
        Some(os) => {
            let (reader, drain) = OutputReader::spawn(os, options.encoding);
            (OutputCapture::present(reader), Some(drain))
        }
        None => (OutputCapture::absent(), None),
    };

    let exited = Arc::new(AtomicBool::new(false));
    // Timeout and cancellation attach only now that the child is running;
    // arming them earlier could kill a process that never started.
    let completion = tokio::spawn(lifecycle(
        child,
        stdout_drain.into_iter().chain(stderr_drain).collect(),
        options.timeout,
        options.cancellation.clone().unwrap_or_default(),
        options.throw_on_error,
        Arc::clone(&exited),
    ));

    Ok(Command {
        kind: CommandKind::Process(ProcessHandle {
            pid,
            exited,
            completion: Some(completion),
        }),
        stdin,
        stdout: Arc::new(stdout),
        stderr: Arc::new(stderr),
        io_tasks: Vec::new(),
        outcome: None,
    })
}

fn apply_arguments(cmd: &mut tokio::process::Command, args: &[String], syntax: ArgumentSyntax) {
    #[cfg(windows)]
    {
        if syntax == ArgumentSyntax::Windows {
            use std::os::windows::process::CommandExt;
            cmd.as_std_mut().raw_arg(crate::syntax::join(args));
            return;
        }
    }
    let _ = syntax;
    cmd.args(args);
}

async fn lifecycle(
    mut child: Child,
    drains: Vec<JoinHandle<Result<()>>>,
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
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            () = &mut interrupt_timer, if interrupted.is_none() => {
                interrupted = Some(Error::Timeout);
                if let Err(e) = child.start_kill() {
                    debug!("kill after timeout failed: {e}");
                }
            }
            () = ct.cancelled(), if interrupted.is_none() => {
                interrupted = Some(Error::Cancelled);
                if let Err(e) = child.start_kill() {
                    debug!("kill after cancellation failed: {e}");
                }
            }
        }
    };

    // Exit code first, handle release second.
    let code = match &status {
        Ok(status) => status.code().unwrap_or(-1),
        Err(_) => -1,
    };
    exited.store(true, Ordering::SeqCst);
    drop(child);
    debug!("process exited with code {code}");

    let mut drain_error: Option<Error> = None;
    for drain in drains {
        match drain.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                drain_error.get_or_insert(e);
            }
            Err(e) => {
                drain_error.get_or_insert(Error::Io(format!("drain task failed: {e}")));
            }
        }
    }

    if let Some(e) = interrupted {
        return Err(e);
    }
    if let Err(e) = status {
        return Err(Error::io(&e));
    }
    if throw_on_error && code != 0 {
        return Err(Error::ErrorExitCode(code));
    }
    if let Some(e) = drain_error {
        return Err(e);
    }
    Ok(code)
}
