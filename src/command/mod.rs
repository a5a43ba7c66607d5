//! Command handles: the public surface over running processes.
//!
//! A [`Command`] represents one spawned process, an attached foreign
//! process, or a `a | b` chain. Whatever the shape, the contract is the
//! same:
//!
//! - [`Command::wait`] resolves exactly once, and only after the process
//!   has exited *and* every attached I/O task (stdout/stderr drains,
//!   redirection copies, chain copies) has finished. Later calls return
//!   the cached outcome.
//! - stream accessors are one-shot: taking a stream, redirecting it, or
//!   piping it claims the slot, and later access fails with
//!   [`Error::StreamClaimed`].
//! - [`Command::kill`] is best-effort, idempotent, and never fails.
//!
//! Chains and redirections own their inner commands outright (a tree, no
//! back references), so teardown is plain drop order.

mod attached;
mod io;
mod piped;
mod process;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub(crate) use attached::try_attach;
pub(crate) use process::spawn;

use crate::error::{Error, Result};
use crate::signal::ConsoleSignal;
use crate::stdio::{InputWriter, OutputReader};

/// Which output stream a merged line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    Stdout,
    Stderr,
}

impl OutputSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

enum OutputSlot {
    /// The stream was never piped (attached commands).
    Absent,
    Present(OutputReader),
    Claimed,
}

/// One captured output stream, shared between a command and its results.
///
/// The reader lives in the slot until something claims it; the first
/// [`OutputCapture::text`] call drains it into the cell, and every handle
/// sharing this capture observes the same snapshot afterwards.
pub(crate) struct OutputCapture {
    slot: Mutex<OutputSlot>,
    cell: OnceCell<String>,
}

impl OutputCapture {
    fn present(reader: OutputReader) -> Self {
        Self {
            slot: Mutex::new(OutputSlot::Present(reader)),
            cell: OnceCell::new(),
        }
    }

    fn absent() -> Self {
        Self {
            slot: Mutex::new(OutputSlot::Absent),
            cell: OnceCell::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, OutputSlot> {
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn take(&self) -> Result<OutputReader> {
        let mut slot = self.lock();
        match std::mem::replace(&mut *slot, OutputSlot::Claimed) {
            OutputSlot::Present(reader) => Ok(reader),
            OutputSlot::Claimed => Err(Error::StreamClaimed),
            OutputSlot::Absent => {
                *slot = OutputSlot::Absent;
                Err(Error::StreamNotRedirected)
            }
        }
    }

    fn restore(&self, reader: OutputReader) {
        *self.lock() = OutputSlot::Present(reader);
    }

    async fn text(&self) -> Result<&str> {
        self.cell
            .get_or_try_init(|| async {
                let mut reader = self.take()?;
                reader.read_to_string().await
            })
            .await
            .map(String::as_str)
    }
}

enum StdinSlot {
    Absent,
    Present(InputWriter),
    Claimed,
}

enum CommandKind {
    Process(process::ProcessHandle),
    Attached(attached::AttachedHandle),
    Piped {
        upstream: Box<Command>,
        downstream: Box<Command>,
        copy: Option<JoinHandle<Result<()>>>,
    },
}

/// Handle to a running (or attached) process, chain, or redirected
/// command. Created by [`Shell::run`] / [`Shell::try_attach`].
///
/// [`Shell::run`]: crate::shell::Shell::run
/// [`Shell::try_attach`]: crate::shell::Shell::try_attach
impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command").finish_non_exhaustive()
    }
}

pub struct Command {
    kind: CommandKind,
    stdin: StdinSlot,
    stdout: Arc<OutputCapture>,
    stderr: Arc<OutputCapture>,
    /// Redirection copy tasks; awaited before the outcome settles.
    io_tasks: Vec<JoinHandle<Result<()>>>,
    outcome: Option<Result<CommandResult>>,
}

impl Command {
    /// The primary process id — the leftmost process of a chain.
    ///
    /// Captured at spawn time; if the platform refused to report it, the
    /// captured failure is returned here.
    pub fn pid(&self) -> Result<u32> {
        match &self.kind {
            CommandKind::Process(handle) => handle.pid(),
            CommandKind::Attached(handle) => Ok(handle.pid()),
            CommandKind::Piped { upstream, .. } => upstream.pid(),
        }
    }

    /// Every known process id in the chain, upstream first.
    pub fn pids(&self) -> Vec<u32> {
        match &self.kind {
            CommandKind::Process(handle) => handle.pid().ok().into_iter().collect(),
            CommandKind::Attached(handle) => vec![handle.pid()],
            CommandKind::Piped {
                upstream,
                downstream,
                ..
            } => {
                let mut pids = upstream.pids();
                pids.extend(downstream.pids());
                pids
            }
        }
    }

    /// Take the stdin writer. One-shot: later calls (and the stdin text on
    /// any result) fail with [`Error::StreamClaimed`].
    pub fn stdin(&mut self) -> Result<InputWriter> {
        self.claim_stdin()
    }

    /// Take the stdout reader. One-shot; the result's
    /// [`CommandResult::stdout`] reports the stream as claimed afterwards.
    pub fn stdout(&mut self) -> Result<OutputReader> {
        self.claim_stdout()
    }

    /// Take the stderr reader. One-shot, like [`Command::stdout`].
    pub fn stderr(&mut self) -> Result<OutputReader> {
        self.claim_stderr()
    }

    /// Wait for the process (or chain) to exit and all attached I/O to
    /// drain. Resolves exactly once; repeated calls return the cached
    /// outcome.
    pub async fn wait(&mut self) -> Result<CommandResult> {
        self.wait_boxed().await
    }

    /// Alias for [`Command::wait`].
    pub async fn result(&mut self) -> Result<CommandResult> {
        self.wait_boxed().await
    }

    fn wait_boxed(&mut self) -> Pin<Box<dyn Future<Output = Result<CommandResult>> + Send + '_>> {
        Box::pin(self.wait_impl())
    }

    async fn wait_impl(&mut self) -> Result<CommandResult> {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let mut base: Result<i32> = match &mut self.kind {
            CommandKind::Process(handle) => handle.wait().await,
            CommandKind::Attached(handle) => handle.wait().await,
            CommandKind::Piped {
                upstream,
                downstream,
                copy,
            } => {
                let copy_outcome = match copy.take() {
                    Some(task) => flatten(task.await),
                    None => Ok(()),
                };
                // The chain's outcome is the downstream's; an upstream
                // failure still gets awaited so completion implies every
                // process exited and drained.
                if let Err(e) = upstream.wait_boxed().await {
                    debug!("upstream of chain failed: {e}");
                }
                let mut outcome = downstream.wait_boxed().await.map(|r| r.exit_code);
                if outcome.is_ok() {
                    if let Err(e) = copy_outcome {
                        outcome = Err(e);
                    }
                }
                outcome
            }
        };
        for task in self.io_tasks.drain(..) {
            let io = flatten(task.await);
            if base.is_ok() {
                if let Err(e) = io {
                    base = Err(e);
                }
            }
        }
        let outcome = base.map(|exit_code| CommandResult {
            exit_code,
            stdout: Arc::clone(&self.stdout),
            stderr: Arc::clone(&self.stderr),
        });
        self.outcome = Some(outcome.clone());
        outcome
    }

    /// Best-effort terminate every process this command owns. Idempotent,
    /// never fails, and a no-op once the process is known to have exited.
    pub fn kill(&self) {
        match &self.kind {
            CommandKind::Process(handle) => handle.kill(),
            CommandKind::Attached(handle) => handle.kill(),
            CommandKind::Piped {
                upstream,
                downstream,
                ..
            } => {
                upstream.kill();
                downstream.kill();
            }
        }
    }

    /// Deliver a console signal to the primary process. Returns whether
    /// delivery appeared to succeed.
    pub async fn try_signal(&self, signal: ConsoleSignal) -> Result<bool> {
        let pid = self.pid()?;
        crate::signal::deliver(pid, signal).await
    }

    /// Claim both output readers and merge their lines into a single
    /// sequence, ordered by arrival. The relative order within each
    /// stream is preserved; when one stream ends the other drains to
    /// completion. Single-shot: the streams are consumed.
    pub fn merged_lines(&mut self) -> Result<MergedLines> {
        let stdout = self.stdout.take()?;
        let stderr = match self.stderr.take() {
            Ok(reader) => reader,
            Err(e) => {
                self.stdout.restore(stdout);
                return Err(e);
            }
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let tasks = [
            tokio::spawn(forward_lines(stdout, OutputSource::Stdout, tx.clone())),
            tokio::spawn(forward_lines(stderr, OutputSource::Stderr, tx)),
        ];
        Ok(MergedLines { rx, _tasks: tasks })
    }

    // ------------------------------------------------------------------
    // Redirection
    // ------------------------------------------------------------------

    /// Feed raw bytes (or a string) into stdin, then close it.
    pub fn stdin_from_bytes(mut self, data: impl Into<Vec<u8>>) -> Result<Self> {
        let stdin = self.claim_stdin()?;
        self.io_tasks
            .push(tokio::spawn(io::feed_from_bytes(data.into(), stdin)));
        Ok(self)
    }

    /// Stream a reader into stdin, then close it.
    pub fn stdin_from_reader<R>(mut self, source: R) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let stdin = self.claim_stdin()?;
        self.io_tasks
            .push(tokio::spawn(io::feed_from_reader(source, stdin)));
        Ok(self)
    }

    /// Stream a file into stdin, then close it.
    pub fn stdin_from_file(mut self, path: impl Into<PathBuf>) -> Result<Self> {
        let stdin = self.claim_stdin()?;
        self.io_tasks
            .push(tokio::spawn(io::feed_from_file(path.into(), stdin)));
        Ok(self)
    }

    /// Feed a character sequence into stdin, then close it. Strings are
    /// cheaper through [`Command::stdin_from_bytes`].
    pub fn stdin_from_chars<I>(self, chars: I) -> Result<Self>
    where
        I: IntoIterator<Item = char>,
    {
        let text: String = chars.into_iter().collect();
        self.stdin_from_bytes(text)
    }

    /// Write each item as a line (item + `\n`) into stdin, then close it.
    pub fn stdin_from_lines<I>(mut self, lines: I) -> Result<Self>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let stdin = self.claim_stdin()?;
        let lines: Vec<String> = lines.into_iter().map(Into::into).collect();
        self.io_tasks
            .push(tokio::spawn(io::feed_from_lines(lines, stdin)));
        Ok(self)
    }

    /// Copy stdout into an async writer, backpressured.
    pub fn stdout_to_writer<W>(mut self, sink: W) -> Result<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let source = self.claim_stdout_unbuffered()?;
        self.io_tasks
            .push(tokio::spawn(io::copy_to_writer(source, sink)));
        Ok(self)
    }

    /// Copy stderr into an async writer, backpressured.
    pub fn stderr_to_writer<W>(mut self, sink: W) -> Result<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let source = self.claim_stderr_unbuffered()?;
        self.io_tasks
            .push(tokio::spawn(io::copy_to_writer(source, sink)));
        Ok(self)
    }

    /// Copy stdout into a file (created or truncated).
    pub fn stdout_to_file(mut self, path: impl Into<PathBuf>) -> Result<Self> {
        let source = self.claim_stdout_unbuffered()?;
        self.io_tasks
            .push(tokio::spawn(io::copy_to_file(source, path.into())));
        Ok(self)
    }

    /// Copy stderr into a file (created or truncated).
    pub fn stderr_to_file(mut self, path: impl Into<PathBuf>) -> Result<Self> {
        let source = self.claim_stderr_unbuffered()?;
        self.io_tasks
            .push(tokio::spawn(io::copy_to_file(source, path.into())));
        Ok(self)
    }

    /// Append each stdout line to a shared collection.
    pub fn stdout_to_lines(mut self, sink: Arc<Mutex<Vec<String>>>) -> Result<Self> {
        let source = self.claim_stdout_unbuffered()?;
        self.io_tasks
            .push(tokio::spawn(io::collect_lines(source, sink)));
        Ok(self)
    }

    /// Append each stderr line to a shared collection.
    pub fn stderr_to_lines(mut self, sink: Arc<Mutex<Vec<String>>>) -> Result<Self> {
        let source = self.claim_stderr_unbuffered()?;
        self.io_tasks
            .push(tokio::spawn(io::collect_lines(source, sink)));
        Ok(self)
    }

    /// Append stdout bytes to a shared buffer.
    pub fn stdout_to_bytes(mut self, sink: Arc<Mutex<Vec<u8>>>) -> Result<Self> {
        let source = self.claim_stdout_unbuffered()?;
        self.io_tasks
            .push(tokio::spawn(io::collect_bytes(source, sink)));
        Ok(self)
    }

    /// Append stderr bytes to a shared buffer.
    pub fn stderr_to_bytes(mut self, sink: Arc<Mutex<Vec<u8>>>) -> Result<Self> {
        let source = self.claim_stderr_unbuffered()?;
        self.io_tasks
            .push(tokio::spawn(io::collect_bytes(source, sink)));
        Ok(self)
    }

    /// Chain this command's stdout into `downstream`'s stdin.
    ///
    /// The chain's stdin is this command's, its stdout/stderr are the
    /// downstream's, `kill` reaches both ends, and completion implies the
    /// copy finished and both processes exited.
    pub fn pipe_to(self, downstream: Command) -> Result<Command> {
        piped::pipe(self, downstream)
    }

    fn claim_stdin(&mut self) -> Result<InputWriter> {
        match std::mem::replace(&mut self.stdin, StdinSlot::Claimed) {
            StdinSlot::Present(writer) => Ok(writer),
            StdinSlot::Claimed => Err(Error::StreamClaimed),
            StdinSlot::Absent => {
                self.stdin = StdinSlot::Absent;
                Err(Error::StreamNotRedirected)
            }
        }
    }

    fn claim_stdout(&mut self) -> Result<OutputReader> {
        self.stdout.take()
    }

    fn claim_stderr(&mut self) -> Result<OutputReader> {
        self.stderr.take()
    }

    fn claim_stdout_unbuffered(&mut self) -> Result<OutputReader> {
        let reader = self.stdout.take()?;
        reader.stop_buffering();
        Ok(reader)
    }

    fn claim_stderr_unbuffered(&mut self) -> Result<OutputReader> {
        let reader = self.stderr.take()?;
        reader.stop_buffering();
        Ok(reader)
    }
}

/// `a | b` — sugar for [`Command::pipe_to`].
///
/// # Panics
///
/// Panics if either command's end of the pipe was already claimed; use
/// [`Command::pipe_to`] for a fallible form.
impl std::ops::BitOr for Command {
    type Output = Command;

    fn bitor(self, downstream: Command) -> Command {
        match self.pipe_to(downstream) {
            Ok(chain) => chain,
            Err(e) => panic!("cannot pipe commands: {e}"),
        }
    }
}

fn flatten(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(outcome) => outcome,
        Err(e) => Err(Error::Io(format!("i/o task failed: {e}"))),
    }
}

async fn forward_lines(
    mut reader: OutputReader,
    source: OutputSource,
    tx: UnboundedSender<(OutputSource, String)>,
) {
    loop {
        match reader.next_line().await {
            Ok(Some(line)) => {
                if tx.send((source, line)).is_err() {
                    // Consumer gone; stop capturing.
                    reader.discard();
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("{} line merge stopped: {e}", source.as_str());
                break;
            }
        }
    }
}

/// Single-pass merge of stdout and stderr lines, in arrival order.
pub struct MergedLines {
    rx: UnboundedReceiver<(OutputSource, String)>,
    _tasks: [JoinHandle<()>; 2],
}

impl std::fmt::Debug for MergedLines {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergedLines").finish_non_exhaustive()
    }
}

impl MergedLines {
    /// Next line and its source; `None` once both streams are exhausted.
    pub async fn next(&mut self) -> Option<(OutputSource, String)> {
        self.rx.recv().await
    }
}

/// Outcome of a completed command.
///
/// Output text is materialized lazily: the first [`CommandResult::stdout`]
/// or [`CommandResult::stderr`] call drains the stream, and every clone of
/// the result (and the command itself) shares that snapshot.
#[derive(Clone)]
pub struct CommandResult {
    exit_code: i32,
    stdout: Arc<OutputCapture>,
    stderr: Arc<OutputCapture>,
}

impl CommandResult {
    /// The process exit code. Processes killed before reporting one yield
    /// `-1`; platforms that truncate exit codes to eight bits report the
    /// truncated value.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Whether the exit code is zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Full standard output as text, captured on first access.
    ///
    /// Fails with [`Error::StreamClaimed`] if a redirection or accessor
    /// took the stream, [`Error::StreamNotRedirected`] on an attached
    /// command.
    pub async fn stdout(&self) -> Result<&str> {
        self.stdout.text().await
    }

    /// Full standard error as text, captured on first access.
    pub async fn stderr(&self) -> Result<&str> {
        self.stderr.text().await
    }
}

impl std::fmt::Debug for CommandResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandResult")
            .field("exit_code", &self.exit_code)
            .finish_non_exhaustive()
    }
}
