//! Crate-wide error type.
//!
//! One enum covers every failure class: pipe-local conditions (closed
//! halves, concurrent operations, growth overflow), lifecycle outcomes
//! (timeout, cancellation, non-zero exit with [`throw_on_error`]), stream
//! claim preconditions, and platform limits.
//!
//! The type is `Clone` because a command's completion outcome is computed
//! once and then handed back from every subsequent [`Command::wait`] call.
//! OS errors are therefore carried as their rendered text rather than as a
//! live `std::io::Error`.
//!
//! [`throw_on_error`]: crate::shell::Options::throw_on_error
//! [`Command::wait`]: crate::command::Command::wait

use thiserror::Error;

/// Errors produced by pipes, commands, and the shell factory.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// A required argument was empty, zero, or otherwise unusable.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Read attempted on a pipe whose reader half is closed.
    #[error("pipe reader is closed")]
    ClosedReader,

    /// Write attempted on a pipe whose writer half is closed.
    #[error("pipe writer is closed")]
    ClosedWriter,

    /// A read was issued while another read was still in flight.
    #[error("a read is already in progress on this pipe")]
    ConcurrentRead,

    /// A write was issued while another write was still in flight.
    #[error("a write is already in progress on this pipe")]
    ConcurrentWrite,

    /// The operation's timeout elapsed before it could start.
    #[error("operation timed out")]
    Timeout,

    /// The operation's cancellation token fired.
    #[error("operation was cancelled")]
    Cancelled,

    /// A pipe write would grow the buffer past its maximum capacity.
    #[error("pipe buffer would exceed maximum capacity")]
    TooLong,

    /// An OS-level I/O failure (spawn, drain, redirection source/sink).
    #[error("i/o error: {0}")]
    Io(String),

    /// The process exited non-zero and `throw_on_error` was set.
    #[error("process exited with code {0}")]
    ErrorExitCode(i32),

    /// The stream was never piped (e.g. on an attached command).
    #[error("stream was not redirected")]
    StreamNotRedirected,

    /// The stream was already taken by a redirection, pipe, or accessor.
    #[error("stream was already claimed")]
    StreamClaimed,

    /// The OS did not report a process id at spawn time.
    #[error("process id is unavailable: {0}")]
    ProcessIdUnavailable(String),

    /// `try_attach` was combined with options that only apply at spawn.
    #[error("attach cannot be combined with encoding or start-info options")]
    InvalidAttachOptions,

    /// The operation is not supported on this platform.
    #[error("not supported on this platform: {0}")]
    PlatformNotSupported(&'static str),
}

impl Error {
    /// The exit code carried by [`Error::ErrorExitCode`], if that is what
    /// this error is.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::ErrorExitCode(code) => Some(*code),
            _ => None,
        }
    }

    pub(crate) fn io(err: &std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
