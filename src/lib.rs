#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! shellpipe — launch and orchestrate child processes with composable
//! stream piping.
//!
//! The building blocks:
//! - `shell` — [`Shell`] and [`Options`], the defaults-carrying factory
//! - `command` — [`Command`] handles, redirection, chaining, results
//! - `pipe` — the bounded in-memory byte pipe behind every stream
//! - `stdio` — adapters between child stdio and in-process consumers
//! - `signal` — cross-platform console-signal delivery to a PID
//! - `syntax` — command-line argument joining
//!
//! A command's `wait()` resolves only once the process has exited *and*
//! every attached I/O task has drained; timeouts and cancellation tokens
//! kill the child and surface as typed errors.

pub mod command;
pub mod error;
pub mod pipe;
pub mod shell;
pub mod signal;
pub mod stdio;
pub mod syntax;

// Re-export key types at crate root for convenience.
pub use command::{Command, CommandResult, MergedLines, OutputSource};
pub use tokio_util::sync::CancellationToken;
pub use error::{Error, Result};
pub use pipe::{Pipe, PipeReader, PipeWriter};
pub use shell::{Options, Shell};
pub use signal::ConsoleSignal;
pub use stdio::{InputWriter, OutputReader, StreamEncoding};
pub use syntax::ArgumentSyntax;
