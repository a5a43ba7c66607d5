//! Chaining two commands stdout-to-stdin.
//!
//! The copy task reads the upstream's captured stdout (switched to
//! fixed-length mode so the chain is backpressured end to end) and writes
//! into the downstream's stdin, closing it at upstream EOF. Dropping the
//! claimed reader at the end of the copy closes both pipe halves together.

use std::sync::Arc;

use tracing::debug;

use super::{Command, CommandKind, StdinSlot};
use crate::error::Result;
use crate::pipe::CHUNK_SIZE;
use crate::stdio::{InputWriter, OutputReader};

/// Build `upstream | downstream`. Claims the upstream stdout and the
/// downstream stdin.
pub(super) fn pipe(mut upstream: Command, mut downstream: Command) -> Result<Command> {
    let source = upstream.claim_stdout()?;
    let sink = downstream.claim_stdin()?;
    source.stop_buffering();
    let copy = tokio::spawn(copy_between(source, sink));

    let stdin = std::mem::replace(&mut upstream.stdin, StdinSlot::Claimed);
    let stdout = Arc::clone(&downstream.stdout);
    let stderr = Arc::clone(&downstream.stderr);
    Ok(Command {
        kind: CommandKind::Piped {
            upstream: Box::new(upstream),
            downstream: Box::new(downstream),
            copy: Some(copy),
        },
        stdin,
        stdout,
        stderr,
        io_tasks: Vec::new(),
        outcome: None,
    })
}

async fn copy_between(mut source: OutputReader, mut sink: InputWriter) -> Result<()> {
    let mut chunk = vec![0u8; CHUNK_SIZE];
    loop {
        let n = source.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        sink.write(&chunk[..n]).await?;
    }
    sink.close();
    debug!("pipe chain copy finished");
    Ok(())
}
