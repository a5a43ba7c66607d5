//! Adapters between child stdio and in-process consumers.
//!
//! [`OutputReader`] wraps a child's stdout or stderr: a background drain
//! task eagerly moves bytes from the OS pipe into a [`Pipe`] so the child
//! never stalls on a full OS buffer, and the consumer reads from the pipe
//! at its own pace. [`InputWriter`] wraps the child's stdin and absorbs the
//! platform differences around writing to an exited process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdin;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Error, Result};
use crate::pipe::{Pipe, PipeReader, CHUNK_SIZE};

/// How captured output bytes become text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamEncoding {
    /// Invalid UTF-8 is replaced with U+FFFD (default).
    #[default]
    Utf8Lossy,
    /// Invalid UTF-8 is an error.
    Utf8,
}

impl StreamEncoding {
    fn decode(self, bytes: Vec<u8>) -> Result<String> {
        match self {
            Self::Utf8Lossy => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Self::Utf8 => {
                String::from_utf8(bytes).map_err(|e| Error::Io(format!("invalid utf-8: {e}")))
            }
        }
    }
}

/// Buffered reader over one child output stream.
///
/// Created with a running drain task; dropped readers close their pipe
/// half, which turns the remaining drain into a discard loop.
pub struct OutputReader {
    pipe: Pipe,
    reader: PipeReader,
    discard: Arc<AtomicBool>,
    encoding: StreamEncoding,
    /// Bytes pulled from the pipe but not yet returned (line lookahead).
    pending: Vec<u8>,
    eof: bool,
}

impl std::fmt::Debug for OutputReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputReader").finish_non_exhaustive()
    }
}

impl OutputReader {
    /// Wrap an OS pipe end and spawn its drain task. The returned handle
    /// joins the owning command's I/O set.
    pub(crate) fn spawn<R>(source: R, encoding: StreamEncoding) -> (Self, JoinHandle<Result<()>>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let pipe = Pipe::new();
        let discard = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(drain(source, pipe.clone(), Arc::clone(&discard)));
        let reader = Self {
            reader: pipe.reader(),
            pipe,
            discard,
            encoding,
            pending: Vec::new(),
            eof: false,
        };
        (reader, task)
    }

    /// Read up to `out.len()` bytes; 0 means the stream is finished.
    pub async fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.discard.load(Ordering::Relaxed) || out.is_empty() {
            return Ok(0);
        }
        if !self.pending.is_empty() {
            let n = out.len().min(self.pending.len());
            out[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            return Ok(n);
        }
        if self.eof {
            return Ok(0);
        }
        let n = self.reader.read(out).await?;
        if n == 0 {
            self.eof = true;
        }
        Ok(n)
    }

    /// Read the rest of the stream as raw bytes.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut collected = std::mem::take(&mut self.pending);
        let mut chunk = [0u8; CHUNK_SIZE];
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&chunk[..n]);
        }
        Ok(collected)
    }

    /// Read the rest of the stream as text in the configured encoding.
    pub async fn read_to_string(&mut self) -> Result<String> {
        let bytes = self.read_to_end().await?;
        self.encoding.decode(bytes)
    }

    /// Next line, without its terminator (`\n`, with a preceding `\r`
    /// stripped). A final unterminated line is yielded before `None`.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return self.encoding.decode(line).map(Some);
            }
            if self.eof || self.discard.load(Ordering::Relaxed) {
                break;
            }
            let mut chunk = [0u8; CHUNK_SIZE];
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                self.eof = true;
            } else {
                self.pending.extend_from_slice(&chunk[..n]);
            }
        }
        if self.pending.is_empty() {
            return Ok(None);
        }
        let line = std::mem::take(&mut self.pending);
        self.encoding.decode(line).map(Some)
    }

    /// Stop capturing: the drain keeps the child from blocking but throws
    /// the bytes away, and reads return end-of-stream immediately.
    pub fn discard(&self) {
        self.discard.store(true, Ordering::Relaxed);
        self.reader.close();
    }

    /// Switch the backing pipe to fixed-length mode so the child is
    /// backpressured once the resident buffer fills. Call before handing
    /// the stream to a long-running sink.
    pub fn stop_buffering(&self) {
        self.pipe.set_fixed_length();
    }
}

/// Drain loop: OS pipe → in-memory pipe. Keeps reading after a discard so
/// the child never deadlocks on a full OS buffer; the pipe writes become
/// no-ops once the reader half is closed.
async fn drain<R>(mut source: R, pipe: Pipe, discard: Arc<AtomicBool>) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let writer = pipe.writer();
    let mut chunk = vec![0u8; CHUNK_SIZE];
    loop {
        match source.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if !discard.load(Ordering::Relaxed) {
                    writer.write(&chunk[..n]).await?;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                debug!("output drain ended with error: {e}");
                writer.close();
                return Err(Error::io(&e));
            }
        }
    }
    writer.close();
    Ok(())
}

/// Writer over the child's stdin.
///
/// Post-exit stdin behavior differs across operating systems (no-op,
/// broken pipe, or write fault), so every write and flush swallows I/O
/// errors; writing after exit is always a silent no-op. Text is written
/// as UTF-8.
pub struct InputWriter {
    stdin: Option<ChildStdin>,
}

impl std::fmt::Debug for InputWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputWriter").finish_non_exhaustive()
    }
}

impl InputWriter {
    pub(crate) fn new(stdin: ChildStdin) -> Self {
        Self { stdin: Some(stdin) }
    }

    /// Write and flush the whole buffer. I/O failures are swallowed.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Ok(());
        };
        if let Err(e) = stdin.write_all(data).await {
            debug!("stdin write swallowed: {e}");
            return Ok(());
        }
        if let Err(e) = stdin.flush().await {
            debug!("stdin flush swallowed: {e}");
        }
        Ok(())
    }

    /// Write `text` followed by `\n`.
    pub async fn write_line(&mut self, text: &str) -> Result<()> {
        self.write(text.as_bytes()).await?;
        self.write(b"\n").await
    }

    /// Flush buffered bytes. I/O failures are swallowed.
    pub async fn flush(&mut self) -> Result<()> {
        if let Some(stdin) = self.stdin.as_mut() {
            if let Err(e) = stdin.flush().await {
                debug!("stdin flush swallowed: {e}");
            }
        }
        Ok(())
    }

    /// Close stdin so the child sees EOF. Idempotent.
    pub fn close(&mut self) {
        self.stdin = None;
    }
}
