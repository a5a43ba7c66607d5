//! Bounded in-memory byte pipe with async read/write, timeouts, and
//! cancellation.
//!
//! A [`Pipe`] decouples a producer from a consumer: the drain task for a
//! child's stdout writes into one, the caller reads out of the other end.
//! Two modes:
//!
//! - **Unbounded** (default) — writes always complete immediately, growing
//!   the ring buffer as needed. Used for captured output so a child never
//!   blocks on a full OS pipe.
//! - **Fixed-length** ([`Pipe::set_fixed_length`]) — resident bytes are
//!   capped at [`FIXED_CLAMP`]; writers wait for the reader to catch up.
//!   Used when output is being forwarded to a sink and should not
//!   accumulate.
//!
//! Signaling uses two `tokio::sync::Semaphore`s as condition variables,
//! each holding at most one permit: `bytes` is signaled iff data is
//! readable or the writer closed, `space` (fixed-length mode only) iff the
//! pipe has room or the reader closed. Both are recomputed from those
//! predicates after every state change, so a consumed-but-unused permit is
//! always repaired by the next mutation and every waiter re-checks state
//! under the lock before blocking.
//!
//! Half-close semantics: closing the writer lets the reader drain to EOF;
//! closing the reader turns writes into silent no-ops. When both halves
//! are closed the buffer is released.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Chunk size used by drain and copy loops throughout the crate.
pub(crate) const CHUNK_SIZE: usize = 4096;

/// Resident-byte cap in fixed-length mode.
pub(crate) const FIXED_CLAMP: usize = 2 * CHUNK_SIZE;

/// Smallest non-empty buffer allocation.
const MIN_CAPACITY: usize = 256;

/// Growth ceiling for unbounded mode.
const MAX_CAPACITY: usize = i32::MAX as usize;

struct PipeState {
    /// Ring storage. `len()` is the current capacity; empty until the
    /// first write.
    buf: Vec<u8>,
    /// Logical offset of the oldest unread byte.
    start: usize,
    /// Number of unread bytes.
    count: usize,
    writer_closed: bool,
    reader_closed: bool,
    write_in_flight: bool,
    read_in_flight: bool,
    /// Close requested while the matching operation was in flight; applied
    /// by that operation's completion path.
    writer_close_deferred: bool,
    reader_close_deferred: bool,
    /// Present iff fixed-length mode is enabled.
    space: Option<Arc<Semaphore>>,
}

struct PipeInner {
    state: Mutex<PipeState>,
    /// Signaled iff `count > 0 || writer_closed`.
    bytes: Semaphore,
}

impl PipeInner {
    fn lock(&self) -> MutexGuard<'_, PipeState> {
        // A poisoned pipe lock means a panic mid-copy; propagating the
        // inner state is still sound (all invariants hold between copies).
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Recompute both semaphores from the signaling predicates. Called at
    /// the end of every state mutation, under the lock.
    fn sync_signals(&self, state: &mut PipeState) {
        sync_permit(&self.bytes, state.count > 0 || state.writer_closed);
        if let Some(space) = &state.space {
            let free = FIXED_CLAMP.saturating_sub(state.count);
            sync_permit(space, state.reader_closed || free > 0);
        }
    }

    fn close_writer_locked(&self, state: &mut PipeState) {
        if state.writer_closed {
            return;
        }
        state.writer_closed = true;
        self.release_if_done(state);
        self.sync_signals(state);
    }

    fn close_reader_locked(&self, state: &mut PipeState) {
        if state.reader_closed {
            return;
        }
        state.reader_closed = true;
        self.release_if_done(state);
        self.sync_signals(state);
    }

    /// Once both halves are closed, nothing can be read or written again:
    /// drop the backing storage.
    fn release_if_done(&self, state: &mut PipeState) {
        if state.writer_closed && state.reader_closed {
            state.buf = Vec::new();
            state.start = 0;
            state.count = 0;
            state.space = None;
        }
    }
}

/// Converge a semaphore to the target permit count (0 or 1).
fn sync_permit(sem: &Semaphore, signaled: bool) {
    let want = usize::from(signaled);
    let have = sem.available_permits();
    if have < want {
        sem.add_permits(want - have);
    } else if have > want {
        if let Ok(permit) = sem.try_acquire() {
            permit.forget();
        }
    }
}

/// Wait for a permit, bounded by an optional deadline and cancellation
/// token. The permit is consumed.
async fn acquire(
    sem: &Semaphore,
    deadline: Option<Instant>,
    ct: Option<&CancellationToken>,
) -> Result<()> {
    let wait = async {
        let acquired = match ct {
            Some(ct) => tokio::select! {
                () = ct.cancelled() => return Err(Error::Cancelled),
                permit = sem.acquire() => permit,
            },
            None => sem.acquire().await,
        };
        if let Ok(permit) = acquired {
            permit.forget();
        }
        Ok(())
    };
    match deadline {
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, wait).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout),
            }
        }
        None => wait.await,
    }
}

/// Copy `data` into the ring. The caller has ensured capacity.
fn write_ring(state: &mut PipeState, data: &[u8]) {
    let cap = state.buf.len();
    let pos = (state.start + state.count) % cap;
    let first = data.len().min(cap - pos);
    state.buf[pos..pos + first].copy_from_slice(&data[..first]);
    if data.len() > first {
        let rest = data.len() - first;
        state.buf[..rest].copy_from_slice(&data[first..]);
    }
    state.count += data.len();
}

/// Copy up to `out.len()` bytes out of the ring, advancing `start`.
fn read_ring(state: &mut PipeState, out: &mut [u8]) -> usize {
    let n = out.len().min(state.count);
    if n == 0 {
        return 0;
    }
    let cap = state.buf.len();
    let first = n.min(cap - state.start);
    out[..first].copy_from_slice(&state.buf[state.start..state.start + first]);
    if n > first {
        out[first..n].copy_from_slice(&state.buf[..n - first]);
    }
    state.start = (state.start + n) % cap;
    state.count -= n;
    if state.count == 0 {
        state.start = 0;
        // The mode may have been enabled after the buffer grew; once the
        // reader has caught up, fall back to the clamp.
        if state.space.is_some() && state.buf.len() > FIXED_CLAMP {
            state.buf.truncate(FIXED_CLAMP);
            state.buf.shrink_to_fit();
        }
    }
    n
}

/// Grow the ring so `additional` more bytes fit, linearizing the unread
/// region to the front of the new allocation.
fn ensure_capacity(state: &mut PipeState, additional: usize, limit: usize) -> Result<()> {
    let needed = state
        .count
        .checked_add(additional)
        .filter(|&n| n <= limit)
        .ok_or(Error::TooLong)?;
    let cap = state.buf.len();
    if needed <= cap {
        return Ok(());
    }
    let new_cap = if cap < MIN_CAPACITY {
        needed.max(MIN_CAPACITY)
    } else {
        needed.max(cap.saturating_mul(2))
    }
    .min(limit);
    let mut new_buf = vec![0u8; new_cap];
    let n = state.count;
    if n > 0 {
        let first = n.min(cap - state.start);
        new_buf[..first].copy_from_slice(&state.buf[state.start..state.start + first]);
        if n > first {
            new_buf[first..n].copy_from_slice(&state.buf[..n - first]);
        }
    }
    state.buf = new_buf;
    state.start = 0;
    Ok(())
}

/// Clears the in-flight flag for one side and applies a deferred close.
struct OpGuard<'a> {
    inner: &'a PipeInner,
    writer: bool,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        if self.writer {
            state.write_in_flight = false;
            if state.writer_close_deferred {
                state.writer_close_deferred = false;
                self.inner.close_writer_locked(&mut state);
            }
        } else {
            state.read_in_flight = false;
            if state.reader_close_deferred {
                state.reader_close_deferred = false;
                self.inner.close_reader_locked(&mut state);
            }
        }
    }
}

/// Bounded in-memory byte pipe. Cheap to clone; [`Pipe::writer`] and
/// [`Pipe::reader`] hand out the two halves.
#[derive(Clone)]
pub struct Pipe {
    inner: Arc<PipeInner>,
}

impl Default for Pipe {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipe {
    /// Create an empty pipe in unbounded mode.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PipeInner {
                state: Mutex::new(PipeState {
                    buf: Vec::new(),
                    start: 0,
                    count: 0,
                    writer_closed: false,
                    reader_closed: false,
                    write_in_flight: false,
                    read_in_flight: false,
                    writer_close_deferred: false,
                    reader_close_deferred: false,
                    space: None,
                }),
                bytes: Semaphore::new(0),
            }),
        }
    }

    /// Enable backpressure: writers now wait once [`FIXED_CLAMP`] bytes
    /// are resident. No-op if either half is already closed or the mode is
    /// already on.
    pub fn set_fixed_length(&self) {
        let mut state = self.inner.lock();
        if state.writer_closed || state.reader_closed || state.space.is_some() {
            return;
        }
        state.space = Some(Arc::new(Semaphore::new(0)));
        self.inner.sync_signals(&mut state);
    }

    /// The write half. Dropping it closes the writer side.
    #[must_use]
    pub fn writer(&self) -> PipeWriter {
        PipeWriter {
            inner: Arc::clone(&self.inner),
        }
    }

    /// The read half. Dropping it closes the reader side.
    #[must_use]
    pub fn reader(&self) -> PipeReader {
        PipeReader {
            inner: Arc::clone(&self.inner),
        }
    }

    #[cfg(test)]
    fn resident_capacity(&self) -> usize {
        self.inner.lock().buf.len()
    }
}

/// Write half of a [`Pipe`].
pub struct PipeWriter {
    inner: Arc<PipeInner>,
}

impl PipeWriter {
    /// Write the whole buffer with no timeout or cancellation.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.write_impl(data, None, None).await
    }

    /// Write the whole buffer, waiting at most `timeout` (`None` =
    /// forever) for space and aborting on `ct`.
    ///
    /// The bound applies only to *starting* the write: once the first byte
    /// is accepted the remainder is written unconditionally, so a
    /// [`Error::Timeout`] or [`Error::Cancelled`] outcome guarantees no
    /// partial write happened.
    pub async fn write_with(
        &self,
        data: &[u8],
        timeout: Option<Duration>,
        ct: &CancellationToken,
    ) -> Result<()> {
        self.write_impl(data, timeout, Some(ct)).await
    }

    async fn write_impl(
        &self,
        mut data: &[u8],
        timeout: Option<Duration>,
        ct: Option<&CancellationToken>,
    ) -> Result<()> {
        if ct.is_some_and(CancellationToken::is_cancelled) {
            return Err(Error::Cancelled);
        }
        if data.is_empty() {
            return Ok(());
        }
        let space = {
            let mut state = self.inner.lock();
            if state.writer_closed || state.writer_close_deferred {
                return Err(Error::ClosedWriter);
            }
            if state.write_in_flight {
                return Err(Error::ConcurrentWrite);
            }
            if state.reader_closed {
                // The consumer is gone; accept and discard.
                return Ok(());
            }
            match &state.space {
                None => {
                    ensure_capacity(&mut state, data.len(), MAX_CAPACITY)?;
                    write_ring(&mut state, data);
                    self.inner.sync_signals(&mut state);
                    return Ok(());
                }
                Some(space) => {
                    let free = FIXED_CLAMP.saturating_sub(state.count);
                    if free >= data.len() {
                        ensure_capacity(&mut state, data.len(), FIXED_CLAMP)?;
                        write_ring(&mut state, data);
                        self.inner.sync_signals(&mut state);
                        return Ok(());
                    }
                    let space = Arc::clone(space);
                    state.write_in_flight = true;
                    space
                }
            }
        };
        let _guard = OpGuard {
            inner: &self.inner,
            writer: true,
        };
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut first = true;
        while !data.is_empty() {
            if first {
                acquire(&space, deadline, ct).await?;
                first = false;
            } else {
                // Past the first slice the write must run to completion.
                acquire(&space, None, None).await?;
            }
            let mut state = self.inner.lock();
            if state.reader_closed {
                return Ok(());
            }
            let free = FIXED_CLAMP.saturating_sub(state.count);
            if free == 0 {
                continue;
            }
            let n = free.min(data.len());
            ensure_capacity(&mut state, n, FIXED_CLAMP)?;
            write_ring(&mut state, &data[..n]);
            data = &data[n..];
            self.inner.sync_signals(&mut state);
        }
        Ok(())
    }

    /// Close the write half. Idempotent; a close issued while a write is
    /// in flight applies when that write finishes.
    pub fn close(&self) {
        let mut state = self.inner.lock();
        if state.write_in_flight {
            state.writer_close_deferred = true;
        } else {
            self.inner.close_writer_locked(&mut state);
        }
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read half of a [`Pipe`].
pub struct PipeReader {
    inner: Arc<PipeInner>,
}

impl PipeReader {
    /// Read into `out` with no timeout or cancellation. Returns the number
    /// of bytes read; 0 means the writer closed and the pipe is drained.
    pub async fn read(&self, out: &mut [u8]) -> Result<usize> {
        self.read_impl(out, None, None).await
    }

    /// Read into `out`, waiting at most `timeout` (`None` = forever) for
    /// bytes and aborting on `ct`. Partial reads are allowed.
    pub async fn read_with(
        &self,
        out: &mut [u8],
        timeout: Option<Duration>,
        ct: &CancellationToken,
    ) -> Result<usize> {
        self.read_impl(out, timeout, Some(ct)).await
    }

    async fn read_impl(
        &self,
        out: &mut [u8],
        timeout: Option<Duration>,
        ct: Option<&CancellationToken>,
    ) -> Result<usize> {
        if ct.is_some_and(CancellationToken::is_cancelled) {
            return Err(Error::Cancelled);
        }
        if out.is_empty() {
            return Ok(0);
        }
        {
            let mut state = self.inner.lock();
            if state.reader_closed || state.reader_close_deferred {
                return Err(Error::ClosedReader);
            }
            if state.read_in_flight {
                return Err(Error::ConcurrentRead);
            }
            if state.count > 0 {
                let n = read_ring(&mut state, out);
                self.inner.sync_signals(&mut state);
                return Ok(n);
            }
            if state.writer_closed {
                return Ok(0);
            }
            state.read_in_flight = true;
        }
        let _guard = OpGuard {
            inner: &self.inner,
            writer: false,
        };
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            acquire(&self.inner.bytes, deadline, ct).await?;
            let mut state = self.inner.lock();
            if state.count > 0 {
                let n = read_ring(&mut state, out);
                self.inner.sync_signals(&mut state);
                return Ok(n);
            }
            if state.writer_closed {
                return Ok(0);
            }
            // Stale permit; wait for the next signal.
        }
    }

    /// Close the read half. Idempotent; a close issued while a read is in
    /// flight applies when that read finishes. Subsequent writes are
    /// silently discarded.
    pub fn close(&self) {
        let mut state = self.inner.lock();
        if state.read_in_flight {
            state.reader_close_deferred = true;
        } else {
            self.inner.close_reader_locked(&mut state);
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.close();
    }
}
