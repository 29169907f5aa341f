//! Ring Buffer for Subprocess Output Staging
//!
//! CRITICAL: Writes never wait on the reader.
//! This ring buffer:
//! - Accepts concurrent writes from any number of producers
//! - Lets a single reader peek at the buffered window before consuming it
//! - Pulses a single-slot channel whenever there may be something to read
//! - Either rejects oversized writes or grows, depending on its policy
//!
//! Every operation takes the one lock for its full duration, and the only
//! work done under it is copying bytes.

use std::fmt;
use std::io;

use crossbeam_channel::{Receiver, Sender};
use log::debug;
use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;

/// Buffers at or below this size double when they grow; larger ones grow by 25%.
const DOUBLING_LIMIT: usize = 8192;

/// What a write does when the buffer has no room for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrowthPolicy {
    /// Reject the whole write and leave the buffer untouched.
    FailFast,
    /// Reallocate the storage, keeping every buffered byte.
    #[default]
    AutoGrow,
}

/// Ring buffer errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RingBufferError {
    /// Fail-fast write that does not fit in the free space
    #[error("insufficient capacity: {requested} bytes requested, {available} available")]
    InsufficientCapacity { requested: usize, available: usize },
    /// Auto-grow write whose reallocation failed
    #[error("failed to grow buffer to {requested} bytes")]
    AllocationFailed { requested: usize },
    /// Buffer is closed (writes), or closed and drained (reads)
    #[error("end of stream")]
    EndOfStream,
}

impl From<RingBufferError> for io::Error {
    fn from(err: RingBufferError) -> Self {
        let kind = match err {
            RingBufferError::InsufficientCapacity { .. } => io::ErrorKind::Other,
            RingBufferError::AllocationFailed { .. } => io::ErrorKind::OutOfMemory,
            RingBufferError::EndOfStream => io::ErrorKind::BrokenPipe,
        };
        io::Error::new(kind, err)
    }
}

/// A consistent copy of everything buffered, taken under one lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Window {
    /// Buffered bytes, oldest first
    pub bytes: Vec<u8>,
    /// Whether the buffer was closed when the copy was taken.
    /// If so, `bytes` is final: nothing more can be appended.
    pub closed: bool,
}

/// Bookkeeping guarded by the buffer lock.
struct State {
    /// Physical storage; its length is the capacity
    storage: Vec<u8>,
    /// Number of valid bytes
    len: usize,
    /// Read position of the oldest valid byte
    cursor: usize,
    closed: bool,
    /// Sending half of the wake-up signal, dropped on close
    notify: Option<Sender<()>>,
}

impl State {
    fn capacity(&self) -> usize {
        self.storage.len()
    }

    fn available(&self) -> usize {
        self.capacity() - self.len
    }

    /// Pulse the listener unless a pulse is already pending.
    fn signal(&self) {
        if self.len == 0 || self.closed {
            return;
        }
        if let Some(ref tx) = self.notify {
            // A full slot means the reader has not woken up yet; it will
            // see these bytes too.
            let _ = tx.try_send(());
        }
    }

    /// Copy `data` in at the logical tail. The caller guarantees room.
    fn copy_in(&mut self, data: &[u8]) {
        let capacity = self.capacity();
        let tail = (self.cursor + self.len) % capacity;
        let first = data.len().min(capacity - tail);

        self.storage[tail..tail + first].copy_from_slice(&data[..first]);
        self.storage[..data.len() - first].copy_from_slice(&data[first..]);
        self.len += data.len();
    }

    /// Copy leading bytes into `dst` without moving the cursor.
    fn copy_out(&self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.len);
        if n == 0 {
            return 0;
        }

        let first = n.min(self.capacity() - self.cursor);
        dst[..first].copy_from_slice(&self.storage[self.cursor..self.cursor + first]);
        dst[first..n].copy_from_slice(&self.storage[..n - first]);
        n
    }

    fn consume(&mut self, n: usize) -> usize {
        let n = n.min(self.len);
        if n == 0 {
            return 0;
        }

        self.cursor = (self.cursor + n) % self.capacity();
        self.len -= n;
        self.signal();
        n
    }

    /// Reallocate so at least `required` bytes fit, unwrapping the content
    /// to the front of the new storage.
    fn grow(&mut self, required: usize) -> Result<(), RingBufferError> {
        let capacity = self.capacity();
        let target = if capacity <= DOUBLING_LIMIT {
            capacity.saturating_mul(2)
        } else {
            capacity.saturating_add(capacity / 4)
        }
        .max(required);

        let mut storage = Vec::new();
        storage
            .try_reserve_exact(target)
            .map_err(|_| RingBufferError::AllocationFailed { requested: target })?;
        storage.resize(target, 0);

        let copied = self.copy_out(&mut storage[..self.len]);
        debug_assert_eq!(copied, self.len);

        debug!(
            "Ring buffer grew from {} to {} bytes ({} buffered)",
            capacity, target, self.len
        );

        self.storage = storage;
        self.cursor = 0;
        Ok(())
    }
}

/// Concurrent byte store with peek/consume semantics and change notification
pub struct RingBuffer {
    state: Mutex<State>,
    policy: GrowthPolicy,
    /// Receiving half of the wake-up signal, cloned out by `listen`
    listener: Receiver<()>,
}

impl RingBuffer {
    /// Create an empty buffer with the default growth policy
    pub fn new(capacity: usize) -> Self {
        Self::with_policy(capacity, GrowthPolicy::default())
    }

    /// Create an empty buffer of `capacity` bytes with an explicit policy
    pub fn with_policy(capacity: usize, policy: GrowthPolicy) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(1);
        Self {
            state: Mutex::new(State {
                storage: vec![0u8; capacity],
                len: 0,
                cursor: 0,
                closed: false,
                notify: Some(tx),
            }),
            policy,
            listener: rx,
        }
    }

    /// Append all of `data` at the tail, or none of it.
    ///
    /// Under [`GrowthPolicy::FailFast`] a write that does not fit fails with
    /// [`RingBufferError::InsufficientCapacity`] and the buffer is not
    /// modified. Under [`GrowthPolicy::AutoGrow`] the storage is reallocated
    /// first. After [`close`](Self::close) every write fails with
    /// [`RingBufferError::EndOfStream`].
    pub fn write(&self, data: &[u8]) -> Result<usize, RingBufferError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(RingBufferError::EndOfStream);
        }
        if data.is_empty() {
            return Ok(0);
        }

        let available = state.available();
        if data.len() > available {
            match self.policy {
                GrowthPolicy::FailFast => {
                    return Err(RingBufferError::InsufficientCapacity {
                        requested: data.len(),
                        available,
                    });
                }
                GrowthPolicy::AutoGrow => {
                    let required = state.len.checked_add(data.len()).ok_or(
                        RingBufferError::AllocationFailed {
                            requested: usize::MAX,
                        },
                    )?;
                    state.grow(required)?;
                }
            }
        }

        state.copy_in(data);
        state.signal();
        Ok(data.len())
    }

    /// Copy up to `dst.len()` leading bytes without consuming them.
    ///
    /// Fails with [`RingBufferError::EndOfStream`] only when the buffer is
    /// both closed and empty.
    pub fn peek(&self, dst: &mut [u8]) -> Result<usize, RingBufferError> {
        let state = self.state.lock();
        if state.len == 0 && state.closed {
            return Err(RingBufferError::EndOfStream);
        }
        Ok(state.copy_out(dst))
    }

    /// Advance past up to `n` bytes. Returns how many were actually dropped.
    pub fn consume(&self, n: usize) -> usize {
        self.state.lock().consume(n)
    }

    /// Peek followed by a consume of exactly what was copied, atomically.
    pub fn read(&self, dst: &mut [u8]) -> Result<usize, RingBufferError> {
        let mut state = self.state.lock();
        if state.len == 0 && state.closed {
            return Err(RingBufferError::EndOfStream);
        }
        let n = state.copy_out(dst);
        Ok(state.consume(n))
    }

    /// Copy out the whole buffered window together with the closed flag
    pub(crate) fn window(&self) -> Window {
        let state = self.state.lock();
        let mut bytes = vec![0u8; state.len];
        state.copy_out(&mut bytes);
        Window {
            bytes,
            closed: state.closed,
        }
    }

    /// Physical size of the storage
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity()
    }

    /// Number of buffered bytes
    pub fn len(&self) -> usize {
        self.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Forbid further writes and release the wake-up signal.
    ///
    /// Listeners still receive a pulse that was pending, then see the
    /// channel disconnect. Buffered bytes stay readable until drained.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.notify.take();
    }

    /// Handle that receives a pulse whenever there may be something to read.
    ///
    /// Pulses coalesce: several writes before the listener wakes up leave a
    /// single pending pulse. Treat a pulse as "check again", never as a
    /// count of writes.
    pub fn listen(&self) -> Receiver<()> {
        self.listener.clone()
    }
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RingBuffer")
            .field("storage", &hex::encode(&state.storage))
            .field("cursor", &state.cursor)
            .field("len", &state.len)
            .field("closed", &state.closed)
            .field("policy", &self.policy)
            .finish()
    }
}

impl io::Write for &RingBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        RingBuffer::write(*self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Read for &RingBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match RingBuffer::read(*self, buf) {
            Ok(n) => Ok(n),
            Err(RingBufferError::EndOfStream) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}
