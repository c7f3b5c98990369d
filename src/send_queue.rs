//! Mutex-guarded outbound byte queue

use crate::{ByteBuffer, Result, TransportError};
use bytes::Bytes;
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

/// Outcome of a non-blocking pop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pop {
    /// Everything that was queued, in order.
    Chunk(Bytes),
    /// Nothing queued.
    Empty,
    /// Another thread holds the queue; try again next cycle.
    Contended,
}

#[derive(Debug)]
pub(crate) struct QueueInner {
    buffer: ByteBuffer,
    open: bool,
}

/// Outbound queue shared between callers (pushing) and the worker (popping).
///
/// The queue is a single [`ByteBuffer`]; a pop hands the worker the whole
/// content at once, so a later [`push_front`](Self::push_front) lands after
/// the chunk already in flight but ahead of everything queued since.
///
/// A closed queue rejects pushes but can still be popped. Closing happens
/// under the queue mutex, so once a drain observes an empty closed queue no
/// accepted byte can appear behind it.
#[derive(Debug)]
pub struct SendQueue {
    inner: Mutex<QueueInner>,
    limit: Option<usize>,
}

impl SendQueue {
    /// Create an open queue. With `limit` set, pushes that would exceed it
    /// are rejected with [`TransportError::SendQueueFull`].
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                buffer: ByteBuffer::new(),
                open: true,
            }),
            limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        // Every critical section is a single buffer mutation, so a poisoned
        // queue still holds a valid buffer.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock for a push of `additional` bytes, checking it is allowed
    fn lock_for_push(&self, additional: usize) -> Result<MutexGuard<'_, QueueInner>> {
        if additional == 0 {
            return Err(TransportError::EmptyPayload);
        }
        let inner = self.lock();
        if !inner.open {
            return Err(TransportError::InvalidState(
                "send queue is closed".to_string(),
            ));
        }
        if let Some(limit) = self.limit {
            let queued = inner.buffer.len();
            if queued.saturating_add(additional) > limit {
                return Err(TransportError::SendQueueFull { queued, limit });
            }
        }
        Ok(inner)
    }

    /// Append bytes at the tail
    pub fn push_back(&self, data: &[u8]) -> Result<()> {
        let mut inner = self.lock_for_push(data.len())?;
        inner.buffer.extend_from_slice(data)
    }

    /// Append an owned chunk at the tail
    pub fn push_back_bytes(&self, data: Bytes) -> Result<()> {
        self.push_back(&data)
    }

    /// Append a header fragment and a payload fragment as one queued unit
    pub fn push_back_framed(&self, head: &[u8], payload: &[u8]) -> Result<()> {
        let mut inner = self.lock_for_push(head.len().saturating_add(payload.len()))?;
        inner.buffer.extend_pair(head, payload)
    }

    /// Insert bytes ahead of everything queued but not yet popped
    pub fn push_front(&self, data: &[u8]) -> Result<()> {
        let mut inner = self.lock_for_push(data.len())?;
        inner.buffer.prepend(data)
    }

    /// Take the queued bytes without waiting for the lock
    pub fn try_pop(&self) -> Pop {
        let mut inner = match self.inner.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Pop::Contended,
        };
        if inner.buffer.is_empty() {
            Pop::Empty
        } else {
            Pop::Chunk(inner.buffer.take_all())
        }
    }

    /// Take the queued bytes, waiting for the lock if necessary
    pub fn pop_force(&self) -> Option<Bytes> {
        let mut inner = self.lock();
        if inner.buffer.is_empty() {
            None
        } else {
            Some(inner.buffer.take_all())
        }
    }

    /// Stop accepting pushes; queued bytes stay poppable
    pub fn close(&self) {
        self.lock().open = false;
    }

    /// Close the queue if nothing is queued. Returns whether it was empty.
    ///
    /// The emptiness check and the close share one critical section, so a
    /// drain that sees `true` can never miss a later push.
    pub fn close_if_empty(&self) -> bool {
        let mut inner = self.lock();
        if inner.buffer.is_empty() {
            inner.open = false;
            true
        } else {
            false
        }
    }

    /// Discard any leftovers and accept pushes again
    pub fn reopen(&self) {
        let mut inner = self.lock();
        inner.buffer.release();
        inner.open = true;
    }

    /// Stop accepting pushes and discard everything queued; returns the
    /// number of bytes dropped
    pub fn close_and_clear(&self) -> usize {
        let mut inner = self.lock();
        inner.open = false;
        let dropped = inner.buffer.len();
        inner.buffer.release();
        dropped
    }

    /// Discard everything queued; returns the number of bytes dropped
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let dropped = inner.buffer.len();
        inner.buffer.release();
        dropped
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    /// Queued bytes
    pub fn len(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().buffer.is_empty()
    }

    /// `(used, allocated)` of the underlying buffer
    pub fn usage(&self) -> (usize, usize) {
        let inner = self.lock();
        (inner.buffer.len(), inner.buffer.capacity())
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    #[cfg(test)]
    pub(crate) fn hold_lock(&self) -> MutexGuard<'_, QueueInner> {
        self.lock()
    }
}
