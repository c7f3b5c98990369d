//! Growable byte region used for both directions of a connection

use crate::{Result, TransportError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// An owned, growable byte buffer with used/allocated tracking and an
/// optional hard size limit.
///
/// `len()` is the used size and `capacity()` the allocated size; growth is
/// handled internally and always keeps `len() <= capacity()`. When a limit is
/// set, no operation ever leaves more than `limit` bytes in the buffer: a
/// growing call that would cross it fails and changes nothing.
#[derive(Debug, Default)]
pub struct ByteBuffer {
    data: BytesMut,
    limit: Option<usize>,
}

impl ByteBuffer {
    /// Create an empty, unbounded buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty, unbounded buffer with preallocated space
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            limit: None,
        }
    }

    /// Create an empty buffer that refuses to hold more than `limit` bytes
    pub fn with_limit(limit: usize) -> Self {
        Self {
            data: BytesMut::new(),
            limit: Some(limit),
        }
    }

    /// Used size in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Allocated size in bytes
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Bytes that can still be added before the limit is hit
    pub fn remaining_until_limit(&self) -> Option<usize> {
        self.limit.map(|limit| limit.saturating_sub(self.data.len()))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Length after adding `additional` bytes, or the reason it is not allowed.
    fn grown_len(&self, additional: usize) -> Result<usize> {
        let attempted = self
            .data
            .len()
            .checked_add(additional)
            .ok_or(TransportError::BufferLimitExceeded {
                limit: self.limit.unwrap_or(usize::MAX),
                attempted: usize::MAX,
            })?;
        match self.limit {
            Some(limit) if attempted > limit => {
                Err(TransportError::BufferLimitExceeded { limit, attempted })
            }
            _ => Ok(attempted),
        }
    }

    /// Append bytes at the tail
    pub fn extend_from_slice(&mut self, data: &[u8]) -> Result<()> {
        self.grown_len(data.len())?;
        self.data.extend_from_slice(data);
        Ok(())
    }

    /// Append a header and a payload as one unit, growing only once
    pub fn extend_pair(&mut self, head: &[u8], payload: &[u8]) -> Result<()> {
        let additional = head
            .len()
            .checked_add(payload.len())
            .ok_or(TransportError::BufferLimitExceeded {
                limit: self.limit.unwrap_or(usize::MAX),
                attempted: usize::MAX,
            })?;
        self.grown_len(additional)?;
        self.data.reserve(additional);
        self.data.put_slice(head);
        self.data.put_slice(payload);
        Ok(())
    }

    /// Insert bytes ahead of everything currently held
    pub fn prepend(&mut self, data: &[u8]) -> Result<()> {
        let new_len = self.grown_len(data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        let mut joined = BytesMut::with_capacity(new_len);
        joined.put_slice(data);
        joined.put_slice(&self.data);
        self.data = joined;
        Ok(())
    }

    /// Remove and return the whole content; the buffer keeps its spare capacity
    pub fn take_all(&mut self) -> Bytes {
        self.data.split().freeze()
    }

    /// Remove and return up to `n` bytes from the front
    pub fn consume(&mut self, n: usize) -> Bytes {
        let n = n.min(self.data.len());
        self.data.split_to(n).freeze()
    }

    /// Drop up to `n` bytes from the front
    pub fn advance(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.advance(n);
    }

    /// Big-endian `u32` at `offset`, if that many bytes are buffered
    pub fn peek_u32_be(&self, offset: usize) -> Option<u32> {
        let end = offset.checked_add(4)?;
        let bytes = self.data.get(offset..end)?;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Forget the content but keep the allocation
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Forget the content and give the allocation back
    pub fn release(&mut self) {
        self.data = BytesMut::new();
    }
}

impl AsRef<[u8]> for ByteBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}
