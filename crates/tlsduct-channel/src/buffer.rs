//! Growable byte buffers with a capacity ceiling, backed by pluggable
//! allocators.
//!
//! Each holder owns at most one allocation. Filled bytes occupy `[0..len)`;
//! the rest of the allocation is spare capacity for the engine or the
//! transport to write into. Holders marked as carrying plain data zeroize
//! contents before any buffer leaves them.

use std::fmt;
use std::sync::Arc;

use tracing::trace;
use zeroize::Zeroize;

use crate::bufferset::PlainSink;
use tlsduct_types::EngineError;

/// Supplies and recycles raw byte buffers.
///
/// Implementations may pool. Buffers handed to `free` by a plain-data
/// holder have already been wiped.
pub trait BufferAllocator: Send + Sync {
    /// Allocate a zero-filled buffer of exactly `capacity` bytes.
    fn allocate(&self, capacity: usize) -> Vec<u8>;
    /// Accept back a buffer previously obtained from `allocate`.
    fn free(&self, buffer: Vec<u8>);
}

/// Plain heap allocator; `free` drops the buffer.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
    fn allocate(&self, capacity: usize) -> Vec<u8> {
        vec![0; capacity]
    }

    fn free(&self, _buffer: Vec<u8>) {}
}

/// One growable buffer plus the bookkeeping to prepare, release, grow and
/// dispose it.
pub(crate) struct BufferHolder {
    name: &'static str,
    buffer: Option<Vec<u8>>,
    len: usize,
    allocator: Arc<dyn BufferAllocator>,
    initial_size: usize,
    max_size: usize,
    plain_data: bool,
    opportunistic_release: bool,
}

impl BufferHolder {
    pub(crate) fn new(
        name: &'static str,
        allocator: Arc<dyn BufferAllocator>,
        initial_size: usize,
        max_size: usize,
        plain_data: bool,
        opportunistic_release: bool,
    ) -> Self {
        Self {
            name,
            buffer: None,
            len: 0,
            allocator,
            initial_size,
            max_size,
            plain_data,
            opportunistic_release,
        }
    }

    /// Allocate the buffer if absent.
    pub(crate) fn prepare(&mut self) {
        if self.buffer.is_none() {
            self.buffer = Some(self.allocator.allocate(self.initial_size));
            self.len = 0;
        }
    }

    /// Hand the buffer back to the allocator if it is present and empty.
    /// Returns whether the buffer was given back.
    pub(crate) fn release(&mut self) -> bool {
        if self.opportunistic_release && self.len == 0 {
            if let Some(mut buffer) = self.buffer.take() {
                if self.plain_data {
                    buffer.zeroize();
                }
                self.allocator.free(buffer);
                trace!(buffer = self.name, "released");
                return true;
            }
        }
        false
    }

    /// Grow geometrically toward the ceiling. Fails once the ceiling has
    /// been reached.
    pub(crate) fn enlarge(&mut self) -> Result<(), EngineError> {
        let capacity = self.capacity();
        if capacity >= self.max_size {
            return Err(EngineError::Internal(format!(
                "buffer {} already at maximum capacity ({capacity})",
                self.name
            )));
        }
        self.reallocate((capacity * 2).min(self.max_size));
        Ok(())
    }

    /// Grow so that capacity is at least `at_least`, capped at the ceiling.
    pub(crate) fn resize(&mut self, at_least: usize) {
        let target = at_least.min(self.max_size);
        if self.capacity() < target {
            self.reallocate(target);
        }
    }

    fn reallocate(&mut self, new_capacity: usize) {
        let old = self.buffer.take();
        let mut new = self.allocator.allocate(new_capacity);
        if let Some(mut old) = old {
            new[..self.len].copy_from_slice(&old[..self.len]);
            trace!(
                buffer = self.name,
                from = old.len(),
                to = new_capacity,
                "buffer grown"
            );
            if self.plain_data {
                old.zeroize();
            }
            self.allocator.free(old);
        }
        self.buffer = Some(new);
    }

    /// Wipe everything past the filled region.
    pub(crate) fn zero_remaining(&mut self) {
        if let Some(buffer) = &mut self.buffer {
            buffer[self.len..].zeroize();
        }
    }

    /// Drop the buffer unconditionally, wiping plain data first.
    pub(crate) fn dispose(&mut self) {
        if let Some(mut buffer) = self.buffer.take() {
            if self.plain_data {
                buffer.zeroize();
            }
            self.allocator.free(buffer);
            self.len = 0;
        }
    }

    pub(crate) fn null_or_empty(&self) -> bool {
        self.buffer.is_none() || self.len == 0
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn capacity(&self) -> usize {
        self.buffer.as_ref().map_or(0, Vec::len)
    }

    pub(crate) fn spare_capacity(&self) -> usize {
        self.capacity() - self.len
    }

    /// The filled region.
    pub(crate) fn filled(&self) -> &[u8] {
        match self.buffer.as_deref() {
            Some(buffer) => &buffer[..self.len],
            None => &[],
        }
    }

    /// The spare region, for the engine or the transport to write into.
    pub(crate) fn spare_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        match self.buffer.as_deref_mut() {
            Some(buffer) => &mut buffer[len..],
            None => &mut [],
        }
    }

    /// Record that `n` bytes of the spare region were filled.
    pub(crate) fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.spare_capacity());
        self.len += n;
    }

    /// Drop the first `n` filled bytes, sliding the rest to the front.
    pub(crate) fn discard_front(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        if n == 0 {
            return;
        }
        if let Some(buffer) = &mut self.buffer {
            buffer.copy_within(n..self.len, 0);
        }
        self.len -= n;
    }
}

/// `in_plain` doubles as an unwrap destination: the engine scatters
/// decrypted bytes into its spare region.
impl PlainSink for BufferHolder {
    fn remaining(&self) -> usize {
        self.spare_capacity()
    }

    fn put(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.spare_capacity());
        self.spare_mut()[..n].copy_from_slice(&src[..n]);
        self.advance(n);
        n
    }
}

impl fmt::Debug for BufferHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHolder")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}
