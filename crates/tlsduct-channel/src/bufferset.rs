//! Uniform views over single buffers and gather/scatter slice arrays.
//!
//! The engine never sees the caller's buffers directly. Plaintext flows out
//! of a [`GatherBuffers`] cursor during `wrap` and into a [`PlainSink`]
//! during `unwrap`; both advance their own position so that a loop of
//! engine calls picks up exactly where the previous call stopped.

/// Destination for plaintext produced by `TlsEngine::unwrap`.
///
/// Implemented by [`ScatterBuffers`] (the caller's destination slices) and
/// by the channel's own decrypted-data buffer.
pub trait PlainSink {
    /// Spare capacity in bytes.
    fn remaining(&self) -> usize;

    fn has_remaining(&self) -> bool {
        self.remaining() > 0
    }

    /// Copy as much of `src` as fits, returning the number of bytes taken.
    fn put(&mut self, src: &[u8]) -> usize;
}

/// Scatter cursor over the caller's destination slices, filled in order.
pub struct ScatterBuffers<'a, 'b> {
    bufs: &'a mut [&'b mut [u8]],
    idx: usize,
    off: usize,
    written: usize,
}

impl<'a, 'b> ScatterBuffers<'a, 'b> {
    pub fn new(bufs: &'a mut [&'b mut [u8]]) -> Self {
        Self {
            bufs,
            idx: 0,
            off: 0,
            written: 0,
        }
    }

    /// Total bytes written through this cursor so far.
    pub fn written(&self) -> usize {
        self.written
    }
}

impl PlainSink for ScatterBuffers<'_, '_> {
    fn remaining(&self) -> usize {
        let ahead: usize = self.bufs[self.idx..].iter().map(|b| b.len()).sum();
        ahead - self.off
    }

    fn put(&mut self, mut src: &[u8]) -> usize {
        let mut total = 0;
        while !src.is_empty() && self.idx < self.bufs.len() {
            let buf = &mut self.bufs[self.idx];
            let space = buf.len() - self.off;
            if space == 0 {
                self.idx += 1;
                self.off = 0;
                continue;
            }
            let n = src.len().min(space);
            buf[self.off..self.off + n].copy_from_slice(&src[..n]);
            self.off += n;
            total += n;
            src = &src[n..];
        }
        self.written += total;
        total
    }
}

/// Gather cursor over the caller's source slices, consumed front to back.
pub struct GatherBuffers<'a, 'b> {
    bufs: &'a [&'b [u8]],
    idx: usize,
    off: usize,
    consumed: usize,
}

impl<'a, 'b> GatherBuffers<'a, 'b> {
    pub fn new(bufs: &'a [&'b [u8]]) -> Self {
        Self {
            bufs,
            idx: 0,
            off: 0,
            consumed: 0,
        }
    }

    /// The zero-length source used for handshake wrap calls, which read no
    /// application data.
    pub fn empty() -> GatherBuffers<'static, 'static> {
        GatherBuffers::new(&[])
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        let ahead: usize = self.bufs[self.idx..].iter().map(|b| b.len()).sum();
        ahead - self.off
    }

    pub fn has_remaining(&self) -> bool {
        self.remaining() > 0
    }

    /// Total bytes consumed through this cursor so far.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Copy up to `dst.len()` bytes out, advancing the cursor. Returns the
    /// number of bytes copied.
    pub fn take(&mut self, mut dst: &mut [u8]) -> usize {
        let mut total = 0;
        while !dst.is_empty() && self.idx < self.bufs.len() {
            let buf = self.bufs[self.idx];
            let avail = buf.len() - self.off;
            if avail == 0 {
                self.idx += 1;
                self.off = 0;
                continue;
            }
            let n = dst.len().min(avail);
            dst[..n].copy_from_slice(&buf[self.off..self.off + n]);
            self.off += n;
            total += n;
            dst = &mut dst[n..];
        }
        self.consumed += total;
        total
    }
}
