//! The wrap/unwrap pump: turns a readable/writable transport pair plus a
//! TLS engine into a single encrypted byte channel.
//!
//! Concurrency model: three independent critical sections guard handshake
//! initialization, the read side (reader half, `in_encrypted`, `in_plain`)
//! and the write side (writer half, `out_encrypted`). Acquisition order is
//! always init → read → write. The handshake takes all three; reads take
//! the write lock only while driving a handshake step. The engine sits
//! behind its own leaf lock, held for single calls only. All operations
//! take `&self`, so a channel shared through `Arc` can be read, written and
//! handshaken from distinct threads.

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::buffer::{BufferAllocator, BufferHolder, HeapAllocator};
use crate::bufferset::{GatherBuffers, PlainSink, ScatterBuffers};
use crate::engine::TlsEngine;
use crate::{ChannelError, EngineError, HandshakeStatus, RecordStatus};
use crate::{BUFFERS_INITIAL_SIZE, MAX_TLS_PACKET_SIZE};


/// Callback invoked under the init lock once the initial handshake
/// completes, before the handshake is recorded as negotiated.
///
/// The callback must not re-enter the channel. If it fails, the operation
/// fails with [`ChannelError::Callback`] and the handshake is not recorded
/// as completed; a later `handshake()` runs it again.
pub type SessionInitCallback<E> =
    Box<dyn Fn(&E) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

/// Construction-time options for [`TlsChannel`].
pub struct ChannelOptions<E> {
    /// When true, `read`/`write` fail with [`ChannelError::NeedsHandshake`]
    /// until `handshake()` has been called; when false they drive the
    /// handshake implicitly.
    pub explicit_handshake: bool,
    /// When true, engine-delegated tasks run inline on the calling thread;
    /// when false they surface as [`ChannelError::NeedsTask`].
    pub run_tasks: bool,
    /// When true, `close()` waits for the peer's close_notify after sending
    /// ours.
    pub wait_for_close_confirmation: bool,
    /// When true, internal buffers are handed back to their allocator
    /// whenever they are empty between operations.
    pub release_buffers: bool,
    /// Allocator for the decrypted-data buffer (zeroed before release).
    pub plain_allocator: Arc<dyn BufferAllocator>,
    /// Allocator for the two encrypted-data buffers.
    pub encrypted_allocator: Arc<dyn BufferAllocator>,
    /// Session initialization callback.
    pub session_init: SessionInitCallback<E>,
}

impl<E> Default for ChannelOptions<E> {
    fn default() -> Self {
        Self {
            explicit_handshake: false,
            run_tasks: true,
            wait_for_close_confirmation: false,
            release_buffers: true,
            plain_allocator: Arc::new(HeapAllocator),
            encrypted_allocator: Arc::new(HeapAllocator),
            session_init: Box::new(|_| Ok(())),
        }
    }
}

/// End-of-stream from the transport, distinct from failures: converted to a
/// graceful `Ok(0)` by `read` and to [`ChannelError::Closed`] elsewhere.
enum PumpError {
    Eof,
    Fail(ChannelError),
}

impl PumpError {
    fn eof_is_closed(self) -> ChannelError {
        match self {
            PumpError::Eof => ChannelError::Closed,
            PumpError::Fail(e) => e,
        }
    }
}

impl From<ChannelError> for PumpError {
    fn from(e: ChannelError) -> Self {
        PumpError::Fail(e)
    }
}

impl From<EngineError> for PumpError {
    fn from(e: EngineError) -> Self {
        PumpError::Fail(e.into())
    }
}

struct UnwrapResult {
    bytes_produced: usize,
    status: HandshakeStatus,
    was_closed: bool,
}

struct WrapResult {
    bytes_consumed: usize,
    #[allow(dead_code)]
    status: HandshakeStatus,
}

/// Read-side state: the reader half and the two inbound buffers.
struct ReadState<R> {
    channel: Option<R>,
    in_encrypted: BufferHolder,
    in_plain: BufferHolder,
}

/// Write-side state: the writer half and the outbound buffer.
struct WriteState<W> {
    channel: Option<W>,
    out_encrypted: BufferHolder,
}

/// Unwrap destination selector. `InPlain` is resolved against the live
/// `in_plain` holder on every engine call, so a reallocation mid-loop (on
/// `BufferOverflow`) is always observed.
enum Sink<'c, 'a, 'b> {
    User(&'c mut ScatterBuffers<'a, 'b>),
    InPlain,
}

/// An encrypted byte channel over a transport pair, driven by a TLS engine.
///
/// `R` and `W` are the plain transport halves. A read returning `Ok(0)`
/// means end-of-stream; a read or write raising
/// `ErrorKind::WouldBlock` (or a write accepting zero bytes) surfaces as
/// [`ChannelError::NeedsRead`] / [`ChannelError::NeedsWrite`], after which
/// the same operation can be retried once the transport is ready.
pub struct TlsChannel<R, W, E: TlsEngine> {
    read: Mutex<ReadState<R>>,
    write: Mutex<WriteState<W>>,
    engine: Mutex<E>,
    init: Mutex<()>,
    negotiated: AtomicBool,
    handshaking: AtomicBool,
    invalid: AtomicBool,
    shutdown_sent: AtomicBool,
    shutdown_received: AtomicBool,
    explicit_handshake: bool,
    run_tasks: bool,
    wait_for_close_confirmation: bool,
    session_init: SessionInitCallback<E>,
}

impl<R: Read, W: Write, E: TlsEngine> TlsChannel<R, W, E> {
    pub fn new(reader: R, writer: W, engine: E, options: ChannelOptions<E>) -> Self {
        let release = options.release_buffers;
        Self {
            read: Mutex::new(ReadState {
                channel: Some(reader),
                in_encrypted: BufferHolder::new(
                    "in_encrypted",
                    options.encrypted_allocator.clone(),
                    BUFFERS_INITIAL_SIZE,
                    MAX_TLS_PACKET_SIZE,
                    false,
                    release,
                ),
                in_plain: BufferHolder::new(
                    "in_plain",
                    options.plain_allocator,
                    BUFFERS_INITIAL_SIZE,
                    MAX_TLS_PACKET_SIZE,
                    true,
                    release,
                ),
            }),
            write: Mutex::new(WriteState {
                channel: Some(writer),
                out_encrypted: BufferHolder::new(
                    "out_encrypted",
                    options.encrypted_allocator,
                    BUFFERS_INITIAL_SIZE,
                    MAX_TLS_PACKET_SIZE,
                    false,
                    release,
                ),
            }),
            engine: Mutex::new(engine),
            init: Mutex::new(()),
            negotiated: AtomicBool::new(false),
            handshaking: AtomicBool::new(false),
            invalid: AtomicBool::new(false),
            shutdown_sent: AtomicBool::new(false),
            shutdown_received: AtomicBool::new(false),
            explicit_handshake: options.explicit_handshake,
            run_tasks: options.run_tasks,
            wait_for_close_confirmation: options.wait_for_close_confirmation,
            session_init: options.session_init,
        }
    }

    // ========================================================================
    // Read path
    // ========================================================================

    /// Read decrypted bytes into `dst`. Returns the number of bytes read,
    /// with `Ok(0)` meaning end-of-stream (or an empty `dst`).
    pub fn read(&self, dst: &mut [u8]) -> Result<usize, ChannelError> {
        let mut bufs: [&mut [u8]; 1] = [dst];
        self.read_vectored(&mut bufs)
    }

    /// Read decrypted bytes, scattering them over `dsts` in order.
    pub fn read_vectored(&self, dsts: &mut [&mut [u8]]) -> Result<usize, ChannelError> {
        if dsts.iter().map(|b| b.len()).sum::<usize>() == 0 {
            return Ok(0);
        }
        if !self.explicit_handshake {
            self.handshake()?;
        }
        let mut rs = self.read.lock();
        if self.invalid.load(Ordering::SeqCst) || self.shutdown_sent.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let status = self.engine_status();
        self.check_explicit_handshake(status)?;
        let mut cursor = ScatterBuffers::new(dsts);
        match self.read_locked(&mut rs, &mut cursor, status) {
            Ok(n) => Ok(n),
            Err(PumpError::Eof) => Ok(0),
            Err(PumpError::Fail(e)) => Err(e),
        }
    }

    fn read_locked(
        &self,
        rs: &mut ReadState<R>,
        cursor: &mut ScatterBuffers<'_, '_>,
        mut status: HandshakeStatus,
    ) -> Result<usize, PumpError> {
        let mut bytes_to_return = rs.in_plain.len();
        loop {
            if bytes_to_return > 0 {
                // Either the engine scattered directly into the caller's
                // buffers, or the bytes are pending in in_plain.
                if rs.in_plain.null_or_empty() {
                    return Ok(bytes_to_return);
                }
                return Ok(self.transfer_pending_plain(rs, cursor));
            }
            if self.shutdown_received.load(Ordering::SeqCst) {
                return Ok(0);
            }
            debug_assert!(rs.in_plain.null_or_empty());
            match status {
                HandshakeStatus::NeedUnwrap | HandshakeStatus::NeedWrap => {
                    let mut ws = self.write.lock();
                    bytes_to_return = {
                        let mut sink = Sink::User(&mut *cursor);
                        self.handshake_locked(rs, &mut ws, &mut sink, false)?
                    };
                    status = HandshakeStatus::NotHandshaking;
                }
                HandshakeStatus::NotHandshaking | HandshakeStatus::Finished => {
                    let result = {
                        let mut sink = Sink::User(&mut *cursor);
                        self.read_and_unwrap(rs, &mut sink)?
                    };
                    if result.was_closed {
                        return Ok(0);
                    }
                    bytes_to_return = result.bytes_produced;
                    status = result.status;
                }
                HandshakeStatus::NeedTask => {
                    self.handle_task().map_err(PumpError::Fail)?;
                    status = self.engine_status();
                }
            }
        }
    }

    /// Move pending decrypted bytes to the caller, then give the buffer back
    /// to its pool if drained, wiping whatever stayed behind.
    fn transfer_pending_plain(
        &self,
        rs: &mut ReadState<R>,
        cursor: &mut ScatterBuffers<'_, '_>,
    ) -> usize {
        let n = cursor.put(rs.in_plain.filled());
        rs.in_plain.discard_front(n);
        let disposed = rs.in_plain.release();
        if !disposed {
            rs.in_plain.zero_remaining();
        }
        n
    }

    // ========================================================================
    // Write path
    // ========================================================================

    /// Encrypt and send bytes from `src`. Returns the number of source
    /// bytes consumed.
    ///
    /// With a non-blocking transport the count can be short: consumed bytes
    /// whose records did not fully flush stay buffered, and any later write
    /// (including a zero-length one) flushes them before consuming more.
    /// [`ChannelError::NeedsWrite`] is raised only when nothing was
    /// consumed.
    pub fn write(&self, src: &[u8]) -> Result<usize, ChannelError> {
        self.write_vectored(&[src])
    }

    /// Encrypt and send bytes gathered from `srcs` in order.
    pub fn write_vectored(&self, srcs: &[&[u8]]) -> Result<usize, ChannelError> {
        if !self.explicit_handshake {
            self.handshake()?;
        }
        let mut ws = self.write.lock();
        if self.invalid.load(Ordering::SeqCst) || self.shutdown_sent.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        self.check_explicit_handshake(self.engine_status())?;
        let mut source = GatherBuffers::new(srcs);
        self.wrap_and_write(&mut ws, &mut source)
    }

    fn wrap_and_write(
        &self,
        ws: &mut WriteState<W>,
        source: &mut GatherBuffers<'_, '_>,
    ) -> Result<usize, ChannelError> {
        let bytes_to_consume = source.remaining();
        let mut bytes_consumed = 0;
        ws.out_encrypted.prepare();
        // A zero-remaining source still enters once, flushing records left
        // over from an interrupted write.
        let result = loop {
            match self.write_to_channel(ws) {
                Ok(()) => {}
                Err(ChannelError::NeedsWrite) if bytes_consumed > 0 => break Ok(bytes_consumed),
                Err(e) => break Err(e),
            }
            if bytes_consumed == bytes_to_consume {
                break Ok(bytes_consumed);
            }
            match self.wrap_loop(ws, source) {
                Ok(wrap) => bytes_consumed += wrap.bytes_consumed,
                Err(e) => break Err(e),
            }
        };
        ws.out_encrypted.release();
        result
    }

    // ========================================================================
    // Engine pump
    // ========================================================================

    fn engine_status(&self) -> HandshakeStatus {
        self.engine.lock().handshake_status()
    }

    fn check_explicit_handshake(&self, status: HandshakeStatus) -> Result<(), ChannelError> {
        if status.is_active() && self.explicit_handshake {
            return Err(ChannelError::NeedsHandshake);
        }
        Ok(())
    }

    /// Call the engine's unwrap until it produces bytes, runs out of record
    /// bytes, reports the peer's close, or changes handshake status.
    fn unwrap_loop(
        &self,
        rs: &mut ReadState<R>,
        sink: &mut Sink<'_, '_, '_>,
        orig: HandshakeStatus,
    ) -> Result<UnwrapResult, ChannelError> {
        loop {
            debug_assert!(rs.in_plain.null_or_empty());
            let ReadState {
                in_encrypted,
                in_plain,
                ..
            } = rs;
            let call = {
                let mut engine = self.engine.lock();
                let result = match sink {
                    Sink::User(cursor) => engine.unwrap(in_encrypted.filled(), &mut **cursor),
                    Sink::InPlain => {
                        in_plain.prepare();
                        engine.unwrap(in_encrypted.filled(), in_plain)
                    }
                };
                match result {
                    Ok(call) => call,
                    Err(e) => {
                        self.invalid.store(true, Ordering::SeqCst);
                        return Err(e.into());
                    }
                }
            };
            in_encrypted.discard_front(call.bytes_consumed);
            trace!(
                consumed = call.bytes_consumed,
                produced = call.bytes_produced,
                status = ?call.status,
                handshake = ?call.handshake,
                "engine unwrap"
            );
            // Data can be produced even alongside an overflow report; in
            // that case just return the data.
            if call.bytes_produced > 0
                || call.status == RecordStatus::BufferUnderflow
                || call.status == RecordStatus::Closed
                || call.handshake != orig
            {
                return Ok(UnwrapResult {
                    bytes_produced: call.bytes_produced,
                    status: call.handshake,
                    was_closed: call.status == RecordStatus::Closed,
                });
            }
            if call.status == RecordStatus::BufferOverflow {
                rs.in_plain.prepare();
                let effective = match sink {
                    Sink::User(cursor) => cursor.remaining(),
                    Sink::InPlain => rs.in_plain.spare_capacity(),
                };
                rs.in_plain
                    .resize((effective * 2).min(MAX_TLS_PACKET_SIZE));
                // in_plain may have moved; resolve it lazily from here on.
                *sink = Sink::InPlain;
            }
        }
    }

    /// Call the engine's wrap until a record fits, growing `out_encrypted`
    /// on overflow.
    fn wrap_loop(
        &self,
        ws: &mut WriteState<W>,
        source: &mut GatherBuffers<'_, '_>,
    ) -> Result<WrapResult, ChannelError> {
        loop {
            let call = {
                let mut engine = self.engine.lock();
                match engine.wrap(source, ws.out_encrypted.spare_mut()) {
                    Ok(call) => call,
                    Err(e) => {
                        self.invalid.store(true, Ordering::SeqCst);
                        return Err(e.into());
                    }
                }
            };
            ws.out_encrypted.advance(call.bytes_produced);
            trace!(
                consumed = call.bytes_consumed,
                produced = call.bytes_produced,
                status = ?call.status,
                handshake = ?call.handshake,
                "engine wrap"
            );
            match call.status {
                RecordStatus::Ok | RecordStatus::Closed => {
                    return Ok(WrapResult {
                        bytes_consumed: call.bytes_consumed,
                        status: call.handshake,
                    });
                }
                RecordStatus::BufferOverflow => {
                    debug_assert_eq!(call.bytes_consumed, 0);
                    self.enlarge(&mut ws.out_encrypted)?;
                }
                RecordStatus::BufferUnderflow => {
                    self.invalid.store(true, Ordering::SeqCst);
                    return Err(ChannelError::Tls(EngineError::Internal(
                        "buffer underflow reported by wrap".into(),
                    )));
                }
            }
        }
    }

    fn enlarge(&self, holder: &mut BufferHolder) -> Result<(), ChannelError> {
        holder.enlarge().map_err(|e| {
            self.invalid.store(true, Ordering::SeqCst);
            ChannelError::Tls(e)
        })
    }

    /// Alternate transport reads and unwraps until the engine makes
    /// progress of any kind.
    fn read_and_unwrap(
        &self,
        rs: &mut ReadState<R>,
        sink: &mut Sink<'_, '_, '_>,
    ) -> Result<UnwrapResult, PumpError> {
        // The pre-operation status tells unwrap_loop when a status change
        // means the handshake moved and control must return to the driver.
        let orig = self.engine_status();
        rs.in_encrypted.prepare();
        let result = self.read_and_unwrap_loop(rs, sink, orig);
        rs.in_encrypted.release();
        result
    }

    fn read_and_unwrap_loop(
        &self,
        rs: &mut ReadState<R>,
        sink: &mut Sink<'_, '_, '_>,
        orig: HandshakeStatus,
    ) -> Result<UnwrapResult, PumpError> {
        loop {
            debug_assert!(rs.in_plain.null_or_empty());
            let result = self.unwrap_loop(rs, sink, orig).map_err(PumpError::Fail)?;
            if result.bytes_produced > 0 || result.status != orig || result.was_closed {
                if result.was_closed {
                    self.shutdown_received.store(true, Ordering::SeqCst);
                }
                return Ok(result);
            }
            if rs.in_encrypted.spare_capacity() == 0 {
                self.enlarge(&mut rs.in_encrypted).map_err(PumpError::Fail)?;
            }
            self.read_from_channel(rs)?;
        }
    }

    fn read_from_channel(&self, rs: &mut ReadState<R>) -> Result<usize, PumpError> {
        let ReadState {
            channel,
            in_encrypted,
            ..
        } = rs;
        let reader = channel
            .as_mut()
            .ok_or(PumpError::Fail(ChannelError::Closed))?;
        debug_assert!(in_encrypted.spare_capacity() > 0);
        loop {
            trace!("reading from transport");
            match reader.read(in_encrypted.spare_mut()) {
                Ok(0) => return Err(PumpError::Eof),
                Ok(n) => {
                    in_encrypted.advance(n);
                    trace!(bytes = n, "read from transport");
                    return Ok(n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    return Err(PumpError::Fail(ChannelError::NeedsRead));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.invalid.store(true, Ordering::SeqCst);
                    return Err(PumpError::Fail(ChannelError::Io(e)));
                }
            }
        }
    }

    /// Flush `out_encrypted` completely, or raise `NeedsWrite` if the
    /// transport stops accepting bytes.
    fn write_to_channel(&self, ws: &mut WriteState<W>) -> Result<(), ChannelError> {
        if ws.out_encrypted.len() == 0 {
            return Ok(());
        }
        let WriteState {
            channel,
            out_encrypted,
        } = ws;
        let writer = channel.as_mut().ok_or(ChannelError::Closed)?;
        let mut written = 0;
        let result = loop {
            let pending = &out_encrypted.filled()[written..];
            if pending.is_empty() {
                break Ok(());
            }
            trace!(bytes = pending.len(), "writing to transport");
            match writer.write(pending) {
                Ok(0) => break Err(ChannelError::NeedsWrite),
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    break Err(ChannelError::NeedsWrite);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.invalid.store(true, Ordering::SeqCst);
                    break Err(ChannelError::Io(e));
                }
            }
        };
        out_encrypted.discard_front(written);
        result
    }

    fn handle_task(&self) -> Result<(), ChannelError> {
        let task = self.engine.lock().delegated_task();
        let Some(task) = task else {
            return Err(ChannelError::Tls(EngineError::Internal(
                "engine reported a pending task but supplied none".into(),
            )));
        };
        if self.run_tasks {
            trace!("running delegated task inline");
            task.run();
            Ok(())
        } else {
            Err(ChannelError::NeedsTask(task))
        }
    }

    // ========================================================================
    // Handshake driver
    // ========================================================================

    /// Negotiate the session if that has not been done yet.
    pub fn handshake(&self) -> Result<(), ChannelError> {
        self.do_handshake(false).map_err(PumpError::eof_is_closed)
    }

    /// Force a new negotiation.
    ///
    /// Renegotiation was removed in TLS 1.3; engines do not necessarily
    /// check, so the gate lives here. The comparison is lexicographic over
    /// protocol names, which holds for "TLSv1" through "TLSv1.4".
    pub fn renegotiate(&self) -> Result<(), ChannelError> {
        {
            let engine = self.engine.lock();
            if let Some(protocol) = engine.protocol() {
                if protocol >= "TLSv1.3" {
                    return Err(ChannelError::Tls(EngineError::Protocol(
                        "renegotiation not supported in TLS 1.3 or later".into(),
                    )));
                }
            }
        }
        self.do_handshake(true).map_err(PumpError::eof_is_closed)
    }

    fn do_handshake(&self, force: bool) -> Result<(), PumpError> {
        if !force && self.negotiated.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _init = self.init.lock();
        if self.invalid.load(Ordering::SeqCst) || self.shutdown_sent.load(Ordering::SeqCst) {
            return Err(PumpError::Fail(ChannelError::Closed));
        }
        if force || !self.negotiated.load(Ordering::SeqCst) {
            {
                let mut rs = self.read.lock();
                let mut ws = self.write.lock();
                let mut sink = Sink::InPlain;
                self.handshake_locked(&mut rs, &mut ws, &mut sink, force)?;
            }
            {
                let engine = self.engine.lock();
                (self.session_init)(&engine)
                    .map_err(|e| PumpError::Fail(ChannelError::Callback(e)))?;
            }
            // Only a successful callback records the negotiation.
            self.negotiated.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Run the handshake pump. Caller holds the read and write locks.
    fn handshake_locked(
        &self,
        rs: &mut ReadState<R>,
        ws: &mut WriteState<W>,
        sink: &mut Sink<'_, '_, '_>,
        force: bool,
    ) -> Result<usize, PumpError> {
        ws.out_encrypted.prepare();
        let result = self.do_work_loop(rs, ws, sink, force);
        ws.out_encrypted.release();
        result
    }

    fn do_work_loop(
        &self,
        rs: &mut ReadState<R>,
        ws: &mut WriteState<W>,
        sink: &mut Sink<'_, '_, '_>,
        force: bool,
    ) -> Result<usize, PumpError> {
        let mut step = self.do_work(rs, ws, sink, force)?;
        loop {
            if let Some(bytes_read) = step {
                return Ok(bytes_read);
            }
            step = self.do_work(rs, ws, sink, false)?;
        }
    }

    /// One resumable unit of handshake work. Returns `Some(bytes)` when the
    /// handshake is done (bytes > 0 when a step decrypted application data
    /// for a concurrent read), `None` to keep stepping.
    fn do_work(
        &self,
        rs: &mut ReadState<R>,
        ws: &mut WriteState<W>,
        sink: &mut Sink<'_, '_, '_>,
        force: bool,
    ) -> Result<Option<usize>, PumpError> {
        if !self.handshaking.load(Ordering::SeqCst) {
            if force || !self.negotiated.load(Ordering::SeqCst) {
                trace!("begin handshake");
                self.engine
                    .lock()
                    .begin_handshake()
                    .map_err(|e| PumpError::Fail(e.into()))?;
            }
            debug_assert!(rs.in_plain.null_or_empty());
            // Flush records left over from a step interrupted by NeedsWrite.
            self.write_to_channel(ws).map_err(PumpError::Fail)?;
            self.handshaking.store(true, Ordering::SeqCst);
        }
        let step = self.maybe_handshake_step(rs, ws, sink)?;
        if step.is_some() {
            self.handshaking.store(false, Ordering::SeqCst);
        }
        Ok(step)
    }

    fn maybe_handshake_step(
        &self,
        rs: &mut ReadState<R>,
        ws: &mut WriteState<W>,
        sink: &mut Sink<'_, '_, '_>,
    ) -> Result<Option<usize>, PumpError> {
        let status = self.engine_status();
        if !status.is_active() {
            return Ok(Some(0));
        }
        let (new_status, produced) = self.handshake_step(rs, ws, sink, status)?;
        if new_status == HandshakeStatus::NeedUnwrap && produced > 0 {
            // The step decrypted application data; hand it out so a
            // concurrent read can deliver it.
            return Ok(Some(produced));
        }
        Ok(None)
    }

    fn handshake_step(
        &self,
        rs: &mut ReadState<R>,
        ws: &mut WriteState<W>,
        sink: &mut Sink<'_, '_, '_>,
        status: HandshakeStatus,
    ) -> Result<(HandshakeStatus, usize), PumpError> {
        let mut produced = 0;
        match status {
            HandshakeStatus::NeedWrap => {
                debug_assert!(ws.out_encrypted.null_or_empty());
                self.wrap_loop(ws, &mut GatherBuffers::empty())
                    .map_err(PumpError::Fail)?;
                self.write_to_channel(ws).map_err(PumpError::Fail)?;
            }
            HandshakeStatus::NeedUnwrap => {
                produced = self.read_and_unwrap(rs, sink)?.bytes_produced;
            }
            HandshakeStatus::NeedTask => {
                self.handle_task().map_err(PumpError::Fail)?;
            }
            // A pass-through engine that never encrypts reports these
            // without a FINISHED transition; accept them.
            HandshakeStatus::Finished | HandshakeStatus::NotHandshaking => {}
        }
        Ok((self.engine_status(), produced))
    }

    // ========================================================================
    // Shutdown and close
    // ========================================================================

    /// Drive the close_notify exchange. Returns true once both directions
    /// are shut down.
    ///
    /// The first call sends our close_notify and returns whether the
    /// peer's was already received; a later call reads the peer's reply.
    /// Idempotent once fully shut down.
    pub fn shutdown(&self) -> Result<bool, ChannelError> {
        let mut rs = self.read.lock();
        let mut ws = self.write.lock();
        self.shutdown_locked(&mut rs, &mut ws)
    }

    fn shutdown_locked(
        &self,
        rs: &mut ReadState<R>,
        ws: &mut WriteState<W>,
    ) -> Result<bool, ChannelError> {
        if self.invalid.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        if !self.shutdown_sent.load(Ordering::SeqCst) {
            self.shutdown_sent.store(true, Ordering::SeqCst);
            ws.out_encrypted.prepare();
            let result = self.send_close_notify(ws);
            ws.out_encrypted.release();
            result?;
            // If this side is the first to send close_notify, the caller
            // waits for the response; if it is the second, inbound is
            // already done.
            if self.shutdown_received.load(Ordering::SeqCst) {
                self.free_buffers(rs, ws);
                return Ok(true);
            }
            return Ok(false);
        }
        if !self.shutdown_received.load(Ordering::SeqCst) {
            let result = {
                let mut sink = Sink::InPlain;
                self.read_and_unwrap(rs, &mut sink)
            };
            match result {
                Ok(_) => debug_assert!(self.shutdown_received.load(Ordering::SeqCst)),
                Err(e) => return Err(e.eof_is_closed()),
            }
        }
        self.free_buffers(rs, ws);
        Ok(true)
    }

    fn send_close_notify(&self, ws: &mut WriteState<W>) -> Result<(), ChannelError> {
        self.write_to_channel(ws)?;
        self.engine.lock().close_outbound();
        self.wrap_loop(ws, &mut GatherBuffers::empty())?;
        self.write_to_channel(ws)
    }

    /// Close the channel: best-effort TLS shutdown, then drop both
    /// transport halves and free all buffers. Never fails; shutdown errors
    /// are logged and discarded.
    pub fn close(&self) {
        self.try_shutdown();
        let mut rs = self.read.lock();
        let mut ws = self.write.lock();
        rs.channel = None;
        ws.channel = None;
        self.free_buffers(&mut rs, &mut ws);
    }

    fn try_shutdown(&self) {
        let Some(mut rs) = self.read.try_lock() else {
            return;
        };
        let Some(mut ws) = self.write.try_lock() else {
            return;
        };
        if !self.shutdown_sent.load(Ordering::SeqCst) {
            match self.shutdown_locked(&mut rs, &mut ws) {
                Ok(false) if self.wait_for_close_confirmation => {
                    if let Err(e) = self.shutdown_locked(&mut rs, &mut ws) {
                        debug!(error = %e, "shutdown on close failed, continuing");
                    }
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "shutdown on close failed, continuing"),
            }
        }
    }

    fn free_buffers(&self, rs: &mut ReadState<R>, ws: &mut WriteState<W>) {
        rs.in_encrypted.dispose();
        rs.in_plain.dispose();
        ws.out_encrypted.dispose();
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// False once the channel was invalidated or `close()` was called.
    pub fn is_open(&self) -> bool {
        !self.invalid.load(Ordering::SeqCst)
            && self.read.lock().channel.is_some()
            && self.write.lock().channel.is_some()
    }

    /// Whether our close_notify has been sent.
    pub fn shutdown_sent(&self) -> bool {
        self.shutdown_sent.load(Ordering::SeqCst)
    }

    /// Whether the peer's close_notify has been received.
    pub fn shutdown_received(&self) -> bool {
        self.shutdown_received.load(Ordering::SeqCst)
    }

    /// Whether engine-delegated tasks run inline.
    pub fn runs_tasks(&self) -> bool {
        self.run_tasks
    }

    /// Exclusive access to the engine.
    pub fn engine(&self) -> MutexGuard<'_, E> {
        self.engine.lock()
    }

    pub fn session_init_callback(&self) -> &SessionInitCallback<E> {
        &self.session_init
    }

    /// Access the plain readable transport half, if not yet closed.
    pub fn with_reader<T>(&self, f: impl FnOnce(Option<&mut R>) -> T) -> T {
        f(self.read.lock().channel.as_mut())
    }

    /// Access the plain writable transport half, if not yet closed.
    pub fn with_writer<T>(&self, f: impl FnOnce(Option<&mut W>) -> T) -> T {
        f(self.write.lock().channel.as_mut())
    }
}

// ============================================================================
// std::io integration
// ============================================================================

fn into_io_error(e: ChannelError) -> std::io::Error {
    match e {
        ChannelError::Io(io) => io,
        ChannelError::Closed => std::io::Error::new(ErrorKind::NotConnected, e.to_string()),
        e if e.is_would_block() => std::io::Error::new(ErrorKind::WouldBlock, e.to_string()),
        e => std::io::Error::other(e.to_string()),
    }
}

impl<R: Read, W: Write, E: TlsEngine> Read for &TlsChannel<R, W, E> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        TlsChannel::read(*self, buf).map_err(into_io_error)
    }
}

impl<R: Read, W: Write, E: TlsEngine> Write for &TlsChannel<R, W, E> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        TlsChannel::write(*self, buf).map_err(into_io_error)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        TlsChannel::write_vectored(*self, &[])
            .map(|_| ())
            .map_err(into_io_error)
    }
}

impl<R: Read, W: Write, E: TlsEngine> Read for TlsChannel<R, W, E> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        TlsChannel::read(self, buf).map_err(into_io_error)
    }
}

impl<R: Read, W: Write, E: TlsEngine> Write for TlsChannel<R, W, E> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        TlsChannel::write(self, buf).map_err(into_io_error)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        TlsChannel::write_vectored(self, &[])
            .map(|_| ())
            .map_err(into_io_error)
    }
}
