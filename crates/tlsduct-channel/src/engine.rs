//! Contract between the channel pump and an external TLS engine.

use crate::bufferset::{GatherBuffers, PlainSink};
use tlsduct_types::{DelegatedTask, EngineCall, EngineError, HandshakeStatus};

/// The opaque TLS state machine driven by [`TlsChannel`].
///
/// The engine owns all cryptography and protocol logic; the channel only
/// moves bytes between it and the transport. All calls are serialized by
/// the channel, so implementations need no internal locking.
///
/// Contract notes:
/// - `wrap` reads plaintext from `src` and writes records into `dst`,
///   reporting both counts. On `BufferOverflow` it must consume nothing.
/// - `unwrap` reads records from `src` and scatters plaintext into `dst`.
///   On `BufferOverflow` and `BufferUnderflow` it must consume nothing.
/// - A fatal error from `wrap` or `unwrap` permanently invalidates the
///   session.
///
/// [`TlsChannel`]: crate::channel::TlsChannel
pub trait TlsEngine: Send {
    /// Start a handshake, or restart one for renegotiation.
    ///
    /// May be called again after an interrupted handshake attempt, before
    /// any record has been exchanged.
    fn begin_handshake(&mut self) -> Result<(), EngineError>;

    /// Encrypt plaintext from `src` into the spare region `dst`.
    fn wrap(
        &mut self,
        src: &mut GatherBuffers<'_, '_>,
        dst: &mut [u8],
    ) -> Result<EngineCall, EngineError>;

    /// Decrypt records from `src`, scattering plaintext into `dst`.
    fn unwrap(&mut self, src: &[u8], dst: &mut dyn PlainSink) -> Result<EngineCall, EngineError>;

    /// What the engine currently needs to make handshake progress.
    fn handshake_status(&self) -> HandshakeStatus;

    /// The next delegated task, when `handshake_status` is `NeedTask`.
    fn delegated_task(&mut self) -> Option<DelegatedTask>;

    /// Signal that no further outbound records will be produced; the next
    /// `wrap` emits the close_notify record.
    fn close_outbound(&mut self);

    /// Negotiated protocol name (for example `"TLSv1.2"`), once the
    /// handshake has produced one.
    fn protocol(&self) -> Option<&str>;
}
