//! Engine status taxonomy: what the engine needs next, and what a single
//! wrap/unwrap call reported.

/// What the TLS engine needs in order to make handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// The engine has records to emit; call `wrap` and flush them.
    NeedWrap,
    /// The engine needs peer records; read from the transport and `unwrap`.
    NeedUnwrap,
    /// A delegated task must run before the handshake can continue.
    NeedTask,
    /// The handshake just completed with this call.
    Finished,
    /// No handshake in progress.
    NotHandshaking,
}

impl HandshakeStatus {
    /// True while the engine is mid-handshake and needs to be driven.
    pub fn is_active(self) -> bool {
        !matches!(self, HandshakeStatus::Finished | HandshakeStatus::NotHandshaking)
    }
}

/// Result status of a single wrap or unwrap call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    /// The call made normal progress.
    Ok,
    /// The engine is closed in this direction (close_notify sent or seen).
    Closed,
    /// The destination cannot hold the output; grow it and retry.
    BufferOverflow,
    /// The source does not hold a complete record; supply more bytes.
    BufferUnderflow,
}

/// Outcome of one engine wrap or unwrap call.
#[derive(Debug, Clone, Copy)]
pub struct EngineCall {
    pub status: RecordStatus,
    pub handshake: HandshakeStatus,
    pub bytes_consumed: usize,
    pub bytes_produced: usize,
}

impl EngineCall {
    /// A call that made normal progress with the given byte counts.
    pub fn ok(handshake: HandshakeStatus, bytes_consumed: usize, bytes_produced: usize) -> Self {
        Self {
            status: RecordStatus::Ok,
            handshake,
            bytes_consumed,
            bytes_produced,
        }
    }

    /// A call that reported `status` without moving any bytes.
    pub fn stalled(status: RecordStatus, handshake: HandshakeStatus) -> Self {
        Self {
            status,
            handshake,
            bytes_consumed: 0,
            bytes_produced: 0,
        }
    }
}
