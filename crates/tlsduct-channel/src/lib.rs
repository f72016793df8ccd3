#![forbid(unsafe_code)]
#![doc = "TLS record-layer channel: pumps an external TLS engine over a byte transport."]
//!
//! This crate performs no cryptography. It mediates between an opaque TLS
//! engine (a wrap/unwrap state machine, see [`TlsEngine`]), a transport
//! pair (`std::io::Read` + `std::io::Write`, blocking or non-blocking), and
//! a caller that wants a plain encrypted byte channel ([`TlsChannel`]).
//!
//! With a non-blocking transport, operations never spin: a zero-progress
//! transport call surfaces as [`ChannelError::NeedsRead`] or
//! [`ChannelError::NeedsWrite`], and retrying the same operation once the
//! transport is ready resumes exactly where the pump left off.

pub mod buffer;
pub mod bufferset;
pub mod channel;
pub mod engine;

pub use buffer::{BufferAllocator, HeapAllocator};
pub use bufferset::{GatherBuffers, PlainSink, ScatterBuffers};
pub use channel::{ChannelOptions, SessionInitCallback, TlsChannel};
pub use engine::TlsEngine;
pub use tlsduct_types::{
    ChannelError, DelegatedTask, EngineCall, EngineError, HandshakeStatus, RecordStatus,
};

/// Initial capacity of each of the channel's internal buffers.
pub const BUFFERS_INITIAL_SIZE: usize = 4096;

/// Official TLS max record payload is 2^14 = 16 KiB; allow 1 KiB more for
/// the record overhead.
pub const MAX_TLS_PACKET_SIZE: usize = 17 * 1024;
