#![forbid(unsafe_code)]
#![doc = "Shared error and status vocabulary for the tlsduct TLS channel."]

pub mod error;
pub mod status;

pub use error::{ChannelError, DelegatedTask, EngineError};
pub use status::{EngineCall, HandshakeStatus, RecordStatus};
