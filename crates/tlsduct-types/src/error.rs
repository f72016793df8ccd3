//! Error taxonomy for the TLS channel.
//!
//! Four of the variants are not failures but retry signals: the channel is
//! usable with non-blocking transports, and `NeedsRead` / `NeedsWrite` /
//! `NeedsTask` / `NeedsHandshake` ask the caller to supply an input
//! condition (transport readiness, a run task, a completed handshake) and
//! then retry the same operation.

use std::fmt;

/// A handshake task the engine delegated to the caller.
///
/// Carried by [`ChannelError::NeedsTask`] when the channel was configured
/// not to run tasks inline. The session makes no progress until the task
/// has been run and the operation is retried.
pub struct DelegatedTask(Box<dyn FnOnce() + Send>);

impl DelegatedTask {
    pub fn new(task: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(task))
    }

    /// Run the task to completion.
    pub fn run(self) {
        (self.0)()
    }
}

impl fmt::Debug for DelegatedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DelegatedTask")
    }
}

/// Errors reported by a TLS engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Something invalid was produced or received at the TLS level.
    #[error("tls protocol error: {0}")]
    Protocol(String),
    /// The engine or the channel machinery violated an internal invariant.
    #[error("engine internal error: {0}")]
    Internal(String),
}

/// Errors surfaced by channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The transport had no bytes available; retry once it is readable.
    #[error("transport needs a read to proceed")]
    NeedsRead,
    /// The transport accepted no bytes; retry once it is writable.
    #[error("transport needs a write to proceed")]
    NeedsWrite,
    /// A delegated task must be run before retrying.
    #[error("a delegated task must be run to proceed")]
    NeedsTask(DelegatedTask),
    /// Explicit-handshake mode: complete the handshake before reading or
    /// writing.
    #[error("handshake must be completed to proceed")]
    NeedsHandshake,
    /// The channel is invalid or already shut down.
    #[error("channel is closed")]
    Closed,
    /// The engine reported a fatal TLS error; the session is invalid.
    #[error(transparent)]
    Tls(#[from] EngineError),
    /// The session initialization callback failed; the handshake is not
    /// recorded as completed.
    #[error("session initialization callback failed: {0}")]
    Callback(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The transport failed; the session is invalid.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// True for the retry signals, false for real failures.
    pub fn is_would_block(&self) -> bool {
        matches!(
            self,
            ChannelError::NeedsRead
                | ChannelError::NeedsWrite
                | ChannelError::NeedsTask(_)
                | ChannelError::NeedsHandshake
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_channel_error_display() {
        assert_eq!(
            ChannelError::NeedsRead.to_string(),
            "transport needs a read to proceed"
        );
        assert_eq!(
            ChannelError::NeedsWrite.to_string(),
            "transport needs a write to proceed"
        );
        assert_eq!(
            ChannelError::NeedsHandshake.to_string(),
            "handshake must be completed to proceed"
        );
        assert_eq!(ChannelError::Closed.to_string(), "channel is closed");
    }

    #[test]
    fn test_engine_error_display_and_conversion() {
        let e = EngineError::Protocol("bad record mac".into());
        assert_eq!(e.to_string(), "tls protocol error: bad record mac");

        let e: ChannelError = EngineError::Internal("impossible state".into()).into();
        assert_eq!(e.to_string(), "engine internal error: impossible state");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone");
        let e: ChannelError = io.into();
        assert!(e.to_string().contains("pipe gone"), "got: {e}");
        assert!(!e.is_would_block());
    }

    #[test]
    fn test_would_block_classification() {
        assert!(ChannelError::NeedsRead.is_would_block());
        assert!(ChannelError::NeedsWrite.is_would_block());
        assert!(ChannelError::NeedsHandshake.is_would_block());
        assert!(ChannelError::NeedsTask(DelegatedTask::new(|| {})).is_would_block());
        assert!(!ChannelError::Closed.is_would_block());
    }

    #[test]
    fn test_delegated_task_runs() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let task = DelegatedTask::new(move || flag.store(true, Ordering::SeqCst));
        assert_eq!(format!("{task:?}"), "DelegatedTask");
        task.run();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_errors_are_send() {
        fn assert_send<T: Send>() {}
        assert_send::<ChannelError>();
        assert_send::<EngineError>();
        assert_send::<DelegatedTask>();
    }
}
