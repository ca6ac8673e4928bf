//! Error taxonomy for stream operations.
//!
//! Every failure a consumer can observe falls into one of these kinds so
//! callers can distinguish direction misuse, peer aborts, local
//! cancellation, engine control failures, and use-after-dispose.

use thiserror::Error;

use crate::types::EngineStatus;

pub type Result<T> = std::result::Result<T, StreamError>;

#[derive(Error, Debug)]
pub enum StreamError {
    /// The operation is not permitted in the stream's current configuration,
    /// e.g. reading a send-only stream or overlapping two sends.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// The peer aborted its side of the stream.
    #[error("stream aborted by the peer")]
    PeerAborted,

    /// A local cancellation token fired before the operation completed.
    #[error("operation canceled")]
    Canceled,

    /// An engine control call returned a non-success status.
    #[error("engine control call failed with status {0}")]
    Transport(EngineStatus),

    /// The stream was disposed while the operation was pending or before it
    /// was issued.
    #[error("stream has been disposed")]
    Disposed,

    /// A completion was awaited with a token from an already-retired
    /// generation. Indicates a bug in operation serialization.
    #[error("completion awaited for a stale generation")]
    StaleCompletion,
}
