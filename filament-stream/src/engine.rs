//! Control surface and event contract of the external transport engine.
//!
//! The engine is a black box: it owns congestion control, loss recovery, and
//! cryptography. This layer only issues control calls against it and reacts
//! to the typed events it delivers. Events arrive on threads owned by the
//! engine, at any time, including before the consumer has registered
//! interest in the corresponding outcome.

use bytes::Bytes;

use crate::types::{EngineStatus, ShutdownKind, StreamDirection, StreamHandle};

/// Outcome of a fallible engine control call.
pub type ControlResult = std::result::Result<(), EngineStatus>;

/// Control operations the stream layer issues against the engine.
///
/// All methods must be callable from arbitrary threads. Control failures are
/// reported synchronously through the returned status; event-driven outcomes
/// arrive separately through [`StreamEvent`] delivery.
pub trait TransportEngine: Send + Sync {
    /// Open a new locally-initiated stream on the engine's connection.
    fn open(&self, direction: StreamDirection) -> std::result::Result<StreamHandle, EngineStatus>;

    /// Start a locally-initiated stream. Completion is reported via
    /// [`StreamEvent::StartComplete`].
    fn start(&self, handle: StreamHandle) -> ControlResult;

    /// Queue one buffer for sending. The buffer must stay pinned by the
    /// caller until [`StreamEvent::SendComplete`] retires it.
    fn send(&self, handle: StreamHandle, buffer: Bytes) -> ControlResult;

    /// Re-open the receive gate after the consumer drained the previous
    /// chunk. Until this is called the engine delivers no further
    /// [`StreamEvent::Receive`] for the stream.
    fn receive_enable(&self, handle: StreamHandle) -> ControlResult;

    /// Acknowledge consumption of exactly `bytes_consumed` bytes from the
    /// most recently delivered receive chunk.
    fn receive_acknowledge(&self, handle: StreamHandle, bytes_consumed: u64) -> ControlResult;

    /// Shut down one or both directions of the stream.
    fn shutdown(&self, handle: StreamHandle, kind: ShutdownKind, error_code: u64) -> ControlResult;

    /// Release the engine-side stream object. Infallible; events delivered
    /// for a closed handle must be ignorable by the caller.
    fn close(&self, handle: StreamHandle);

    /// Numeric stream identifier. Only valid once the stream has started.
    fn stream_id(&self, handle: StreamHandle) -> std::result::Result<i64, EngineStatus>;
}

/// Typed events delivered by the engine, one callback per stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// An asynchronous start call finished. Only delivered for
    /// locally-initiated streams.
    StartComplete,

    /// One chunk of inbound data, as an ordered run of engine buffers. The
    /// gate closes after delivery; no further `Receive` arrives until the
    /// consumer re-enables it.
    Receive {
        buffers: Vec<Bytes>,
        total_length: u64,
    },

    /// The in-flight send was retired by the engine. `canceled` is set when
    /// the engine dropped the data instead of delivering it.
    SendComplete { canceled: bool },

    /// The peer finished its send side gracefully; reads will drain to EOF.
    PeerSendShutdown,

    /// The peer aborted its send side; reads fail from here on.
    PeerSendAborted,

    /// The peer stopped receiving; future sends may fail at the control
    /// level. Informational.
    PeerReceiveAborted,

    /// A graceful local send-side shutdown finished.
    SendShutdownComplete,

    /// Both directions are fully closed.
    ShutdownComplete,
}

/// Receiver side of the per-stream event callback.
///
/// Implemented by the stream's shared state; the registry dispatches each
/// delivered event to the sink registered for the handle.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: StreamEvent);
}
