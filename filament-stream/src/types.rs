//! Core identifier, direction, and status types for the stream layer.

use core::fmt;

/// Opaque per-stream reference issued by the transport engine.
///
/// The engine owns the meaning of the value; this layer only uses it as a
/// routing key for control calls and event dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Direction of a stream, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    /// Both sides may send and receive.
    Bidirectional,

    /// Only the initiating side may send.
    Unidirectional,
}

/// Shutdown kinds accepted by the engine control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    /// Finish the send side gracefully; all queued data is still delivered.
    Graceful,

    /// Abort the receive side. No further receive events will be acted on.
    AbortReceive,

    /// Abort the send side. The peer sees its read side aborted.
    AbortSend,

    /// Abort both directions.
    Abort,
}

/// Non-success status code returned by an engine control operation.
///
/// The engine defines the code space; this layer treats any status as an
/// opaque failure and surfaces it unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStatus(pub u32);

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}
