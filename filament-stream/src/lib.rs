//! Awaitable stream I/O over a callback-driven transport engine.
//!
//! The engine (an external black box) drives all network and cryptographic
//! work and reports progress through per-stream event callbacks delivered on
//! its own threads. This crate bridges that push-style interface to a
//! pull-style, cancellable `write`/`read`/`shutdown_write` API with
//! exactly-once completion semantics and an explicit receive backpressure
//! gate.
//!
//! # Architecture
//!
//! - [`completion::Completion`] — single-slot, generation-counted awaitable
//!   signal, reset and reused per operation.
//! - [`stream::Stream`] — the per-stream completion state machine: four
//!   sub-states under one lock, arbitrating engine events against consumer
//!   calls and their cancellation tokens with a first-writer-wins tie-break.
//! - [`registry::StreamRegistry`] — opaque-token dispatch from engine
//!   callbacks to stream state; events after dispose are a safe lookup miss.
//! - [`engine`] — the control/event contract the engine must satisfy.

#![forbid(unsafe_code)]

pub mod completion;
pub mod engine;
pub mod error;
pub mod registry;
pub mod stream;
pub mod types;

pub use engine::{ControlResult, EventSink, StreamEvent, TransportEngine};
pub use error::{Result, StreamError};
pub use registry::StreamRegistry;
pub use stream::Stream;
pub use types::{EngineStatus, ShutdownKind, StreamDirection, StreamHandle};
