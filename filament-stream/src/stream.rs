//! Per-stream completion state machine.
//!
//! One `Stream` owns four sub-state machines (start, read, send, shutdown)
//! behind a single mutex, and arbitrates between engine events arriving on
//! engine threads and consumer calls arriving on arbitrary tasks. The
//! tie-break used throughout is first-writer-wins: under the lock, only the
//! actor that observes a sub-state still in its neutral value performs the
//! transition, and that actor alone signals the matching completion source.
//! This yields exactly one signal per operation even when a callback and a
//! cancellation race.
//!
//! The lock is held only for sub-state critical sections, never across an
//! await, an engine control call, or a completion signal.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::completion::{Completion, Generation};
use crate::engine::{EventSink, StreamEvent, TransportEngine};
use crate::error::{Result, StreamError};
use crate::registry::StreamRegistry;
use crate::types::{ShutdownKind, StreamDirection, StreamHandle};

/// Start progress of a locally-initiated stream. Inbound streams begin
/// `Started`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartState {
    NotStarted,
    Starting,
    Started,
}

/// Read-side sub-state. `Completed` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    /// No chunk pending, no terminal condition. Neutral value for the
    /// first-writer-wins race on the receive source.
    Idle,
    /// One chunk was delivered and awaits draining by `read`.
    ChunkReady,
    /// Peer finished its send side; reads return 0 from here on.
    Completed,
    /// Reads were aborted, by the peer or locally.
    Aborted,
}

/// Send-side sub-state. Neutral value is `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendState {
    Idle,
    /// A cancellation won the race; the operation's late natural event
    /// restores `Idle` without signaling.
    Aborted,
    Finished,
}

/// Shutdown sub-state. Neutral value is `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownState {
    Idle,
    Canceled,
    Finished,
}

struct State {
    start: StartState,
    read: ReadState,
    send: SendState,
    shutdown: ShutdownState,

    /// Chunks delivered by receive events, in delivery order, retained until
    /// copied into a consumer buffer.
    recv_queue: VecDeque<Bytes>,

    /// The single in-flight send buffer. Holding it here keeps the bytes
    /// alive for the engine until `SendComplete` retires the operation.
    send_pin: Option<Bytes>,

    /// Cached numeric identifier, resolved lazily after start.
    stream_id: Option<i64>,

    disposed: bool,
}

/// Shared core of a stream: sub-states plus the three completion sources.
///
/// Registered with the [`StreamRegistry`] as the stream's event sink; kept
/// alive by the registry entry until dispose even if the `Stream` facade is
/// dropped first.
pub(crate) struct StreamShared {
    can_read: bool,
    can_write: bool,
    state: Mutex<State>,

    /// Shared start/send slot: a stream cannot send before it starts, so one
    /// slot serves both operations, one generation each.
    op: Completion<()>,
    /// Receive slot, completed with the total bytes available.
    recv: Completion<u64>,
    /// Shutdown slot.
    shut: Completion<()>,
}

impl StreamShared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventSink for StreamShared {
    fn on_event(&self, event: StreamEvent) {
        trace!(event = ?event, "stream event");
        match event {
            StreamEvent::StartComplete => {
                let signal = {
                    let mut st = self.lock();
                    st.start = StartState::Started;
                    match st.send {
                        SendState::Idle => true,
                        SendState::Aborted => {
                            // The write that triggered the start was
                            // canceled; retire the race and accept the next
                            // write.
                            st.send = SendState::Idle;
                            false
                        }
                        SendState::Finished => false,
                    }
                };
                if signal {
                    self.op.complete(());
                }
            }
            StreamEvent::Receive {
                buffers,
                total_length,
            } => {
                let signal = {
                    let mut st = self.lock();
                    match st.read {
                        ReadState::Completed | ReadState::Aborted => {
                            // Delivery after a terminal read state is a
                            // protocol violation by the engine; ignore it
                            // rather than crash.
                            warn!(read = ?st.read, "ignoring receive event in terminal read state");
                            false
                        }
                        ReadState::Idle => {
                            st.recv_queue.extend(buffers);
                            st.read = ReadState::ChunkReady;
                            true
                        }
                        ReadState::ChunkReady => {
                            // Consumer has not drained yet; data queues.
                            st.recv_queue.extend(buffers);
                            false
                        }
                    }
                };
                if signal {
                    self.recv.complete(total_length);
                }
            }
            StreamEvent::SendComplete { canceled } => {
                if canceled {
                    debug!("engine retired the in-flight send without delivering it");
                }
                let signal = {
                    let mut st = self.lock();
                    st.send_pin = None;
                    match st.send {
                        SendState::Idle => {
                            st.send = SendState::Finished;
                            true
                        }
                        SendState::Aborted => {
                            // Late event for a canceled write: drop the
                            // signal, restore the neutral value.
                            st.send = SendState::Idle;
                            false
                        }
                        SendState::Finished => false,
                    }
                };
                if signal {
                    self.op.complete(());
                }
            }
            StreamEvent::PeerSendShutdown => {
                let signal = {
                    let mut st = self.lock();
                    match st.read {
                        ReadState::Completed | ReadState::Aborted => false,
                        current => {
                            st.read = ReadState::Completed;
                            current == ReadState::Idle
                        }
                    }
                };
                if signal {
                    // EOF: zero bytes available.
                    self.recv.complete(0);
                }
            }
            StreamEvent::PeerSendAborted => {
                let signal = {
                    let mut st = self.lock();
                    match st.read {
                        ReadState::Completed | ReadState::Aborted => false,
                        current => {
                            st.read = ReadState::Aborted;
                            current == ReadState::Idle
                        }
                    }
                };
                if signal {
                    self.recv.complete_err(StreamError::PeerAborted);
                }
            }
            StreamEvent::PeerReceiveAborted => {
                // Informational; future sends fail at the control level.
                debug!("peer aborted its receive side");
            }
            StreamEvent::SendShutdownComplete => {
                let signal = {
                    let mut st = self.lock();
                    if st.shutdown == ShutdownState::Idle {
                        st.shutdown = ShutdownState::Finished;
                        true
                    } else {
                        false
                    }
                };
                if signal {
                    self.shut.complete(());
                }
            }
            StreamEvent::ShutdownComplete => {
                // Terminal bookkeeping only; both directions are closed.
                trace!("stream fully shut down");
            }
        }
    }
}

/// One ordered byte-transport channel multiplexed over a connection.
///
/// Constructed by the connection layer when the engine reports an inbound
/// stream or when the consumer opens an outbound one. Operations take
/// `&self`; a bidirectional stream may be read and written concurrently from
/// different tasks. Serializing reads among themselves and writes among
/// themselves is the consumer's responsibility.
pub struct Stream {
    engine: Arc<dyn TransportEngine>,
    registry: Arc<StreamRegistry>,
    handle: StreamHandle,
    shared: Arc<StreamShared>,
}

impl Stream {
    /// Wrap an engine stream handle.
    ///
    /// `inbound` streams begin started; their readability/writability derives
    /// from the peer's perspective of `direction`.
    pub fn new(
        engine: Arc<dyn TransportEngine>,
        registry: Arc<StreamRegistry>,
        handle: StreamHandle,
        direction: StreamDirection,
        inbound: bool,
    ) -> Self {
        let (can_read, can_write, start) = if inbound {
            (
                true,
                direction == StreamDirection::Bidirectional,
                StartState::Started,
            )
        } else {
            (
                direction == StreamDirection::Bidirectional,
                true,
                StartState::NotStarted,
            )
        };

        let shared = Arc::new(StreamShared {
            can_read,
            can_write,
            state: Mutex::new(State {
                start,
                read: ReadState::Idle,
                send: SendState::Idle,
                shutdown: ShutdownState::Idle,
                recv_queue: VecDeque::new(),
                send_pin: None,
                stream_id: None,
                disposed: false,
            }),
            op: Completion::new(),
            recv: Completion::new(),
            shut: Completion::new(),
        });
        registry.register(handle, shared.clone());

        debug!(stream = %handle, can_read, can_write, inbound, "stream created");

        Self {
            engine,
            registry,
            handle,
            shared,
        }
    }

    pub fn can_read(&self) -> bool {
        self.shared.can_read
    }

    pub fn can_write(&self) -> bool {
        self.shared.can_write
    }

    pub fn handle(&self) -> StreamHandle {
        self.handle
    }

    /// Numeric stream identifier, resolved lazily from the engine and cached.
    /// Only valid once the stream has started.
    pub fn stream_id(&self) -> Result<i64> {
        {
            let st = self.shared.lock();
            if st.disposed {
                return Err(StreamError::Disposed);
            }
            if let Some(id) = st.stream_id {
                return Ok(id);
            }
        }
        let id = self
            .engine
            .stream_id(self.handle)
            .map_err(StreamError::Transport)?;
        self.shared.lock().stream_id = Some(id);
        Ok(id)
    }

    /// Write one buffer to the stream, starting it first if necessary.
    ///
    /// At most one send may be in flight; an overlapping call fails with
    /// [`StreamError::InvalidOperation`]. Cancellation is cooperative: it
    /// stops the wait and marks the send sub-state so the late natural
    /// completion is dropped, but never unwinds the engine operation itself.
    pub async fn write(&self, buffer: Bytes, token: &CancellationToken) -> Result<()> {
        if !self.shared.can_write {
            return Err(StreamError::InvalidOperation("stream is not writable"));
        }

        let start_token = {
            let mut st = self.shared.lock();
            if st.disposed {
                return Err(StreamError::Disposed);
            }
            if st.send_pin.is_some() {
                return Err(StreamError::InvalidOperation("a send is already in flight"));
            }
            if st.start == StartState::NotStarted {
                st.start = StartState::Starting;
                Some(self.shared.op.arm())
            } else {
                None
            }
        };

        if let Some(gen) = start_token {
            trace!(stream = %self.handle, "starting stream");
            self.engine
                .start(self.handle)
                .map_err(StreamError::Transport)?;
            self.wait_start(gen, token).await?;
        }

        let send_token = {
            let mut st = self.shared.lock();
            if st.disposed {
                return Err(StreamError::Disposed);
            }
            if st.send != SendState::Idle {
                return Err(StreamError::InvalidOperation(
                    "previous send has not been retired",
                ));
            }
            st.send_pin = Some(buffer.clone());
            self.shared.op.arm()
        };

        if let Err(status) = self.engine.send(self.handle, buffer) {
            // The pin was taken before the control call; release it on the
            // synchronous failure path.
            self.shared.lock().send_pin = None;
            return Err(StreamError::Transport(status));
        }

        self.wait_send(send_token, token).await?;

        {
            let mut st = self.shared.lock();
            if st.send == SendState::Finished {
                st.send = SendState::Idle;
            }
        }
        Ok(())
    }

    /// Read into `dst`, suspending until a chunk, EOF, an abort, or a
    /// cancellation arrives. Returns the number of bytes copied; 0 means the
    /// peer finished its send side.
    ///
    /// Bytes beyond `dst`'s capacity within the delivered chunk are dropped,
    /// not retained for a later read (bounded single-chunk-per-read model).
    pub async fn read(&self, dst: &mut [u8], token: &CancellationToken) -> Result<usize> {
        if !self.shared.can_read {
            return Err(StreamError::InvalidOperation("stream is not readable"));
        }

        let recv_token = {
            let st = self.shared.lock();
            if st.disposed {
                return Err(StreamError::Disposed);
            }
            match st.read {
                ReadState::Completed => return Ok(0),
                ReadState::Aborted => return Err(StreamError::PeerAborted),
                ReadState::Idle | ReadState::ChunkReady => {}
            }
            self.shared.recv.arm()
        };

        // A chunk that arrived before this call already completed the slot;
        // the wait then returns without suspending.
        self.wait_recv(recv_token, token).await?;

        let (copied, reenable) = {
            let mut st = self.shared.lock();
            let mut copied = 0usize;
            for chunk in st.recv_queue.drain(..) {
                let room = dst.len() - copied;
                if room == 0 {
                    // Leftover bytes are dropped; dropping the drain clears
                    // the rest of the queue.
                    break;
                }
                let n = room.min(chunk.len());
                dst[copied..copied + n].copy_from_slice(&chunk[..n]);
                copied += n;
            }
            let reenable = if st.read == ReadState::ChunkReady {
                st.read = ReadState::Idle;
                true
            } else {
                false
            };
            (copied, reenable)
        };

        if reenable {
            // Re-open the gate, then acknowledge exactly what was copied.
            self.engine
                .receive_enable(self.handle)
                .map_err(StreamError::Transport)?;
            self.engine
                .receive_acknowledge(self.handle, copied as u64)
                .map_err(StreamError::Transport)?;
        }

        trace!(stream = %self.handle, copied, "read completed");
        Ok(copied)
    }

    /// Abort the read side. Synchronous and idempotent.
    ///
    /// If a read is suspended, this is the first writer for the receive race
    /// and unblocks it with [`StreamError::Canceled`].
    pub fn abort_read(&self) -> Result<()> {
        let signal = {
            let mut st = self.shared.lock();
            if st.disposed {
                return Err(StreamError::Disposed);
            }
            let was_idle = st.read == ReadState::Idle;
            st.read = ReadState::Aborted;
            was_idle
        };
        if signal {
            self.shared.recv.complete_err(StreamError::Canceled);
        }
        self.engine
            .shutdown(self.handle, ShutdownKind::AbortReceive, 0)
            .map_err(StreamError::Transport)
    }

    /// Gracefully shut down the send side and wait for the engine to confirm.
    pub async fn shutdown_write(&self, token: &CancellationToken) -> Result<()> {
        let shut_token = {
            let st = self.shared.lock();
            if st.disposed {
                return Err(StreamError::Disposed);
            }
            self.shared.shut.arm()
        };

        self.engine
            .shutdown(self.handle, ShutdownKind::Graceful, 0)
            .map_err(StreamError::Transport)?;

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                let signal = {
                    let mut st = self.shared.lock();
                    if st.shutdown == ShutdownState::Idle {
                        st.shutdown = ShutdownState::Canceled;
                        true
                    } else {
                        false
                    }
                };
                if signal {
                    self.shared.shut.complete_err(StreamError::Canceled);
                }
                self.shared.shut.wait(shut_token).await
            }
            out = self.shared.shut.wait(shut_token) => out,
        }
    }

    /// Release the engine handle and the callback registration. Idempotent.
    ///
    /// Pending operations are force-completed with [`StreamError::Disposed`]
    /// instead of being left suspended; events arriving afterwards are a
    /// safe registry lookup miss.
    pub fn dispose(&self) {
        let (fail_recv, fail_op, fail_shut) = {
            let mut st = self.shared.lock();
            if st.disposed {
                return;
            }
            st.disposed = true;
            let fail_recv = st.read == ReadState::Idle;
            if fail_recv {
                st.read = ReadState::Aborted;
            }
            let fail_op = st.send == SendState::Idle;
            if fail_op {
                st.send = SendState::Aborted;
            }
            let fail_shut = st.shutdown == ShutdownState::Idle;
            if fail_shut {
                st.shutdown = ShutdownState::Canceled;
            }
            st.send_pin = None;
            st.recv_queue.clear();
            (fail_recv, fail_op, fail_shut)
        };

        // A natural completion may already have stored its outcome for the
        // current generation; poisoning skips the slot in that case instead
        // of double-signaling.
        if fail_recv {
            self.shared.recv.poison(StreamError::Disposed);
        }
        if fail_op {
            self.shared.op.poison(StreamError::Disposed);
        }
        if fail_shut {
            self.shared.shut.poison(StreamError::Disposed);
        }

        self.registry.deregister(self.handle);
        self.engine.close(self.handle);
        debug!(stream = %self.handle, "stream disposed");
    }

    /// Await the shared start/send slot for the start phase.
    ///
    /// The deciding transition for this phase is `start: Starting -> Started`;
    /// once the event handler performed it, a cancellation has lost the race
    /// and must not signal, even though the send sub-state is still `Idle`.
    async fn wait_start(&self, gen: Generation, token: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                let signal = {
                    let mut st = self.shared.lock();
                    if st.start == StartState::Starting && st.send == SendState::Idle {
                        st.send = SendState::Aborted;
                        true
                    } else {
                        false
                    }
                };
                if signal {
                    self.shared.op.complete_err(StreamError::Canceled);
                }
                self.shared.op.wait(gen).await
            }
            out = self.shared.op.wait(gen) => out,
        }
    }

    /// Await the shared start/send slot for the send phase, racing the
    /// cancellation token under first-writer-wins on the send sub-state.
    async fn wait_send(&self, gen: Generation, token: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                let signal = {
                    let mut st = self.shared.lock();
                    if st.send == SendState::Idle {
                        st.send = SendState::Aborted;
                        true
                    } else {
                        false
                    }
                };
                if signal {
                    self.shared.op.complete_err(StreamError::Canceled);
                }
                self.shared.op.wait(gen).await
            }
            out = self.shared.op.wait(gen) => out,
        }
    }

    /// Await the receive slot, racing the cancellation token under
    /// first-writer-wins on the read sub-state.
    async fn wait_recv(&self, gen: Generation, token: &CancellationToken) -> Result<u64> {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                let signal = {
                    let mut st = self.shared.lock();
                    if st.read == ReadState::Idle {
                        st.read = ReadState::Aborted;
                        true
                    } else {
                        false
                    }
                };
                if signal {
                    self.shared.recv.complete_err(StreamError::Canceled);
                }
                self.shared.recv.wait(gen).await
            }
            out = self.shared.recv.wait(gen) => out,
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.dispose();
    }
}
