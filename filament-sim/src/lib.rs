//! In-memory transport engine implementing the filament control/event
//! contract.
//!
//! Two handles created by [`SimEngine::pair`] are linked back-to-back: data
//! sent on one is delivered as receive events on the other, honoring the
//! receive gate (delivery pauses after each chunk until the consumer
//! re-enables it). Events are delivered on a dedicated engine thread, so
//! streams observe the same thread-arbitrary callback model a real engine
//! exhibits.
//!
//! Not a transport: no framing, no loss, no flow control beyond the gate.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use bytes::Bytes;
use crossbeam_channel::Sender;
use tracing::trace;

use filament_stream::{
    ControlResult, EngineStatus, ShutdownKind, StreamDirection, StreamEvent, StreamHandle,
    StreamRegistry, TransportEngine,
};

/// Handle is unknown to the engine.
pub const STATUS_NOT_FOUND: EngineStatus = EngineStatus(0x01);
/// Stream id queried before the stream started.
pub const STATUS_NOT_STARTED: EngineStatus = EngineStatus(0x02);
/// Send refused because the peer stopped receiving.
pub const STATUS_SEND_REFUSED: EngineStatus = EngineStatus(0x03);

struct SimStream {
    direction: StreamDirection,
    inbound: bool,
    peer: Option<StreamHandle>,
    started: bool,

    /// Receive gate: open means the next queued data may be delivered.
    /// Closes after each delivered chunk until `receive_enable`.
    gate_open: bool,
    inbox: VecDeque<Bytes>,
    /// Peer finished its send side; delivered once the inbox drains.
    fin_pending: bool,

    /// Local abort-receive was issued; inbound data is discarded.
    recv_aborted: bool,
    /// The peer aborted its receive side; sends are refused.
    peer_stopped: bool,

    /// Total bytes acknowledged by the consumer, for test assertions.
    acknowledged: u64,
}

impl SimStream {
    fn new(direction: StreamDirection, inbound: bool, peer: Option<StreamHandle>) -> Self {
        Self {
            direction,
            inbound,
            peer,
            started: inbound,
            gate_open: true,
            inbox: VecDeque::new(),
            fin_pending: false,
            recv_aborted: false,
            peer_stopped: false,
            acknowledged: 0,
        }
    }
}

struct Inner {
    streams: HashMap<StreamHandle, SimStream>,
    next_handle: u64,
}

/// In-memory engine delivering events through a shared [`StreamRegistry`].
pub struct SimEngine {
    inner: Mutex<Inner>,
    tx: Option<Sender<(StreamHandle, StreamEvent)>>,
    worker: Option<JoinHandle<()>>,
}

impl SimEngine {
    pub fn new(registry: Arc<StreamRegistry>) -> Arc<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<(StreamHandle, StreamEvent)>();
        let worker = std::thread::Builder::new()
            .name("sim-engine".into())
            .spawn(move || {
                for (handle, event) in rx {
                    registry.dispatch(handle, event);
                }
            })
            .expect("spawning sim engine thread");

        Arc::new(Self {
            inner: Mutex::new(Inner {
                streams: HashMap::new(),
                next_handle: 1,
            }),
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, handle: StreamHandle, event: StreamEvent) {
        trace!(stream = %handle, event = ?event, "sim delivering event");
        if let Some(tx) = &self.tx {
            // The worker only exits on engine drop; a failed send means the
            // event would have been dropped by a real closed engine too.
            let _ = tx.send((handle, event));
        }
    }

    /// Create two linked handles: a locally-initiated stream and its
    /// inbound counterpart on the "remote" side.
    pub fn pair(&self, direction: StreamDirection) -> (StreamHandle, StreamHandle) {
        let mut inner = self.lock();
        let initiator = StreamHandle(inner.next_handle);
        let acceptor = StreamHandle(inner.next_handle + 1);
        inner.next_handle += 2;
        inner
            .streams
            .insert(initiator, SimStream::new(direction, false, Some(acceptor)));
        inner
            .streams
            .insert(acceptor, SimStream::new(direction, true, Some(initiator)));
        (initiator, acceptor)
    }

    /// Bytes acknowledged so far by the consumer of `handle`.
    pub fn acknowledged(&self, handle: StreamHandle) -> u64 {
        self.lock()
            .streams
            .get(&handle)
            .map(|s| s.acknowledged)
            .unwrap_or(0)
    }

    /// Deliver queued data (or a pending fin) for `handle` if its gate is
    /// open, closing the gate behind a data chunk.
    fn flush(&self, inner: &mut Inner, handle: StreamHandle) {
        let Some(stream) = inner.streams.get_mut(&handle) else {
            return;
        };
        if !stream.gate_open || stream.recv_aborted {
            return;
        }
        if !stream.inbox.is_empty() {
            let buffers: Vec<Bytes> = stream.inbox.drain(..).collect();
            let total_length = buffers.iter().map(|b| b.len() as u64).sum();
            stream.gate_open = false;
            self.emit(
                handle,
                StreamEvent::Receive {
                    buffers,
                    total_length,
                },
            );
        } else if stream.fin_pending {
            stream.fin_pending = false;
            self.emit(handle, StreamEvent::PeerSendShutdown);
        }
    }
}

impl TransportEngine for SimEngine {
    fn open(&self, direction: StreamDirection) -> Result<StreamHandle, EngineStatus> {
        let mut inner = self.lock();
        let handle = StreamHandle(inner.next_handle);
        inner.next_handle += 1;
        inner
            .streams
            .insert(handle, SimStream::new(direction, false, None));
        Ok(handle)
    }

    fn start(&self, handle: StreamHandle) -> ControlResult {
        let mut inner = self.lock();
        let stream = inner.streams.get_mut(&handle).ok_or(STATUS_NOT_FOUND)?;
        stream.started = true;
        drop(inner);
        self.emit(handle, StreamEvent::StartComplete);
        Ok(())
    }

    fn send(&self, handle: StreamHandle, buffer: Bytes) -> ControlResult {
        let mut inner = self.lock();
        let stream = inner.streams.get_mut(&handle).ok_or(STATUS_NOT_FOUND)?;
        if stream.peer_stopped {
            return Err(STATUS_SEND_REFUSED);
        }
        let peer = stream.peer;
        if let Some(peer) = peer {
            if let Some(peer_stream) = inner.streams.get_mut(&peer) {
                if !peer_stream.recv_aborted {
                    peer_stream.inbox.push_back(buffer);
                }
            }
            self.flush(&mut inner, peer);
        }
        drop(inner);
        self.emit(handle, StreamEvent::SendComplete { canceled: false });
        Ok(())
    }

    fn receive_enable(&self, handle: StreamHandle) -> ControlResult {
        let mut inner = self.lock();
        {
            let stream = inner.streams.get_mut(&handle).ok_or(STATUS_NOT_FOUND)?;
            stream.gate_open = true;
        }
        self.flush(&mut inner, handle);
        Ok(())
    }

    fn receive_acknowledge(&self, handle: StreamHandle, bytes_consumed: u64) -> ControlResult {
        let mut inner = self.lock();
        let stream = inner.streams.get_mut(&handle).ok_or(STATUS_NOT_FOUND)?;
        stream.acknowledged += bytes_consumed;
        Ok(())
    }

    fn shutdown(&self, handle: StreamHandle, kind: ShutdownKind, _error_code: u64) -> ControlResult {
        let mut inner = self.lock();
        let stream = inner.streams.get_mut(&handle).ok_or(STATUS_NOT_FOUND)?;
        let peer = stream.peer;

        match kind {
            ShutdownKind::Graceful => {
                if let Some(peer) = peer {
                    if let Some(peer_stream) = inner.streams.get_mut(&peer) {
                        peer_stream.fin_pending = true;
                    }
                    self.flush(&mut inner, peer);
                }
                drop(inner);
                self.emit(handle, StreamEvent::SendShutdownComplete);
            }
            ShutdownKind::AbortReceive => {
                stream.recv_aborted = true;
                stream.inbox.clear();
                stream.fin_pending = false;
                if let Some(peer) = peer {
                    if let Some(peer_stream) = inner.streams.get_mut(&peer) {
                        peer_stream.peer_stopped = true;
                    }
                    drop(inner);
                    self.emit(peer, StreamEvent::PeerReceiveAborted);
                }
            }
            ShutdownKind::AbortSend => {
                drop(inner);
                if let Some(peer) = peer {
                    self.emit(peer, StreamEvent::PeerSendAborted);
                }
            }
            ShutdownKind::Abort => {
                stream.recv_aborted = true;
                stream.inbox.clear();
                stream.fin_pending = false;
                if let Some(peer) = peer {
                    if let Some(peer_stream) = inner.streams.get_mut(&peer) {
                        peer_stream.peer_stopped = true;
                    }
                    drop(inner);
                    self.emit(peer, StreamEvent::PeerReceiveAborted);
                    self.emit(peer, StreamEvent::PeerSendAborted);
                }
            }
        }
        Ok(())
    }

    fn close(&self, handle: StreamHandle) {
        self.lock().streams.remove(&handle);
    }

    fn stream_id(&self, handle: StreamHandle) -> Result<i64, EngineStatus> {
        let inner = self.lock();
        let stream = inner.streams.get(&handle).ok_or(STATUS_NOT_FOUND)?;
        if !stream.started {
            return Err(STATUS_NOT_STARTED);
        }
        // QUIC-style id: the two low bits encode initiator and
        // directionality.
        let dir_bit = match stream.direction {
            StreamDirection::Bidirectional => 0,
            StreamDirection::Unidirectional => 2,
        };
        let init_bit = i64::from(stream.inbound);
        Ok(((handle.0 as i64) << 2) | dir_bit | init_bit)
    }
}

impl Drop for SimEngine {
    fn drop(&mut self) {
        // Closing the channel stops the delivery thread.
        self.tx = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
