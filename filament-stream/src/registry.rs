//! Token-to-stream dispatch registry for engine callbacks.
//!
//! The engine identifies a stream only by its opaque handle. Instead of
//! handing the engine a raw pointer to stream state, the registry owns the
//! mapping from handle to the stream's event sink and removes the entry on
//! dispose. An event delivered after dispose is a safe lookup miss, never a
//! dispatch into freed state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::trace;

use crate::engine::{EventSink, StreamEvent};
use crate::types::StreamHandle;

pub struct StreamRegistry {
    entries: Mutex<HashMap<StreamHandle, Arc<dyn EventSink>>>,
}

impl StreamRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<StreamHandle, Arc<dyn EventSink>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, handle: StreamHandle, sink: Arc<dyn EventSink>) {
        self.lock().insert(handle, sink);
    }

    pub fn deregister(&self, handle: StreamHandle) {
        self.lock().remove(&handle);
    }

    /// Route one engine event to the stream registered for `handle`.
    ///
    /// The sink is cloned out of the map first so the registry lock is not
    /// held while stream state is mutated.
    pub fn dispatch(&self, handle: StreamHandle, event: StreamEvent) {
        let sink = self.lock().get(&handle).cloned();
        match sink {
            Some(sink) => sink.on_event(event),
            None => {
                trace!(stream = %handle, event = ?event, "dropping event for unregistered stream");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, handle: StreamHandle) -> bool {
        self.lock().contains_key(&handle)
    }
}
