//! The engine behind its locks.
//!
//! Every transition runs under the callback lock, and inside that under the
//! state lock. The state lock is only held for the synchronous state
//! transition; notifications are delivered after it is released, still under
//! the callback lock, so a handler can call straight back into the
//! [`Context`] without deadlocking while a transition on another thread waits
//! until the earlier notifications have been handed out.

use std::{net::SocketAddr, sync::Arc, time::Instant};

use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::{Notify, mpsc};
use tracing::trace;

use super::{
    ClientError, EngineConfig,
    channel::{ChannelId, ChannelInfo, IoId},
    circuit::{CircuitId, DisconnectCause},
    engine::{Effects, EngineState, IoRequest, SendLabor},
    events::EventHandler,
};
use crate::messages::MonitorMask;

struct Shared {
    state: Mutex<EngineState>,
    callbacks: ReentrantMutex<()>,
    handler: Arc<dyn EventHandler>,
    io_tx: mpsc::UnboundedSender<IoRequest>,
    /// Poked whenever a transition may have moved the next deadline
    timers: Notify,
}

/// A shareable handle to one client engine
#[derive(Clone)]
pub struct Context {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").finish_non_exhaustive()
    }
}

impl Context {
    /// Create an engine, and the receiving end of its network requests
    pub fn new(
        config: EngineConfig,
        handler: Arc<dyn EventHandler>,
    ) -> (Context, mpsc::UnboundedReceiver<IoRequest>) {
        let (io_tx, io_rx) = mpsc::unbounded_channel();
        let context = Context {
            shared: Arc::new(Shared {
                state: Mutex::new(EngineState::new(config, Instant::now())),
                callbacks: ReentrantMutex::new(()),
                handler,
                io_tx,
                timers: Notify::new(),
            }),
        };
        (context, io_rx)
    }

    /// Run a transition under the state lock, then act on what it produced
    fn execute<T>(&self, f: impl FnOnce(&mut EngineState, &mut Effects) -> T) -> T {
        let _guard = self.shared.callbacks.lock();
        let mut effects = Effects::default();
        let result = {
            let mut state = self.shared.state.lock();
            f(&mut *state, &mut effects)
        };
        self.deliver(effects);
        result
    }

    fn deliver(&self, effects: Effects) {
        for request in effects.io {
            if self.shared.io_tx.send(request).is_err() {
                trace!("Runtime gone; dropping network request");
            }
        }
        self.shared.timers.notify_one();
        for notification in effects.notifications {
            self.shared.handler.notify(self, notification);
        }
    }

    /// Inspect the engine directly
    pub fn with_state<T>(&self, f: impl FnOnce(&EngineState) -> T) -> T {
        f(&*self.shared.state.lock())
    }

    pub fn create_channel(&self, name: &str, priority: u32) -> Result<ChannelId, ClientError> {
        self.execute(|state, _| state.create_channel(name, priority, Instant::now()))
    }

    pub fn destroy_channel(&self, channel: ChannelId) -> Result<(), ClientError> {
        self.execute(|state, effects| state.destroy_channel(channel, Instant::now(), effects))
    }

    pub fn channel_info(&self, channel: ChannelId) -> Result<ChannelInfo, ClientError> {
        self.with_state(|state| state.channel_info(channel))
    }

    pub fn pending_bytes(&self) -> usize {
        self.with_state(EngineState::pending_bytes)
    }

    pub fn read(&self, channel: ChannelId, data_type: u16, count: u32) -> Result<IoId, ClientError> {
        self.execute(|state, effects| state.read(channel, data_type, count, effects))
    }

    pub fn write(
        &self,
        channel: ChannelId,
        data_type: u16,
        count: u32,
        data: &[u8],
    ) -> Result<(), ClientError> {
        self.execute(|state, effects| state.write(channel, data_type, count, data, effects))
    }

    pub fn write_notify(
        &self,
        channel: ChannelId,
        data_type: u16,
        count: u32,
        data: &[u8],
    ) -> Result<IoId, ClientError> {
        self.execute(|state, effects| state.write_notify(channel, data_type, count, data, effects))
    }

    pub fn subscribe(
        &self,
        channel: ChannelId,
        data_type: u16,
        count: u32,
        mask: MonitorMask,
    ) -> Result<IoId, ClientError> {
        self.execute(|state, effects| state.subscribe(channel, data_type, count, mask, effects))
    }

    pub fn unsubscribe(&self, io: IoId) -> Result<(), ClientError> {
        self.execute(|state, effects| state.unsubscribe(io, effects))
    }

    /// Drop the circuit a channel is on; every channel on it searches again
    pub fn reset_circuit(&self, channel: ChannelId) -> Result<(), ClientError> {
        self.execute(|state, effects| state.reset_circuit(channel, Instant::now(), effects))
    }

    pub fn flush(&self) {
        self.execute(|state, effects| state.flush(effects))
    }

    pub fn datagram_received(&self, bytes: &[u8], source: SocketAddr) {
        self.execute(|state, effects| {
            state.datagram_received(bytes, source, Instant::now(), effects)
        })
    }

    pub fn circuit_connected(&self, circuit: CircuitId) {
        self.execute(|state, effects| state.circuit_connected(circuit, Instant::now(), effects))
    }

    pub fn circuit_received(&self, circuit: CircuitId, bytes: &[u8], more_pending: bool) {
        self.execute(|state, effects| {
            state.circuit_received(circuit, bytes, more_pending, Instant::now(), effects)
        })
    }

    pub fn circuit_closed(&self, circuit: CircuitId, cause: DisconnectCause) {
        self.execute(|state, effects| {
            state.circuit_closed(circuit, cause, Instant::now(), effects)
        })
    }

    pub fn send_labor(&self, circuit: CircuitId) -> SendLabor {
        self.execute(|state, effects| state.send_labor(circuit, effects))
    }

    pub fn process_timers(&self) {
        self.execute(|state, effects| state.process_timers(Instant::now(), effects))
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.with_state(EngineState::next_deadline)
    }

    /// Wait until a transition may have moved the next deadline
    pub async fn timers_changed(&self) {
        self.shared.timers.notified().await
    }

    pub fn shutdown(&self) {
        self.execute(|state, effects| state.shutdown(Instant::now(), effects))
    }

    pub fn is_closed(&self) -> bool {
        self.with_state(EngineState::is_closed)
    }
}
