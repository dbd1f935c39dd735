use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

use super::{spawn_pump, Listeners, MessageSink, Subscription, TaskSlot, TransportBinding, TransportKind};
use crate::message::Message;

/// Delivers every sent message back to its own listeners.
pub struct LoopbackBinding {
    queue: mpsc::UnboundedSender<Message>,
    listeners: Arc<Listeners>,
    closed: AtomicBool,
    pump: TaskSlot,
}

impl LoopbackBinding {
    /// Must be called inside a tokio runtime.
    pub fn new() -> Arc<Self> {
        let (queue, rx) = mpsc::unbounded_channel();
        let listeners = Listeners::new();
        let pump = spawn_pump(rx, listeners.clone());
        Arc::new(Self {
            queue,
            listeners,
            closed: AtomicBool::new(false),
            pump: TaskSlot::new(pump),
        })
    }
}

impl TransportBinding for LoopbackBinding {
    fn kind(&self) -> TransportKind {
        TransportKind::Loopback
    }

    fn send(&self, message: Message, _transfer: Vec<Bytes>) {
        if self.is_closed() || self.queue.send(message).is_err() {
            trace!("loopback closed, dropping message");
        }
    }

    fn on_message(&self, sink: MessageSink) -> Subscription {
        self.listeners.subscribe(sink)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.listeners.clear();
            self.pump.abort();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
