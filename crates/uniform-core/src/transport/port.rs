use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

use super::{spawn_pump, Listeners, MessageSink, Subscription, TaskSlot, TransportBinding, TransportKind};
use crate::message::Message;

/// One end of an entangled duplex pipe.
///
/// Messages sent on one port arrive, in order, at the listeners of the
/// other. Closing either end closes both.
pub struct MessagePort {
    peer: mpsc::UnboundedSender<Message>,
    listeners: Arc<Listeners>,
    closed: Arc<AtomicBool>,
    pump: TaskSlot,
}

impl MessagePort {
    /// Create an entangled pair. Must be called inside a tokio runtime.
    pub fn pair() -> (Arc<MessagePort>, Arc<MessagePort>) {
        let (to_b, b_rx) = mpsc::unbounded_channel();
        let (to_a, a_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let a_listeners = Listeners::new();
        let b_listeners = Listeners::new();
        let a = Arc::new(MessagePort {
            peer: to_b,
            pump: TaskSlot::new(spawn_pump(a_rx, a_listeners.clone())),
            listeners: a_listeners,
            closed: closed.clone(),
        });
        let b = Arc::new(MessagePort {
            peer: to_a,
            pump: TaskSlot::new(spawn_pump(b_rx, b_listeners.clone())),
            listeners: b_listeners,
            closed,
        });
        (a, b)
    }
}

impl TransportBinding for MessagePort {
    fn kind(&self) -> TransportKind {
        TransportKind::MessagePort
    }

    fn send(&self, message: Message, _transfer: Vec<Bytes>) {
        if self.is_closed() || self.peer.send(message).is_err() {
            trace!("message port closed, dropping message");
        }
    }

    fn on_message(&self, sink: MessageSink) -> Subscription {
        self.listeners.subscribe(sink)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.listeners.clear();
        self.pump.abort();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
