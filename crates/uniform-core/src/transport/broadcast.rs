use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::{trace, warn};

use super::{Listeners, MessageSink, Subscription, TaskSlot, TransportBinding, TransportKind};
use crate::config::ProtocolConfig;
use crate::message::Message;

#[derive(Clone)]
struct Envelope {
    from: u64,
    message: Message,
}

/// A named multi-subscriber group. Members never hear their own messages.
#[derive(Clone)]
pub struct BroadcastGroup {
    name: Arc<str>,
    tx: broadcast::Sender<Envelope>,
    next_member: Arc<AtomicU64>,
}

impl BroadcastGroup {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(ProtocolConfig::BROADCAST_CAPACITY);
        Self {
            name: Arc::from(name.into()),
            tx,
            next_member: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Join the group. Messages published after this call are buffered for
    /// the new member. Must be called inside a tokio runtime.
    pub fn join(&self) -> Arc<BroadcastBinding> {
        let member = self.next_member.fetch_add(1, Ordering::Relaxed);
        let listeners = Listeners::new();
        let mut rx = self.tx.subscribe();
        let pump_listeners = listeners.clone();
        let group = self.name.clone();

        let pump = tokio::spawn(async move {
            if !pump_listeners.wait_ready().await {
                return;
            }
            loop {
                match rx.recv().await {
                    Ok(envelope) if envelope.from == member => {}
                    Ok(envelope) => pump_listeners.dispatch(envelope.message).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(group = %group, member, skipped, "broadcast member lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Arc::new(BroadcastBinding {
            member,
            group: self.clone(),
            listeners,
            closed: AtomicBool::new(false),
            pump: TaskSlot::new(pump),
        })
    }
}

/// Membership in a [`BroadcastGroup`].
pub struct BroadcastBinding {
    member: u64,
    group: BroadcastGroup,
    listeners: Arc<Listeners>,
    closed: AtomicBool,
    pump: TaskSlot,
}

impl BroadcastBinding {
    pub fn group_name(&self) -> &str {
        self.group.name()
    }
}

impl TransportBinding for BroadcastBinding {
    fn kind(&self) -> TransportKind {
        TransportKind::Broadcast
    }

    fn send(&self, message: Message, _transfer: Vec<Bytes>) {
        if self.is_closed() {
            trace!(group = %self.group.name(), "broadcast member closed, dropping message");
            return;
        }
        // no receivers is not an error for a broadcast
        let _ = self.group.tx.send(Envelope {
            from: self.member,
            message,
        });
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
