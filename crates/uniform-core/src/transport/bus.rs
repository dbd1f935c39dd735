use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{spawn_pump, Listeners, MessageSink, Subscription, TaskSlot, TransportBinding, TransportKind};
use crate::message::Message;

type Endpoints = HashMap<String, mpsc::UnboundedSender<Message>>;

/// Host message bus shared by several named endpoints.
///
/// Each message is routed to the endpoint named by its `channel` field;
/// `"*"` fans out to every other endpoint.
#[derive(Clone)]
pub struct MessageBus {
    kind: TransportKind,
    endpoints: Arc<Mutex<Endpoints>>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(TransportKind::Internal)
    }
}

impl MessageBus {
    /// A bus reporting `kind` for its bindings (e.g. `worker` for a host
    /// talking to worker contexts).
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            endpoints: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Attach an endpoint named `name`, replacing any previous endpoint of
    /// that name. Must be called inside a tokio runtime.
    pub fn attach(&self, name: impl Into<String>) -> Arc<BusBinding> {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let listeners = Listeners::new();
        let pump = spawn_pump(rx, listeners.clone());
        self.lock_endpoints().insert(name.clone(), tx.clone());
        debug!(endpoint = %name, kind = %self.kind, "bus endpoint attached");

        Arc::new(BusBinding {
            name,
            bus: self.clone(),
            inbox: tx,
            listeners,
            closed: AtomicBool::new(false),
            pump: TaskSlot::new(pump),
        })
    }

    pub fn endpoints(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock_endpoints().keys().cloned().collect();
        names.sort();
        names
    }

    fn route(&self, from: &str, message: Message) {
        let endpoints = self.lock_endpoints();
        if message.channel == "*" {
            for (name, tx) in endpoints.iter().filter(|(name, _)| name.as_str() != from) {
                if tx.send(message.clone()).is_err() {
                    trace!(endpoint = %name, "bus endpoint gone");
                }
            }
            return;
        }
        match endpoints.get(&message.channel) {
            Some(tx) => {
                if tx.send(message).is_err() {
                    trace!("bus endpoint gone, dropping message");
                }
            }
            None => debug!(target_channel = %message.channel, "no bus endpoint, dropping message"),
        }
    }

    fn lock_endpoints(&self) -> MutexGuard<'_, Endpoints> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One endpoint on a [`MessageBus`].
pub struct BusBinding {
    name: String,
    bus: MessageBus,
    inbox: mpsc::UnboundedSender<Message>,
    listeners: Arc<Listeners>,
    closed: AtomicBool,
    pump: TaskSlot,
}

impl BusBinding {
    pub fn endpoint(&self) -> &str {
        &self.name
    }
}

impl TransportBinding for BusBinding {
    fn kind(&self) -> TransportKind {
        self.bus.kind
    }

    fn send(&self, message: Message, _transfer: Vec<Bytes>) {
        if self.is_closed() {
            trace!(endpoint = %self.name, "bus binding closed, dropping message");
            return;
        }
        self.bus.route(&self.name, message);
    }

    fn on_message(&self, sink: MessageSink) -> Subscription {
        self.listeners.subscribe(sink)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut endpoints = self.bus.lock_endpoints();
        if endpoints
            .get(&self.name)
            .is_some_and(|tx| tx.same_channel(&self.inbox))
        {
            endpoints.remove(&self.name);
        }
        drop(endpoints);
        self.listeners.clear();
        self.pump.abort();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
