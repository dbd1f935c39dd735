//! Transport bindings: one contract over many communication primitives.
//!
//! A [`TransportBinding`] wraps a concrete primitive and exposes best-effort
//! `send`, `on_message` and `close`. Received messages are pushed into the
//! owning channel's bounded inbox through a [`MessageSink`], tagged with the
//! binding they arrived on so replies go back the same way.
//!
//! Bindings provided here:
//! - [`LoopbackBinding`]: in-process self dispatch (`self`)
//! - [`MessagePort`]: entangled duplex pair (`message-port`)
//! - [`BroadcastGroup`]: multi-subscriber group (`broadcast`)
//! - [`MessageBus`]: named host bus routing by destination channel (`internal`)
//! - [`SocketBinding`]: framed TCP stream (`tcp`)

mod broadcast;
mod bus;
pub mod frame;
mod loopback;
mod port;
mod socket;

pub use broadcast::{BroadcastBinding, BroadcastGroup};
pub use bus::{BusBinding, MessageBus};
pub use loopback::LoopbackBinding;
pub use port::MessagePort;
pub use socket::{SocketBinding, SocketServer, SocketServerHandle};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::message::Message;

/// Transport kind strings used for connection bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Worker,
    SharedWorker,
    MessagePort,
    Broadcast,
    Websocket,
    RtcData,
    ChromeRuntime,
    ChromeTabs,
    ChromePort,
    ChromeExternal,
    #[serde(rename = "self")]
    Loopback,
    Internal,
    Tcp,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Worker => "worker",
            TransportKind::SharedWorker => "shared-worker",
            TransportKind::MessagePort => "message-port",
            TransportKind::Broadcast => "broadcast",
            TransportKind::Websocket => "websocket",
            TransportKind::RtcData => "rtc-data",
            TransportKind::ChromeRuntime => "chrome-runtime",
            TransportKind::ChromeTabs => "chrome-tabs",
            TransportKind::ChromePort => "chrome-port",
            TransportKind::ChromeExternal => "chrome-external",
            TransportKind::Loopback => "self",
            TransportKind::Internal => "internal",
            TransportKind::Tcp => "tcp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "worker" => TransportKind::Worker,
            "shared-worker" => TransportKind::SharedWorker,
            "message-port" => TransportKind::MessagePort,
            "broadcast" => TransportKind::Broadcast,
            "websocket" => TransportKind::Websocket,
            "rtc-data" => TransportKind::RtcData,
            "chrome-runtime" => TransportKind::ChromeRuntime,
            "chrome-tabs" => TransportKind::ChromeTabs,
            "chrome-port" => TransportKind::ChromePort,
            "chrome-external" => TransportKind::ChromeExternal,
            "self" => TransportKind::Loopback,
            "internal" => TransportKind::Internal,
            "tcp" => TransportKind::Tcp,
            _ => return None,
        })
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized communication primitive.
pub trait TransportBinding: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Best effort: sends on a closed binding are dropped.
    fn send(&self, message: Message, transfer: Vec<Bytes>);

    /// Feed received messages into `sink` until the subscription is dropped.
    fn on_message(&self, sink: MessageSink) -> Subscription;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// A received message plus the binding it arrived on.
pub struct Inbound {
    pub message: Message,
    pub reply: Option<Arc<dyn TransportBinding>>,
}

impl fmt::Debug for Inbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbound")
            .field("message", &self.message)
            .field("reply", &self.reply.as_ref().map(|b| b.kind()))
            .finish()
    }
}

/// Entry point into a channel's inbox for one binding.
#[derive(Clone)]
pub struct MessageSink {
    inbox: mpsc::Sender<Inbound>,
    origin: Weak<dyn TransportBinding>,
}

impl MessageSink {
    pub fn new(inbox: mpsc::Sender<Inbound>, origin: Weak<dyn TransportBinding>) -> Self {
        Self { inbox, origin }
    }

    /// Push a message into the inbox. Returns false once the channel is gone.
    pub async fn deliver(&self, message: Message) -> bool {
        let inbound = Inbound {
            message,
            reply: self.origin.upgrade(),
        };
        self.inbox.send(inbound).await.is_ok()
    }
}

/// Handle returned by `on_message`; unsubscribes when dropped.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Listener table shared between a binding and its receive task.
pub(crate) struct Listeners {
    sinks: Mutex<Vec<(u64, MessageSink)>>,
    next_id: AtomicU64,
    ready: watch::Sender<usize>,
}

impl Listeners {
    pub(crate) fn new() -> Arc<Self> {
        let (ready, _) = watch::channel(0);
        Arc::new(Self {
            sinks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            ready,
        })
    }

    pub(crate) fn subscribe(self: &Arc<Self>, sink: MessageSink) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let count = {
            let mut sinks = self.lock_sinks();
            sinks.push((id, sink));
            sinks.len()
        };
        self.ready.send_replace(count);

        let weak = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(listeners) = weak.upgrade() {
                let count = {
                    let mut sinks = listeners.lock_sinks();
                    sinks.retain(|(sid, _)| *sid != id);
                    sinks.len()
                };
                listeners.ready.send_replace(count);
            }
        })
    }

    /// Wait until at least one listener is attached.
    pub(crate) async fn wait_ready(&self) -> bool {
        let mut rx = self.ready.subscribe();
        let ready = rx.wait_for(|count| *count > 0).await.is_ok();
        ready
    }

    pub(crate) async fn dispatch(&self, message: Message) {
        let sinks: Vec<MessageSink> = self.lock_sinks().iter().map(|(_, s)| s.clone()).collect();
        for sink in sinks {
            sink.deliver(message.clone()).await;
        }
    }

    pub(crate) fn clear(&self) {
        self.lock_sinks().clear();
        self.ready.send_replace(0);
    }

    fn lock_sinks(&self) -> std::sync::MutexGuard<'_, Vec<(u64, MessageSink)>> {
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Forward queued messages to listeners in order, starting once the first
/// listener subscribes.
pub(crate) fn spawn_pump(
    mut queue: mpsc::UnboundedReceiver<Message>,
    listeners: Arc<Listeners>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if !listeners.wait_ready().await {
            return;
        }
        while let Some(message) = queue.recv().await {
            listeners.dispatch(message).await;
        }
    })
}

/// Abort-on-drop slot for a binding's background task.
#[derive(Default)]
pub(crate) struct TaskSlot(Mutex<Option<JoinHandle<()>>>);

impl TaskSlot {
    pub(crate) fn new(handle: JoinHandle<()>) -> Self {
        Self(Mutex::new(Some(handle)))
    }

    pub(crate) fn abort(&self) {
        if let Some(handle) = self.0.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_strings_round_trip() {
        for kind in [
            TransportKind::Worker,
            TransportKind::SharedWorker,
            TransportKind::RtcData,
            TransportKind::ChromeExternal,
            TransportKind::Loopback,
            TransportKind::Tcp,
        ] {
            assert_eq!(TransportKind::parse(kind.as_str()), Some(kind));
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
        assert_eq!(TransportKind::parse("carrier-pigeon"), None);
    }

    #[test]
    fn test_subscription_runs_cancel_once() {
        let hits = Arc::new(AtomicU64::new(0));
        let counter = hits.clone();
        let sub = Subscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sub.unsubscribe();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
