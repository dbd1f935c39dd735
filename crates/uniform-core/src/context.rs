//! Channel contexts: several named channels hosted by one process.
//!
//! A [`ChannelContext`] creates and supervises channels, wires common
//! topologies (port pairs, broadcast groups, buses, loopback), supports
//! lazily initialised channels and merges every channel's connection events
//! into one stream.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::channel::Channel;
use crate::config::{ChannelConfig, ProtocolConfig};
use crate::connection::{Connection, ConnectionEvent, ConnectionQuery};
use crate::error::{ChannelError, Result};
use crate::transport::{BroadcastGroup, LoopbackBinding, MessageBus, MessagePort, TransportBinding};

type ChannelInit = Box<dyn FnOnce(Channel) -> BoxFuture<'static, Result<()>> + Send>;

/// A connection tagged with the context that reported it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextConnection {
    pub context_id: String,
    #[serde(flatten)]
    pub connection: Connection,
}

struct Hosted {
    channel: Channel,
    // Detached on drop; exits once the channel's event sender is gone.
    _forwarder: JoinHandle<()>,
}

/// Supervisor for the channels of one execution context.
pub struct ChannelContext {
    id: String,
    host_name: Mutex<Option<String>>,
    channels: Mutex<BTreeMap<String, Hosted>>,
    deferred: Mutex<HashMap<String, ChannelInit>>,
    init_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<ConnectionEvent>,
    closed: AtomicBool,
}

impl Default for ChannelContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelContext {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(ProtocolConfig::CONNECTION_EVENT_BUFFER);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            host_name: Mutex::new(None),
            channels: Mutex::new(BTreeMap::new()),
            deferred: Mutex::new(HashMap::new()),
            init_lock: tokio::sync::Mutex::new(()),
            events,
            closed: AtomicBool::new(false),
        }
    }

    /// Context with host channel `name` already created.
    pub fn with_host(name: &str) -> Self {
        let context = Self::new();
        context.init_host(name);
        context
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host_name(&self) -> Option<String> {
        self.lock_host().clone()
    }

    pub fn host(&self) -> Option<Channel> {
        let name = self.host_name()?;
        self.get_channel(&name)
    }

    /// Create (or reuse) channel `name` and make it the host.
    pub fn init_host(&self, name: &str) -> Channel {
        let channel = self.get_or_create_channel(name);
        *self.lock_host() = Some(name.to_string());
        channel
    }

    fn lock_host(&self) -> MutexGuard<'_, Option<String>> {
        self.host_name.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_channels(&self) -> MutexGuard<'_, BTreeMap<String, Hosted>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_deferred(&self) -> MutexGuard<'_, HashMap<String, ChannelInit>> {
        self.deferred.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================
    // Channel management
    // ========================================

    /// Create channel `name`. Fails if it already exists or the context is
    /// closed.
    pub fn create_channel(&self, name: &str) -> Result<Channel> {
        self.create_channel_with(ChannelConfig::new(name))
    }

    pub fn create_channel_with(&self, config: ChannelConfig) -> Result<Channel> {
        self.ensure_open()?;
        let mut channels = self.lock_channels();
        if channels.contains_key(&config.name) {
            return Err(ChannelError::Validation {
                field: "name".to_string(),
                message: format!("Channel '{}' already exists", config.name),
            });
        }
        let channel = self.host_channel(&mut channels, config);
        Ok(channel)
    }

    pub fn create_channels<I, S>(&self, names: I) -> Result<Vec<Channel>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .map(|name| self.create_channel(name.as_ref()))
            .collect()
    }

    pub fn get_channel(&self, name: &str) -> Option<Channel> {
        self.lock_channels().get(name).map(|h| h.channel.clone())
    }

    pub fn get_or_create_channel(&self, name: &str) -> Channel {
        let mut channels = self.lock_channels();
        if let Some(hosted) = channels.get(name) {
            return hosted.channel.clone();
        }
        self.host_channel(&mut channels, ChannelConfig::new(name))
    }

    fn host_channel(&self, channels: &mut BTreeMap<String, Hosted>, config: ChannelConfig) -> Channel {
        let name = config.name.clone();
        let channel = Channel::with_config(config);
        let forwarder = spawn_forwarder(channel.subscribe_connections(), self.events.clone());
        channels.insert(
            name.clone(),
            Hosted {
                channel: channel.clone(),
                _forwarder: forwarder,
            },
        );
        debug!(context = %self.id, channel = %name, "channel hosted");
        channel
    }

    pub fn has_channel(&self, name: &str) -> bool {
        self.lock_channels().contains_key(name)
    }

    /// Hosted channel names, sorted.
    pub fn channel_names(&self) -> Vec<String> {
        self.lock_channels().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock_channels().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_channels().is_empty()
    }

    // ========================================
    // Deferred initialisation
    // ========================================

    /// Register `init` to build channel `name` on first use.
    pub fn defer<F, Fut>(&self, name: &str, init: F)
    where
        F: FnOnce(Channel) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let init: ChannelInit = Box::new(move |channel| init(channel).boxed());
        self.lock_deferred().insert(name.to_string(), init);
    }

    pub fn is_deferred(&self, name: &str) -> bool {
        self.lock_deferred().contains_key(name)
    }

    /// Create channel `name` and run its deferred initializer. Returns
    /// `None` when nothing was deferred under that name.
    pub async fn init_deferred(&self, name: &str) -> Result<Option<Channel>> {
        let _guard = self.init_lock.lock().await;
        self.run_deferred(name).await
    }

    async fn run_deferred(&self, name: &str) -> Result<Option<Channel>> {
        let Some(init) = self.lock_deferred().remove(name) else {
            return Ok(None);
        };
        self.ensure_open()?;
        let channel = self.get_or_create_channel(name);
        if let Err(e) = init(channel.clone()).await {
            self.close_channel(name);
            return Err(e);
        }
        debug!(context = %self.id, channel = %name, "deferred channel initialised");
        Ok(Some(channel))
    }

    /// Existing channel `name`, or the result of its deferred initializer.
    pub async fn get_channel_async(&self, name: &str) -> Result<Option<Channel>> {
        if let Some(channel) = self.get_channel(name) {
            return Ok(Some(channel));
        }
        let _guard = self.init_lock.lock().await;
        if let Some(channel) = self.get_channel(name) {
            return Ok(Some(channel));
        }
        self.run_deferred(name).await
    }

    // ========================================
    // Topologies
    // ========================================

    /// Two channels joined by a message-port pair, each connected to the
    /// other.
    pub fn create_channel_pair(&self, a: &str, b: &str) -> Result<(Channel, Channel)> {
        self.ensure_open()?;
        let first = self.get_or_create_channel(a);
        let second = self.get_or_create_channel(b);
        let (port_a, port_b) = MessagePort::pair();
        first.connect(port_a, b);
        second.connect(port_b, a);
        Ok((first, second))
    }

    /// Connect channel `name` to `target` over an existing port.
    pub fn add_port(&self, name: &str, port: Arc<MessagePort>, target: &str) -> Result<Channel> {
        self.add_transport(name, port, Some(target))
    }

    /// Join channel `name` to a broadcast group as its default route.
    pub fn add_broadcast(&self, name: &str, group: &BroadcastGroup) -> Result<Channel> {
        self.add_transport(name, group.join(), None)
    }

    /// Channel `name` that talks to itself.
    pub fn add_self_channel(&self, name: &str) -> Result<Channel> {
        self.add_transport(name, LoopbackBinding::new(), None)
    }

    /// Attach channel `name` to `bus` under its own name.
    pub fn add_bus(&self, name: &str, bus: &MessageBus) -> Result<Channel> {
        self.add_transport(name, bus.attach(name), None)
    }

    /// Attach any binding. With a `target` the channel connects to it;
    /// otherwise the binding becomes a default route.
    pub fn add_transport(
        &self,
        name: &str,
        binding: Arc<dyn TransportBinding>,
        target: Option<&str>,
    ) -> Result<Channel> {
        self.ensure_open()?;
        let channel = self.get_or_create_channel(name);
        match target {
            Some(target) => {
                channel.connect(binding, target);
            }
            None => channel.attach(binding, None),
        }
        Ok(channel)
    }

    // ========================================
    // Observability
    // ========================================

    /// Connection events from every hosted channel.
    pub fn subscribe_connections(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Matching connections across all channels, most recent first.
    pub fn query_connections(&self, query: &ConnectionQuery) -> Vec<ContextConnection> {
        let channels: Vec<Channel> = self.lock_channels().values().map(|h| h.channel.clone()).collect();
        let mut found: Vec<ContextConnection> = channels
            .iter()
            .flat_map(|channel| channel.query_connections(query))
            .map(|connection| ContextConnection {
                context_id: self.id.clone(),
                connection,
            })
            .collect();
        found.sort_by(|a, b| b.connection.updated_at.cmp(&a.connection.updated_at));
        found
    }

    /// Notify every peer of every hosted channel. Returns peers reached.
    pub fn notify_connections(&self, payload: serde_json::Value) -> usize {
        let channels: Vec<Channel> = self.lock_channels().values().map(|h| h.channel.clone()).collect();
        channels
            .iter()
            .map(|channel| channel.notify_connections(payload.clone()))
            .sum()
    }

    // ========================================
    // Lifecycle
    // ========================================

    /// Close and forget channel `name`.
    pub fn close_channel(&self, name: &str) -> bool {
        let removed = self.lock_channels().remove(name);
        match removed {
            Some(hosted) => {
                hosted.channel.close();
                let mut host = self.lock_host();
                if host.as_deref() == Some(name) {
                    *host = None;
                }
                true
            }
            None => false,
        }
    }

    /// Close every channel and drop pending initializers.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let hosted = std::mem::take(&mut *self.lock_channels());
        let count = hosted.len();
        for entry in hosted.values() {
            entry.channel.close();
        }
        self.lock_deferred().clear();
        *self.lock_host() = None;
        info!(context = %self.id, channels = count, "context closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ChannelError::Closed {
                channel: format!("context {}", self.id),
            });
        }
        Ok(())
    }
}

fn spawn_forwarder(
    mut events: broadcast::Receiver<ConnectionEvent>,
    sink: broadcast::Sender<ConnectionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let _ = sink.send(event);
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionEventKind;
    use crate::value::{path, ObjectRef, Value};

    #[tokio::test]
    async fn test_create_channel_rejects_duplicates() {
        let context = ChannelContext::new();
        context.create_channel("a").unwrap();
        assert!(matches!(
            context.create_channel("a"),
            Err(ChannelError::Validation { .. })
        ));
        assert_eq!(context.get_or_create_channel("a").name(), "a");
        context.create_channels(["b", "c"]).unwrap();
        assert_eq!(context.channel_names(), vec!["a", "b", "c"]);
        assert_eq!(context.len(), 3);
    }

    #[tokio::test]
    async fn test_host_channel() {
        let context = ChannelContext::with_host("main");
        assert_eq!(context.host_name().as_deref(), Some("main"));
        assert_eq!(context.host().unwrap().name(), "main");
        context.close_channel("main");
        assert!(context.host().is_none());
    }

    #[tokio::test]
    async fn test_channel_pair_round_trip() {
        let context = ChannelContext::new();
        let (ui, worker) = context.create_channel_pair("ui", "worker").unwrap();
        worker.expose("add", ObjectRef::function(|_, args| {
            let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
            Ok(Value::Int(sum))
        }));
        ui.expose("title", "hello");

        let sum = ui
            .call("worker", path(["add"]), vec![Value::Int(2), Value::Int(3)])
            .await
            .unwrap();
        assert_eq!(sum, Value::Int(5));
        assert_eq!(
            worker.get("ui", Vec::new(), "title").await.unwrap(),
            Value::from("hello")
        );
    }

    #[tokio::test]
    async fn test_deferred_channel_initialises_once() {
        let context = ChannelContext::new();
        context.defer("lazy", |channel| async move {
            channel.expose("ready", true);
            Ok(())
        });
        assert!(context.is_deferred("lazy"));
        assert!(!context.has_channel("lazy"));

        let channel = context.get_channel_async("lazy").await.unwrap().unwrap();
        assert!(channel.exposed_modules().contains(&"ready".to_string()));
        assert!(!context.is_deferred("lazy"));
        assert!(context.get_channel_async("lazy").await.unwrap().is_some());
        assert!(context.get_channel_async("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_initializer_removes_channel() {
        let context = ChannelContext::new();
        context.defer("broken", |_| async { Err(ChannelError::Other("nope".into())) });
        assert!(context.init_deferred("broken").await.is_err());
        assert!(!context.has_channel("broken"));
    }

    #[tokio::test]
    async fn test_connection_events_are_merged() {
        let context = ChannelContext::new();
        let mut events = context.subscribe_connections();
        context.get_or_create_channel("a");
        context.get_or_create_channel("b");
        context.create_channel_pair("a", "b").unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(first.kind, ConnectionEventKind::Connected);

        let all = context.query_connections(&ConnectionQuery::default());
        assert!(!all.is_empty());
        assert!(all.iter().all(|c| c.context_id == context.id()));
    }

    #[tokio::test]
    async fn test_close_channel_forwards_disconnect() {
        let context = ChannelContext::new();
        let mut events = context.subscribe_connections();
        context.create_channel_pair("a", "b").unwrap();
        while let Ok(Ok(event)) =
            tokio::time::timeout(std::time::Duration::from_millis(100), events.recv()).await
        {
            assert_eq!(event.kind, ConnectionEventKind::Connected);
        }

        assert!(context.close_channel("a"));

        let mut disconnected = Vec::new();
        while let Ok(Ok(event)) =
            tokio::time::timeout(std::time::Duration::from_millis(500), events.recv()).await
        {
            if event.kind == ConnectionEventKind::Disconnected {
                disconnected.push(event.connection.local_channel);
            }
        }
        assert!(disconnected.iter().any(|name| name == "a"));
    }

    #[tokio::test]
    async fn test_close_closes_every_channel() {
        let context = ChannelContext::new();
        let a = context.add_self_channel("a").unwrap();
        let b = context.create_channel("b").unwrap();
        context.close();
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert!(context.is_empty());
        assert!(context.is_closed());
        assert!(matches!(
            context.create_channel("c"),
            Err(ChannelError::Closed { .. })
        ));
    }
}
