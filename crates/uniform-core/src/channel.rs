//! Channels: named RPC endpoints multiplexed over transport bindings.
//!
//! A [`Channel`] owns an object registry, a reflection executor and any
//! number of bindings. Outgoing invocations get a fresh request id and a
//! pending entry that is resolved by the matching response or removed by
//! the deadline, whichever comes first. Incoming messages land in one
//! bounded inbox drained by a dispatcher task; requests run on a bounded
//! pool of handler tasks so a slow action never stalls response handling.
//!
//! ```text
//! binding ─▶ MessageSink ─▶ inbox ─▶ dispatcher ─┬─ request  ─▶ executor ─▶ response
//!                                                ├─ response ─▶ pending table
//!                                                └─ signal   ─▶ connection registry
//! ```

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot, Semaphore};
use tracing::{debug, info, trace, warn};

use crate::codec::{DecodeCache, Decoder, Descriptor, Encoder};
use crate::config::{ChannelConfig, ProtocolConfig};
use crate::connection::{
    Connection, ConnectionEvent, ConnectionParams, ConnectionQuery, ConnectionRegistry, Direction,
};
use crate::error::{ChannelError, Result};
use crate::message::{
    signal, EventPayload, Message, MessageKind, RequestPayload, ResponsePayload, SignalPayload,
};
use crate::proxy::{Invoker, RemoteProxy};
use crate::reflect::{Action, ExecScope, Execution, Executor};
use crate::registry::ObjectRegistry;
use crate::storage::{ChannelStorage, DeferOptions};
use crate::transport::{Inbound, MessageSink, Subscription, TaskSlot, TransportBinding, TransportKind};
use crate::value::{Path, Value};

/// Outcome of [`Channel::send_or_defer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Parked in the mailbox under this entry id.
    Deferred(String),
}

/// Named RPC endpoint. Cheap to clone; clones share one endpoint.
#[derive(Clone)]
pub struct Channel {
    core: Arc<ChannelCore>,
}

struct Attached {
    binding: Arc<dyn TransportBinding>,
    _subscription: Subscription,
}

#[derive(Default)]
struct RouteTable {
    attached: Vec<Attached>,
    targets: HashMap<String, Arc<dyn TransportBinding>>,
    default: Option<Arc<dyn TransportBinding>>,
}

/// Request id -> resolver. Each id resolves at most once.
#[derive(Default)]
struct PendingRequests(Mutex<HashMap<String, oneshot::Sender<Message>>>);

impl PendingRequests {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Message>>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, id: &str) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id.to_string(), tx);
        rx
    }

    fn resolve(&self, id: &str, message: Message) -> bool {
        match self.lock().remove(id) {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    fn remove(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    /// Drop every resolver; waiting callers observe a closed channel.
    fn cancel_all(&self) -> usize {
        let mut pending = self.lock();
        let count = pending.len();
        pending.clear();
        count
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

struct ChannelEvents {
    inbound: broadcast::Sender<Message>,
    outbound: broadcast::Sender<Message>,
    invocations: broadcast::Sender<Message>,
    responses: broadcast::Sender<Message>,
}

impl ChannelEvents {
    fn new() -> Self {
        let make = || broadcast::channel(ProtocolConfig::EVENT_BUFFER).0;
        Self {
            inbound: make(),
            outbound: make(),
            invocations: make(),
            responses: make(),
        }
    }
}

struct ChannelCore {
    name: String,
    timeout: Duration,
    self_ref: Weak<ChannelCore>,
    registry: Arc<ObjectRegistry>,
    executor: Executor,
    proxies: DecodeCache,
    connections: Arc<ConnectionRegistry>,
    routes: Mutex<RouteTable>,
    pending: PendingRequests,
    exposed: Mutex<BTreeSet<String>>,
    events: ChannelEvents,
    inbox: mpsc::Sender<Inbound>,
    workers: Arc<Semaphore>,
    closed: AtomicBool,
    dispatcher: TaskSlot,
}

impl Channel {
    /// Channel with default settings. Must be called inside a tokio runtime.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(ChannelConfig::new(name))
    }

    pub fn with_config(config: ChannelConfig) -> Self {
        let ChannelConfig {
            name,
            timeout,
            reflect,
            modules,
        } = config;
        let registry = Arc::new(ObjectRegistry::new(name.clone()));
        let executor = Executor::new(Arc::clone(&registry), reflect, modules);
        let (inbox, rx) = mpsc::channel(ProtocolConfig::INBOX_CAPACITY);

        let core = Arc::new_cyclic(|weak: &Weak<ChannelCore>| ChannelCore {
            dispatcher: TaskSlot::new(spawn_dispatcher(weak.clone(), rx)),
            name,
            timeout,
            self_ref: weak.clone(),
            registry,
            executor,
            proxies: DecodeCache::new(),
            connections: Arc::new(ConnectionRegistry::new()),
            routes: Mutex::new(RouteTable::default()),
            pending: PendingRequests::default(),
            exposed: Mutex::new(BTreeSet::new()),
            events: ChannelEvents::new(),
            inbox,
            workers: Arc::new(Semaphore::new(ProtocolConfig::MAX_CONCURRENT_REQUESTS)),
            closed: AtomicBool::new(false),
        });
        debug!(channel = %core.name, "channel created");
        Self { core }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Default deadline for [`invoke`](Self::invoke).
    pub fn timeout(&self) -> Duration {
        self.core.timeout
    }

    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        &self.core.registry
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.core.connections
    }

    // ========================================
    // Bindings
    // ========================================

    /// Start receiving on `binding` without any handshake.
    ///
    /// With a `target`, requests for that channel go over this binding; the
    /// first binding attached without one becomes the default route.
    pub fn attach(&self, binding: Arc<dyn TransportBinding>, target: Option<&str>) {
        self.core.attach(binding, target, target.is_none());
    }

    /// Attach `binding` as the route to `target`, register an outgoing
    /// connection and send a `connect` signal.
    pub fn connect(&self, binding: Arc<dyn TransportBinding>, target: &str) -> Connection {
        let core = &self.core;
        core.attach(Arc::clone(&binding), Some(target), false);
        let connection = core.connections.register(
            ConnectionParams::new(&core.name, target, binding.kind(), Direction::Outgoing)
                .with_metadata("phase", "connect"),
        );
        core.send_signal(&binding, signal::CONNECT, target, Some(&connection.id), serde_json::Value::Null);
        info!(channel = %core.name, target = %target, transport = %binding.kind(), "connected");
        connection
    }

    /// Accept traffic on `binding`.
    ///
    /// With a known `peer`, the binding becomes the route to it, an incoming
    /// connection is registered and the peer receives a `notify` signal.
    /// Without one, peers are learned from their `connect` signals.
    pub fn listen(&self, binding: Arc<dyn TransportBinding>, peer: Option<&str>) -> Option<Connection> {
        let core = &self.core;
        core.attach(Arc::clone(&binding), peer, false);
        let peer = peer?;
        let connection = core.connections.register(
            ConnectionParams::new(&core.name, peer, binding.kind(), Direction::Incoming)
                .with_metadata("phase", "listen"),
        );
        core.send_signal(&binding, signal::NOTIFY, peer, Some(&connection.id), serde_json::Value::Null);
        Some(connection)
    }

    /// Stop receiving on `binding` and drop any routes through it. The
    /// binding itself stays open.
    pub fn detach(&self, binding: &Arc<dyn TransportBinding>) -> bool {
        let mut routes = self.core.lock_routes();
        let before = routes.attached.len();
        routes.attached.retain(|a| !same_binding(&a.binding, binding));
        routes.targets.retain(|_, b| !same_binding(b, binding));
        if routes.default.as_ref().is_some_and(|b| same_binding(b, binding)) {
            routes.default = None;
        }
        routes.attached.len() != before
    }

    // ========================================
    // Exposure
    // ========================================

    /// Register `value` as root `name`.
    pub fn expose(&self, name: &str, value: impl Into<Value>) -> bool {
        let written = self.core.registry.write(&[name.to_string()], value.into());
        if written {
            self.core.lock_exposed().insert(name.to_string());
            debug!(channel = %self.core.name, name = %name, "exposed");
        }
        written
    }

    pub fn expose_all<I, K, V>(&self, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        for (name, value) in entries {
            self.expose(name.as_ref(), value);
        }
    }

    /// Exposed roots that are still registered.
    pub fn exposed_modules(&self) -> Vec<String> {
        let registry = &self.core.registry;
        self.core
            .lock_exposed()
            .iter()
            .filter(|name| registry.read(&[(*name).clone()]).is_some())
            .cloned()
            .collect()
    }

    // ========================================
    // Invocation
    // ========================================

    /// Send `action` against `path` on channel `target` and wait for the
    /// result, using the channel's default deadline.
    pub async fn invoke(&self, target: &str, action: Action, path: Path, args: Vec<Value>) -> Result<Value> {
        self.core.request(target, action, path, args, self.core.timeout).await
    }

    pub async fn invoke_with_timeout(
        &self,
        target: &str,
        action: Action,
        path: Path,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        self.core.request(target, action, path, args, timeout).await
    }

    /// Read member `prop` of the object at `path`.
    pub async fn get(&self, target: &str, path: Path, prop: &str) -> Result<Value> {
        self.invoke(target, Action::Get, path, vec![Value::from(prop)]).await
    }

    /// Assign member `prop` of the object at `path`.
    pub async fn set(&self, target: &str, path: Path, prop: &str, value: impl Into<Value>) -> Result<bool> {
        let result = self
            .invoke(target, Action::Set, path, vec![Value::from(prop), value.into()])
            .await?;
        Ok(result.as_bool().unwrap_or(false))
    }

    /// Call the function at `path`.
    pub async fn call(&self, target: &str, path: Path, args: Vec<Value>) -> Result<Value> {
        self.invoke(target, Action::Apply, path, vec![Value::List(args)]).await
    }

    /// Construct with the constructor at `path`.
    pub async fn construct(&self, target: &str, path: Path, args: Vec<Value>) -> Result<Value> {
        self.invoke(target, Action::Construct, path, vec![Value::List(args)])
            .await
    }

    /// Ask `target` to load a module.
    pub async fn import(&self, target: &str, specifier: &str) -> Result<Value> {
        self.invoke(target, Action::Import, Vec::new(), vec![Value::from(specifier)])
            .await
    }

    /// Proxy for `path` on channel `target`.
    pub fn proxy(&self, target: &str, path: Path) -> RemoteProxy {
        RemoteProxy::new(self.core.invoker(), target, path)
    }

    /// Proxy rooted at exposed module `module` on `target`.
    pub fn remote(&self, target: &str, module: &str) -> RemoteProxy {
        self.proxy(target, vec![module.to_string()])
    }

    /// Decode a descriptor received out of band.
    pub fn wrap_descriptor(&self, descriptor: Descriptor) -> Value {
        self.core.decoder().decode_descriptor(descriptor)
    }

    // ========================================
    // Events and signals
    // ========================================

    /// Fire-and-forget `event` to `target`. Returns whether a route existed.
    pub fn emit(&self, target: &str, event: &str, data: serde_json::Value) -> bool {
        let payload = EventPayload {
            event: event.to_string(),
            data,
        };
        match Message::event(target, &self.core.name, &payload) {
            Ok(message) => self.core.send_routed(message, Vec::new()),
            Err(e) => {
                warn!(channel = %self.core.name, error = %e, "failed to build event");
                false
            }
        }
    }

    /// Send a `notify` signal to `target`. Returns whether a route existed.
    pub fn notify(&self, target: &str, payload: serde_json::Value) -> bool {
        let core = &self.core;
        match core.route(target) {
            Some(binding) => {
                core.send_signal(&binding, signal::NOTIFY, target, None, payload);
                true
            }
            None => {
                debug!(channel = %core.name, target = %target, "notify without route");
                false
            }
        }
    }

    /// Notify every remote channel with an active connection to this one.
    /// Returns how many were reached.
    pub fn notify_connections(&self, payload: serde_json::Value) -> usize {
        let query = ConnectionQuery {
            local_channel: Some(self.core.name.clone()),
            ..ConnectionQuery::default()
        };
        let connections = self.core.connections.query(&query);
        let mut reached = BTreeSet::new();
        for connection in &connections {
            let remote = &connection.remote_channel;
            if !reached.contains(remote) && self.notify(remote, payload.clone()) {
                reached.insert(remote.clone());
            }
            if reached.contains(remote) {
                self.core.connections.mark_notified(connection, payload.clone());
            }
        }
        reached.len()
    }

    /// Send a prebuilt message over the route for `message.channel`.
    pub fn send(&self, message: Message) -> bool {
        self.core.send_routed(message, Vec::new())
    }

    // ========================================
    // Durable hand-off
    // ========================================

    /// Send `message` if a route exists, otherwise park it in the mailbox.
    pub async fn send_or_defer(
        &self,
        message: Message,
        storage: &ChannelStorage,
        options: DeferOptions,
    ) -> Result<Delivery> {
        if !self.is_closed() && self.core.route(&message.channel).is_some() {
            self.core.send_routed(message, Vec::new());
            return Ok(Delivery::Sent);
        }
        let id = storage.defer(&message, options).await?;
        debug!(channel = %self.core.name, target = %message.channel, id = %id, "deferred message");
        Ok(Delivery::Deferred(id))
    }

    /// Deliver parked mailbox entries for `target`.
    ///
    /// Stops at the first entry that cannot be delivered; that entry is
    /// marked failed so its retry budget is spent. Returns the number
    /// delivered.
    pub async fn flush_deferred(&self, storage: &ChannelStorage, target: &str) -> Result<usize> {
        let mut delivered = 0;
        while let Some(entry) = storage.process_next_pending(target).await? {
            let route = if self.is_closed() { None } else { self.core.route(target) };
            match route {
                Some(binding) => {
                    let message = entry.to_message();
                    let _ = self.core.events.outbound.send(message.clone());
                    binding.send(message, Vec::new());
                    storage.mark_delivered(&entry.id).await?;
                    delivered += 1;
                }
                None => {
                    storage.mark_failed(&entry.id).await?;
                    break;
                }
            }
        }
        if delivered > 0 {
            info!(channel = %self.core.name, target = %target, delivered, "flushed mailbox");
        }
        Ok(delivered)
    }

    // ========================================
    // Observability
    // ========================================

    /// Every message received, before dispatch.
    pub fn subscribe_inbound(&self) -> broadcast::Receiver<Message> {
        self.core.events.inbound.subscribe()
    }

    /// Every message sent.
    pub fn subscribe_outbound(&self) -> broadcast::Receiver<Message> {
        self.core.events.outbound.subscribe()
    }

    /// Requests accepted for execution.
    pub fn subscribe_invocations(&self) -> broadcast::Receiver<Message> {
        self.core.events.invocations.subscribe()
    }

    /// Responses received for this channel.
    pub fn subscribe_responses(&self) -> broadcast::Receiver<Message> {
        self.core.events.responses.subscribe()
    }

    pub fn subscribe_connections(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.core.connections.subscribe()
    }

    pub fn query_connections(&self, query: &ConnectionQuery) -> Vec<Connection> {
        self.core.connections.query(query)
    }

    /// Remote channels with an active connection, sorted.
    pub fn connected_channels(&self) -> Vec<String> {
        let query = ConnectionQuery {
            local_channel: Some(self.core.name.clone()),
            ..ConnectionQuery::default()
        };
        self.core
            .connections
            .query(&query)
            .into_iter()
            .map(|c| c.remote_channel)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Outstanding requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.core.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Cancel pending requests, close every binding, close every tracked
    /// connection and release registered objects.
    pub fn close(&self) {
        self.core.close();
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.core.name)
            .field("closed", &self.core.is_closed())
            .field("pending", &self.core.pending.len())
            .finish()
    }
}

fn spawn_dispatcher(core: Weak<ChannelCore>, mut inbox: mpsc::Receiver<Inbound>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(inbound) = inbox.recv().await {
            let Some(core) = core.upgrade() else {
                break;
            };
            core.dispatch(inbound);
        }
    })
}

fn same_binding(a: &Arc<dyn TransportBinding>, b: &Arc<dyn TransportBinding>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl ChannelCore {
    fn lock_routes(&self) -> MutexGuard<'_, RouteTable> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_exposed(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.exposed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn invoker(&self) -> Weak<dyn Invoker> {
        self.self_ref.clone()
    }

    fn decoder(&self) -> Decoder<'_> {
        Decoder::new(&self.name, &self.registry, &self.proxies, self.invoker())
    }

    fn attach(&self, binding: Arc<dyn TransportBinding>, target: Option<&str>, as_default: bool) {
        let mut routes = self.lock_routes();
        if !routes.attached.iter().any(|a| same_binding(&a.binding, &binding)) {
            let sink = MessageSink::new(self.inbox.clone(), Arc::downgrade(&binding));
            let subscription = binding.on_message(sink);
            routes.attached.push(Attached {
                binding: Arc::clone(&binding),
                _subscription: subscription,
            });
            debug!(channel = %self.name, transport = %binding.kind(), "binding attached");
        }
        if let Some(target) = target {
            routes.targets.insert(target.to_string(), Arc::clone(&binding));
        }
        if as_default && routes.default.is_none() {
            routes.default = Some(binding);
        }
    }

    /// Binding for `target`: its dedicated route, else the default.
    fn route(&self, target: &str) -> Option<Arc<dyn TransportBinding>> {
        let routes = self.lock_routes();
        routes
            .targets
            .get(target)
            .or(routes.default.as_ref())
            .cloned()
    }

    fn send_routed(&self, message: Message, transfer: Vec<Bytes>) -> bool {
        match self.route(&message.channel) {
            Some(binding) => {
                self.send_on(&binding, message, transfer);
                true
            }
            None => {
                debug!(channel = %self.name, target = %message.channel, kind = %message.kind, "no route, dropping message");
                false
            }
        }
    }

    fn send_on(&self, binding: &Arc<dyn TransportBinding>, mut message: Message, transfer: Vec<Bytes>) {
        if message.transport.is_none() {
            message.transport = Some(binding.kind());
        }
        if binding.is_closed() {
            debug!(channel = %self.name, id = %message.id, "binding closed, dropping message");
        }
        let _ = self.events.outbound.send(message.clone());
        binding.send(message, transfer);
    }

    fn send_signal(
        &self,
        binding: &Arc<dyn TransportBinding>,
        kind: &str,
        to: &str,
        connection_id: Option<&str>,
        data: serde_json::Value,
    ) {
        let payload = SignalPayload {
            signal: kind.to_string(),
            from: self.name.clone(),
            to: to.to_string(),
            connection_id: connection_id.map(str::to_string),
            data,
        };
        match Message::signal(to, &self.name, &payload) {
            Ok(message) => self.send_on(binding, message, Vec::new()),
            Err(e) => warn!(channel = %self.name, error = %e, "failed to build signal"),
        }
    }

    async fn request(
        &self,
        target: &str,
        action: Action,
        path: Path,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        if self.is_closed() {
            return Err(ChannelError::Closed {
                channel: self.name.clone(),
            });
        }
        let binding = self.route(target).ok_or_else(|| ChannelError::NoRoute {
            target: target.to_string(),
        })?;

        let id = uuid::Uuid::new_v4().to_string();
        let payload = RequestPayload {
            action,
            path: path.clone(),
            args: Encoder::new(&self.name, target, &self.registry).encode_all(&args),
        };
        let message = Message::request(id.clone(), target, &self.name, &payload)?;

        let mut rx = self.pending.register(&id);
        trace!(channel = %self.name, target = %target, %action, req_id = %id, "request sent");
        self.send_on(&binding, message, Vec::new());
        drop(binding);

        let response = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(ChannelError::Closed {
                    channel: self.name.clone(),
                })
            }
            Err(_) => {
                if self.pending.remove(&id) {
                    warn!(
                        channel = %self.name,
                        target = %target,
                        %action,
                        path = %path.join("."),
                        req_id = %id,
                        "request timed out"
                    );
                    return Err(ChannelError::timeout(action, &path));
                }
                // Resolved between the deadline and the removal.
                rx.try_recv().map_err(|_| ChannelError::Closed {
                    channel: self.name.clone(),
                })?
            }
        };
        self.decode_response(response)
    }

    fn decode_response(&self, response: Message) -> Result<Value> {
        let payload = response.response_payload()?;
        if let Some(error) = payload.error {
            return Err(ChannelError::Remote(error));
        }
        let decoder = self.decoder();
        if let Some(descriptor) = payload.descriptor {
            return Ok(decoder.decode_descriptor(descriptor));
        }
        Ok(payload.result.map(|w| decoder.decode(w)).unwrap_or_default())
    }

    fn dispatch(self: Arc<Self>, inbound: Inbound) {
        if self.is_closed() {
            return;
        }
        let Inbound { message, reply } = inbound;
        let _ = self.events.inbound.send(message.clone());

        match message.kind {
            MessageKind::Request => {
                if message.channel != self.name {
                    trace!(channel = %self.name, target = %message.channel, "ignoring request for another channel");
                    return;
                }
                let _ = self.events.invocations.send(message.clone());
                let workers = Arc::clone(&self.workers);
                tokio::spawn(async move {
                    let Ok(_permit) = workers.acquire_owned().await else {
                        return;
                    };
                    self.handle_request(message, reply).await;
                });
            }
            MessageKind::Response => {
                if message.channel != self.name {
                    return;
                }
                let _ = self.events.responses.send(message.clone());
                let req_id = message.correlation_id().to_string();
                if !self.pending.resolve(&req_id, message) {
                    debug!(channel = %self.name, req_id = %req_id, "dropping late or unknown response");
                }
            }
            MessageKind::Event => {
                trace!(channel = %self.name, sender = %message.sender, "event received");
            }
            MessageKind::Signal => self.handle_signal(message, reply),
        }
    }

    async fn handle_request(&self, message: Message, reply: Option<Arc<dyn TransportBinding>>) {
        let (response, transfer) = match message.request_payload() {
            Ok(payload) => {
                let args = self.decoder().decode_all(payload.args);
                let scope = ExecScope::new(&self.name, &message.sender);
                let execution = self
                    .executor
                    .execute(payload.action, &payload.path, args, &scope)
                    .await;
                self.build_response(&message.sender, payload.action, execution)
            }
            Err(e) => (ResponsePayload::error(e.to_string()), Vec::new()),
        };

        let out = match Message::response(&message.id, &message.sender, &self.name, &response) {
            Ok(out) => out,
            Err(e) => {
                warn!(channel = %self.name, req_id = %message.id, error = %e, "failed to build response");
                return;
            }
        };

        match reply.or_else(|| self.route(&message.sender)) {
            Some(binding) => self.send_on(&binding, out, transfer),
            None => warn!(
                channel = %self.name,
                sender = %message.sender,
                req_id = %message.id,
                "no route for response"
            ),
        }
    }

    /// Inline copiable results; export objects as descriptors. A GET result
    /// keeps the path it was read from.
    fn build_response(&self, target: &str, action: Action, execution: Execution) -> (ResponsePayload, Vec<Bytes>) {
        let Execution {
            result,
            path,
            transfer,
        } = execution;
        let encoder = Encoder::new(&self.name, target, &self.registry);
        let payload = match result {
            Err(e) => ResponsePayload::error(e.to_string()),
            Ok(Value::Object(object)) => {
                let descriptor = if action == Action::Get && !path.is_empty() {
                    encoder.export_at(&object, path)
                } else {
                    encoder.export(&object)
                };
                ResponsePayload::reference(descriptor)
            }
            Ok(Value::Remote(proxy)) => ResponsePayload::reference(encoder.forward(&proxy)),
            Ok(value) => ResponsePayload::ok(encoder.encode(&value)),
        };
        (payload, transfer)
    }

    fn handle_signal(&self, message: Message, reply: Option<Arc<dyn TransportBinding>>) {
        let payload = match message.signal_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(channel = %self.name, error = %e, "malformed signal");
                return;
            }
        };
        if payload.to != self.name && message.channel != self.name {
            return;
        }

        if let Some(binding) = &reply {
            if payload.signal == signal::CONNECT {
                let mut routes = self.lock_routes();
                if !routes.targets.contains_key(&payload.from) {
                    routes.targets.insert(payload.from.clone(), Arc::clone(binding));
                    debug!(channel = %self.name, peer = %payload.from, "learned route from connect signal");
                }
            }
        }

        let transport = reply
            .as_ref()
            .map(|b| b.kind())
            .or(message.transport)
            .unwrap_or(TransportKind::Internal);
        let connection = self.connections.register(
            ConnectionParams::new(&self.name, &payload.from, transport, Direction::Incoming)
                .with_sender(&message.sender)
                .with_metadata("signal", payload.signal.clone()),
        );
        let notice = serde_json::to_value(&payload).unwrap_or_default();
        self.connections.mark_notified(&connection, notice);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let cancelled = self.pending.cancel_all();
        let attached = {
            let mut routes = self.lock_routes();
            routes.targets.clear();
            routes.default = None;
            std::mem::take(&mut routes.attached)
        };
        for entry in &attached {
            entry.binding.close();
        }
        drop(attached);
        let disconnected = self.connections.close_all();
        self.registry.clear();
        self.proxies.clear();
        self.lock_exposed().clear();
        self.dispatcher.abort();
        info!(
            channel = %self.name,
            cancelled,
            disconnected,
            "channel closed"
        );
    }
}

#[async_trait]
impl Invoker for ChannelCore {
    async fn invoke(&self, target: &str, action: Action, path: Path, args: Vec<Value>) -> Result<Value> {
        self.request(target, action, path, args, self.timeout).await
    }
}
