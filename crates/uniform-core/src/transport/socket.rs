//! Framed TCP transport.
//!
//! Each [`SocketBinding`] owns one stream split into a reader task and a
//! writer task. [`SocketServer`] accepts peers and hands every new binding
//! to a callback, usually `Channel::listen`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, trace, warn};

use super::frame::{read_frame, write_frame};
use super::{Listeners, MessageSink, Subscription, TaskSlot, TransportBinding, TransportKind};
use crate::config::ProtocolConfig;
use crate::error::{ChannelError, Result};
use crate::message::Message;

/// A channel transport over one TCP stream.
pub struct SocketBinding {
    peer_addr: SocketAddr,
    outgoing: mpsc::UnboundedSender<Message>,
    listeners: Arc<Listeners>,
    closed: Arc<watch::Sender<bool>>,
    reader: TaskSlot,
    writer: TaskSlot,
}

impl SocketBinding {
    /// Connect to a listening peer.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Arc<Self>> {
        let stream = tokio::time::timeout(ProtocolConfig::SOCKET_CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| ChannelError::Io {
                message: format!(
                    "connect timed out after {:?}",
                    ProtocolConfig::SOCKET_CONNECT_TIMEOUT
                ),
                source: None,
            })??;
        Self::from_stream(stream)
    }

    /// Wrap an established stream.
    pub fn from_stream(stream: TcpStream) -> Result<Arc<Self>> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (mut read_half, mut write_half) = stream.into_split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let listeners = Listeners::new();
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);

        let writer_closed = closed.clone();
        let writer = tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                let bytes = match message.to_bytes() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(peer = %peer_addr, error = %e, "unserializable message dropped");
                        continue;
                    }
                };
                if let Err(e) = write_frame(&mut write_half, &bytes).await {
                    debug!(peer = %peer_addr, error = %e, "socket write failed");
                    break;
                }
            }
            writer_closed.send_replace(true);
        });

        let reader_listeners = listeners.clone();
        let reader_closed = closed.clone();
        let reader = tokio::spawn(async move {
            if !reader_listeners.wait_ready().await {
                return;
            }
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Some(frame)) => match Message::from_bytes(&frame) {
                        Ok(message) => reader_listeners.dispatch(message).await,
                        Err(e) => warn!(peer = %peer_addr, error = %e, "dropping undecodable frame"),
                    },
                    Ok(None) => {
                        debug!(peer = %peer_addr, "socket closed by peer");
                        break;
                    }
                    Err(e) => {
                        debug!(peer = %peer_addr, error = %e, "socket read failed");
                        break;
                    }
                }
            }
            reader_closed.send_replace(true);
        });

        Ok(Arc::new(Self {
            peer_addr,
            outgoing,
            listeners,
            closed,
            reader: TaskSlot::new(reader),
            writer: TaskSlot::new(writer),
        }))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Resolves once the binding is closed locally or by the peer.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl TransportBinding for SocketBinding {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn send(&self, message: Message, _transfer: Vec<Bytes>) {
        if self.is_closed() || self.outgoing.send(message).is_err() {
            trace!(peer = %self.peer_addr, "socket closed, dropping message");
        }
    }

    fn on_message(&self, sink: MessageSink) -> Subscription {
        self.listeners.subscribe(sink)
    }

    fn close(&self) {
        if !self.closed.send_replace(true) {
            debug!(peer = %self.peer_addr, "closing socket binding");
        }
        self.listeners.clear();
        self.reader.abort();
        self.writer.abort();
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Handle to a running socket server. Dropping shuts down the server.
pub struct SocketServerHandle {
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl SocketServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting and close every accepted binding.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for SocketServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Accept loop producing [`SocketBinding`]s.
pub struct SocketServer;

impl SocketServer {
    /// Bind `addr` and hand each accepted peer to `on_accept`.
    pub async fn start<A, F>(addr: A, on_accept: F) -> Result<SocketServerHandle>
    where
        A: ToSocketAddrs,
        F: Fn(Arc<SocketBinding>) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        info!("channel socket server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            Arc::new(on_accept),
            shutdown_rx,
            conn_shutdown_rx,
            Arc::new(AtomicUsize::new(0)),
        ));

        Ok(SocketServerHandle {
            addr,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop<F>(
        listener: TcpListener,
        on_accept: Arc<F>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) where
        F: Fn(Arc<SocketBinding>) + Send + Sync + 'static,
    {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("channel socket server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    let (stream, peer_addr) = match accept_result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("socket accept error: {}", e);
                            continue;
                        }
                    };

                    let current = active_connections.load(Ordering::Relaxed);
                    if current >= ProtocolConfig::MAX_SOCKET_CONNECTIONS {
                        warn!(
                            "Rejecting connection from {}: at max capacity ({})",
                            peer_addr,
                            ProtocolConfig::MAX_SOCKET_CONNECTIONS
                        );
                        continue;
                    }

                    let binding = match SocketBinding::from_stream(stream) {
                        Ok(binding) => binding,
                        Err(e) => {
                            debug!("failed to set up connection from {}: {}", peer_addr, e);
                            continue;
                        }
                    };

                    active_connections.fetch_add(1, Ordering::Relaxed);
                    debug!("channel connection from {}", peer_addr);
                    on_accept(binding.clone());

                    let conns = active_connections.clone();
                    let mut conn_shutdown = conn_shutdown_rx.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = binding.closed() => {}
                            _ = conn_shutdown.changed() => binding.close(),
                        }
                        conns.fetch_sub(1, Ordering::Relaxed);
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use crate::transport::Inbound;
    use std::sync::Weak;

    #[tokio::test]
    async fn test_socket_pair_exchanges_messages() {
        let (accepted_tx, mut accepted_rx) = mpsc::unbounded_channel();
        let server = SocketServer::start("127.0.0.1:0", move |binding| {
            let _ = accepted_tx.send(binding);
        })
        .await
        .unwrap();

        let client = SocketBinding::connect(server.addr()).await.unwrap();
        let accepted = accepted_rx.recv().await.unwrap();

        let (inbox_tx, mut inbox_rx) = mpsc::channel::<Inbound>(8);
        let origin: Weak<dyn TransportBinding> = Arc::downgrade(&accepted) as Weak<dyn TransportBinding>;
        let _sub = accepted.on_message(MessageSink::new(inbox_tx, origin));

        let message = Message::new(MessageKind::Event, "host", "client", serde_json::json!({"n": 1}));
        client.send(message.clone(), Vec::new());

        let inbound = inbox_rx.recv().await.unwrap();
        assert_eq!(inbound.message, message);
        assert!(inbound.reply.is_some());
    }

    #[tokio::test]
    async fn test_closed_socket_drops_sends() {
        let server = SocketServer::start("127.0.0.1:0", |_| {}).await.unwrap();
        let client = SocketBinding::connect(server.addr()).await.unwrap();
        client.close();
        assert!(client.is_closed());
        client.send(
            Message::new(MessageKind::Event, "x", "y", serde_json::Value::Null),
            Vec::new(),
        );
    }
}
