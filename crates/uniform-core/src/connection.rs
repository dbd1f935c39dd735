//! Peer connection bookkeeping.
//!
//! Connections are keyed by `(local, remote, sender, transport, direction)`.
//! Registering an existing key refreshes it instead of creating a duplicate.
//! Every lifecycle change is published on a broadcast feed.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::ProtocolConfig;
use crate::message::now_millis;
use crate::transport::TransportKind;

/// Which side initiated the relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Active,
    Closed,
}

/// One tracked peer relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    pub local_channel: String,
    pub remote_channel: String,
    pub sender: String,
    pub transport: TransportKind,
    pub direction: Direction,
    pub status: ConnectionStatus,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_notify_at: Option<i64>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Connection {
    /// Composite key `local::remote::sender::transport::direction`.
    pub fn key(&self) -> String {
        connection_key(
            &self.local_channel,
            &self.remote_channel,
            &self.sender,
            self.transport,
            self.direction,
        )
    }
}

fn connection_key(
    local: &str,
    remote: &str,
    sender: &str,
    transport: TransportKind,
    direction: Direction,
) -> String {
    format!("{local}::{remote}::{sender}::{transport}::{direction}")
}

/// Input to [`ConnectionRegistry::register`].
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub local_channel: String,
    pub remote_channel: String,
    pub sender: String,
    pub transport: TransportKind,
    pub direction: Direction,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ConnectionParams {
    pub fn new(
        local_channel: impl Into<String>,
        remote_channel: impl Into<String>,
        transport: TransportKind,
        direction: Direction,
    ) -> Self {
        let local_channel = local_channel.into();
        Self {
            sender: local_channel.clone(),
            local_channel,
            remote_channel: remote_channel.into(),
            transport,
            direction,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Connection lifecycle event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionEventKind {
    Connected,
    Notified,
    Disconnected,
}

/// Published on every lifecycle change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEvent {
    #[serde(rename = "type")]
    pub kind: ConnectionEventKind,
    pub connection: Connection,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

/// Filters for [`ConnectionRegistry::query`]. The default returns active
/// connections only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionQuery {
    /// Matches either the local or the remote channel.
    pub channel: Option<String>,
    pub local_channel: Option<String>,
    pub remote_channel: Option<String>,
    pub sender: Option<String>,
    pub transport: Option<TransportKind>,
    pub direction: Option<Direction>,
    pub status: Option<ConnectionStatus>,
    pub include_closed: bool,
}

impl ConnectionQuery {
    pub fn channel(name: impl Into<String>) -> Self {
        Self {
            channel: Some(name.into()),
            ..Self::default()
        }
    }

    fn matches(&self, conn: &Connection) -> bool {
        if let Some(status) = self.status {
            if conn.status != status {
                return false;
            }
        } else if !self.include_closed && conn.status != ConnectionStatus::Active {
            return false;
        }
        if let Some(channel) = &self.channel {
            if &conn.local_channel != channel && &conn.remote_channel != channel {
                return false;
            }
        }
        self.local_channel.as_ref().map_or(true, |c| &conn.local_channel == c)
            && self.remote_channel.as_ref().map_or(true, |c| &conn.remote_channel == c)
            && self.sender.as_ref().map_or(true, |s| &conn.sender == s)
            && self.transport.map_or(true, |t| conn.transport == t)
            && self.direction.map_or(true, |d| conn.direction == d)
    }
}

/// Tracks connections for one channel.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, Connection>>,
    events: broadcast::Sender<ConnectionEvent>,
    clock: AtomicI64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(ProtocolConfig::CONNECTION_EVENT_BUFFER);
        Self {
            connections: Mutex::new(HashMap::new()),
            events,
            clock: AtomicI64::new(0),
        }
    }

    /// Register or refresh a connection.
    ///
    /// An existing key is reactivated, its `updated_at` advanced and its
    /// metadata merged; its id never changes. A new key emits `connected`.
    pub fn register(&self, params: ConnectionParams) -> Connection {
        let key = connection_key(
            &params.local_channel,
            &params.remote_channel,
            &params.sender,
            params.transport,
            params.direction,
        );
        let now = self.tick();
        let mut connections = self.lock_connections();

        if let Some(existing) = connections.get_mut(&key) {
            let reopened = existing.status == ConnectionStatus::Closed;
            existing.status = ConnectionStatus::Active;
            existing.updated_at = now;
            existing.metadata.extend(params.metadata);
            let conn = existing.clone();
            drop(connections);
            if reopened {
                self.emit(ConnectionEventKind::Connected, &conn, now, serde_json::Value::Null);
            }
            return conn;
        }

        let conn = Connection {
            id: uuid::Uuid::new_v4().to_string(),
            local_channel: params.local_channel,
            remote_channel: params.remote_channel,
            sender: params.sender,
            transport: params.transport,
            direction: params.direction,
            status: ConnectionStatus::Active,
            created_at: now,
            updated_at: now,
            last_notify_at: None,
            metadata: params.metadata,
        };
        connections.insert(key, conn.clone());
        drop(connections);

        debug!(
            local = %conn.local_channel,
            remote = %conn.remote_channel,
            transport = %conn.transport,
            direction = %conn.direction,
            "connection registered"
        );
        self.emit(ConnectionEventKind::Connected, &conn, now, serde_json::Value::Null);
        conn
    }

    /// Record a notification on `conn` and emit `notified`.
    pub fn mark_notified(&self, conn: &Connection, payload: serde_json::Value) -> Option<Connection> {
        let now = self.tick();
        let updated = {
            let mut connections = self.lock_connections();
            let existing = connections.get_mut(&conn.key())?;
            existing.last_notify_at = Some(now);
            existing.updated_at = now;
            existing.clone()
        };
        self.emit(ConnectionEventKind::Notified, &updated, now, payload);
        Some(updated)
    }

    /// Close every open connection touching channel `name`.
    pub fn close_by_channel(&self, name: &str) -> usize {
        self.close_where(|c| c.local_channel == name || c.remote_channel == name)
    }

    pub fn close_all(&self) -> usize {
        self.close_where(|_| true)
    }

    fn close_where(&self, predicate: impl Fn(&Connection) -> bool) -> usize {
        let now = self.tick();
        let closed: Vec<Connection> = {
            let mut connections = self.lock_connections();
            connections
                .values_mut()
                .filter(|c| c.status != ConnectionStatus::Closed && predicate(c))
                .map(|c| {
                    c.status = ConnectionStatus::Closed;
                    c.updated_at = now;
                    c.clone()
                })
                .collect()
        };
        for conn in &closed {
            self.emit(ConnectionEventKind::Disconnected, conn, now, serde_json::Value::Null);
        }
        closed.len()
    }

    /// Matching connections, most recently updated first.
    pub fn query(&self, query: &ConnectionQuery) -> Vec<Connection> {
        let mut found: Vec<Connection> = self
            .lock_connections()
            .values()
            .filter(|c| query.matches(c))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        found
    }

    pub fn get(&self, key: &str) -> Option<Connection> {
        self.lock_connections().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock_connections().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, kind: ConnectionEventKind, conn: &Connection, timestamp: i64, payload: serde_json::Value) {
        // no subscribers is fine
        let _ = self.events.send(ConnectionEvent {
            kind,
            connection: conn.clone(),
            timestamp,
            payload,
        });
    }

    /// Wall clock in milliseconds, forced strictly increasing.
    fn tick(&self) -> i64 {
        let now = now_millis();
        let mut last = self.clock.load(Ordering::SeqCst);
        loop {
            let next = now.max(last + 1);
            match self
                .clock
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }

    fn lock_connections(&self) -> MutexGuard<'_, HashMap<String, Connection>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker_params() -> ConnectionParams {
        ConnectionParams::new("A", "B", TransportKind::Worker, Direction::Outgoing)
    }

    #[test]
    fn test_register_is_idempotent_and_advances_updated_at() {
        let registry = ConnectionRegistry::new();
        let first = registry.register(worker_params());
        let second = registry.register(worker_params().with_metadata("phase", "again"));

        assert_eq!(first.id, second.id);
        assert!(second.updated_at > first.updated_at);
        assert_eq!(second.metadata["phase"], "again");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_query_by_channel_returns_single_active_entry() {
        let registry = ConnectionRegistry::new();
        registry.register(worker_params());
        registry.register(worker_params());

        let found = registry.query(&ConnectionQuery::channel("B"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].status, ConnectionStatus::Active);
    }

    #[test]
    fn test_close_by_channel_hides_from_default_query() {
        let registry = ConnectionRegistry::new();
        registry.register(worker_params());
        registry.register(ConnectionParams::new("A", "C", TransportKind::Worker, Direction::Outgoing));

        assert_eq!(registry.close_by_channel("B"), 1);
        assert_eq!(registry.close_by_channel("B"), 0);
        assert_eq!(registry.query(&ConnectionQuery::default()).len(), 1);

        let all = registry.query(&ConnectionQuery {
            include_closed: true,
            ..ConnectionQuery::default()
        });
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_query_sorted_by_recent_update() {
        let registry = ConnectionRegistry::new();
        let b = registry.register(worker_params());
        registry.register(ConnectionParams::new("A", "C", TransportKind::Worker, Direction::Outgoing));
        registry.mark_notified(&b, serde_json::Value::Null);

        let found = registry.query(&ConnectionQuery::default());
        assert_eq!(found[0].remote_channel, "B");
        assert!(found[0].last_notify_at.is_some());
    }

    #[test]
    fn test_filters_by_direction_and_transport() {
        let registry = ConnectionRegistry::new();
        registry.register(worker_params());
        registry.register(ConnectionParams::new("A", "B", TransportKind::Broadcast, Direction::Incoming));

        let incoming = registry.query(&ConnectionQuery {
            direction: Some(Direction::Incoming),
            ..ConnectionQuery::default()
        });
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].transport, TransportKind::Broadcast);
    }

    #[tokio::test]
    async fn test_events_published_for_lifecycle() {
        let registry = ConnectionRegistry::new();
        let mut events = registry.subscribe();

        let conn = registry.register(worker_params());
        registry.mark_notified(&conn, serde_json::json!({"hello": true}));
        registry.close_all();

        assert_eq!(events.recv().await.unwrap().kind, ConnectionEventKind::Connected);
        let notified = events.recv().await.unwrap();
        assert_eq!(notified.kind, ConnectionEventKind::Notified);
        assert_eq!(notified.payload["hello"], true);
        assert_eq!(events.recv().await.unwrap().kind, ConnectionEventKind::Disconnected);
    }
}
