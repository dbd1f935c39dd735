//! SQLite-backed durable mailbox and shared exchange.
//!
//! One [`ChannelStorage`] is opened per channel identity. Several identities
//! can share one database file (see [`ChannelStorage::for_channel`]); the
//! identity decides mailbox ownership of pending operations and exchange
//! access control.
//!
//! Tables:
//! - `mailbox`: deferred messages and their delivery state
//! - `pending_ops`: long-running operations awaiting completion
//! - `exchange`: versioned key/value records with advisory locks

mod exchange;
mod mailbox;
mod transaction;

pub use exchange::{ExchangeLock, ExchangeRecord, ExchangeUpdate, ExchangeUpdateKind};
pub use mailbox::{
    DeferOptions, DeferredQuery, MailboxEntry, MailboxSort, MailboxStats, MailboxStatus,
    PendingOperation, PendingStatus,
};
pub use transaction::{ExchangeOp, ExchangeTransaction};

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::StorageConfig;
use crate::error::{ChannelError, Result};

/// Durable store bound to one channel identity.
///
/// Uses WAL mode for safe concurrent access across processes and
/// `Arc<Mutex<Connection>>` within a process. Every call runs on the blocking
/// pool.
#[derive(Clone)]
pub struct ChannelStorage {
    channel: String,
    conn: Arc<Mutex<Connection>>,
    message_updates: broadcast::Sender<MailboxEntry>,
    exchange_updates: broadcast::Sender<ExchangeUpdate>,
}

impl ChannelStorage {
    /// Open the store at the default platform location.
    pub fn open(channel: impl Into<String>) -> Result<Self> {
        Self::open_at(channel, &default_db_path()?)
    }

    /// Open the store at a specific path, creating parent directories.
    pub fn open_at(channel: impl Into<String>, db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| ChannelError::Io {
                    message: format!("Failed to create storage directory: {}", parent.display()),
                    source: Some(e),
                })?;
            }
        }

        let conn = Connection::open(db_path)?;
        Self::configure_connection(&conn)?;
        Self::ensure_schema(&conn)?;

        let channel = channel.into();
        debug!(channel = %channel, path = %db_path.display(), "opened channel storage");

        let (message_updates, _) = broadcast::channel(StorageConfig::UPDATE_BUFFER);
        let (exchange_updates, _) = broadcast::channel(StorageConfig::UPDATE_BUFFER);
        Ok(Self {
            channel,
            conn: Arc::new(Mutex::new(conn)),
            message_updates,
            exchange_updates,
        })
    }

    /// Another identity over the same database and update feeds.
    pub fn for_channel(&self, channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            conn: Arc::clone(&self.conn),
            message_updates: self.message_updates.clone(),
            exchange_updates: self.exchange_updates.clone(),
        }
    }

    /// Channel identity used for ownership and access checks.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Mailbox status changes.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<MailboxEntry> {
        self.message_updates.subscribe()
    }

    /// Exchange writes, deletes and lock changes.
    pub fn subscribe_exchange(&self) -> broadcast::Receiver<ExchangeUpdate> {
        self.exchange_updates.subscribe()
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode=WAL;\n\
             PRAGMA busy_timeout={};\n\
             PRAGMA synchronous=NORMAL;\n\
             PRAGMA temp_store=MEMORY;",
            StorageConfig::BUSY_TIMEOUT_MS,
        ))?;
        Ok(())
    }

    fn ensure_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS mailbox (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                channel TEXT NOT NULL,
                sender TEXT NOT NULL,
                recipient TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                expires_at INTEGER,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL,
                metadata TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_mailbox_channel_status
                ON mailbox(channel, status, seq);

            CREATE TABLE IF NOT EXISTS pending_ops (
                id TEXT PRIMARY KEY,
                channel TEXT NOT NULL,
                kind TEXT NOT NULL,
                data TEXT NOT NULL,
                metadata TEXT,
                status TEXT NOT NULL,
                result TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_pending_ops_channel ON pending_ops(channel);

            CREATE TABLE IF NOT EXISTS exchange (
                id TEXT PRIMARY KEY,
                key TEXT NOT NULL UNIQUE,
                value TEXT NOT NULL,
                owner TEXT NOT NULL,
                shared_with TEXT NOT NULL,
                version INTEGER NOT NULL,
                lock_holder TEXT,
                lock_acquired_at INTEGER,
                lock_expires_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| ChannelError::Database {
                message: "Failed to acquire storage connection lock".to_string(),
                source: None,
            })?;
            f(&mut guard)
        })
        .await
        .map_err(|e| ChannelError::Other(format!("Storage task failed: {}", e)))?
    }

    fn publish_message(&self, entry: MailboxEntry) {
        let _ = self.message_updates.send(entry);
    }

    fn publish_exchange(&self, update: ExchangeUpdate) {
        let _ = self.exchange_updates.send(update);
    }
}

/// `<data dir>/uniform-channel/channels.sqlite`.
pub fn default_db_path() -> Result<PathBuf> {
    let base = dirs::data_dir().ok_or_else(|| ChannelError::Validation {
        field: "data_dir".to_string(),
        message: "No platform data directory available".to_string(),
    })?;
    Ok(base
        .join(StorageConfig::APP_DIR_NAME)
        .join(StorageConfig::DB_FILENAME))
}

/// Conversion failure for a stored column.
pub(crate) fn invalid_column(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, message.into())
}

pub(crate) fn json_column(index: usize, raw: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(raw).map_err(|e| invalid_column(index, e.to_string()))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn create_test_storage(channel: &str) -> (ChannelStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("channels.sqlite");
        let storage = ChannelStorage::open_at(channel, &db_path).unwrap();
        (storage, temp_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::create_test_storage;
    use super::*;

    #[test]
    fn test_open_creates_parent_directories() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("dir").join("store.sqlite");
        let storage = ChannelStorage::open_at("host", &db_path).unwrap();
        assert!(db_path.exists());
        assert_eq!(storage.channel(), "host");
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let db_path = temp_dir.path().join("store.sqlite");
        ChannelStorage::open_at("host", &db_path).unwrap();
        ChannelStorage::open_at("host", &db_path).unwrap();
    }

    #[test]
    fn test_for_channel_shares_connection() {
        let (storage, _tmp) = create_test_storage("host");
        let other = storage.for_channel("worker");
        assert_eq!(other.channel(), "worker");
        assert!(Arc::ptr_eq(&storage.conn, &other.conn));
    }
}
