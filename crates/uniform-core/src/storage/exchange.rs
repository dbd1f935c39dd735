//! Shared, access-controlled key/value exchange with advisory locks.
//!
//! Access rules:
//! - the first writer of a key owns it for the record's lifetime
//! - reads and writes need ownership, a wildcard in `shared_with`, or the
//!   caller's name in `shared_with`
//! - only the owner deletes
//! - a live lock held by another channel blocks writes and deletes
//!
//! Denials come back as `None`/`false`, never as errors.

use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{invalid_column, json_column, ChannelStorage};
use crate::config::StorageConfig;
use crate::error::Result;
use crate::message::now_millis;

/// Advisory lease on a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeLock {
    pub holder: String,
    pub acquired_at: i64,
    pub expires_at: i64,
}

/// One exchange entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeRecord {
    pub id: String,
    pub key: String,
    pub value: serde_json::Value,
    pub owner: String,
    pub shared_with: Vec<String>,
    pub version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<ExchangeLock>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ExchangeRecord {
    pub fn can_access(&self, channel: &str) -> bool {
        self.owner == channel
            || self
                .shared_with
                .iter()
                .any(|c| c == StorageConfig::WILDCARD || c == channel)
    }

    /// Whether another channel holds an unexpired lock.
    pub fn is_locked_against(&self, channel: &str, now: i64) -> bool {
        self.lock
            .as_ref()
            .is_some_and(|lock| lock.holder != channel && lock.expires_at > now)
    }
}

/// Kind of exchange change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeUpdateKind {
    Put,
    Delete,
    Lock,
    Unlock,
}

/// Published after every committed exchange change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeUpdate {
    #[serde(rename = "type")]
    pub kind: ExchangeUpdateKind,
    pub key: String,
    /// Channel that made the change.
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<ExchangeRecord>,
    pub timestamp: i64,
}

const RECORD_COLUMNS: &str = "id, key, value, owner, shared_with, version, \
     lock_holder, lock_acquired_at, lock_expires_at, created_at, updated_at";

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<ExchangeRecord> {
    let value: String = row.get(2)?;
    let shared_with: String = row.get(4)?;
    let holder: Option<String> = row.get(6)?;
    let acquired_at: Option<i64> = row.get(7)?;
    let expires_at: Option<i64> = row.get(8)?;
    Ok(ExchangeRecord {
        id: row.get(0)?,
        key: row.get(1)?,
        value: json_column(2, &value)?,
        owner: row.get(3)?,
        shared_with: serde_json::from_str(&shared_with)
            .map_err(|e| invalid_column(4, e.to_string()))?,
        version: row.get(5)?,
        lock: match (holder, acquired_at, expires_at) {
            (Some(holder), Some(acquired_at), Some(expires_at)) => Some(ExchangeLock {
                holder,
                acquired_at,
                expires_at,
            }),
            _ => None,
        },
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

pub(super) fn load_record(conn: &Connection, key: &str) -> rusqlite::Result<Option<ExchangeRecord>> {
    conn.query_row(
        &format!("SELECT {} FROM exchange WHERE key = ?1", RECORD_COLUMNS),
        params![key],
        row_to_record,
    )
    .optional()
}

fn store_record(conn: &Connection, record: &ExchangeRecord) -> Result<()> {
    let shared_with = serde_json::to_string(&record.shared_with)?;
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO exchange ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            RECORD_COLUMNS
        ),
        params![
            record.id,
            record.key,
            record.value.to_string(),
            record.owner,
            shared_with,
            record.version,
            record.lock.as_ref().map(|l| l.holder.clone()),
            record.lock.as_ref().map(|l| l.acquired_at),
            record.lock.as_ref().map(|l| l.expires_at),
            record.created_at,
            record.updated_at,
        ],
    )?;
    Ok(())
}

/// Write `value` under `key` as `channel`. `None` means the write was denied.
pub(super) fn apply_put(
    conn: &Connection,
    channel: &str,
    key: &str,
    value: serde_json::Value,
    shared_with: Option<Vec<String>>,
    now: i64,
) -> Result<Option<ExchangeRecord>> {
    let record = match load_record(conn, key)? {
        Some(existing) => {
            if !existing.can_access(channel) || existing.is_locked_against(channel, now) {
                return Ok(None);
            }
            let shared_with = match shared_with {
                Some(shared) if existing.owner == channel => shared,
                _ => existing.shared_with.clone(),
            };
            ExchangeRecord {
                value,
                shared_with,
                version: existing.version + 1,
                updated_at: now,
                ..existing
            }
        }
        None => ExchangeRecord {
            id: uuid::Uuid::new_v4().to_string(),
            key: key.to_string(),
            value,
            owner: channel.to_string(),
            shared_with: shared_with.unwrap_or_else(|| vec![StorageConfig::WILDCARD.to_string()]),
            version: 1,
            lock: None,
            created_at: now,
            updated_at: now,
        },
    };
    store_record(conn, &record)?;
    Ok(Some(record))
}

/// Shallow-merge `patch` into the record under `key`. Objects merge key by
/// key; anything else replaces the value. A missing key yields
/// `Ok(Some(None))`; a denial yields `Ok(None)`.
pub(super) fn apply_update(
    conn: &Connection,
    channel: &str,
    key: &str,
    patch: serde_json::Value,
    now: i64,
) -> Result<Option<Option<ExchangeRecord>>> {
    let Some(existing) = load_record(conn, key)? else {
        return Ok(Some(None));
    };
    if !existing.can_access(channel) || existing.is_locked_against(channel, now) {
        return Ok(None);
    }
    let value = match (existing.value.clone(), patch) {
        (serde_json::Value::Object(mut base), serde_json::Value::Object(changes)) => {
            base.extend(changes);
            serde_json::Value::Object(base)
        }
        (_, replacement) => replacement,
    };
    let record = ExchangeRecord {
        value,
        version: existing.version + 1,
        updated_at: now,
        ..existing
    };
    store_record(conn, &record)?;
    Ok(Some(Some(record)))
}

/// Delete `key` as `channel`. `None` means denied, `Some(false)` missing.
pub(super) fn apply_delete(conn: &Connection, channel: &str, key: &str, now: i64) -> Result<Option<bool>> {
    let Some(existing) = load_record(conn, key)? else {
        return Ok(Some(false));
    };
    if existing.owner != channel || existing.is_locked_against(channel, now) {
        return Ok(None);
    }
    conn.execute("DELETE FROM exchange WHERE id = ?1", params![existing.id])?;
    Ok(Some(true))
}

impl ChannelStorage {
    /// Write `value` under `key`.
    ///
    /// `shared_with` defaults to the wildcard for new records and is only
    /// honoured for the owner afterwards. Returns the stored record, or
    /// `None` when access is denied or another channel holds the lock.
    pub async fn exchange_put(
        &self,
        key: &str,
        value: serde_json::Value,
        shared_with: Option<Vec<String>>,
    ) -> Result<Option<ExchangeRecord>> {
        let channel = self.channel.clone();
        let key_owned = key.to_string();
        let now = now_millis();
        let record = self
            .with_conn(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let record = apply_put(&tx, &channel, &key_owned, value, shared_with, now)?;
                tx.commit()?;
                Ok(record)
            })
            .await?;

        match &record {
            Some(record) => {
                debug!(key = %record.key, version = record.version, "exchange put");
                self.publish_exchange(ExchangeUpdate {
                    kind: ExchangeUpdateKind::Put,
                    key: record.key.clone(),
                    channel: self.channel.clone(),
                    record: Some(record.clone()),
                    timestamp: now,
                });
            }
            None => debug!(key = %key, channel = %self.channel, "exchange put denied"),
        }
        Ok(record)
    }

    /// Value under `key`, or `None` if missing or not visible to this channel.
    pub async fn exchange_get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.exchange_record(key).await?.map(|record| record.value))
    }

    /// Full record under `key`, access-checked.
    pub async fn exchange_record(&self, key: &str) -> Result<Option<ExchangeRecord>> {
        let key = key.to_string();
        let channel = self.channel.clone();
        self.with_conn(move |conn| {
            Ok(load_record(conn, &key)?.filter(|record| record.can_access(&channel)))
        })
        .await
    }

    /// Delete `key`. Only the owner may delete; returns whether a record was
    /// removed.
    pub async fn exchange_delete(&self, key: &str) -> Result<bool> {
        let channel = self.channel.clone();
        let key_owned = key.to_string();
        let now = now_millis();
        let outcome = self
            .with_conn(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let outcome = apply_delete(&tx, &channel, &key_owned, now)?;
                tx.commit()?;
                Ok(outcome)
            })
            .await?;

        let removed = outcome == Some(true);
        if removed {
            self.publish_exchange(ExchangeUpdate {
                kind: ExchangeUpdateKind::Delete,
                key: key.to_string(),
                channel: self.channel.clone(),
                record: None,
                timestamp: now,
            });
        } else if outcome.is_none() {
            debug!(key = %key, channel = %self.channel, "exchange delete denied");
        }
        Ok(removed)
    }

    /// Acquire or refresh the lock on `key` for `timeout` (default 30s).
    ///
    /// Fails when the key is missing, not visible, or locked by another
    /// channel whose lease has not expired.
    pub async fn exchange_lock(&self, key: &str, timeout: Option<Duration>) -> Result<bool> {
        let channel = self.channel.clone();
        let key_owned = key.to_string();
        let now = now_millis();
        let lease = i64::try_from(timeout.unwrap_or(StorageConfig::DEFAULT_LOCK_TIMEOUT).as_millis())
            .unwrap_or(i64::MAX);
        let record = self
            .with_conn(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let granted = match load_record(&tx, &key_owned)? {
                    Some(mut record)
                        if record.can_access(&channel) && !record.is_locked_against(&channel, now) =>
                    {
                        record.lock = Some(ExchangeLock {
                            holder: channel.clone(),
                            acquired_at: now,
                            expires_at: now.saturating_add(lease),
                        });
                        record.updated_at = now;
                        store_record(&tx, &record)?;
                        Some(record)
                    }
                    _ => None,
                };
                tx.commit()?;
                Ok(granted)
            })
            .await?;

        match record {
            Some(record) => {
                self.publish_exchange(ExchangeUpdate {
                    kind: ExchangeUpdateKind::Lock,
                    key: record.key.clone(),
                    channel: self.channel.clone(),
                    record: Some(record),
                    timestamp: now,
                });
                Ok(true)
            }
            None => {
                warn!(key = %key, channel = %self.channel, "exchange lock contended");
                Ok(false)
            }
        }
    }

    /// Release the lock on `key`. Only the holder may release.
    pub async fn exchange_unlock(&self, key: &str) -> Result<bool> {
        let channel = self.channel.clone();
        let key_owned = key.to_string();
        let now = now_millis();
        let record = self
            .with_conn(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let released = match load_record(&tx, &key_owned)? {
                    Some(mut record)
                        if record.lock.as_ref().is_some_and(|l| l.holder == channel) =>
                    {
                        record.lock = None;
                        record.updated_at = now;
                        store_record(&tx, &record)?;
                        Some(record)
                    }
                    _ => None,
                };
                tx.commit()?;
                Ok(released)
            })
            .await?;

        Ok(match record {
            Some(record) => {
                self.publish_exchange(ExchangeUpdate {
                    kind: ExchangeUpdateKind::Unlock,
                    key: record.key.clone(),
                    channel: self.channel.clone(),
                    record: Some(record),
                    timestamp: now,
                });
                true
            }
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::create_test_storage;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_versions_and_keeps_owner() {
        let (host, _tmp) = create_test_storage("host");
        let worker = host.for_channel("worker");

        let first = host.exchange_put("config", json!({"a": 1}), None).await.unwrap().unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(first.owner, "host");
        assert_eq!(first.shared_with, vec!["*".to_string()]);

        let second = worker
            .exchange_put("config", json!({"a": 2}), Some(vec!["worker".into()]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.owner, "host");
        assert_eq!(second.shared_with, vec!["*".to_string()]);
        assert_eq!(second.id, first.id);
        assert_eq!(second.created_at, first.created_at);

        assert_eq!(host.exchange_get("config").await.unwrap(), Some(json!({"a": 2})));
    }

    #[tokio::test]
    async fn test_get_hides_records_from_outsiders() {
        let (host, _tmp) = create_test_storage("host");
        let worker = host.for_channel("worker");
        let stranger = host.for_channel("stranger");

        host.exchange_put("secret", json!("s"), Some(vec!["worker".into()]))
            .await
            .unwrap();

        assert_eq!(worker.exchange_get("secret").await.unwrap(), Some(json!("s")));
        assert_eq!(stranger.exchange_get("secret").await.unwrap(), None);
        assert!(stranger.exchange_record("secret").await.unwrap().is_none());
        assert!(stranger
            .exchange_put("secret", json!("overwrite"), None)
            .await
            .unwrap()
            .is_none());
        assert_eq!(host.exchange_get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_only_owner_deletes() {
        let (host, _tmp) = create_test_storage("host");
        let worker = host.for_channel("worker");
        host.exchange_put("k", json!(1), None).await.unwrap();

        assert!(!worker.exchange_delete("k").await.unwrap());
        assert!(host.exchange_delete("k").await.unwrap());
        assert!(!host.exchange_delete("k").await.unwrap());
        assert_eq!(host.exchange_get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lock_blocks_other_writers_until_released() {
        let (host, _tmp) = create_test_storage("host");
        let worker = host.for_channel("worker");
        host.exchange_put("k", json!(1), None).await.unwrap();

        assert!(host.exchange_lock("k", None).await.unwrap());
        assert!(!worker.exchange_lock("k", None).await.unwrap());
        assert!(worker.exchange_put("k", json!(2), None).await.unwrap().is_none());
        assert!(host.exchange_put("k", json!(3), None).await.unwrap().is_some());

        assert!(!worker.exchange_unlock("k").await.unwrap());
        assert!(host.exchange_unlock("k").await.unwrap());
        assert!(worker.exchange_lock("k", None).await.unwrap());
        assert!(!host.exchange_lock("missing", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken_over() {
        let (host, _tmp) = create_test_storage("host");
        let worker = host.for_channel("worker");
        host.exchange_put("k", json!(1), None).await.unwrap();

        assert!(host
            .exchange_lock("k", Some(Duration::from_millis(10)))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(worker.exchange_lock("k", None).await.unwrap());

        let record = worker.exchange_record("k").await.unwrap().unwrap();
        assert_eq!(record.lock.unwrap().holder, "worker");
    }

    #[tokio::test]
    async fn test_exchange_updates_are_published() {
        let (host, _tmp) = create_test_storage("host");
        let mut updates = host.subscribe_exchange();
        host.exchange_put("k", json!(1), None).await.unwrap();
        host.exchange_delete("k").await.unwrap();

        let put = updates.recv().await.unwrap();
        assert_eq!(put.kind, ExchangeUpdateKind::Put);
        assert_eq!(put.channel, "host");
        let delete = updates.recv().await.unwrap();
        assert_eq!(delete.kind, ExchangeUpdateKind::Delete);
        assert!(delete.record.is_none());
    }
}
