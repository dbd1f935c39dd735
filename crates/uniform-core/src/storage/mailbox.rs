//! Deferred-message mailbox and pending-operation tracking.

use std::fmt;
use std::time::Duration;

use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{invalid_column, json_column, ChannelStorage};
use crate::config::StorageConfig;
use crate::error::{ChannelError, Result};
use crate::message::{now_millis, Message, MessageKind};

/// Delivery state of a mailbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailboxStatus {
    Pending,
    Processing,
    Delivered,
    Failed,
}

impl MailboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MailboxStatus::Pending => "pending",
            MailboxStatus::Processing => "processing",
            MailboxStatus::Delivered => "delivered",
            MailboxStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MailboxStatus::Pending),
            "processing" => Some(MailboxStatus::Processing),
            "delivered" => Some(MailboxStatus::Delivered),
            "failed" => Some(MailboxStatus::Failed),
            _ => None,
        }
    }

    /// Delivered and failed entries never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MailboxStatus::Delivered | MailboxStatus::Failed)
    }
}

impl fmt::Display for MailboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for [`ChannelStorage::defer`].
#[derive(Debug, Clone)]
pub struct DeferOptions {
    pub priority: i64,
    pub expires_in: Option<Duration>,
    pub max_retries: u32,
    pub metadata: Option<serde_json::Value>,
}

impl Default for DeferOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            expires_in: None,
            max_retries: StorageConfig::DEFAULT_MAX_RETRIES,
            metadata: None,
        }
    }
}

impl DeferOptions {
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_expires_in(mut self, ttl: Duration) -> Self {
        self.expires_in = Some(ttl);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A persisted deferred message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxEntry {
    pub id: String,
    pub channel: String,
    pub sender: String,
    pub recipient: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub payload: serde_json::Value,
    pub status: MailboxStatus,
    pub priority: i64,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl MailboxEntry {
    /// Rebuild the wire message for redelivery. The entry id becomes the
    /// message id.
    pub fn to_message(&self) -> Message {
        Message {
            id: self.id.clone(),
            channel: self.recipient.clone(),
            sender: self.sender.clone(),
            kind: self.kind,
            req_id: None,
            transport: None,
            payload: self.payload.clone(),
            timestamp: self.created_at,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }
}

/// Ordering for [`ChannelStorage::get_mailbox`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MailboxSort {
    /// Newest first.
    #[default]
    CreatedAt,
    /// Highest priority first, then insertion order.
    Priority,
}

/// Filters for [`ChannelStorage::get_deferred_messages`].
#[derive(Debug, Clone, Default)]
pub struct DeferredQuery {
    pub status: Option<MailboxStatus>,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// Per-status counts. Expired entries are counted only as expired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub delivered: usize,
    pub failed: usize,
    pub expired: usize,
}

/// State of a tracked operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    Pending,
    Completed,
}

/// A long-running operation registered by a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub id: String,
    pub channel: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub status: PendingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

const ENTRY_COLUMNS: &str = "id, channel, sender, recipient, kind, payload, status, priority, \
     created_at, updated_at, expires_at, retry_count, max_retries, metadata";

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<MailboxEntry> {
    let kind: String = row.get(4)?;
    let payload: String = row.get(5)?;
    let status: String = row.get(6)?;
    let metadata: Option<String> = row.get(13)?;
    Ok(MailboxEntry {
        id: row.get(0)?,
        channel: row.get(1)?,
        sender: row.get(2)?,
        recipient: row.get(3)?,
        kind: MessageKind::parse(&kind)
            .ok_or_else(|| invalid_column(4, format!("unknown message kind: {}", kind)))?,
        payload: json_column(5, &payload)?,
        status: MailboxStatus::parse(&status)
            .ok_or_else(|| invalid_column(6, format!("unknown mailbox status: {}", status)))?,
        priority: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        expires_at: row.get(10)?,
        retry_count: row.get(11)?,
        max_retries: row.get(12)?,
        metadata: metadata.as_deref().map(|m| json_column(13, m)).transpose()?,
    })
}

fn load_entry(conn: &rusqlite::Connection, id: &str) -> rusqlite::Result<Option<MailboxEntry>> {
    conn.query_row(
        &format!("SELECT {} FROM mailbox WHERE id = ?1", ENTRY_COLUMNS),
        params![id],
        row_to_entry,
    )
    .optional()
}

fn row_to_pending(row: &Row<'_>) -> rusqlite::Result<PendingOperation> {
    let data: String = row.get(3)?;
    let metadata: Option<String> = row.get(4)?;
    let status: String = row.get(5)?;
    let result: Option<String> = row.get(6)?;
    Ok(PendingOperation {
        id: row.get(0)?,
        channel: row.get(1)?,
        kind: row.get(2)?,
        data: json_column(3, &data)?,
        metadata: metadata.as_deref().map(|m| json_column(4, m)).transpose()?,
        status: match status.as_str() {
            "completed" => PendingStatus::Completed,
            _ => PendingStatus::Pending,
        },
        result: result.as_deref().map(|r| json_column(6, r)).transpose()?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

const PENDING_COLUMNS: &str =
    "id, channel, kind, data, metadata, status, result, created_at, updated_at";

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl ChannelStorage {
    // ========================================
    // Mailbox
    // ========================================

    /// Persist `message` as a pending mailbox entry for its destination
    /// channel. Returns the entry id.
    pub async fn defer(&self, message: &Message, options: DeferOptions) -> Result<String> {
        let now = now_millis();
        let sender = if message.sender.is_empty() {
            self.channel.clone()
        } else {
            message.sender.clone()
        };
        let entry = MailboxEntry {
            id: uuid::Uuid::new_v4().to_string(),
            channel: message.channel.clone(),
            sender,
            recipient: message.channel.clone(),
            kind: message.kind,
            payload: message.payload.clone(),
            status: MailboxStatus::Pending,
            priority: options.priority,
            created_at: now,
            updated_at: now,
            expires_at: options.expires_in.map(|ttl| now.saturating_add(millis(ttl))),
            retry_count: 0,
            max_retries: options.max_retries,
            metadata: options.metadata,
        };

        let row = entry.clone();
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO mailbox ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    ENTRY_COLUMNS
                ),
                params![
                    row.id,
                    row.channel,
                    row.sender,
                    row.recipient,
                    row.kind.as_str(),
                    row.payload.to_string(),
                    row.status.as_str(),
                    row.priority,
                    row.created_at,
                    row.updated_at,
                    row.expires_at,
                    row.retry_count,
                    row.max_retries,
                    row.metadata.as_ref().map(|m| m.to_string()),
                ],
            )?;
            Ok(())
        })
        .await?;

        debug!(
            channel = %entry.channel,
            id = %entry.id,
            max_retries = entry.max_retries,
            "deferred message"
        );
        let id = entry.id.clone();
        self.publish_message(entry);
        Ok(id)
    }

    /// Entries for `channel` in insertion order.
    pub async fn get_deferred_messages(
        &self,
        channel: &str,
        query: DeferredQuery,
    ) -> Result<Vec<MailboxEntry>> {
        let channel = channel.to_string();
        self.with_conn(move |conn| {
            let limit = query.limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
            let offset = i64::try_from(query.offset).unwrap_or(i64::MAX);
            let status = query.status.map(|s| s.as_str());
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM mailbox
                 WHERE channel = ?1 AND (?2 IS NULL OR status = ?2)
                 ORDER BY seq ASC LIMIT ?3 OFFSET ?4",
                ENTRY_COLUMNS
            ))?;
            let rows = stmt.query_map(params![channel, status, limit, offset], row_to_entry)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    /// Claim the oldest unexpired pending entry for `channel`.
    pub async fn process_next_pending(&self, channel: &str) -> Result<Option<MailboxEntry>> {
        let channel = channel.to_string();
        let now = now_millis();
        let claimed = self
            .with_conn(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let entry = tx
                    .query_row(
                        &format!(
                            "SELECT {} FROM mailbox
                             WHERE channel = ?1 AND status = 'pending'
                               AND (expires_at IS NULL OR expires_at >= ?2)
                             ORDER BY seq ASC LIMIT 1",
                            ENTRY_COLUMNS
                        ),
                        params![channel, now],
                        row_to_entry,
                    )
                    .optional()?;
                let claimed = match entry {
                    Some(mut entry) => {
                        tx.execute(
                            "UPDATE mailbox SET status = 'processing', updated_at = ?1 WHERE id = ?2",
                            params![now, entry.id],
                        )?;
                        entry.status = MailboxStatus::Processing;
                        entry.updated_at = now;
                        Some(entry)
                    }
                    None => None,
                };
                tx.commit()?;
                Ok(claimed)
            })
            .await?;

        if let Some(entry) = &claimed {
            debug!(channel = %entry.channel, id = %entry.id, "claimed mailbox entry");
            self.publish_message(entry.clone());
        }
        Ok(claimed)
    }

    /// Finalize an entry as delivered. Returns false for unknown or
    /// already-terminal entries.
    pub async fn mark_delivered(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        let now = now_millis();
        let updated = self
            .with_conn(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let updated = match load_entry(&tx, &id)? {
                    Some(mut entry) if !entry.status.is_terminal() => {
                        tx.execute(
                            "UPDATE mailbox SET status = 'delivered', updated_at = ?1 WHERE id = ?2",
                            params![now, id],
                        )?;
                        entry.status = MailboxStatus::Delivered;
                        entry.updated_at = now;
                        Some(entry)
                    }
                    _ => None,
                };
                tx.commit()?;
                Ok(updated)
            })
            .await?;

        Ok(match updated {
            Some(entry) => {
                self.publish_message(entry);
                true
            }
            None => false,
        })
    }

    /// Record a failed delivery attempt.
    ///
    /// Increments `retry_count`; the entry returns to pending while
    /// `retry_count < max_retries` and becomes failed otherwise. Returns
    /// whether the entry will be retried. Terminal entries are left alone.
    pub async fn mark_failed(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        let now = now_millis();
        let updated = self
            .with_conn(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let updated = match load_entry(&tx, &id)? {
                    Some(mut entry) if !entry.status.is_terminal() => {
                        entry.retry_count += 1;
                        entry.updated_at = now;
                        entry.status = if entry.retry_count < entry.max_retries {
                            MailboxStatus::Pending
                        } else {
                            MailboxStatus::Failed
                        };
                        tx.execute(
                            "UPDATE mailbox SET status = ?1, retry_count = ?2, updated_at = ?3 WHERE id = ?4",
                            params![entry.status.as_str(), entry.retry_count, now, id],
                        )?;
                        Some(entry)
                    }
                    _ => None,
                };
                tx.commit()?;
                Ok(updated)
            })
            .await?;

        Ok(match updated {
            Some(entry) => {
                let retry = entry.status == MailboxStatus::Pending;
                if retry {
                    debug!(id = %entry.id, retry_count = entry.retry_count, "mailbox entry scheduled for retry");
                } else {
                    warn!(
                        id = %entry.id,
                        channel = %entry.channel,
                        retry_count = entry.retry_count,
                        "mailbox entry failed permanently"
                    );
                }
                self.publish_message(entry);
                retry
            }
            None => false,
        })
    }

    /// All entries for `channel`.
    pub async fn get_mailbox(
        &self,
        channel: &str,
        sort: MailboxSort,
        limit: Option<usize>,
    ) -> Result<Vec<MailboxEntry>> {
        let channel = channel.to_string();
        self.with_conn(move |conn| {
            let order = match sort {
                MailboxSort::Priority => "priority DESC, seq ASC",
                MailboxSort::CreatedAt => "created_at DESC, seq DESC",
            };
            let limit = limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM mailbox WHERE channel = ?1 ORDER BY {} LIMIT ?2",
                ENTRY_COLUMNS, order
            ))?;
            let rows = stmt.query_map(params![channel, limit], row_to_entry)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    pub async fn get_mailbox_stats(&self, channel: &str) -> Result<MailboxStats> {
        let entries = self
            .get_deferred_messages(channel, DeferredQuery::default())
            .await?;
        let now = now_millis();
        let mut stats = MailboxStats {
            total: entries.len(),
            ..MailboxStats::default()
        };
        for entry in &entries {
            if entry.is_expired(now) {
                stats.expired += 1;
                continue;
            }
            match entry.status {
                MailboxStatus::Pending => stats.pending += 1,
                MailboxStatus::Processing => stats.processing += 1,
                MailboxStatus::Delivered => stats.delivered += 1,
                MailboxStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    /// Delete every entry for `channel`. Returns the number removed.
    pub async fn clear_mailbox(&self, channel: &str) -> Result<usize> {
        let channel = channel.to_string();
        let removed = self
            .with_conn(move |conn| Ok(conn.execute("DELETE FROM mailbox WHERE channel = ?1", params![channel])?))
            .await?;
        debug!(removed, "cleared mailbox");
        Ok(removed)
    }

    /// Purge every entry whose TTL has passed, whatever its status.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let now = now_millis();
        let removed = self
            .with_conn(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM mailbox WHERE expires_at IS NOT NULL AND expires_at < ?1",
                    params![now],
                )?)
            })
            .await?;
        if removed > 0 {
            info!(removed, "purged expired mailbox entries");
        }
        Ok(removed)
    }

    // ========================================
    // Pending operations
    // ========================================

    /// Track an operation for this channel. Returns its id.
    pub async fn register_pending(
        &self,
        kind: &str,
        data: serde_json::Value,
        metadata: Option<serde_json::Value>,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_millis();
        let row = (id.clone(), self.channel.clone(), kind.to_string());
        self.with_conn(move |conn| {
            let (id, channel, kind) = row;
            conn.execute(
                &format!(
                    "INSERT INTO pending_ops ({}) VALUES (?1, ?2, ?3, ?4, ?5, 'pending', NULL, ?6, ?6)",
                    PENDING_COLUMNS
                ),
                params![
                    id,
                    channel,
                    kind,
                    data.to_string(),
                    metadata.as_ref().map(|m| m.to_string()),
                    now,
                ],
            )?;
            Ok(())
        })
        .await?;
        Ok(id)
    }

    /// Operations registered by this channel, oldest first.
    pub async fn get_pending_operations(&self) -> Result<Vec<PendingOperation>> {
        let channel = self.channel.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM pending_ops WHERE channel = ?1 ORDER BY created_at ASC, id ASC",
                PENDING_COLUMNS
            ))?;
            let rows = stmt.query_map(params![channel], row_to_pending)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn get_pending(&self, id: &str) -> Result<Option<PendingOperation>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM pending_ops WHERE id = ?1", PENDING_COLUMNS),
                    params![id],
                    row_to_pending,
                )
                .optional()?)
        })
        .await
    }

    /// Mark an operation completed with `result`. Returns false if unknown.
    pub async fn complete_pending(&self, id: &str, result: serde_json::Value) -> Result<bool> {
        let id = id.to_string();
        let now = now_millis();
        let updated = self
            .with_conn(move |conn| {
                Ok(conn.execute(
                    "UPDATE pending_ops SET status = 'completed', result = ?1, updated_at = ?2 WHERE id = ?3",
                    params![result.to_string(), now, id],
                )?)
            })
            .await?;
        Ok(updated > 0)
    }

    /// Drop an operation without completing it.
    pub async fn cancel_pending(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        let removed = self
            .with_conn(move |conn| Ok(conn.execute("DELETE FROM pending_ops WHERE id = ?1", params![id])?))
            .await?;
        Ok(removed > 0)
    }

    /// Poll until the operation completes, then remove it and return its
    /// result. An unknown id yields `None`.
    pub async fn await_pending(&self, id: &str, timeout: Option<Duration>) -> Result<Option<serde_json::Value>> {
        let timeout = timeout.unwrap_or(StorageConfig::PENDING_WAIT_TIMEOUT);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.get_pending(id).await? {
                None => return Ok(None),
                Some(op) if op.status == PendingStatus::Completed => {
                    self.cancel_pending(id).await?;
                    return Ok(Some(op.result.unwrap_or(serde_json::Value::Null)));
                }
                Some(_) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ChannelError::timeout("awaitPending", &[id.to_string()]));
            }
            tokio::time::sleep(StorageConfig::PENDING_POLL_INTERVAL).await;
        }
    }
}
