//! Atomic multi-step exchange writes.

use rusqlite::TransactionBehavior;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::exchange::{apply_delete, apply_put, apply_update};
use super::{ChannelStorage, ExchangeUpdate, ExchangeUpdateKind};
use crate::error::{ChannelError, Result};
use crate::message::now_millis;

/// One step of an exchange transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ExchangeOp {
    Put {
        key: String,
        value: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shared_with: Option<Vec<String>>,
    },
    Delete {
        key: String,
    },
    /// Shallow merge into an existing record; missing keys are skipped.
    Update {
        key: String,
        patch: serde_json::Value,
    },
}

impl ExchangeOp {
    pub fn key(&self) -> &str {
        match self {
            ExchangeOp::Put { key, .. } | ExchangeOp::Delete { key } | ExchangeOp::Update { key, .. } => key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Open,
    Committed,
    RolledBack,
}

/// Builder collecting exchange operations for one atomic commit.
///
/// Commit and rollback both end the transaction; any later call fails with
/// a validation error.
pub struct ExchangeTransaction {
    storage: ChannelStorage,
    ops: Vec<ExchangeOp>,
    state: TxState,
}

impl ExchangeTransaction {
    fn new(storage: ChannelStorage) -> Self {
        Self {
            storage,
            ops: Vec::new(),
            state: TxState::Open,
        }
    }

    pub fn put(&mut self, key: impl Into<String>, value: serde_json::Value) -> Result<&mut Self> {
        self.push(ExchangeOp::Put {
            key: key.into(),
            value,
            shared_with: None,
        })
    }

    pub fn put_shared(
        &mut self,
        key: impl Into<String>,
        value: serde_json::Value,
        shared_with: Vec<String>,
    ) -> Result<&mut Self> {
        self.push(ExchangeOp::Put {
            key: key.into(),
            value,
            shared_with: Some(shared_with),
        })
    }

    pub fn delete(&mut self, key: impl Into<String>) -> Result<&mut Self> {
        self.push(ExchangeOp::Delete { key: key.into() })
    }

    pub fn update(&mut self, key: impl Into<String>, patch: serde_json::Value) -> Result<&mut Self> {
        self.push(ExchangeOp::Update {
            key: key.into(),
            patch,
        })
    }

    pub fn operation_count(&self) -> usize {
        self.ops.len()
    }

    /// Apply every queued operation atomically.
    pub async fn commit(&mut self) -> Result<()> {
        self.check_state()?;
        self.state = TxState::Committed;
        let ops = std::mem::take(&mut self.ops);
        if ops.is_empty() {
            return Ok(());
        }
        self.storage.execute_transaction(ops).await.map(|_| ())
    }

    /// Discard queued operations.
    pub fn rollback(&mut self) -> Result<()> {
        self.check_state()?;
        self.ops.clear();
        self.state = TxState::RolledBack;
        Ok(())
    }

    fn push(&mut self, op: ExchangeOp) -> Result<&mut Self> {
        self.check_state()?;
        self.ops.push(op);
        Ok(self)
    }

    fn check_state(&self) -> Result<()> {
        let message = match self.state {
            TxState::Open => return Ok(()),
            TxState::Committed => "Transaction already committed",
            TxState::RolledBack => "Transaction already rolled back",
        };
        Err(ChannelError::Validation {
            field: "transaction".to_string(),
            message: message.to_string(),
        })
    }
}

impl ChannelStorage {
    pub fn begin_transaction(&self) -> ExchangeTransaction {
        ExchangeTransaction::new(self.clone())
    }

    /// Apply `ops` in one SQLite transaction.
    ///
    /// Any denied operation aborts the whole batch with
    /// [`ChannelError::TransactionAborted`] and nothing is written. Returns
    /// the changes that were committed.
    pub async fn execute_transaction(&self, ops: Vec<ExchangeOp>) -> Result<Vec<ExchangeUpdate>> {
        let channel = self.channel.clone();
        let now = now_millis();
        let count = ops.len();
        let result = self
            .with_conn(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let mut updates = Vec::with_capacity(ops.len());
                for op in ops {
                    let key = op.key().to_string();
                    let denied = || ChannelError::TransactionAborted {
                        reason: format!("access denied for key '{}'", key),
                    };
                    match op {
                        ExchangeOp::Put {
                            key: k,
                            value,
                            shared_with,
                        } => {
                            let record = apply_put(&tx, &channel, &k, value, shared_with, now)?
                                .ok_or_else(denied)?;
                            updates.push(ExchangeUpdate {
                                kind: ExchangeUpdateKind::Put,
                                key: k,
                                channel: channel.clone(),
                                record: Some(record),
                                timestamp: now,
                            });
                        }
                        ExchangeOp::Delete { key: k } => {
                            if apply_delete(&tx, &channel, &k, now)?.ok_or_else(denied)? {
                                updates.push(ExchangeUpdate {
                                    kind: ExchangeUpdateKind::Delete,
                                    key: k,
                                    channel: channel.clone(),
                                    record: None,
                                    timestamp: now,
                                });
                            }
                        }
                        ExchangeOp::Update { key: k, patch } => {
                            if let Some(record) = apply_update(&tx, &channel, &k, patch, now)?.ok_or_else(denied)? {
                                updates.push(ExchangeUpdate {
                                    kind: ExchangeUpdateKind::Put,
                                    key: k,
                                    channel: channel.clone(),
                                    record: Some(record),
                                    timestamp: now,
                                });
                            }
                        }
                    }
                }
                // Dropping `tx` on an early return rolls everything back.
                tx.commit()?;
                Ok(updates)
            })
            .await;

        match result {
            Ok(updates) => {
                debug!(channel = %self.channel, ops = count, "exchange transaction committed");
                for update in &updates {
                    self.publish_exchange(update.clone());
                }
                Ok(updates)
            }
            Err(err) => {
                warn!(channel = %self.channel, error = %err, "exchange transaction aborted");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::create_test_storage;
    use serde_json::json;

    #[tokio::test]
    async fn test_commit_applies_all_operations() {
        let (host, _tmp) = create_test_storage("host");
        host.exchange_put("old", json!(1), None).await.unwrap();
        host.exchange_put("settings", json!({"theme": "dark", "size": 1}), None)
            .await
            .unwrap();

        let mut tx = host.begin_transaction();
        tx.put("a", json!("x"))
            .unwrap()
            .delete("old")
            .unwrap()
            .update("settings", json!({"size": 2}))
            .unwrap();
        assert_eq!(tx.operation_count(), 3);
        tx.commit().await.unwrap();

        assert_eq!(host.exchange_get("a").await.unwrap(), Some(json!("x")));
        assert_eq!(host.exchange_get("old").await.unwrap(), None);
        let settings = host.exchange_record("settings").await.unwrap().unwrap();
        assert_eq!(settings.value, json!({"theme": "dark", "size": 2}));
        assert_eq!(settings.version, 2);
    }

    #[tokio::test]
    async fn test_denied_operation_rolls_back_everything() {
        let (host, _tmp) = create_test_storage("host");
        let worker = host.for_channel("worker");
        host.exchange_put("owned", json!(1), None).await.unwrap();

        let err = worker
            .execute_transaction(vec![
                ExchangeOp::Put {
                    key: "fresh".into(),
                    value: json!(true),
                    shared_with: None,
                },
                ExchangeOp::Delete { key: "owned".into() },
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, ChannelError::TransactionAborted { .. }));
        assert_eq!(host.exchange_get("fresh").await.unwrap(), None);
        assert_eq!(host.exchange_get("owned").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_finished_transaction_rejects_reuse() {
        let (host, _tmp) = create_test_storage("host");

        let mut tx = host.begin_transaction();
        tx.put("a", json!(1)).unwrap();
        tx.commit().await.unwrap();
        assert!(matches!(
            tx.put("b", json!(2)),
            Err(ChannelError::Validation { .. })
        ));
        assert!(tx.commit().await.is_err());

        let mut rolled = host.begin_transaction();
        rolled.put("c", json!(3)).unwrap();
        rolled.rollback().unwrap();
        assert_eq!(rolled.operation_count(), 0);
        assert!(rolled.rollback().is_err());
        assert_eq!(host.exchange_get("c").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_replaces_non_objects_and_skips_missing() {
        let (host, _tmp) = create_test_storage("host");
        host.exchange_put("n", json!(1), None).await.unwrap();

        let updates = host
            .execute_transaction(vec![
                ExchangeOp::Update {
                    key: "n".into(),
                    patch: json!([1, 2]),
                },
                ExchangeOp::Update {
                    key: "missing".into(),
                    patch: json!({}),
                },
            ])
            .await
            .unwrap();

        assert_eq!(updates.len(), 1);
        assert_eq!(host.exchange_get("n").await.unwrap(), Some(json!([1, 2])));
        assert_eq!(host.exchange_get("missing").await.unwrap(), None);
    }
}
