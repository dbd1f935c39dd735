//! Objects the gateway exposes on its channel.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use uniform_core::{
    Channel, ChannelError, ChannelStorage, ConnectionQuery, ConnectionRegistry, ObjectRef, Value,
};

/// Expose `system`, plus `exchange` and `mailbox` when storage is configured.
pub fn install(channel: &Channel, storage: Option<ChannelStorage>) {
    channel.expose("system", system_object(channel.name(), Arc::clone(channel.connections())));
    if let Some(storage) = storage {
        channel.expose("exchange", exchange_object(&storage));
        channel.expose("mailbox", mailbox_object(&storage));
        info!("Exchange and mailbox exposed on {}", channel.name());
    }
}

fn system_object(name: &str, connections: Arc<ConnectionRegistry>) -> ObjectRef {
    let local = name.to_string();
    ObjectRef::new()
        .with("name", name)
        .with("ping", ObjectRef::function(|_, _| Ok(Value::from("pong"))))
        .with(
            "echo",
            ObjectRef::function(|_, args| Ok(args.into_iter().next().unwrap_or_default())),
        )
        .with(
            "time",
            ObjectRef::function(|_, _| Ok(Value::Int(chrono::Utc::now().timestamp_millis()))),
        )
        .with(
            "channels",
            ObjectRef::function(move |_, _| {
                let query = ConnectionQuery {
                    local_channel: Some(local.clone()),
                    ..ConnectionQuery::default()
                };
                let mut remotes: Vec<String> = connections
                    .query(&query)
                    .into_iter()
                    .map(|c| c.remote_channel)
                    .collect();
                remotes.sort();
                remotes.dedup();
                Ok(Value::List(remotes.into_iter().map(Value::String).collect()))
            }),
        )
}

// ========================================
// Exchange
// ========================================

fn exchange_object(storage: &ChannelStorage) -> ObjectRef {
    let get = {
        let storage = storage.clone();
        ObjectRef::async_function(move |_, args| {
            let storage = storage.clone();
            async move {
                let key = key_arg(&args)?;
                Ok(storage.exchange_get(&key).await?.map(Value::from).unwrap_or_default())
            }
        })
    };

    let put = {
        let storage = storage.clone();
        ObjectRef::async_function(move |_, args| {
            let storage = storage.clone();
            async move {
                let key = key_arg(&args)?;
                let value = args
                    .get(1)
                    .and_then(Value::to_json)
                    .ok_or_else(|| invalid("value", "value must be plain data"))?;
                let shared_with = match args.get(2) {
                    None | Some(Value::Null) => None,
                    Some(list) => Some(
                        list.as_list()
                            .ok_or_else(|| invalid("sharedWith", "sharedWith must be a list"))?
                            .iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect(),
                    ),
                };
                let record = storage.exchange_put(&key, value, shared_with).await?;
                Ok(match record {
                    Some(record) => Value::from(serde_json::to_value(record)?),
                    None => Value::Null,
                })
            }
        })
    };

    let delete = {
        let storage = storage.clone();
        ObjectRef::async_function(move |_, args| {
            let storage = storage.clone();
            async move {
                let key = key_arg(&args)?;
                Ok(Value::Bool(storage.exchange_delete(&key).await?))
            }
        })
    };

    let lock = {
        let storage = storage.clone();
        ObjectRef::async_function(move |_, args| {
            let storage = storage.clone();
            async move {
                let key = key_arg(&args)?;
                let timeout = args
                    .get(1)
                    .and_then(Value::as_i64)
                    .and_then(|ms| u64::try_from(ms).ok())
                    .map(Duration::from_millis);
                Ok(Value::Bool(storage.exchange_lock(&key, timeout).await?))
            }
        })
    };

    let unlock = {
        let storage = storage.clone();
        ObjectRef::async_function(move |_, args| {
            let storage = storage.clone();
            async move {
                let key = key_arg(&args)?;
                Ok(Value::Bool(storage.exchange_unlock(&key).await?))
            }
        })
    };

    ObjectRef::new()
        .with("get", get)
        .with("put", put)
        .with("delete", delete)
        .with("lock", lock)
        .with("unlock", unlock)
}

// ========================================
// Mailbox
// ========================================

fn mailbox_object(storage: &ChannelStorage) -> ObjectRef {
    let owner = storage.channel().to_string();
    let storage = storage.clone();
    let stats = ObjectRef::async_function(move |_, args| {
        let storage = storage.clone();
        let channel = args
            .first()
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| owner.clone());
        async move {
            let stats = storage.get_mailbox_stats(&channel).await?;
            Ok(Value::from(serde_json::to_value(stats)?))
        }
    });
    ObjectRef::new().with("stats", stats)
}

fn key_arg(args: &[Value]) -> uniform_core::Result<String> {
    args.first()
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| invalid("key", "key must be a string"))
}

fn invalid(field: &str, message: &str) -> ChannelError {
    ChannelError::Validation {
        field: field.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use uniform_core::{path, LoopbackBinding};

    fn create_test_channel(storage: Option<ChannelStorage>) -> Channel {
        let channel = Channel::new("gateway");
        channel.attach(LoopbackBinding::new(), Some("gateway"));
        install(&channel, storage);
        channel
    }

    #[tokio::test]
    async fn test_system_ping_and_echo() {
        let channel = create_test_channel(None);
        let pong = channel
            .call("gateway", path(["system", "ping"]), vec![])
            .await
            .unwrap();
        assert_eq!(pong, Value::from("pong"));

        let echoed = channel
            .call("gateway", path(["system", "echo"]), vec![Value::Int(5)])
            .await
            .unwrap();
        assert_eq!(echoed, Value::Int(5));
        assert_eq!(channel.exposed_modules(), vec!["system".to_string()]);
    }

    #[tokio::test]
    async fn test_exchange_object_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let storage = ChannelStorage::open_at("gateway", &temp_dir.path().join("gw.db")).unwrap();
        let channel = create_test_channel(Some(storage));

        let record = channel
            .call(
                "gateway",
                path(["exchange", "put"]),
                vec![Value::from("color"), Value::from("blue")],
            )
            .await
            .unwrap();
        assert!(record.as_map().is_some());

        let value = channel
            .call("gateway", path(["exchange", "get"]), vec![Value::from("color")])
            .await
            .unwrap();
        assert_eq!(value, Value::from("blue"));

        let locked = channel
            .call("gateway", path(["exchange", "lock"]), vec![Value::from("color")])
            .await
            .unwrap();
        assert_eq!(locked, Value::Bool(true));

        let stats = channel
            .call("gateway", path(["mailbox", "stats"]), vec![])
            .await
            .unwrap();
        assert_eq!(stats.as_map().and_then(|m| m.get("total")), Some(&Value::Int(0)));
    }
}
