//! Durable mailbox and exchange tests against an on-disk database.

use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use uniform_core::message::EventPayload;
use uniform_core::{
    Channel, ChannelStorage, DeferOptions, Delivery, MailboxStatus, Message, MessageKind,
    MessagePort,
};

fn create_test_env() -> (TempDir, ChannelStorage) {
    let temp_dir = TempDir::new().unwrap();
    let storage = ChannelStorage::open_at("host", &temp_dir.path().join("channels.db")).unwrap();
    (temp_dir, storage)
}

fn ready_event() -> Message {
    let payload = EventPayload {
        event: "ready".to_string(),
        data: json!({"version": 2}),
    };
    Message::event("worker", "host", &payload).unwrap()
}

#[tokio::test]
async fn test_deferred_message_is_flushed_once_route_exists() {
    let (_tmp, storage) = create_test_env();
    let host = Channel::new("host");

    let delivery = host
        .send_or_defer(ready_event(), &storage, DeferOptions::default())
        .await
        .unwrap();
    let Delivery::Deferred(id) = delivery else {
        panic!("expected deferral without a route");
    };

    // No route yet: the attempt spends one retry and the entry stays pending.
    assert_eq!(host.flush_deferred(&storage, "worker").await.unwrap(), 0);
    let entries = storage
        .get_deferred_messages("worker", Default::default())
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, id);
    assert_eq!(entries[0].status, MailboxStatus::Pending);
    assert_eq!(entries[0].retry_count, 1);

    let worker = Channel::new("worker");
    let mut inbound = worker.subscribe_inbound();
    let (a, b) = MessagePort::pair();
    worker.listen(b, None);
    host.connect(a, "worker");

    assert_eq!(host.flush_deferred(&storage, "worker").await.unwrap(), 1);

    let event = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let message = inbound.recv().await.unwrap();
            if message.kind == MessageKind::Event {
                return message;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(event.sender, "host");
    assert_eq!(event.event_payload().unwrap().event, "ready");

    let stats = storage.get_mailbox_stats("worker").await.unwrap();
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn test_routed_message_is_not_deferred() {
    let (_tmp, storage) = create_test_env();
    let host = Channel::new("host");
    let worker = Channel::new("worker");
    let (a, b) = MessagePort::pair();
    worker.listen(b, None);
    host.connect(a, "worker");

    let delivery = host
        .send_or_defer(ready_event(), &storage, DeferOptions::default())
        .await
        .unwrap();
    assert!(matches!(delivery, Delivery::Sent));
    assert_eq!(storage.get_mailbox_stats("worker").await.unwrap().total, 0);
}

#[tokio::test]
async fn test_retry_budget_ends_in_failed() {
    let (_tmp, storage) = create_test_env();
    let host = Channel::new("host");
    host.send_or_defer(
        ready_event(),
        &storage,
        DeferOptions::default().with_max_retries(2),
    )
    .await
    .unwrap();

    for _ in 0..3 {
        host.flush_deferred(&storage, "worker").await.unwrap();
    }

    let entries = storage
        .get_deferred_messages("worker", Default::default())
        .await
        .unwrap();
    assert_eq!(entries[0].status, MailboxStatus::Failed);
    assert_eq!(entries[0].retry_count, 2);
    assert!(storage.process_next_pending("worker").await.unwrap().is_none());
}

#[tokio::test]
async fn test_two_handles_share_one_database_file() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("shared.db");
    let host = ChannelStorage::open_at("host", &db_path).unwrap();
    let worker = ChannelStorage::open_at("worker", &db_path).unwrap();

    host.exchange_put("config", json!({"mode": "fast"}), Some(vec!["worker".into()]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        worker.exchange_get("config").await.unwrap(),
        Some(json!({"mode": "fast"}))
    );

    host.defer(&ready_event(), DeferOptions::default()).await.unwrap();
    let claimed = worker.process_next_pending("worker").await.unwrap().unwrap();
    assert_eq!(claimed.status, MailboxStatus::Processing);
    assert!(worker.mark_delivered(&claimed.id).await.unwrap());
    assert!(!host.mark_delivered(&claimed.id).await.unwrap());
}

#[tokio::test]
async fn test_exchange_isolation_between_channels() {
    let (_tmp, host) = create_test_env();
    let worker = host.for_channel("worker");
    let outsider = host.for_channel("outsider");

    host.exchange_put("secret", json!("s3"), Some(vec!["worker".into()]))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(worker.exchange_get("secret").await.unwrap(), Some(json!("s3")));
    assert_eq!(outsider.exchange_get("secret").await.unwrap(), None);
    assert!(outsider.exchange_put("secret", json!("x"), None).await.unwrap().is_none());
    assert!(!outsider.exchange_delete("secret").await.unwrap());
    assert!(!worker.exchange_delete("secret").await.unwrap());

    assert!(worker.exchange_lock("secret", None).await.unwrap());
    assert!(!host.exchange_lock("secret", None).await.unwrap());
    assert!(!host.exchange_unlock("secret").await.unwrap());
    assert!(worker.exchange_unlock("secret").await.unwrap());
    assert!(host.exchange_delete("secret").await.unwrap());
}

#[tokio::test]
async fn test_pending_operation_completed_from_another_handle() {
    let (_tmp, host) = create_test_env();
    let worker = host.for_channel("worker");

    let id = host
        .register_pending("export", json!({"rows": 10}), None)
        .await
        .unwrap();
    let waiter = {
        let host = host.clone();
        let id = id.clone();
        tokio::spawn(async move { host.await_pending(&id, Some(Duration::from_secs(2))).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(worker.complete_pending(&id, json!({"ok": true})).await.unwrap());

    let result = waiter.await.unwrap().unwrap();
    assert_eq!(result, Some(json!({"ok": true})));
    assert!(host.get_pending_operations().await.unwrap().is_empty());
}
