//! End-to-end channel behaviour over in-process bindings.

use std::sync::Arc;
use std::time::{Duration, Instant};

use uniform_core::{
    path, Action, Channel, ChannelConfig, ChannelError, ConnectionQuery, MessagePort, ModuleTable,
    ObjectRef, Value,
};

/// Host and worker joined by a port pair, worker connected to host.
fn create_test_pair() -> (Channel, Channel) {
    let host = Channel::new("host");
    let worker = Channel::new("worker");
    let (a, b) = MessagePort::pair();
    host.listen(a, None);
    worker.connect(b, "host");
    (host, worker)
}

#[tokio::test]
async fn test_apply_exposed_greeting() {
    let (host, worker) = create_test_pair();
    host.expose("greet", ObjectRef::function(|_, _| Ok(Value::from("hi"))));

    let result = worker
        .invoke("host", Action::Apply, path(["greet"]), vec![Value::List(vec![])])
        .await
        .unwrap();
    assert_eq!(result, Value::from("hi"));
}

#[tokio::test]
async fn test_get_on_missing_path_is_null() {
    let (_host, worker) = create_test_pair();
    let result = worker
        .invoke("host", Action::Get, path(["missing"]), vec![Value::from("x")])
        .await
        .unwrap();
    assert_eq!(result, Value::Null);
}

#[tokio::test]
async fn test_silent_peer_times_out_naming_action_and_path() {
    let worker = Channel::new("worker");
    let (a, _silent) = MessagePort::pair();
    worker.attach(a, None);

    let started = Instant::now();
    let err = worker
        .invoke_with_timeout(
            "host",
            Action::Get,
            path(["svc", "status"]),
            vec![],
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, ChannelError::Timeout { .. }));
    assert_eq!(err.to_string(), "Request timeout: get on svc.status");
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_secs(2));
    assert_eq!(worker.pending_count(), 0);
}

#[tokio::test]
async fn test_late_response_after_timeout_is_dropped() {
    let (host, worker) = create_test_pair();
    host.expose(
        "slow",
        ObjectRef::async_function(|_, _| async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok(Value::from("late"))
        }),
    );
    host.expose("fast", ObjectRef::function(|_, _| Ok(Value::from("fast"))));

    let err = worker
        .invoke_with_timeout(
            "host",
            Action::Apply,
            path(["slow"]),
            vec![Value::List(vec![])],
            Duration::from_millis(30),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::Timeout { .. }));

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(worker.pending_count(), 0);
    assert_eq!(
        worker.call("host", path(["fast"]), vec![]).await.unwrap(),
        Value::from("fast")
    );
}

#[tokio::test]
async fn test_out_of_order_responses_correlate_by_id() {
    let (host, worker) = create_test_pair();
    host.expose(
        "slow",
        ObjectRef::async_function(|_, _| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(Value::from("slow"))
        }),
    );
    host.expose("fast", ObjectRef::function(|_, _| Ok(Value::from("fast"))));

    let slow = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.call("host", path(["slow"]), vec![]).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let fast = worker.call("host", path(["fast"]), vec![]).await.unwrap();

    assert_eq!(fast, Value::from("fast"));
    assert_eq!(slow.await.unwrap().unwrap(), Value::from("slow"));
}

#[tokio::test]
async fn test_proxy_round_trips_to_original_object() {
    let (host, worker) = create_test_pair();
    let store = ObjectRef::new().with("count", 3);
    let original = store.clone();
    host.expose("store", store);
    host.expose(
        "isStore",
        ObjectRef::function(move |_, args| {
            let same = args
                .first()
                .and_then(Value::as_object)
                .is_some_and(|obj| obj.ptr_eq(&original));
            Ok(Value::Bool(same))
        }),
    );

    let proxy = worker.get("host", Vec::new(), "store").await.unwrap();
    assert!(proxy.is_reference());
    let same = worker
        .call("host", path(["isStore"]), vec![proxy.clone()])
        .await
        .unwrap();
    assert_eq!(same, Value::Bool(true));

    let Value::Remote(remote) = proxy else {
        panic!("expected remote proxy");
    };
    assert_eq!(remote.child("count").value().await.unwrap(), Value::Int(3));
}

#[tokio::test]
async fn test_repeated_descriptors_decode_to_same_proxy() {
    let (host, worker) = create_test_pair();
    host.expose("config", ObjectRef::new().with("debug", true));

    let first = worker.get("host", Vec::new(), "config").await.unwrap();
    let second = worker.get("host", Vec::new(), "config").await.unwrap();
    let (Value::Remote(a), Value::Remote(b)) = (&first, &second) else {
        panic!("expected remote proxies");
    };
    assert!(a.ptr_eq(b));
    assert!(a.child("debug").ptr_eq(&b.child("debug")));
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_callbacks_flow_back_to_caller() {
    let (host, worker) = create_test_pair();
    host.expose(
        "applyTwice",
        ObjectRef::async_function(|_, args| async move {
            let callback = args
                .first()
                .and_then(Value::as_remote)
                .cloned()
                .ok_or_else(|| ChannelError::Other("callback required".into()))?;
            let seed = args.get(1).cloned().unwrap_or_default();
            let once = callback.call(vec![seed]).await?;
            callback.call(vec![once]).await
        }),
    );
    host.expose("noop", ObjectRef::function(|_, _| Ok(Value::Null)));
    worker.call("host", path(["noop"]), vec![]).await.unwrap();

    let increment = ObjectRef::function(|_, args| {
        Ok(Value::Int(args.first().and_then(Value::as_i64).unwrap_or(0) + 1))
    });
    let result = worker
        .call("host", path(["applyTwice"]), vec![Value::Object(increment), Value::Int(40)])
        .await
        .unwrap();
    assert_eq!(result, Value::Int(42));
}

#[tokio::test]
async fn test_set_then_get_through_proxy() {
    let (host, worker) = create_test_pair();
    let settings = ObjectRef::new().with("theme", "light");
    host.expose("settings", settings.clone());

    let proxy = worker.remote("host", "settings");
    assert!(proxy.set("theme", "dark").await.unwrap());
    assert_eq!(settings.get("theme"), Some(Value::from("dark")));
    assert_eq!(proxy.child("theme").value().await.unwrap(), Value::from("dark"));

    let keys = proxy.own_keys().await.unwrap();
    assert_eq!(keys, vec!["theme".to_string()]);
    assert!(proxy.has("theme").await.unwrap());
    assert!(!proxy.has("missing").await.unwrap());
}

#[tokio::test]
async fn test_construct_remote_instance() {
    let (host, worker) = create_test_pair();
    host.expose(
        "Point",
        ObjectRef::constructor(|args| {
            let x = args.first().cloned().unwrap_or_default();
            Ok(Value::Object(ObjectRef::new().with("x", x)))
        }),
    );

    let point = worker
        .construct("host", path(["Point"]), vec![Value::Int(7)])
        .await
        .unwrap();
    let Value::Remote(point) = point else {
        panic!("expected remote instance");
    };
    assert_eq!(point.child("x").value().await.unwrap(), Value::Int(7));
    assert!(point.dispose().await.unwrap());
    assert_eq!(point.child("x").value().await.unwrap(), Value::Null);
}

#[tokio::test]
async fn test_calling_non_function_reports_remote_error() {
    let (host, worker) = create_test_pair();
    host.expose("data", ObjectRef::new());
    let err = worker.call("host", path(["data"]), vec![]).await.unwrap_err();
    assert!(matches!(err, ChannelError::Remote(ref m) if m.contains("not callable")));
}

#[tokio::test]
async fn test_import_through_module_table() {
    let modules = ModuleTable::new();
    modules.register("math", || {
        Ok(Value::Object(
            ObjectRef::new().with("e", 2.5),
        ))
    });
    let host = Channel::with_config(ChannelConfig::new("host").with_modules(Arc::new(modules)));
    let worker = Channel::new("worker");
    let (a, b) = MessagePort::pair();
    host.listen(a, None);
    worker.connect(b, "host");

    let module = worker.import("host", "math").await.unwrap();
    assert!(module.is_reference());
    let err = worker.import("host", "missing").await.unwrap_err();
    assert!(matches!(err, ChannelError::Remote(ref m) if m.contains("missing")));
}

#[tokio::test]
async fn test_connection_bookkeeping_after_close() {
    let (host, worker) = create_test_pair();
    host.expose("noop", ObjectRef::function(|_, _| Ok(Value::Null)));
    worker.call("host", path(["noop"]), vec![]).await.unwrap();
    assert_eq!(worker.connected_channels(), vec!["host".to_string()]);

    let mut events = worker.subscribe_connections();
    worker.close();
    let event = events.recv().await.unwrap();
    assert_eq!(event.kind, uniform_core::ConnectionEventKind::Disconnected);
    assert!(worker.query_connections(&ConnectionQuery::default()).is_empty());
    assert!(worker.connected_channels().is_empty());
}

#[tokio::test]
async fn test_notify_connections_marks_peers() {
    let (host, worker) = create_test_pair();
    host.expose("noop", ObjectRef::function(|_, _| Ok(Value::Null)));
    worker.call("host", path(["noop"]), vec![]).await.unwrap();

    let reached = host.notify_connections(serde_json::json!({"reason": "reload"}));
    assert_eq!(reached, 1);
    let connections = host.query_connections(&ConnectionQuery::channel("worker"));
    assert!(connections[0].last_notify_at.is_some());
}
