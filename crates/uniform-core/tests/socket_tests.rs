//! Channels talking over TCP sockets.

use std::time::Duration;

use uniform_core::{
    path, Channel, ChannelError, ConnectionQuery, ObjectRef, SocketBinding, SocketServer,
    SocketServerHandle, TransportKind, Value,
};

/// Start a host channel behind a socket server on an ephemeral port.
async fn create_test_server() -> (Channel, SocketServerHandle) {
    let host = Channel::new("host");
    host.expose(
        "math",
        ObjectRef::new().with(
            "add",
            ObjectRef::function(|_, args| {
                let sum = args.iter().filter_map(Value::as_i64).sum::<i64>();
                Ok(Value::Int(sum))
            }),
        ),
    );
    let accepted = host.clone();
    let handle = SocketServer::start("127.0.0.1:0", move |binding| {
        accepted.listen(binding, None);
    })
    .await
    .unwrap();
    (host, handle)
}

async fn create_test_client(handle: &SocketServerHandle) -> Channel {
    let worker = Channel::new("worker");
    let binding = SocketBinding::connect(handle.addr()).await.unwrap();
    worker.connect(binding, "host");
    worker
}

#[tokio::test]
async fn test_call_over_socket() {
    let (_host, handle) = create_test_server().await;
    let worker = create_test_client(&handle).await;

    let sum = worker
        .call("host", path(["math", "add"]), vec![Value::Int(2), Value::Int(40)])
        .await
        .unwrap();
    assert_eq!(sum, Value::Int(42));
}

#[tokio::test]
async fn test_reference_proxy_over_socket() {
    let (_host, handle) = create_test_server().await;
    let worker = create_test_client(&handle).await;

    let math = worker.get("host", Vec::new(), "math").await.unwrap();
    let Value::Remote(math) = math else {
        panic!("expected remote reference");
    };
    let add = math.child("add");
    assert_eq!(add.call(vec![Value::Int(1), Value::Int(1)]).await.unwrap(), Value::Int(2));
}

#[tokio::test]
async fn test_socket_connections_are_tracked_on_both_sides() {
    let (host, handle) = create_test_server().await;
    let worker = create_test_client(&handle).await;
    worker.call("host", path(["math", "add"]), vec![]).await.unwrap();

    let outgoing = worker.query_connections(&ConnectionQuery::channel("host"));
    assert_eq!(outgoing.len(), 1);
    assert_eq!(outgoing[0].transport, TransportKind::Tcp);

    let incoming = host.query_connections(&ConnectionQuery::channel("worker"));
    assert_eq!(incoming.len(), 1);
    assert_eq!(incoming[0].transport, TransportKind::Tcp);
}

#[tokio::test]
async fn test_server_shutdown_closes_client_binding() {
    let (_host, mut handle) = create_test_server().await;
    let binding = SocketBinding::connect(handle.addr()).await.unwrap();
    let worker = Channel::new("worker");
    worker.connect(binding.clone(), "host");

    handle.shutdown();
    tokio::time::timeout(Duration::from_secs(2), binding.closed())
        .await
        .unwrap();

    let err = worker
        .invoke_with_timeout(
            "host",
            uniform_core::Action::Get,
            Vec::new(),
            vec![Value::from("math")],
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::Timeout { .. }));
}
