//! Live WebSocket server test: handshake, hello_ack, in-band protocol
//! errors, and command delivery over a real socket.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use trinityd::ipc::{self, protocol, IpcCallbacks};

const TEST_PORT: u16 = 49371;

async fn recv_json<S>(stream: &mut S) -> Value
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let frame = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("timed out waiting for frame")
        .expect("stream ended")
        .expect("ws error");
    match frame {
        Message::Text(text) => serde_json::from_str(&text).expect("frame is JSON"),
        other => panic!("expected text frame, got {other:?}"),
    }
}

#[tokio::test]
async fn server_speaks_the_protocol_end_to_end() {
    let mut config = common::test_config();
    config.ipc_port = TEST_PORT;
    let backend = Arc::new(common::PipelineBackend::new());
    let ctx = Arc::new(trinityd::AppContext::new(config, backend));

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server_ctx = Arc::clone(&ctx);
    let server = tokio::spawn(ipc::run(server_ctx, IpcCallbacks::default(), async move {
        let _ = shutdown_rx.await;
    }));

    // Give the listener a moment to bind.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let url = format!("ws://127.0.0.1:{TEST_PORT}/ws/daemon");
    let (mut ws, _) = connect_async(&url).await.expect("connect");

    // First server frame is hello_ack with our connection id.
    let ack = recv_json(&mut ws).await;
    assert_eq!(ack["type"], "hello_ack");
    let connection_id = ack["connectionId"].as_str().unwrap().to_string();
    assert!(!connection_id.is_empty());

    // hello patches metadata.
    ws.send(Message::Text(
        json!({"type":"hello","clientId":"it-daemon","sentAt":"now","platform":"linux"})
            .to_string(),
    ))
    .await
    .unwrap();

    // Malformed JSON gets an in-band error and the connection stays open.
    ws.send(Message::Text("{not json".into())).await.unwrap();
    let err = recv_json(&mut ws).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["code"], protocol::ERR_INVALID_JSON);

    // Unknown message type gets unsupported_type.
    ws.send(Message::Text(json!({"type":"metrics"}).to_string()))
        .await
        .unwrap();
    let err = recv_json(&mut ws).await;
    assert_eq!(err["code"], protocol::ERR_UNSUPPORTED_TYPE);

    // The registry saw the connection and the hello metadata.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let connections = ctx.registry.list(None);
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].connection_id, connection_id);
    assert_eq!(
        connections[0].metadata.client_id.as_deref(),
        Some("it-daemon")
    );

    // A command fanned out to this user arrives on the socket.
    let user_id = connections[0].user_id.clone();
    let (command_id, cmd) = protocol::build_command("restart", None);
    let delivery = ctx.registry.send_command_to_user(&user_id, &cmd);
    assert!(delivery.ok);
    let received = recv_json(&mut ws).await;
    assert_eq!(received["type"], "command");
    assert_eq!(received["commandId"], command_id.as_str());

    // Heartbeats advance last_seen_at.
    let before = ctx.registry.list(None)[0].last_seen_at;
    tokio::time::sleep(Duration::from_millis(20)).await;
    ws.send(Message::Text(
        json!({"type":"heartbeat","sentAt":"now"}).to_string(),
    ))
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(ctx.registry.list(None)[0].last_seen_at >= before);

    // Shutdown closes the connection and empties the registry.
    shutdown_tx.send(()).unwrap();
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None => break,
                _ => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "expected a close frame after shutdown");
    server.await.unwrap().unwrap();
    assert!(ctx.registry.is_empty());
}

#[tokio::test]
async fn wrong_path_is_rejected_at_the_handshake() {
    let mut config = common::test_config();
    config.ipc_port = TEST_PORT + 1;
    let backend = Arc::new(common::PipelineBackend::new());
    let ctx = Arc::new(trinityd::AppContext::new(config, backend));

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(ipc::run(ctx, IpcCallbacks::default(), async move {
        let _ = shutdown_rx.await;
    }));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let url = format!("ws://127.0.0.1:{}/wrong/path", TEST_PORT + 1);
    assert!(connect_async(&url).await.is_err());

    shutdown_tx.send(()).unwrap();
    server.await.unwrap().unwrap();
}
