//! Server ↔ daemon-client conversation using the bundled IPC client.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot};

use trinityd::ipc::client::{CommandHandler, IpcClient, IpcClientConfig};
use trinityd::ipc::{self, protocol, EventContext, IpcCallbacks};

const TEST_PORT: u16 = 49381;

async fn spawn_server(
    port: u16,
    callbacks: IpcCallbacks,
) -> (Arc<trinityd::AppContext>, oneshot::Sender<()>) {
    let mut config = common::test_config();
    config.ipc_port = port;
    let backend = Arc::new(common::PipelineBackend::new());
    let ctx = Arc::new(trinityd::AppContext::new(config, backend));

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server_ctx = Arc::clone(&ctx);
    tokio::spawn(ipc::run(server_ctx, callbacks, async move {
        let _ = shutdown_rx.await;
    }));
    tokio::time::sleep(Duration::from_millis(100)).await;
    (ctx, shutdown_tx)
}

#[tokio::test]
async fn events_flow_to_the_server_and_commands_round_trip() {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<EventContext>();
    let (result_tx, mut result_rx) = mpsc::unbounded_channel();

    let callbacks = IpcCallbacks {
        on_event: Some(Arc::new(move |event| {
            let event_tx = event_tx.clone();
            Box::pin(async move {
                event_tx.send(event).ok();
                Ok(())
            })
        })),
        on_command_result: Some(Arc::new(move |result| {
            result_tx.send(result).ok();
        })),
    };
    let (ctx, shutdown) = spawn_server(TEST_PORT, callbacks).await;

    // A daemon that answers "echo" commands and refuses everything else.
    let handler: CommandHandler = Arc::new(|name, payload| {
        if name == "echo" {
            let mut result = Map::new();
            result.insert(
                "echoed".to_string(),
                payload
                    .and_then(|p| p.get("value").cloned())
                    .unwrap_or(Value::Null),
            );
            Ok(Some(result))
        } else {
            Err(format!("unknown command: {name}"))
        }
    });

    let client = IpcClient::connect(
        IpcClientConfig::new(
            &format!("ws://127.0.0.1:{TEST_PORT}/ws/daemon"),
            "test-daemon",
        ),
        handler,
    )
    .await
    .unwrap();
    assert!(client.is_connected());

    // Event frames reach the server callback with the daemon's identity.
    let mut payload = Map::new();
    payload.insert("path".to_string(), json!("/etc/hosts"));
    client.send_event("fs.changed", payload).unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.event_type, "fs.changed");
    assert_eq!(event.connection_id, client.connection_id);
    assert_eq!(event.payload["path"], "/etc/hosts");

    // A fanned-out command is answered with command_result.
    let user_id = ctx.registry.list(None)[0].user_id.clone();
    let mut cmd_payload = Map::new();
    cmd_payload.insert("value".to_string(), json!(41));
    let (command_id, cmd) = protocol::build_command("echo", Some(cmd_payload));
    assert!(ctx.registry.send_command_to_user(&user_id, &cmd).ok);

    let result = tokio::time::timeout(Duration::from_secs(5), result_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.command_id, command_id);
    assert!(result.ok);

    // An unknown command comes back as a failed result.
    let (command_id, cmd) = protocol::build_command("explode", None);
    assert!(ctx.registry.send_command_to_user(&user_id, &cmd).ok);
    let result = tokio::time::timeout(Duration::from_secs(5), result_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.command_id, command_id);
    assert!(!result.ok);
    assert!(result.error.unwrap().contains("unknown command"));

    shutdown.send(()).unwrap();
}

#[tokio::test]
async fn oversized_frames_are_rejected_by_the_transport() {
    let (ctx, shutdown) = spawn_server(TEST_PORT + 1, IpcCallbacks::default()).await;

    let handler: CommandHandler = Arc::new(|_, _| Ok(None));
    let client = IpcClient::connect(
        IpcClientConfig::new(
            &format!("ws://127.0.0.1:{}/ws/daemon", TEST_PORT + 1),
            "oversize-daemon",
        ),
        handler,
    )
    .await
    .unwrap();

    // One event larger than the server's frame cap: the server drops the
    // connection at the transport level and the registry forgets it.
    let mut payload = Map::new();
    payload.insert(
        "blob".to_string(),
        json!("x".repeat(ctx.config.ipc.max_message_size + 1)),
    );
    client.send_event("too.big", payload).unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if ctx.registry.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("oversized sender should be dropped");

    shutdown.send(()).unwrap();
}
