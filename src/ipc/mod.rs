//! IPC WebSocket bridge — the daemon-facing control channel.
//!
//! Daemons connect to `ws://host:IPC_PORT{IPC_WS_PATH}`, authenticate during
//! the upgrade, and speak the protocol in [`protocol`]: `hello` patches
//! connection metadata, `heartbeat` keeps the connection alive, `event`
//! frames flow into the audit log, and `command_result` frames answer
//! commands fanned out from the HTTP API. A single reaper timer pings open
//! sockets and removes the ones that went quiet.

pub mod auth;
pub mod client;
pub mod protocol;
pub mod registry;

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::{accept_hdr_async_with_config, tungstenite::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::AppContext;
use auth::authenticate_upgrade;
use protocol::{build_error, build_hello_ack, IpcMessage};
use registry::{ConnectionMetadata, DaemonConnection, OutboundFrame};

/// Close code for authentication failures.
const CLOSE_POLICY: u16 = 1008;
/// Close code for server shutdown.
const CLOSE_GOING_AWAY: u16 = 1001;

// ─── Callbacks ────────────────────────────────────────────────────────────────

/// Context handed to the event callback for every inbound `event` frame.
#[derive(Debug, Clone)]
pub struct EventContext {
    pub connection_id: String,
    pub user_id: String,
    pub event_type: String,
    pub event_id: String,
    pub payload: Value,
}

/// Context handed to the result callback for every `command_result` frame.
#[derive(Debug, Clone)]
pub struct CommandResultContext {
    pub connection_id: String,
    pub user_id: String,
    pub command_id: String,
    pub ok: bool,
    pub error: Option<String>,
}

/// Untrusted event hook: errors are caught and logged, and the future runs
/// on its own task so it can never stall the receive loop.
pub type EventCallback =
    Arc<dyn Fn(EventContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;
pub type CommandResultCallback = Arc<dyn Fn(CommandResultContext) + Send + Sync>;

#[derive(Clone, Default)]
pub struct IpcCallbacks {
    pub on_event: Option<EventCallback>,
    pub on_command_result: Option<CommandResultCallback>,
}

// ─── Server ───────────────────────────────────────────────────────────────────

/// Run the IPC server until `shutdown` resolves.
pub async fn run(
    ctx: Arc<AppContext>,
    callbacks: IpcCallbacks,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    let addr = format!("0.0.0.0:{}", ctx.config.ipc_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, path = %ctx.config.ipc.ws_path, "IPC WebSocket server listening");

    let mut reaper = tokio::time::interval(std::time::Duration::from_millis(
        ctx.config.ipc.heartbeat_interval_ms,
    ));
    reaper.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received — closing daemon connections");
                ctx.registry.close_all(CLOSE_GOING_AWAY, "Server shutting down");
                break;
            }

            _ = reaper.tick() => {
                let reaped = ctx.registry.sweep(
                    Utc::now().timestamp_millis(),
                    ctx.config.ipc.client_timeout_ms as i64,
                );
                if !reaped.is_empty() {
                    debug!(count = reaped.len(), "reaper removed stale connections");
                }
            }

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(err = %e, "accept error");
                        continue;
                    }
                };
                debug!(peer = %peer, "new daemon connection");
                let ctx = Arc::clone(&ctx);
                let callbacks = callbacks.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, ctx, callbacks).await {
                        warn!(peer = %peer, err = %e, "connection error");
                    }
                });
            }
        }
    }

    info!("IPC server stopped");
    Ok(())
}

// ─── Per-connection handling ──────────────────────────────────────────────────

async fn handle_connection(
    stream: tokio::net::TcpStream,
    peer: std::net::SocketAddr,
    ctx: Arc<AppContext>,
    callbacks: IpcCallbacks,
) -> Result<()> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(ctx.config.ipc.max_message_size),
        ..Default::default()
    };

    // Capture the upgrade request so authentication can run after the
    // handshake completes (auth failures close in-band with 1008).
    let expected_path = ctx.config.ipc.ws_path.clone();
    let captured: Arc<std::sync::Mutex<Option<CapturedUpgrade>>> =
        Arc::new(std::sync::Mutex::new(None));
    let captured_cb = Arc::clone(&captured);

    let callback = move |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
        let path = req.uri().path().to_string();
        if path != expected_path {
            let mut not_found = ErrorResponse::new(Some("not found".to_string()));
            *not_found.status_mut() =
                tokio_tungstenite::tungstenite::http::StatusCode::NOT_FOUND;
            return Err(not_found);
        }
        *captured_cb.lock().expect("upgrade capture lock") = Some(CapturedUpgrade {
            query: req.uri().query().map(str::to_string),
            headers: req.headers().clone(),
        });
        Ok(resp)
    };

    let ws = accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;
    let (mut sink, mut reader) = ws.split();

    let upgrade = captured
        .lock()
        .expect("upgrade capture lock")
        .take()
        .ok_or_else(|| anyhow::anyhow!("upgrade request not captured"))?;

    // ── Authenticate ─────────────────────────────────────────────────────────
    let identity =
        match authenticate_upgrade(&ctx.config, &upgrade.headers, upgrade.query.as_deref()) {
            Ok(identity) => identity,
            Err(e) => {
                warn!(peer = %peer, err = %e, "upgrade authentication failed");
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::from(CLOSE_POLICY),
                        reason: "Unauthorized".into(),
                    })))
                    .await;
                return Ok(());
            }
        };

    // ── Register ─────────────────────────────────────────────────────────────
    let connection_id = Uuid::new_v4().to_string();
    let now_ms = Utc::now().timestamp_millis();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundFrame>();

    ctx.registry.register(DaemonConnection {
        connection_id: connection_id.clone(),
        user_id: identity.user_id.clone(),
        outbound: outbound_tx,
        connected_at: now_ms,
        last_seen_at: now_ms,
        metadata: ConnectionMetadata {
            ip_address: Some(peer.ip().to_string()),
            user_agent: identity.user_agent.clone(),
            daemon_gpt_id: identity.daemon_gpt_id.clone(),
            ..Default::default()
        },
    });
    info!(connection_id = %connection_id, user_id = %identity.user_id, "daemon connected");

    // hello_ack must be the first server frame.
    let ack = build_hello_ack(&connection_id, Some(env!("CARGO_PKG_VERSION")));
    if sink.send(Message::Text(ack.to_wire())).await.is_err() {
        ctx.registry.remove(&connection_id);
        return Ok(());
    }

    // ── Receive loop ─────────────────────────────────────────────────────────
    loop {
        tokio::select! {
            inbound = reader.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_frame(
                            &ctx,
                            &callbacks,
                            &connection_id,
                            &identity.user_id,
                            &text,
                        ) {
                            if sink.send(Message::Text(reply.to_wire())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ctx.registry.touch(&connection_id, Utc::now().timestamp_millis());
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        ctx.registry.touch(&connection_id, Utc::now().timestamp_millis());
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let reply = build_error(
                            Some(protocol::ERR_INVALID_MESSAGE),
                            "binary frames are not supported",
                        );
                        if sink.send(Message::Text(reply.to_wire())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(connection_id = %connection_id, err = %e, "ws error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
            frame = outbound_rx.recv() => {
                match frame {
                    Some(OutboundFrame::Text(text)) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Some(OutboundFrame::Ping) => {
                        if sink.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                    Some(OutboundFrame::Close { code, reason }) => {
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::from(code),
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    }
                    Some(OutboundFrame::Terminate) | None => break,
                }
            }
        }
    }

    ctx.registry.remove(&connection_id);
    info!(connection_id = %connection_id, "daemon disconnected");
    Ok(())
}

struct CapturedUpgrade {
    query: Option<String>,
    headers: tokio_tungstenite::tungstenite::http::HeaderMap,
}

// ─── Frame dispatch ───────────────────────────────────────────────────────────

/// Handle one inbound text frame; returns the reply to send, if any.
///
/// Malformed frames are answered in-band and never close the connection.
fn handle_frame(
    ctx: &AppContext,
    callbacks: &IpcCallbacks,
    connection_id: &str,
    user_id: &str,
    text: &str,
) -> Option<IpcMessage> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            return Some(build_error(
                Some(protocol::ERR_INVALID_JSON),
                "frame is not valid JSON",
            ));
        }
    };

    let message = match protocol::parse_value(&value) {
        Ok(m) => m,
        Err(e) => {
            let code = if e.starts_with("Unsupported IPC message type") {
                protocol::ERR_UNSUPPORTED_TYPE
            } else {
                protocol::ERR_INVALID_MESSAGE
            };
            return Some(build_error(Some(code), &e));
        }
    };

    ctx.registry
        .touch(connection_id, Utc::now().timestamp_millis());

    let type_name = message.type_name();
    match message {
        IpcMessage::Hello {
            client_id,
            instance_id,
            platform,
            ..
        } => {
            ctx.registry.update_metadata(
                connection_id,
                ConnectionMetadata {
                    client_id: Some(client_id),
                    instance_id,
                    platform,
                    ..Default::default()
                },
            );
            None
        }
        IpcMessage::Heartbeat { .. } => None,
        IpcMessage::Event {
            event_type,
            event_id,
            payload,
            ..
        } => {
            if let Some(on_event) = &callbacks.on_event {
                let event = EventContext {
                    connection_id: connection_id.to_string(),
                    user_id: user_id.to_string(),
                    event_type,
                    event_id,
                    payload: Value::Object(payload),
                };
                let hook = Arc::clone(on_event);
                // The callback is untrusted: run it on its own task and
                // only log failures.
                tokio::spawn(async move {
                    if let Err(e) = hook(event).await {
                        warn!(err = %e, "event callback failed");
                    }
                });
            }
            None
        }
        IpcMessage::CommandResult {
            command_id,
            ok,
            error,
            ..
        } => {
            if let Some(on_result) = &callbacks.on_command_result {
                on_result(CommandResultContext {
                    connection_id: connection_id.to_string(),
                    user_id: user_id.to_string(),
                    command_id,
                    ok,
                    error,
                });
            }
            None
        }
        IpcMessage::Error { message, code, .. } => {
            warn!(
                connection_id,
                code = code.as_deref().unwrap_or("-"),
                message = %message,
                "daemon reported error"
            );
            None
        }
        // Server-originated types bounced back at us.
        IpcMessage::HelloAck { .. } | IpcMessage::Command { .. } => Some(build_error(
            Some(protocol::ERR_UNSUPPORTED_TYPE),
            &format!("message type '{type_name}' is not accepted by the server"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::registry::ConnectionRegistry;

    fn test_ctx() -> Arc<AppContext> {
        crate::test_support::app_context()
    }

    fn register(ctx: &AppContext, id: &str, user: &str) -> mpsc::UnboundedReceiver<OutboundFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        ctx.registry.register(DaemonConnection {
            connection_id: id.to_string(),
            user_id: user.to_string(),
            outbound: tx,
            connected_at: 0,
            last_seen_at: 0,
            metadata: ConnectionMetadata::default(),
        });
        rx
    }

    #[tokio::test]
    async fn invalid_json_gets_in_band_error() {
        let ctx = test_ctx();
        let reply = handle_frame(&ctx, &IpcCallbacks::default(), "c1", "u1", "{oops");
        match reply.unwrap() {
            IpcMessage::Error { code, .. } => {
                assert_eq!(code.as_deref(), Some(protocol::ERR_INVALID_JSON));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_type_gets_unsupported_type() {
        let ctx = test_ctx();
        let reply = handle_frame(
            &ctx,
            &IpcCallbacks::default(),
            "c1",
            "u1",
            r#"{"type":"mystery"}"#,
        );
        match reply.unwrap() {
            IpcMessage::Error { code, .. } => {
                assert_eq!(code.as_deref(), Some(protocol::ERR_UNSUPPORTED_TYPE));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn hello_patches_metadata_and_touches() {
        let ctx = test_ctx();
        let _rx = register(&ctx, "c1", "u1");
        let reply = handle_frame(
            &ctx,
            &IpcCallbacks::default(),
            "c1",
            "u1",
            r#"{"type":"hello","clientId":"daemon-a","sentAt":"now","platform":"linux"}"#,
        );
        assert!(reply.is_none());
        let conns = ctx.registry.list(Some("u1"));
        assert_eq!(conns[0].metadata.client_id.as_deref(), Some("daemon-a"));
        assert_eq!(conns[0].metadata.platform.as_deref(), Some("linux"));
        assert!(conns[0].last_seen_at > 0);
    }

    #[tokio::test]
    async fn command_sent_to_server_is_rejected() {
        let ctx = test_ctx();
        let reply = handle_frame(
            &ctx,
            &IpcCallbacks::default(),
            "c1",
            "u1",
            r#"{"type":"command","commandId":"x","name":"n","issuedAt":"t"}"#,
        );
        match reply.unwrap() {
            IpcMessage::Error { code, .. } => {
                assert_eq!(code.as_deref(), Some(protocol::ERR_UNSUPPORTED_TYPE));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn event_invokes_callback_off_loop() {
        let ctx = test_ctx();
        let _rx = register(&ctx, "c1", "u1");
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let callbacks = IpcCallbacks {
            on_event: Some(Arc::new(move |event: EventContext| {
                let seen_tx = seen_tx.clone();
                Box::pin(async move {
                    seen_tx.send(event.event_type).ok();
                    Ok(())
                })
            })),
            on_command_result: None,
        };
        let reply = handle_frame(
            &ctx,
            &callbacks,
            "c1",
            "u1",
            r#"{"type":"event","eventType":"fs.changed","eventId":"e1","sentAt":"t","payload":{}}"#,
        );
        assert!(reply.is_none());
        let seen = seen_rx.recv().await.unwrap();
        assert_eq!(seen, "fs.changed");
    }

    #[test]
    fn registry_reap_does_not_disturb_other_connections() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        registry.register(DaemonConnection {
            connection_id: "stale".into(),
            user_id: "u".into(),
            outbound: tx1,
            connected_at: 0,
            last_seen_at: 0,
            metadata: ConnectionMetadata::default(),
        });
        registry.register(DaemonConnection {
            connection_id: "fresh".into(),
            user_id: "u".into(),
            outbound: tx2,
            connected_at: 0,
            last_seen_at: 119_000,
            metadata: ConnectionMetadata::default(),
        });
        let reaped = registry.sweep(120_000, 90_000);
        assert_eq!(reaped, vec!["stale".to_string()]);
        let remaining = registry.list(None);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].connection_id, "fresh");
    }
}
