//! Daemon-side IPC client.
//!
//! Reference implementation of the daemon end of the bridge: connect,
//! announce with `hello`, keep the connection alive with heartbeats, run a
//! command handler for inbound `command` frames and answer each with a
//! `command_result`. Embedded daemons use this; the integration tests drive
//! the server with it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::protocol::{self, IpcMessage};

/// Handler for inbound commands: returns `Ok(result)` or `Err(reason)`.
pub type CommandHandler =
    Arc<dyn Fn(&str, Option<&Map<String, Value>>) -> Result<Option<Map<String, Value>>, String>
        + Send
        + Sync>;

pub struct IpcClientConfig {
    pub url: String,
    pub client_id: String,
    /// Bearer token sent on the upgrade request (jwt auth mode).
    pub token: Option<String>,
    /// API key header name/value pair (api_key auth mode).
    pub api_key: Option<(String, String)>,
    pub platform: Option<String>,
    pub heartbeat_interval: Duration,
}

impl IpcClientConfig {
    pub fn new(url: &str, client_id: &str) -> Self {
        Self {
            url: url.to_string(),
            client_id: client_id.to_string(),
            token: None,
            api_key: None,
            platform: Some(std::env::consts::OS.to_string()),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// A connected daemon client.
pub struct IpcClient {
    /// Connection id assigned by the server's `hello_ack`.
    pub connection_id: String,
    /// Events and other messages queued for the server.
    sender: mpsc::UnboundedSender<IpcMessage>,
    task: tokio::task::JoinHandle<()>,
}

impl IpcClient {
    /// Connect, wait for `hello_ack`, send `hello`, then run the message
    /// loop in the background.
    pub async fn connect(config: IpcClientConfig, on_command: CommandHandler) -> Result<Self> {
        let mut request = config
            .url
            .as_str()
            .into_client_request()
            .context("invalid IPC url")?;
        if let Some(token) = &config.token {
            request.headers_mut().insert(
                "authorization",
                format!("Bearer {token}").parse().context("invalid token")?,
            );
        }
        if let Some((header, value)) = &config.api_key {
            request
                .headers_mut()
                .insert(header.parse::<tokio_tungstenite::tungstenite::http::header::HeaderName>()
                    .context("invalid api key header")?,
                    value.parse().context("invalid api key value")?);
        }

        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .context("IPC connect failed")?;
        let (mut sink, mut stream) = ws.split();

        // The first server frame must be hello_ack.
        let first = tokio::time::timeout(Duration::from_secs(10), stream.next())
            .await
            .context("timed out waiting for hello_ack")?;
        let connection_id = match first {
            Some(Ok(Message::Text(text))) => match protocol::parse(&text) {
                Ok(IpcMessage::HelloAck { connection_id, .. }) => connection_id,
                Ok(other) => bail!("expected hello_ack, got {}", other.type_name()),
                Err(e) => bail!("malformed hello_ack: {e}"),
            },
            other => bail!("connection closed before hello_ack: {other:?}"),
        };

        let hello = IpcMessage::Hello {
            client_id: config.client_id.clone(),
            sent_at: Utc::now().to_rfc3339(),
            instance_id: Some(uuid::Uuid::new_v4().to_string()),
            platform: config.platform.clone(),
        };
        sink.send(Message::Text(hello.to_wire())).await?;

        let (sender, mut outbound) = mpsc::unbounded_channel::<IpcMessage>();
        let heartbeat_interval = config.heartbeat_interval;

        let task = tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(heartbeat_interval);
            heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = heartbeat.tick() => {
                        let beat = IpcMessage::Heartbeat { sent_at: Utc::now().to_rfc3339() };
                        if sink.send(Message::Text(beat.to_wire())).await.is_err() {
                            break;
                        }
                    }
                    queued = outbound.recv() => {
                        match queued {
                            Some(msg) => {
                                if sink.send(Message::Text(msg.to_wire())).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    inbound = stream.next() => {
                        match inbound {
                            Some(Ok(Message::Text(text))) => {
                                if let Some(reply) = handle_server_frame(&text, &on_command) {
                                    if sink.send(Message::Text(reply.to_wire())).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                if sink.send(Message::Pong(data)).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Err(e)) => {
                                warn!(err = %e, "ipc client stream error");
                                break;
                            }
                            Some(Ok(_)) => {}
                        }
                    }
                }
            }
            debug!("ipc client loop ended");
        });

        Ok(Self {
            connection_id,
            sender,
            task,
        })
    }

    /// Queue an `event` frame for the server.
    pub fn send_event(&self, event_type: &str, payload: Map<String, Value>) -> Result<()> {
        let event = IpcMessage::Event {
            event_type: event_type.to_string(),
            event_id: uuid::Uuid::new_v4().to_string(),
            sent_at: Utc::now().to_rfc3339(),
            payload,
        };
        self.sender
            .send(event)
            .map_err(|_| anyhow::anyhow!("ipc client is disconnected"))
    }

    pub fn is_connected(&self) -> bool {
        !self.task.is_finished()
    }

    /// Drop the connection without a close handshake.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Dispatch one server frame; returns a reply when one is due.
fn handle_server_frame(text: &str, on_command: &CommandHandler) -> Option<IpcMessage> {
    let message = match protocol::parse(text) {
        Ok(m) => m,
        Err(e) => {
            warn!(err = %e, "server sent an unparsable frame");
            return None;
        }
    };

    match message {
        IpcMessage::Command {
            command_id,
            name,
            payload,
            ..
        } => {
            let outcome = on_command(&name, payload.as_ref());
            let (ok, error, result) = match outcome {
                Ok(result) => (true, None, result),
                Err(reason) => (false, Some(reason), None),
            };
            Some(IpcMessage::CommandResult {
                command_id,
                ok,
                responded_at: Utc::now().to_rfc3339(),
                error,
                result,
            })
        }
        IpcMessage::Error { message, code, .. } => {
            warn!(code = code.as_deref().unwrap_or("-"), message = %message, "server error frame");
            None
        }
        // hello_ack after the handshake, heartbeats, events: nothing to do.
        _ => None,
    }
}
