//! In-memory registry of live daemon connections.
//!
//! The receive loop owns each socket's read half; the write half sits
//! behind an unbounded channel drained by a per-connection writer task.
//! The registry stores the channel sender, so fan-out and the reaper never
//! hold a socket — a send to a closed channel is simply reported as a
//! failed delivery.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use super::protocol::IpcMessage;

/// Frames the writer task can be asked to put on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    /// A serialized protocol message.
    Text(String),
    /// WebSocket ping; the pong advances `last_seen_at`.
    Ping,
    /// Close handshake with code and reason, then drop the socket.
    Close { code: u16, reason: String },
    /// Hard termination without a close handshake (reaper path).
    Terminate,
}

/// Optional identity fields, patched by `hello` and filled from the upgrade
/// request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daemon_gpt_id: Option<String>,
}

impl ConnectionMetadata {
    /// Shallow merge: only fields present in `patch` overwrite.
    fn merge(&mut self, patch: ConnectionMetadata) {
        if patch.client_id.is_some() {
            self.client_id = patch.client_id;
        }
        if patch.instance_id.is_some() {
            self.instance_id = patch.instance_id;
        }
        if patch.platform.is_some() {
            self.platform = patch.platform;
        }
        if patch.ip_address.is_some() {
            self.ip_address = patch.ip_address;
        }
        if patch.user_agent.is_some() {
            self.user_agent = patch.user_agent;
        }
        if patch.daemon_gpt_id.is_some() {
            self.daemon_gpt_id = patch.daemon_gpt_id;
        }
    }
}

/// One live daemon connection.
#[derive(Debug, Clone)]
pub struct DaemonConnection {
    pub connection_id: String,
    pub user_id: String,
    pub outbound: UnboundedSender<OutboundFrame>,
    /// Epoch milliseconds.
    pub connected_at: i64,
    pub last_seen_at: i64,
    pub metadata: ConnectionMetadata,
}

impl DaemonConnection {
    /// Channel open means the writer task (and its socket) is still alive.
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }
}

/// Outcome of a per-user command fan-out.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandDelivery {
    pub ok: bool,
    pub sent_count: usize,
    pub connection_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, DaemonConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent overwrite by connection id.
    pub fn register(&self, conn: DaemonConnection) {
        let mut map = self.connections.lock().expect("registry lock poisoned");
        map.insert(conn.connection_id.clone(), conn);
    }

    /// Idempotent removal.
    pub fn remove(&self, connection_id: &str) {
        let mut map = self.connections.lock().expect("registry lock poisoned");
        map.remove(connection_id);
    }

    /// Advance `last_seen_at`. No-op for unknown ids.
    pub fn touch(&self, connection_id: &str, ts_ms: i64) {
        let mut map = self.connections.lock().expect("registry lock poisoned");
        if let Some(conn) = map.get_mut(connection_id) {
            conn.last_seen_at = ts_ms;
        }
    }

    /// Shallow-merge optional metadata fields. No-op for unknown ids.
    pub fn update_metadata(&self, connection_id: &str, patch: ConnectionMetadata) {
        let mut map = self.connections.lock().expect("registry lock poisoned");
        if let Some(conn) = map.get_mut(connection_id) {
            conn.metadata.merge(patch);
        }
    }

    /// Snapshot copy of connections, optionally filtered by user.
    pub fn list(&self, user_id: Option<&str>) -> Vec<DaemonConnection> {
        let map = self.connections.lock().expect("registry lock poisoned");
        map.values()
            .filter(|c| user_id.map_or(true, |u| c.user_id == u))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send one message to one connection. Never errors: a missing
    /// connection, a closed socket, or a failed enqueue all return `false`.
    pub fn send_to_connection(&self, connection_id: &str, msg: &IpcMessage) -> bool {
        let wire = msg.to_wire();
        if wire.is_empty() {
            return false;
        }
        let sender = {
            let map = self.connections.lock().expect("registry lock poisoned");
            match map.get(connection_id) {
                Some(conn) if conn.is_open() => conn.outbound.clone(),
                _ => return false,
            }
        };
        sender.send(OutboundFrame::Text(wire)).is_ok()
    }

    /// Fan a command out to every open connection of one user.
    ///
    /// Serialization happens once, the connection set is snapshotted, and
    /// `ok` is true iff at least one delivery succeeded.
    pub fn send_command_to_user(&self, user_id: &str, cmd: &IpcMessage) -> CommandDelivery {
        let wire = cmd.to_wire();
        if wire.is_empty() {
            return CommandDelivery {
                ok: false,
                sent_count: 0,
                connection_ids: Vec::new(),
                error: Some("command serialization failed".to_string()),
            };
        }

        let targets = self.list(Some(user_id));
        if targets.is_empty() {
            return CommandDelivery {
                ok: false,
                sent_count: 0,
                connection_ids: Vec::new(),
                error: Some(format!("no connected daemons for user {user_id}")),
            };
        }

        let mut delivered = Vec::new();
        for conn in &targets {
            if !conn.is_open() {
                debug!(connection_id = %conn.connection_id, "skipping closed connection");
                continue;
            }
            if conn.outbound.send(OutboundFrame::Text(wire.clone())).is_ok() {
                delivered.push(conn.connection_id.clone());
            } else {
                warn!(connection_id = %conn.connection_id, "send failed during fan-out");
            }
        }

        let ok = !delivered.is_empty();
        CommandDelivery {
            ok,
            sent_count: delivered.len(),
            connection_ids: delivered,
            error: if ok {
                None
            } else {
                Some(format!("no daemon connection accepted the command for user {user_id}"))
            },
        }
    }

    /// One reaper pass: terminate and remove connections idle past
    /// `timeout_ms`, ping the rest. Returns the reaped connection ids.
    pub fn sweep(&self, now_ms: i64, timeout_ms: i64) -> Vec<String> {
        let snapshot = self.list(None);
        let mut reaped = Vec::new();
        for conn in snapshot {
            if now_ms - conn.last_seen_at > timeout_ms {
                // Best effort: the writer task may already be gone.
                let _ = conn.outbound.send(OutboundFrame::Terminate);
                self.remove(&conn.connection_id);
                warn!(
                    connection_id = %conn.connection_id,
                    idle_ms = now_ms - conn.last_seen_at,
                    "reaping stale connection"
                );
                reaped.push(conn.connection_id);
            } else if conn.is_open() {
                let _ = conn.outbound.send(OutboundFrame::Ping);
            }
        }
        reaped
    }

    /// Close every connection (server shutdown), swallowing errors.
    pub fn close_all(&self, code: u16, reason: &str) {
        for conn in self.list(None) {
            let _ = conn.outbound.send(OutboundFrame::Close {
                code,
                reason: reason.to_string(),
            });
            self.remove(&conn.connection_id);
        }
    }
}
