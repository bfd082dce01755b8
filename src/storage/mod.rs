//! Persistence collaborator — the append-only audit log and the
//! conversation table.
//!
//! The gateway core only depends on the [`AuditLog`] trait; this module also
//! ships the SQLite implementation (WAL mode, crash-safe appends). When no
//! database is configured the gateway runs with the log absent and appends
//! degrade to warnings.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

/// Default timeout for individual SQLite queries.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

// ─── Rows ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogRow {
    pub id: String,
    /// `conversation` or `daemon_event`.
    pub kind: String,
    pub user_id: String,
    pub summary: String,
    /// JSON detail payload.
    pub detail: String,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRow {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub prompt: String,
    pub response: String,
    pub tier: String,
    pub total_tokens: i64,
    pub created_at: String,
}

/// A daemon-emitted event on its way into the audit log.
#[derive(Debug, Clone)]
pub struct DaemonEventRecord {
    pub event_type: String,
    pub event_id: String,
    pub user_id: String,
    pub connection_id: String,
    pub payload: serde_json::Value,
}

/// A completed pipeline run on its way into the audit log.
#[derive(Debug, Clone)]
pub struct ConversationRecord {
    pub session_id: String,
    pub user_id: String,
    pub prompt: String,
    pub response: String,
    pub tier: String,
    pub total_tokens: u64,
}

// ─── Collaborator interface ───────────────────────────────────────────────────

/// Append-only audit log and conversation store.
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Liveness probe for health reporting.
    async fn healthy(&self) -> bool {
        true
    }
    async fn append_conversation(&self, record: ConversationRecord) -> Result<()>;
    async fn append_event(&self, record: DaemonEventRecord) -> Result<()>;
    /// Most recent audit entries, newest first. `limit` is validated by the
    /// HTTP layer (1..=100).
    async fn recent_logs(&self, limit: u32) -> Result<Vec<AuditLogRow>>;
    /// Most recent conversations for a user, newest first. `limit` must be
    /// positive; the HTTP layer rejects 0 with a validation error.
    async fn recent_conversations(&self, user_id: &str, limit: u32)
        -> Result<Vec<ConversationRow>>;
}

// ─── SQLite implementation ────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

const MIGRATION: &str = r#"
CREATE TABLE IF NOT EXISTS audit_log (
    id          TEXT PRIMARY KEY,
    kind        TEXT NOT NULL,
    user_id     TEXT NOT NULL,
    summary     TEXT NOT NULL,
    detail      TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_log_created ON audit_log(created_at DESC);

CREATE TABLE IF NOT EXISTS conversations (
    id            TEXT PRIMARY KEY,
    session_id    TEXT NOT NULL,
    user_id       TEXT NOT NULL,
    prompt        TEXT NOT NULL,
    response      TEXT NOT NULL,
    tier          TEXT NOT NULL,
    total_tokens  INTEGER NOT NULL DEFAULT 0,
    created_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations(user_id, created_at DESC);
"#;

impl Storage {
    /// Open (or create) the SQLite database behind `database_url`.
    pub async fn open(database_url: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for statement in MIGRATION.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(pool).await?;
        }
        Ok(())
    }

    /// Liveness probe for the health endpoint.
    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

#[async_trait]
impl AuditLog for Storage {
    async fn healthy(&self) -> bool {
        self.ping().await
    }

    async fn append_conversation(&self, record: ConversationRecord) -> Result<()> {
        let pool = self.pool.clone();
        with_timeout(async move {
            let now = Utc::now().to_rfc3339();
            let conversation_id = Uuid::new_v4().to_string();
            sqlx::query(
                "INSERT INTO conversations \
                 (id, session_id, user_id, prompt, response, tier, total_tokens, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&conversation_id)
            .bind(&record.session_id)
            .bind(&record.user_id)
            .bind(&record.prompt)
            .bind(&record.response)
            .bind(&record.tier)
            .bind(record.total_tokens as i64)
            .bind(&now)
            .execute(&pool)
            .await?;

            let detail = serde_json::json!({
                "conversationId": conversation_id,
                "sessionId": record.session_id,
                "tier": record.tier,
                "totalTokens": record.total_tokens,
            });
            sqlx::query(
                "INSERT INTO audit_log (id, kind, user_id, summary, detail, created_at) \
                 VALUES (?, 'conversation', ?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&record.user_id)
            .bind(format!("conversation completed ({})", record.tier))
            .bind(detail.to_string())
            .bind(&now)
            .execute(&pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn append_event(&self, record: DaemonEventRecord) -> Result<()> {
        let pool = self.pool.clone();
        with_timeout(async move {
            let detail = serde_json::json!({
                "eventId": record.event_id,
                "connectionId": record.connection_id,
                "payload": record.payload,
            });
            sqlx::query(
                "INSERT INTO audit_log (id, kind, user_id, summary, detail, created_at) \
                 VALUES (?, 'daemon_event', ?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&record.user_id)
            .bind(format!("daemon event: {}", record.event_type))
            .bind(detail.to_string())
            .bind(Utc::now().to_rfc3339())
            .execute(&pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn recent_logs(&self, limit: u32) -> Result<Vec<AuditLogRow>> {
        let pool = self.pool.clone();
        with_timeout(async move {
            let rows = sqlx::query_as::<_, AuditLogRow>(
                "SELECT id, kind, user_id, summary, detail, created_at \
                 FROM audit_log ORDER BY created_at DESC LIMIT ?",
            )
            .bind(limit as i64)
            .fetch_all(&pool)
            .await?;
            Ok(rows)
        })
        .await
    }

    async fn recent_conversations(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<ConversationRow>> {
        let pool = self.pool.clone();
        let user_id = user_id.to_string();
        with_timeout(async move {
            let rows = sqlx::query_as::<_, ConversationRow>(
                "SELECT id, session_id, user_id, prompt, response, tier, total_tokens, created_at \
                 FROM conversations WHERE user_id = ? ORDER BY created_at DESC LIMIT ?",
            )
            .bind(&user_id)
            .bind(limit as i64)
            .fetch_all(&pool)
            .await?;
            Ok(rows)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_storage() -> (Storage, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/audit.db?mode=rwc", dir.path().display());
        (Storage::open(&url).await.unwrap(), dir)
    }

    #[tokio::test]
    async fn conversation_append_is_visible_in_both_tables() {
        let (storage, _dir) = temp_storage().await;
        storage
            .append_conversation(ConversationRecord {
                session_id: "s1".into(),
                user_id: "u1".into(),
                prompt: "p".into(),
                response: "r".into(),
                tier: "simple".into(),
                total_tokens: 42,
            })
            .await
            .unwrap();

        let logs = storage.recent_logs(10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].kind, "conversation");

        let convos = storage.recent_conversations("u1", 10).await.unwrap();
        assert_eq!(convos.len(), 1);
        assert_eq!(convos[0].total_tokens, 42);
    }

    #[tokio::test]
    async fn events_land_in_audit_log() {
        let (storage, _dir) = temp_storage().await;
        storage
            .append_event(DaemonEventRecord {
                event_type: "fs.changed".into(),
                event_id: "e1".into(),
                user_id: "u1".into(),
                connection_id: "c1".into(),
                payload: serde_json::json!({"path": "/tmp/x"}),
            })
            .await
            .unwrap();
        let logs = storage.recent_logs(5).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].summary.contains("fs.changed"));
    }

    #[tokio::test]
    async fn limit_bounds_results() {
        let (storage, _dir) = temp_storage().await;
        for i in 0..5 {
            storage
                .append_event(DaemonEventRecord {
                    event_type: format!("e{i}"),
                    event_id: format!("id{i}"),
                    user_id: "u".into(),
                    connection_id: "c".into(),
                    payload: serde_json::json!({}),
                })
                .await
                .unwrap();
        }
        let logs = storage.recent_logs(3).await.unwrap();
        assert_eq!(logs.len(), 3);
    }
}
