//! Conversation persistence.
//!
//! Tenant isolation is physical: each tenant gets its own
//! `{tenant}_threads` / `{tenant}_messages` table pair, created on first
//! use. There is no shared tenant column; the only cross-tenant reads are
//! explicit `UNION ALL` admin queries over known tenant tables.
//!
//! A chat turn persists as one transaction: thread upsert, user message,
//! assistant message with metrics and optional capture payloads, thread
//! provider/model update. Triggers keep `message_count` and `updated_at`
//! in step with the messages table.

use anyhow::{Context, Result, bail};
use regex::Regex;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::sync::OnceLock;
use uuid::Uuid;

use crate::providers::{Citation, Usage};

const DEFAULT_MAX_CONNECTIONS: u32 = 10;

fn table_id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9_-]{1,64}$").expect("static pattern"))
}

/// Everything written for one completed turn.
#[derive(Debug, Clone, Default)]
pub struct TurnRecord {
    /// Existing thread to append to; a fresh thread is created when absent.
    pub thread_id: Option<String>,
    pub user_id: String,
    pub provider: String,
    pub model: String,
    pub user_content: String,
    pub assistant_content: String,
    pub response_id: Option<String>,
    pub usage: Usage,
    pub cost_usd: Option<f64>,
    pub processing_time_ms: Option<i64>,
    pub citations: Vec<Citation>,
    pub system_prompt: Option<String>,
    pub raw_request: Option<String>,
    pub raw_response: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ThreadRow {
    pub id: String,
    pub user_id: String,
    pub provider: String,
    pub model: String,
    pub status: String,
    pub message_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageRow {
    pub id: String,
    pub thread_id: String,
    pub role: String,
    pub content: String,
    pub model: Option<String>,
    pub total_tokens: Option<i64>,
    pub cost_usd: Option<f64>,
    pub created_at: String,
}

pub struct ConversationStore {
    pool: SqlitePool,
}

impl ConversationStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        Self::connect_with(database_url, DEFAULT_MAX_CONNECTIONS).await
    }

    pub async fn connect_with(database_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid database url {database_url:?}"))?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("cannot open conversation database")?;
        Ok(Self { pool })
    }

    /// Create the tenant's table pair and triggers if absent.
    pub async fn ensure_tenant(&self, tenant_id: &str) -> Result<()> {
        let t = checked_tenant(tenant_id)?;
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{t}_threads" (
                id            TEXT PRIMARY KEY,
                user_id       TEXT NOT NULL,
                provider      TEXT NOT NULL,
                model         TEXT NOT NULL,
                status        TEXT NOT NULL DEFAULT 'active'
                              CHECK (status IN ('active', 'archived', 'deleted')),
                message_count INTEGER NOT NULL DEFAULT 0,
                created_at    TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at    TEXT NOT NULL DEFAULT (datetime('now')),
                metadata      TEXT
            );
            CREATE TABLE IF NOT EXISTS "{t}_messages" (
                id                 TEXT PRIMARY KEY,
                thread_id          TEXT NOT NULL REFERENCES "{t}_threads"(id) ON DELETE CASCADE,
                role               TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'system')),
                content            TEXT NOT NULL,
                provider           TEXT,
                model              TEXT,
                response_id        TEXT,
                input_tokens       INTEGER,
                output_tokens      INTEGER,
                total_tokens       INTEGER,
                cost_usd           REAL,
                processing_time_ms INTEGER,
                citations          TEXT,
                system_prompt      TEXT,
                raw_request        TEXT,
                raw_response       TEXT,
                rendered_html      TEXT,
                created_at         TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS "{t}_messages_thread_idx"
                ON "{t}_messages"(thread_id);
            CREATE TRIGGER IF NOT EXISTS "{t}_messages_after_insert"
                AFTER INSERT ON "{t}_messages"
            BEGIN
                UPDATE "{t}_threads"
                   SET message_count = message_count + 1,
                       updated_at = datetime('now')
                 WHERE id = NEW.thread_id;
            END;
            CREATE TRIGGER IF NOT EXISTS "{t}_messages_after_delete"
                AFTER DELETE ON "{t}_messages"
            BEGIN
                UPDATE "{t}_threads"
                   SET message_count = message_count - 1,
                       updated_at = datetime('now')
                 WHERE id = OLD.thread_id;
            END;
            "#
        );
        sqlx::raw_sql(&ddl)
            .execute(&self.pool)
            .await
            .with_context(|| format!("cannot create tables for tenant {tenant_id}"))?;
        Ok(())
    }

    /// Write one turn atomically. Returns the thread id.
    pub async fn persist_turn(&self, tenant_id: &str, turn: &TurnRecord) -> Result<String> {
        let t = checked_tenant(tenant_id)?;
        let thread_id = turn
            .thread_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let citations_json = if turn.citations.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&turn.citations)?)
        };

        let mut tx = self.pool.begin().await?;

        // (a) thread upsert; existing rows keep their status and history.
        sqlx::query(&format!(
            r#"INSERT INTO "{t}_threads" (id, user_id, provider, model)
               VALUES (?1, ?2, ?3, ?4)
               ON CONFLICT(id) DO NOTHING"#
        ))
        .bind(&thread_id)
        .bind(&turn.user_id)
        .bind(&turn.provider)
        .bind(&turn.model)
        .execute(&mut *tx)
        .await?;

        // (b) user message.
        sqlx::query(&format!(
            r#"INSERT INTO "{t}_messages" (id, thread_id, role, content)
               VALUES (?1, ?2, 'user', ?3)"#
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(&thread_id)
        .bind(&turn.user_content)
        .execute(&mut *tx)
        .await?;

        // (c) assistant message with full metrics and capture payloads.
        sqlx::query(&format!(
            r#"INSERT INTO "{t}_messages"
               (id, thread_id, role, content, provider, model, response_id,
                input_tokens, output_tokens, total_tokens, cost_usd,
                processing_time_ms, citations, system_prompt, raw_request, raw_response)
               VALUES (?1, ?2, 'assistant', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"#
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(&thread_id)
        .bind(&turn.assistant_content)
        .bind(&turn.provider)
        .bind(&turn.model)
        .bind(&turn.response_id)
        .bind(turn.usage.input_tokens as i64)
        .bind(turn.usage.output_tokens as i64)
        .bind(turn.usage.total_tokens as i64)
        .bind(turn.cost_usd)
        .bind(turn.processing_time_ms)
        .bind(&citations_json)
        .bind(&turn.system_prompt)
        .bind(&turn.raw_request)
        .bind(&turn.raw_response)
        .execute(&mut *tx)
        .await?;

        // (d) the thread remembers its last-used provider/model.
        sqlx::query(&format!(
            r#"UPDATE "{t}_threads" SET provider = ?1, model = ?2 WHERE id = ?3"#
        ))
        .bind(&turn.provider)
        .bind(&turn.model)
        .bind(&thread_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(thread_id)
    }

    pub async fn get_thread(&self, tenant_id: &str, thread_id: &str) -> Result<Option<ThreadRow>> {
        let t = checked_tenant(tenant_id)?;
        let row = sqlx::query_as::<_, ThreadRow>(&format!(
            r#"SELECT id, user_id, provider, model, status, message_count,
                      created_at, updated_at
                 FROM "{t}_threads" WHERE id = ?1"#
        ))
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_threads(&self, tenant_id: &str) -> Result<Vec<ThreadRow>> {
        let t = checked_tenant(tenant_id)?;
        let rows = sqlx::query_as::<_, ThreadRow>(&format!(
            r#"SELECT id, user_id, provider, model, status, message_count,
                      created_at, updated_at
                 FROM "{t}_threads"
                WHERE status != 'deleted'
                ORDER BY updated_at DESC"#
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn thread_messages(
        &self,
        tenant_id: &str,
        thread_id: &str,
    ) -> Result<Vec<MessageRow>> {
        let t = checked_tenant(tenant_id)?;
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            r#"SELECT id, thread_id, role, content, model, total_tokens,
                      cost_usd, created_at
                 FROM "{t}_messages"
                WHERE thread_id = ?1
                ORDER BY created_at, rowid"#
        ))
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Explicit cross-tenant admin view: `UNION ALL` over the named
    /// tenants' thread tables, each row labeled with its tenant.
    pub async fn threads_across(&self, tenant_ids: &[String]) -> Result<Vec<(String, ThreadRow)>> {
        if tenant_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut selects = Vec::with_capacity(tenant_ids.len());
        for tenant_id in tenant_ids {
            let t = checked_tenant(tenant_id)?;
            selects.push(format!(
                r#"SELECT '{t}' AS tenant_id, id, user_id, provider, model, status,
                          message_count, created_at, updated_at
                     FROM "{t}_threads""#
            ));
        }
        let sql = format!("{} ORDER BY updated_at DESC", selects.join(" UNION ALL "));
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        rows.into_iter()
            .map(|row| {
                let tenant: String = row.try_get("tenant_id")?;
                let thread = ThreadRow {
                    id: row.try_get("id")?,
                    user_id: row.try_get("user_id")?,
                    provider: row.try_get("provider")?,
                    model: row.try_get("model")?,
                    status: row.try_get("status")?,
                    message_count: row.try_get("message_count")?,
                    created_at: row.try_get("created_at")?,
                    updated_at: row.try_get("updated_at")?,
                };
                Ok((tenant, thread))
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(Into::into)
    }

    #[cfg(test)]
    pub async fn count_messages(&self, tenant_id: &str, thread_id: &str) -> Result<i64> {
        let t = checked_tenant(tenant_id)?;
        let row = sqlx::query(&format!(
            r#"SELECT COUNT(*) AS n FROM "{t}_messages" WHERE thread_id = ?1"#
        ))
        .bind(thread_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("n")?)
    }
}

/// Tenant ids flow into table names; re-check the character set here so a
/// bad id can never reach an identifier position.
fn checked_tenant(tenant_id: &str) -> Result<&str> {
    if table_id_pattern().is_match(tenant_id) {
        Ok(tenant_id)
    } else {
        bail!("invalid tenant id {tenant_id:?} for table name");
    }
}
