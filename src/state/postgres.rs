//! Postgres-backed conversation checkpoints

use super::ConversationBackend;
use crate::error::OrchestrationError;
use crate::models::{ConversationState, Message, UserContext};
use crate::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

fn db_error(context: &str) -> impl Fn(sqlx::Error) -> OrchestrationError + '_ {
    move |e| OrchestrationError::DatabaseError(format!("{}: {}", context, e))
}

pub struct PostgresConversationBackend {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PostgresConversationBackend {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS conversation_threads (
                      thread_id TEXT PRIMARY KEY,
                      user_context JSONB NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS conversation_messages (
                      thread_id TEXT NOT NULL REFERENCES conversation_threads (thread_id),
                      seq BIGINT NOT NULL,
                      message JSONB NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                      PRIMARY KEY (thread_id, seq)
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS active_threads (
                      base_thread_id TEXT PRIMARY KEY,
                      thread_id TEXT NOT NULL,
                      updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                info!("Conversation schema ready");
                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(db_error("Failed to initialize conversation schema"))?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl ConversationBackend for PostgresConversationBackend {
    async fn load(&self, thread_id: &str) -> Result<Option<ConversationState>> {
        self.ensure_schema().await?;

        let Some(thread) = sqlx::query(
            "SELECT user_context, created_at FROM conversation_threads WHERE thread_id = $1",
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to load conversation thread"))?
        else {
            return Ok(None);
        };

        let rows = sqlx::query(
            r#"
            SELECT message
            FROM conversation_messages
            WHERE thread_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to load conversation messages"))?;

        let messages = rows
            .into_iter()
            .map(|row| -> Result<Message> {
                let raw: Value = row
                    .try_get("message")
                    .map_err(db_error("Malformed conversation message row"))?;
                Ok(serde_json::from_value::<Message>(raw)?)
            })
            .collect::<Result<Vec<_>>>()?;

        let user_context: Value = thread
            .try_get("user_context")
            .map_err(db_error("Malformed conversation thread row"))?;
        let created_at: DateTime<Utc> = thread
            .try_get("created_at")
            .map_err(db_error("Malformed conversation thread row"))?;

        Ok(Some(ConversationState {
            thread_id: thread_id.to_string(),
            messages,
            user_context: serde_json::from_value::<UserContext>(user_context)?,
            created_at,
        }))
    }

    async fn create(&self, state: &ConversationState) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO conversation_threads (thread_id, user_context, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (thread_id) DO NOTHING
            "#,
        )
        .bind(&state.thread_id)
        .bind(serde_json::to_value(&state.user_context)?)
        .bind(state.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to create conversation thread"))?;

        Ok(())
    }

    async fn append(&self, thread_id: &str, messages: &[Message]) -> Result<ConversationState> {
        self.ensure_schema().await?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to open append transaction"))?;

        let next_seq: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM conversation_messages WHERE thread_id = $1",
        )
        .bind(thread_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("Failed to read conversation sequence"))?;

        for (offset, message) in messages.iter().enumerate() {
            sqlx::query(
                "INSERT INTO conversation_messages (thread_id, seq, message) VALUES ($1, $2, $3)",
            )
            .bind(thread_id)
            .bind(next_seq + offset as i64)
            .bind(serde_json::to_value(message)?)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to append conversation message"))?;
        }

        tx.commit()
            .await
            .map_err(db_error("Failed to commit conversation append"))?;

        self.load(thread_id).await?.ok_or_else(|| {
            OrchestrationError::StateError(format!("Unknown thread: {}", thread_id))
        })
    }

    async fn active_thread(&self, base_thread_id: &str) -> Result<Option<String>> {
        self.ensure_schema().await?;

        sqlx::query_scalar("SELECT thread_id FROM active_threads WHERE base_thread_id = $1")
            .bind(base_thread_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("Failed to read active thread"))
    }

    async fn set_active_thread(&self, base_thread_id: &str, thread_id: &str) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO active_threads (base_thread_id, thread_id, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (base_thread_id)
            DO UPDATE SET thread_id = EXCLUDED.thread_id, updated_at = NOW()
            "#,
        )
        .bind(base_thread_id)
        .bind(thread_id)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to record active thread"))?;

        Ok(())
    }
}
