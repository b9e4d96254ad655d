//! Postgres-backed finance store

use super::{
    ColumnInfo, FinanceStore, Jar, LedgerEntry, LedgerResult, NewIncomeEntry, NewTransaction,
    UserProfile,
};
use crate::error::LedgerError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
      id UUID PRIMARY KEY,
      email TEXT NOT NULL UNIQUE,
      user_description TEXT,
      saving_target_cents BIGINT
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS jar_categories (
      id INTEGER PRIMARY KEY,
      name TEXT NOT NULL UNIQUE
    );
    "#,
    r#"
    INSERT INTO jar_categories (id, name) VALUES
      (1, 'Necessity'), (2, 'Play'), (3, 'Education'),
      (4, 'Investment'), (5, 'Charity'), (6, 'Savings')
    ON CONFLICT (id) DO NOTHING;
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS monthly_income_entries (
      id BIGSERIAL PRIMARY KEY,
      user_id UUID NOT NULL REFERENCES users (id),
      month_year DATE NOT NULL,
      total_income_cents BIGINT NOT NULL,
      allocation_percentages JSONB NOT NULL,
      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
      UNIQUE (user_id, month_year)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS transactions (
      id BIGSERIAL PRIMARY KEY,
      user_id UUID NOT NULL REFERENCES users (id),
      jar_category_id INTEGER NOT NULL REFERENCES jar_categories (id),
      amount_cents BIGINT NOT NULL,
      description TEXT,
      source TEXT,
      occurred_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
      monthly_income_entry_id BIGINT REFERENCES monthly_income_entries (id)
    );
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_transactions_user_jar_time
    ON transactions (user_id, jar_category_id, occurred_at);
    "#,
];

/// Run at the start of every ad-hoc query transaction: no writes, and no
/// statement may hold a pooled connection for long.
const READ_ONLY_PREAMBLE: &[&str] = &[
    "SET TRANSACTION READ ONLY",
    "SET LOCAL statement_timeout = '5s'",
];

pub struct PostgresLedger {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PostgresLedger {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    async fn ensure_schema(&self) -> LedgerResult<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                for statement in SCHEMA {
                    sqlx::query(statement).execute(&self.pool).await?;
                }
                info!("Finance schema ready");
                Ok::<(), sqlx::Error>(())
            })
            .await?;
        Ok(())
    }

    async fn insert_with(
        tx: &mut Transaction<'_, Postgres>,
        transaction: &NewTransaction,
        income_entry_id: Option<i64>,
    ) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO transactions
              (user_id, jar_category_id, amount_cents, description, source, occurred_at, monthly_income_entry_id)
            VALUES
              ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(transaction.user_id)
        .bind(transaction.jar.id())
        .bind(transaction.amount)
        .bind(&transaction.description)
        .bind(&transaction.source)
        .bind(transaction.occurred_at)
        .bind(income_entry_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl FinanceStore for PostgresLedger {
    async fn user_by_identifier(&self, identifier: &str) -> LedgerResult<UserProfile> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            "SELECT id, email, user_description, saving_target_cents FROM users WHERE email = $1",
        )
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LedgerError::UserNotFound(identifier.to_string()))?;

        Ok(UserProfile {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            description: row.try_get("user_description")?,
            saving_target_cents: row.try_get("saving_target_cents")?,
        })
    }

    async fn record_monthly_income(
        &self,
        entry: NewIncomeEntry,
        allocations: Vec<NewTransaction>,
    ) -> LedgerResult<i64> {
        self.ensure_schema().await?;
        let mut tx = self.pool.begin().await?;

        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM monthly_income_entries WHERE user_id = $1 AND month_year = $2)",
        )
        .bind(entry.user_id)
        .bind(entry.month)
        .fetch_one(&mut *tx)
        .await?;

        if exists {
            return Err(LedgerError::Conflict(format!(
                "Income for {} already exists. Please choose a different month.",
                entry.month.format("%Y-%m")
            )));
        }

        let entry_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO monthly_income_entries (user_id, month_year, total_income_cents, allocation_percentages)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(entry.user_id)
        .bind(entry.month)
        .bind(entry.total)
        .bind(&entry.percentages)
        .fetch_one(&mut *tx)
        .await?;

        for allocation in &allocations {
            Self::insert_with(&mut tx, allocation, Some(entry_id)).await?;
        }

        tx.commit().await?;
        debug!(entry_id, allocations = allocations.len(), "Monthly income recorded");
        Ok(entry_id)
    }

    async fn insert_transactions(&self, transactions: Vec<NewTransaction>) -> LedgerResult<()> {
        self.ensure_schema().await?;
        let mut tx = self.pool.begin().await?;
        for transaction in &transactions {
            Self::insert_with(&mut tx, transaction, None).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn set_saving_target(&self, user_id: Uuid, target_cents: i64) -> LedgerResult<()> {
        self.ensure_schema().await?;
        let result = sqlx::query("UPDATE users SET saving_target_cents = $1 WHERE id = $2")
            .bind(target_cents)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::UserNotFound(user_id.to_string()));
        }
        Ok(())
    }

    async fn jar_history(&self, user_id: Uuid, jar: Jar) -> LedgerResult<Vec<LedgerEntry>> {
        self.ensure_schema().await?;
        let rows = sqlx::query(
            r#"
            SELECT amount_cents, occurred_at, description, monthly_income_entry_id
            FROM transactions
            WHERE user_id = $1 AND jar_category_id = $2
            ORDER BY occurred_at ASC
            "#,
        )
        .bind(user_id)
        .bind(jar.id())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let occurred_at: DateTime<Utc> = row.try_get("occurred_at")?;
                let description: Option<String> = row.try_get("description")?;
                Ok(LedgerEntry {
                    jar,
                    amount: row.try_get("amount_cents")?,
                    occurred_at,
                    description: description.unwrap_or_default(),
                    monthly_income_entry_id: row.try_get("monthly_income_entry_id")?,
                })
            })
            .collect()
    }

    async fn transaction_columns(&self) -> LedgerResult<Vec<ColumnInfo>> {
        self.ensure_schema().await?;
        let rows = sqlx::query(
            r#"
            SELECT column_name::text AS column_name,
                   data_type::text AS data_type,
                   is_nullable::text AS is_nullable,
                   column_default::text AS column_default
            FROM information_schema.columns
            WHERE table_name = 'transactions'
            ORDER BY ordinal_position
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let nullable: String = row.try_get("is_nullable")?;
                Ok(ColumnInfo {
                    name: row.try_get("column_name")?,
                    data_type: row.try_get("data_type")?,
                    nullable: nullable.eq_ignore_ascii_case("yes"),
                    default: row.try_get("column_default")?,
                })
            })
            .collect()
    }

    async fn run_read_only(&self, sql: &str) -> LedgerResult<Vec<Map<String, Value>>> {
        self.ensure_schema().await?;

        // The database enforces read-only on top of the caller's statement check.
        let mut tx = self.pool.begin().await?;
        for statement in READ_ONLY_PREAMBLE {
            sqlx::query(*statement).execute(&mut *tx).await?;
        }

        let wrapped = format!(
            "SELECT COALESCE(json_agg(q), '[]'::json) FROM ({}) AS q",
            sql.trim().trim_end_matches(';')
        );
        let rows: Value = sqlx::query_scalar(&wrapped).fetch_one(&mut *tx).await?;
        tx.rollback().await?;

        match rows {
            Value::Array(items) => Ok(items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect()),
            other => Err(LedgerError::QueryRejected(format!(
                "unexpected result shape: {}",
                other
            ))),
        }
    }
}
