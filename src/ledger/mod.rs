//! Finance records used by the tools
//!
//! Users, the six money jars, monthly income entries and jar transactions.
//! Only tool handlers (and the reasoning adapter, for the profile) touch this;
//! the orchestrator never does.

use crate::error::LedgerError;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

pub mod postgres;
pub use postgres::PostgresLedger;

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

//
// ================= Jars =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Jar {
    Necessity,
    Play,
    Education,
    Investment,
    Charity,
    Savings,
}

impl Jar {
    pub const ALL: [Jar; 6] = [
        Jar::Necessity,
        Jar::Play,
        Jar::Education,
        Jar::Investment,
        Jar::Charity,
        Jar::Savings,
    ];

    /// Row id in `jar_categories`
    pub fn id(self) -> i32 {
        match self {
            Jar::Necessity => 1,
            Jar::Play => 2,
            Jar::Education => 3,
            Jar::Investment => 4,
            Jar::Charity => 5,
            Jar::Savings => 6,
        }
    }

    pub fn from_id(id: i64) -> Option<Jar> {
        Jar::ALL.into_iter().find(|jar| i64::from(jar.id()) == id)
    }

    pub fn name(self) -> &'static str {
        match self {
            Jar::Necessity => "Necessity",
            Jar::Play => "Play",
            Jar::Education => "Education",
            Jar::Investment => "Investment",
            Jar::Charity => "Charity",
            Jar::Savings => "Savings",
        }
    }

    pub fn from_name(name: &str) -> Option<Jar> {
        let name = name.trim();
        Jar::ALL
            .into_iter()
            .find(|jar| jar.name().eq_ignore_ascii_case(name))
    }
}

//
// ================= Records =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserProfile {
    pub id: Uuid,
    pub email: String,
    pub description: Option<String>,
    pub saving_target_cents: Option<i64>,
}

/// Transaction to insert. Amounts are whole VND, signed (expenses negative).
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    pub user_id: Uuid,
    pub jar: Jar,
    pub amount: i64,
    pub description: String,
    pub source: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewIncomeEntry {
    pub user_id: Uuid,
    /// First day of the income month
    pub month: NaiveDate,
    pub total: i64,
    pub percentages: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    pub jar: Jar,
    pub amount: i64,
    pub occurred_at: DateTime<Utc>,
    pub description: String,
    pub monthly_income_entry_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
}

//
// ================= Store Trait =================
//

#[async_trait]
pub trait FinanceStore: Send + Sync {
    async fn user_by_identifier(&self, identifier: &str) -> LedgerResult<UserProfile>;

    /// Insert the income entry and its per-jar transactions atomically.
    /// Fails with `Conflict` when the month already has an entry.
    async fn record_monthly_income(
        &self,
        entry: NewIncomeEntry,
        allocations: Vec<NewTransaction>,
    ) -> LedgerResult<i64>;

    /// Insert all transactions or none
    async fn insert_transactions(&self, transactions: Vec<NewTransaction>) -> LedgerResult<()>;

    async fn set_saving_target(&self, user_id: Uuid, target_cents: i64) -> LedgerResult<()>;

    /// Transactions of one jar, oldest first
    async fn jar_history(&self, user_id: Uuid, jar: Jar) -> LedgerResult<Vec<LedgerEntry>>;

    async fn transaction_columns(&self) -> LedgerResult<Vec<ColumnInfo>>;

    /// Run a statement already vetted as read-only and return its rows
    async fn run_read_only(&self, sql: &str) -> LedgerResult<Vec<Map<String, Value>>>;
}

//
// ================= In-Memory Store =================
//

#[derive(Default)]
struct LedgerData {
    users: HashMap<String, UserProfile>,
    income_entries: Vec<(i64, Uuid, NaiveDate)>,
    transactions: Vec<(Uuid, LedgerEntry)>,
}

/// In-memory finance store for development and tests
pub struct InMemoryLedger {
    data: RwLock<LedgerData>,
    auto_provision: bool,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(LedgerData::default()),
            auto_provision: false,
        }
    }

    /// Unknown identifiers get a fresh profile instead of `UserNotFound`
    pub fn auto_provisioning() -> Self {
        Self {
            auto_provision: true,
            ..Self::new()
        }
    }

    pub fn with_user(mut self, email: &str, description: Option<&str>) -> Self {
        let profile = new_profile(email, description);
        self.data
            .get_mut()
            .users
            .insert(email.to_string(), profile);
        self
    }

    pub async fn transactions_for(&self, user_id: Uuid) -> Vec<LedgerEntry> {
        let data = self.data.read().await;
        data.transactions
            .iter()
            .filter(|(owner, _)| *owner == user_id)
            .map(|(_, entry)| entry.clone())
            .collect()
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn new_profile(email: &str, description: Option<&str>) -> UserProfile {
    UserProfile {
        id: Uuid::new_v4(),
        email: email.to_string(),
        description: description.map(|d| d.to_string()),
        saving_target_cents: None,
    }
}

fn to_entry(tx: NewTransaction, income_entry_id: Option<i64>) -> (Uuid, LedgerEntry) {
    (
        tx.user_id,
        LedgerEntry {
            jar: tx.jar,
            amount: tx.amount,
            occurred_at: tx.occurred_at,
            description: tx.description,
            monthly_income_entry_id: income_entry_id,
        },
    )
}

#[async_trait]
impl FinanceStore for InMemoryLedger {
    async fn user_by_identifier(&self, identifier: &str) -> LedgerResult<UserProfile> {
        {
            let data = self.data.read().await;
            if let Some(profile) = data.users.get(identifier) {
                return Ok(profile.clone());
            }
        }

        if !self.auto_provision {
            return Err(LedgerError::UserNotFound(identifier.to_string()));
        }

        let mut data = self.data.write().await;
        let profile = data
            .users
            .entry(identifier.to_string())
            .or_insert_with(|| new_profile(identifier, None))
            .clone();
        Ok(profile)
    }

    async fn record_monthly_income(
        &self,
        entry: NewIncomeEntry,
        allocations: Vec<NewTransaction>,
    ) -> LedgerResult<i64> {
        let mut data = self.data.write().await;

        let exists = data
            .income_entries
            .iter()
            .any(|(_, user, month)| *user == entry.user_id && *month == entry.month);
        if exists {
            return Err(LedgerError::Conflict(format!(
                "Income for {} already exists. Please choose a different month.",
                entry.month.format("%Y-%m")
            )));
        }

        let entry_id = data.income_entries.len() as i64 + 1;
        data.income_entries.push((entry_id, entry.user_id, entry.month));
        data.transactions.extend(
            allocations
                .into_iter()
                .map(|tx| to_entry(tx, Some(entry_id))),
        );

        Ok(entry_id)
    }

    async fn insert_transactions(&self, transactions: Vec<NewTransaction>) -> LedgerResult<()> {
        let mut data = self.data.write().await;
        data.transactions
            .extend(transactions.into_iter().map(|tx| to_entry(tx, None)));
        Ok(())
    }

    async fn set_saving_target(&self, user_id: Uuid, target_cents: i64) -> LedgerResult<()> {
        let mut data = self.data.write().await;
        let profile = data
            .users
            .values_mut()
            .find(|profile| profile.id == user_id)
            .ok_or_else(|| LedgerError::UserNotFound(user_id.to_string()))?;
        profile.saving_target_cents = Some(target_cents);
        Ok(())
    }

    async fn jar_history(&self, user_id: Uuid, jar: Jar) -> LedgerResult<Vec<LedgerEntry>> {
        let data = self.data.read().await;
        let mut entries: Vec<LedgerEntry> = data
            .transactions
            .iter()
            .filter(|(owner, entry)| *owner == user_id && entry.jar == jar)
            .map(|(_, entry)| entry.clone())
            .collect();
        entries.sort_by_key(|entry| entry.occurred_at);
        Ok(entries)
    }

    async fn transaction_columns(&self) -> LedgerResult<Vec<ColumnInfo>> {
        let column = |name: &str, data_type: &str, nullable: bool, default: Option<&str>| ColumnInfo {
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable,
            default: default.map(|d| d.to_string()),
        };

        Ok(vec![
            column("id", "bigint", false, Some("nextval('transactions_id_seq'::regclass)")),
            column("user_id", "uuid", false, None),
            column("jar_category_id", "integer", false, None),
            column("amount_cents", "bigint", false, None),
            column("description", "text", true, None),
            column("source", "text", true, None),
            column("occurred_at", "timestamp with time zone", false, Some("now()")),
            column("monthly_income_entry_id", "bigint", true, None),
        ])
    }

    async fn run_read_only(&self, _sql: &str) -> LedgerResult<Vec<Map<String, Value>>> {
        Err(LedgerError::Unsupported(
            "SQL queries need the Postgres finance store".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jar_lookup() {
        assert_eq!(Jar::from_id(6), Some(Jar::Savings));
        assert_eq!(Jar::from_id(7), None);
        assert_eq!(Jar::from_name(" play "), Some(Jar::Play));
        assert_eq!(Jar::from_name("Fun"), None);
        assert_eq!(Jar::Charity.id(), 5);
    }

    #[tokio::test]
    async fn test_unknown_user_rejected_unless_provisioning() {
        let strict = InMemoryLedger::new();
        assert!(matches!(
            strict.user_by_identifier("ghost@example.com").await,
            Err(LedgerError::UserNotFound(_))
        ));

        let open = InMemoryLedger::auto_provisioning();
        let first = open.user_by_identifier("new@example.com").await.unwrap();
        let second = open.user_by_identifier("new@example.com").await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_duplicate_income_month_conflicts() {
        let ledger = InMemoryLedger::new().with_user("lan@example.com", None);
        let user = ledger.user_by_identifier("lan@example.com").await.unwrap();
        let month = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let entry = NewIncomeEntry {
            user_id: user.id,
            month,
            total: 10_000_000,
            percentages: serde_json::json!({}),
        };

        ledger.record_monthly_income(entry.clone(), vec![]).await.unwrap();
        let err = ledger.record_monthly_income(entry, vec![]).await.unwrap_err();
        assert!(err.to_string().contains("2024-01 already exists"));
    }

    #[tokio::test]
    async fn test_jar_history_sorted_and_filtered() {
        let ledger = InMemoryLedger::new().with_user("lan@example.com", None);
        let user = ledger.user_by_identifier("lan@example.com").await.unwrap();
        let now = Utc::now();
        let tx = |jar: Jar, amount: i64, days_ago: i64| NewTransaction {
            user_id: user.id,
            jar,
            amount,
            description: String::new(),
            source: "test".to_string(),
            occurred_at: now - chrono::Duration::days(days_ago),
        };

        ledger
            .insert_transactions(vec![
                tx(Jar::Savings, 200, 1),
                tx(Jar::Play, -50, 2),
                tx(Jar::Savings, 100, 10),
            ])
            .await
            .unwrap();

        let history = ledger.jar_history(user.id, Jar::Savings).await.unwrap();
        let amounts: Vec<i64> = history.iter().map(|e| e.amount).collect();
        assert_eq!(amounts, vec![100, 200]);
    }
}
