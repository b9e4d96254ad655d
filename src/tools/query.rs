//! Ad-hoc read access to the user's transactions

use super::{current_user, group_thousands, Tool, ToolOutcome};
use crate::error::ToolError;
use crate::ledger::FinanceStore;
use crate::models::UserContext;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;

const SEPARATOR: &str = "----------------------------------------";

const MUTATING_KEYWORDS: &[&str] = &[
    "insert", "update", "delete", "drop", "alter", "create", "truncate", "grant", "revoke",
    "copy", "merge", "call", "vacuum",
];

/// Server functions with side effects (sleeping, signalling backends,
/// changing settings, reaching outside the database)
const FORBIDDEN_FUNCTIONS: &[&str] = &[
    "pg_terminate_backend", "pg_cancel_backend", "pg_reload_conf", "pg_rotate_logfile",
    "set_config", "pg_read_file", "pg_read_binary_file", "pg_ls_dir", "pg_stat_file",
    "pg_notify", "txid_current",
];

/// Prefixes of function families rejected wholesale
const FORBIDDEN_FUNCTION_PREFIXES: &[&str] = &["pg_sleep", "dblink", "lo_", "pg_advisory"];

fn is_forbidden_function(word: &str) -> bool {
    FORBIDDEN_FUNCTIONS.contains(&word)
        || FORBIDDEN_FUNCTION_PREFIXES
            .iter()
            .any(|prefix| word.starts_with(prefix))
}

/// Placeholder the model may use in place of the current user's id
const USER_ID_PLACEHOLDER: &str = ":user_id";

//
// ================= get_transaction_schema =================
//

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct NoArgs {}

pub struct GetTransactionSchema {
    ledger: Arc<dyn FinanceStore>,
}

impl GetTransactionSchema {
    pub fn new(ledger: Arc<dyn FinanceStore>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl Tool for GetTransactionSchema {
    const NAME: &'static str = "get_transaction_schema";
    const DESCRIPTION: &'static str =
        "Get the column layout of the transactions table before writing a SQL query.";

    type Args = NoArgs;

    fn describe_call(&self, _args: &Self::Args) -> String {
        "Examining transaction database structure to understand your data".to_string()
    }

    async fn execute(&self, _args: Self::Args, ctx: &UserContext) -> ToolOutcome {
        current_user(self.ledger.as_ref(), ctx).await?;
        let columns = self.ledger.transaction_columns().await?;
        if columns.is_empty() {
            return Ok("No schema information found".to_string());
        }

        let mut lines = vec!["Transactions Table Schema:".to_string(), SEPARATOR.to_string()];
        for column in columns {
            lines.push(format!(
                "Column: {}\nType: {}\nNullable: {}\nDefault: {}",
                column.name,
                column.data_type,
                if column.nullable { "YES" } else { "NO" },
                column.default.as_deref().unwrap_or("None")
            ));
            lines.push(SEPARATOR.to_string());
        }
        Ok(lines.join("\n"))
    }
}

//
// ================= sql_executor =================
//

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SqlExecutorArgs {
    /// A single SELECT (or WITH ... SELECT) statement
    pub sql_query: String,
}

pub struct SqlExecutor {
    ledger: Arc<dyn FinanceStore>,
}

impl SqlExecutor {
    pub fn new(ledger: Arc<dyn FinanceStore>) -> Self {
        Self { ledger }
    }
}

/// Blank out single-quoted literals so keywords inside strings are ignored
fn without_literals(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_literal = false;
    for ch in sql.chars() {
        if ch == '\'' {
            in_literal = !in_literal;
            out.push(' ');
        } else if in_literal {
            out.push(' ');
        } else {
            out.push(ch);
        }
    }
    out
}

/// Accept exactly one read-only statement, returned without trailing `;`
pub fn validate_read_only(sql: &str) -> std::result::Result<String, String> {
    let statement = sql.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    if statement.is_empty() {
        return Err("Query is empty".to_string());
    }

    let scanned = without_literals(statement).to_lowercase();
    if scanned.contains(';') {
        return Err("Only a single statement is allowed".to_string());
    }

    let words: Vec<&str> = scanned
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .collect();

    match words.first() {
        Some(&"select") | Some(&"with") => {}
        _ => return Err("Only SELECT queries are allowed".to_string()),
    }

    if let Some(keyword) = words.iter().find(|w| MUTATING_KEYWORDS.contains(*w)) {
        return Err(format!(
            "Only SELECT queries are allowed (found '{}')",
            keyword.to_uppercase()
        ));
    }

    if let Some(function) = words.iter().find(|w| is_forbidden_function(w)) {
        return Err(format!("Function '{}' is not allowed in queries", function));
    }

    Ok(statement.to_string())
}

fn format_number(n: &serde_json::Number) -> String {
    if let Some(i) = n.as_i64() {
        return group_thousands(i);
    }
    let f = n.as_f64().unwrap_or_default();
    let raw = f.abs().to_string();
    let (int_part, frac_part) = raw.split_once('.').unwrap_or((raw.as_str(), ""));
    let grouped = group_thousands(int_part.parse::<i64>().unwrap_or_default());
    let sign = if f < 0.0 { "-" } else { "" };
    if frac_part.is_empty() {
        format!("{}{}", sign, grouped)
    } else {
        format!("{}{}.{}", sign, grouped, frac_part)
    }
}

fn format_row(row: Map<String, Value>) -> Map<String, Value> {
    row.into_iter()
        .map(|(key, value)| {
            let formatted = match value {
                Value::Number(n) => Value::String(format_number(&n)),
                Value::String(s) => Value::String(s),
                Value::Null => Value::Null,
                other => Value::String(other.to_string()),
            };
            (key, formatted)
        })
        .collect()
}

#[async_trait]
impl Tool for SqlExecutor {
    const NAME: &'static str = "sql_executor";
    const DESCRIPTION: &'static str = "Run a read-only SQL query (single SELECT) over the user's data and return the rows. \
        Always filter by user_id; write :user_id where the current user's id belongs. \
        Amounts are stored in amount_cents as whole VND.";

    type Args = SqlExecutorArgs;

    fn describe_call(&self, _args: &Self::Args) -> String {
        "Searching through your transaction history to find relevant information".to_string()
    }

    async fn execute(&self, args: Self::Args, ctx: &UserContext) -> ToolOutcome {
        let statement = validate_read_only(&args.sql_query)
            .map_err(|reason| ToolError::validation(Self::NAME, reason))?;

        let user = current_user(self.ledger.as_ref(), ctx).await?;
        let statement = statement.replace(USER_ID_PLACEHOLDER, &format!("'{}'", user.id));
        debug!(sql = %statement, "Running read-only query");

        let rows = self
            .ledger
            .run_read_only(&statement)
            .await
            .map_err(|e| ToolError::Execution(format!("Error executing query: {}", e)))?;

        let body = if rows.is_empty() {
            json!({
                "status": "success",
                "message": "No results found",
                "data": [],
            })
        } else {
            let total_rows = rows.len();
            let data: Vec<Value> = rows.into_iter().map(|r| Value::Object(format_row(r))).collect();
            json!({
                "status": "success",
                "message": "Query executed successfully",
                "data": data,
                "total_rows": total_rows,
            })
        };

        Ok(body.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LedgerError;
    use crate::ledger::{
        ColumnInfo, Jar, LedgerEntry, LedgerResult, NewIncomeEntry, NewTransaction, UserProfile,
    };
    use crate::tools::test_support::{args, ctx, ledger, USER};
    use crate::tools::ErasedTool;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    /// Finance store that records the statement it was asked to run
    struct RecordingStore {
        user: UserProfile,
        seen: Mutex<Option<String>>,
        rows: Vec<Map<String, Value>>,
    }

    #[async_trait]
    impl FinanceStore for RecordingStore {
        async fn user_by_identifier(&self, _identifier: &str) -> LedgerResult<UserProfile> {
            Ok(self.user.clone())
        }
        async fn record_monthly_income(
            &self,
            _entry: NewIncomeEntry,
            _allocations: Vec<NewTransaction>,
        ) -> LedgerResult<i64> {
            Err(LedgerError::Unsupported("read-only".to_string()))
        }
        async fn insert_transactions(&self, _transactions: Vec<NewTransaction>) -> LedgerResult<()> {
            Err(LedgerError::Unsupported("read-only".to_string()))
        }
        async fn set_saving_target(&self, _user_id: Uuid, _target_cents: i64) -> LedgerResult<()> {
            Err(LedgerError::Unsupported("read-only".to_string()))
        }
        async fn jar_history(&self, _user_id: Uuid, _jar: Jar) -> LedgerResult<Vec<LedgerEntry>> {
            Ok(vec![])
        }
        async fn transaction_columns(&self) -> LedgerResult<Vec<ColumnInfo>> {
            Ok(vec![])
        }
        async fn run_read_only(&self, sql: &str) -> LedgerResult<Vec<Map<String, Value>>> {
            *self.seen.lock().await = Some(sql.to_string());
            Ok(self.rows.clone())
        }
    }

    fn recording_store(rows: Vec<Map<String, Value>>) -> Arc<RecordingStore> {
        Arc::new(RecordingStore {
            user: UserProfile {
                id: Uuid::nil(),
                email: USER.to_string(),
                description: None,
                saving_target_cents: None,
            },
            seen: Mutex::new(None),
            rows,
        })
    }

    #[test]
    fn test_validation_accepts_select_and_with() {
        assert_eq!(
            validate_read_only("  SELECT * FROM transactions;  ").unwrap(),
            "SELECT * FROM transactions"
        );
        assert!(validate_read_only("with t as (select 1) select * from t").is_ok());
        assert!(validate_read_only("select 'please delete me' as note").is_ok());
    }

    #[test]
    fn test_validation_rejects_writes() {
        assert!(validate_read_only("DELETE FROM transactions").is_err());
        assert!(validate_read_only("select 1; drop table users").is_err());
        assert!(validate_read_only("with x as (delete from transactions returning *) select * from x").is_err());
        assert!(validate_read_only("   ").is_err());
    }

    #[test]
    fn test_validation_rejects_side_effect_functions() {
        for sql in [
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity",
            "SELECT pg_sleep(100000)",
            "select PG_SLEEP_FOR('1 hour')",
            "SELECT set_config('statement_timeout', '0', false)",
            "select * from dblink('host=evil', 'select 1') as t(x int)",
            "select lo_import('/etc/passwd')",
            "select pg_read_file('postgresql.conf')",
            "select pg_cancel_backend(1)",
        ] {
            let err = validate_read_only(sql).unwrap_err();
            assert!(err.contains("is not allowed"), "{} -> {}", sql, err);
        }

        // Names inside literals and ordinary columns still pass.
        assert!(validate_read_only("select 'pg_sleep(5)' as note").is_ok());
        assert!(validate_read_only("select description from transactions where source = 'lo_fi'").is_ok());
    }

    #[tokio::test]
    async fn test_executor_rejects_side_effect_functions_before_touching_store() {
        let store = recording_store(vec![]);
        let tool = SqlExecutor::new(store.clone());

        let err = tool
            .call(args(json!({"sql_query": "SELECT pg_sleep(100000)"})), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Validation { .. }));
        assert!(store.seen.lock().await.is_none());
    }

    #[test]
    fn test_number_formatting() {
        let row = args(json!({"total": 1234567, "avg": -1234.5, "jar": "Play", "note": null}));
        let formatted = format_row(row);
        assert_eq!(formatted["total"], "1,234,567");
        assert_eq!(formatted["avg"], "-1,234.5");
        assert_eq!(formatted["jar"], "Play");
        assert!(formatted["note"].is_null());
    }

    #[tokio::test]
    async fn test_executor_substitutes_user_and_formats_rows() {
        let store = recording_store(vec![args(json!({"amount_cents": 2500000}))]);
        let tool = SqlExecutor::new(store.clone());

        let response = tool
            .call(
                args(json!({"sql_query": "SELECT amount_cents FROM transactions WHERE user_id = :user_id"})),
                &ctx(),
            )
            .await
            .unwrap();

        let body: Value = serde_json::from_str(&response).unwrap();
        assert_eq!(body["total_rows"], 1);
        assert_eq!(body["data"][0]["amount_cents"], "2,500,000");

        let seen = store.seen.lock().await.clone().unwrap();
        assert!(seen.ends_with(&format!("user_id = '{}'", Uuid::nil())));
    }

    #[tokio::test]
    async fn test_executor_rejects_mutation_before_touching_store() {
        let store = recording_store(vec![]);
        let tool = SqlExecutor::new(store.clone());

        let err = tool
            .call(args(json!({"sql_query": "UPDATE users SET email = 'x'"})), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Validation { .. }));
        assert!(store.seen.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_in_memory_store_reports_unsupported() {
        let tool = SqlExecutor::new(ledger());
        let err = tool
            .call(args(json!({"sql_query": "select 1"})), &ctx())
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Error executing query:"));
    }

    #[tokio::test]
    async fn test_schema_listing() {
        let tool = GetTransactionSchema::new(ledger());
        let response = tool.call(Map::new(), &ctx()).await.unwrap();
        assert!(response.starts_with("Transactions Table Schema:"));
        assert!(response.contains("Column: amount_cents\nType: bigint\nNullable: NO\nDefault: None"));
    }
}
