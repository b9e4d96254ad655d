//! Tools that move money into, out of and between jars

use super::{current_user, ensure_finite, format_vnd, Tool, ToolOutcome};
use crate::error::ToolError;
use crate::ledger::{FinanceStore, Jar, NewIncomeEntry, NewTransaction};
use crate::models::UserContext;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tracing::info;

const CHATBOT_SOURCE: &str = "chatbot";

//
// ================= add_monthly_income =================
//

fn default_necessity() -> f64 {
    55.0
}
fn default_ten() -> f64 {
    10.0
}
fn default_charity() -> f64 {
    5.0
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct AddMonthlyIncomeArgs {
    /// The monthly income amount in VND
    pub monthly_income_amount: f64,
    /// Month of the income in YYYY-MM format (e.g. '2024-01'). Defaults to the current month.
    #[serde(default)]
    pub month_year: Option<String>,
    /// Share for the Necessity jar (food, housing, utilities). Default 55.
    #[serde(default = "default_necessity")]
    pub necessity_percentage: f64,
    /// Share for the Play jar (entertainment and leisure). Default 10.
    #[serde(default = "default_ten")]
    pub play_percentage: f64,
    /// Share for the Education jar (learning and skills). Default 10.
    #[serde(default = "default_ten")]
    pub education_percentage: f64,
    /// Share for the Investment jar (long-term wealth building). Default 10.
    #[serde(default = "default_ten")]
    pub investment_percentage: f64,
    /// Share for the Charity jar (giving back). Default 5.
    #[serde(default = "default_charity")]
    pub charity_percentage: f64,
    /// Share for the Savings jar (emergency fund and future goals). Default 10.
    #[serde(default = "default_ten")]
    pub savings_percentage: f64,
}

impl AddMonthlyIncomeArgs {
    fn allocation(&self) -> [(Jar, f64); 6] {
        [
            (Jar::Necessity, self.necessity_percentage),
            (Jar::Play, self.play_percentage),
            (Jar::Education, self.education_percentage),
            (Jar::Investment, self.investment_percentage),
            (Jar::Charity, self.charity_percentage),
            (Jar::Savings, self.savings_percentage),
        ]
    }
}

pub struct AddMonthlyIncome {
    ledger: Arc<dyn FinanceStore>,
}

impl AddMonthlyIncome {
    pub fn new(ledger: Arc<dyn FinanceStore>) -> Self {
        Self { ledger }
    }
}

/// `"2024-01"` → first day of that month
fn parse_month(tool: &str, raw: &str) -> std::result::Result<NaiveDate, ToolError> {
    NaiveDate::parse_from_str(&format!("{}-01", raw.trim()), "%Y-%m-%d")
        .map_err(|_| ToolError::validation(tool, format!("month_year must use the YYYY-MM format, got '{}'", raw)))
}

#[async_trait]
impl Tool for AddMonthlyIncome {
    const NAME: &'static str = "add_monthly_income";
    const DESCRIPTION: &'static str =
        "Add monthly income to the user's jars, split by the allocation percentages (which must total 100).";

    type Args = AddMonthlyIncomeArgs;

    fn describe_call(&self, args: &Self::Args) -> String {
        format!(
            "Adding monthly income of {} VND to user's jars",
            args.monthly_income_amount
        )
    }

    async fn execute(&self, args: Self::Args, ctx: &UserContext) -> ToolOutcome {
        ensure_finite(Self::NAME, "monthly_income_amount", args.monthly_income_amount)?;
        if args.monthly_income_amount <= 0.0 {
            return Err(ToolError::validation(
                Self::NAME,
                "monthly_income_amount must be positive",
            ));
        }

        let allocation = args.allocation();
        if allocation.iter().any(|(_, pct)| !pct.is_finite() || *pct < 0.0) {
            return Err(ToolError::validation(
                Self::NAME,
                "allocation percentages must be non-negative numbers",
            ));
        }

        let total_percentage: f64 = allocation.iter().map(|(_, pct)| pct).sum();
        if (total_percentage - 100.0).abs() > 0.01 {
            return Err(ToolError::validation(
                Self::NAME,
                format!(
                    "Allocation percentages must total 100%. Current total: {}%",
                    total_percentage
                ),
            ));
        }

        let now = Utc::now();
        let month = match args.month_year.as_deref().filter(|m| !m.trim().is_empty()) {
            Some(raw) => parse_month(Self::NAME, raw)?,
            None => NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
                .ok_or_else(|| ToolError::Execution("Could not determine the current month".to_string()))?,
        };
        let month_label = month.format("%Y-%m").to_string();

        let user = current_user(self.ledger.as_ref(), ctx).await?;
        let income = args.monthly_income_amount.round() as i64;

        let allocations: Vec<NewTransaction> = allocation
            .iter()
            .filter_map(|(jar, pct)| {
                let amount = (income as f64 * pct / 100.0).round() as i64;
                (amount > 0).then(|| NewTransaction {
                    user_id: user.id,
                    jar: *jar,
                    amount,
                    description: format!("Monthly income allocation for {}", month_label),
                    source: CHATBOT_SOURCE.to_string(),
                    occurred_at: now,
                })
            })
            .collect();

        let percentages = allocation
            .iter()
            .map(|(jar, pct)| (jar.name().to_string(), json!(pct)))
            .collect::<serde_json::Map<_, _>>();

        let entry_id = self
            .ledger
            .record_monthly_income(
                NewIncomeEntry {
                    user_id: user.id,
                    month,
                    total: income,
                    percentages: percentages.into(),
                },
                allocations,
            )
            .await?;

        info!(entry_id, month = %month_label, "Monthly income recorded");

        let details = allocation
            .iter()
            .map(|(jar, pct)| format!("{}: {}%", jar.name(), pct))
            .collect::<Vec<_>>()
            .join(", ");

        Ok(format!(
            "Monthly income of {} for {} added successfully! Allocated to jars: {}",
            format_vnd(income as f64),
            month_label,
            details
        ))
    }
}

//
// ================= update_transaction =================
//

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    #[default]
    Expense,
    Income,
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionType::Expense => write!(f, "expense"),
            TransactionType::Income => write!(f, "income"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct UpdateTransactionArgs {
    /// Amount of the transaction in VND
    pub amount: f64,
    /// Jar id: 1 Necessity, 2 Play, 3 Education, 4 Investment, 5 Charity, 6 Savings
    pub jar_category_id: i64,
    /// What the money was spent on or came from
    #[serde(default)]
    pub description: String,
    /// `expense` (default) or `income`
    #[serde(default)]
    pub transaction_type: TransactionType,
}

pub struct UpdateTransaction {
    ledger: Arc<dyn FinanceStore>,
}

impl UpdateTransaction {
    pub fn new(ledger: Arc<dyn FinanceStore>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl Tool for UpdateTransaction {
    const NAME: &'static str = "update_transaction";
    const DESCRIPTION: &'static str = "Add a single income or expense transaction to one jar. \
        Classify the transaction into a jar when the user does not name one.";

    type Args = UpdateTransactionArgs;

    fn describe_call(&self, args: &Self::Args) -> String {
        format!("Recording {} of {} VND", args.transaction_type, args.amount)
    }

    async fn execute(&self, args: Self::Args, ctx: &UserContext) -> ToolOutcome {
        ensure_finite(Self::NAME, "amount", args.amount)?;
        let amount = args.amount.abs().round() as i64;
        if amount == 0 {
            return Err(ToolError::validation(Self::NAME, "amount must not be zero"));
        }

        let jar = Jar::from_id(args.jar_category_id).ok_or_else(|| {
            ToolError::validation(
                Self::NAME,
                format!(
                    "jar_category_id must be between 1 and 6, got {}",
                    args.jar_category_id
                ),
            )
        })?;

        let user = current_user(self.ledger.as_ref(), ctx).await?;
        let signed = match args.transaction_type {
            TransactionType::Expense => -amount,
            TransactionType::Income => amount,
        };

        self.ledger
            .insert_transactions(vec![NewTransaction {
                user_id: user.id,
                jar,
                amount: signed,
                description: args.description.clone(),
                source: CHATBOT_SOURCE.to_string(),
                occurred_at: Utc::now(),
            }])
            .await?;

        let mut response = format!(
            "Added {} of {} to the {} jar",
            args.transaction_type,
            format_vnd(amount as f64),
            jar.name()
        );
        if !args.description.trim().is_empty() {
            response.push_str(&format!(" for {}", args.description.trim()));
        }
        Ok(response)
    }
}

//
// ================= swap_jar =================
//

fn default_swap_description() -> String {
    "Jar swap".to_string()
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SwapJarArgs {
    /// Source jar name (Necessity, Play, Education, Investment, Charity, Savings)
    #[serde(alias = "fromJarName")]
    pub from_jar: String,
    /// Target jar name
    #[serde(alias = "toJarName")]
    pub to_jar: String,
    /// Amount to move in VND
    #[serde(alias = "amountCents")]
    pub amount: f64,
    /// Note stored on both transactions
    #[serde(default = "default_swap_description")]
    pub description: String,
}

pub struct SwapJar {
    ledger: Arc<dyn FinanceStore>,
}

impl SwapJar {
    pub fn new(ledger: Arc<dyn FinanceStore>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl Tool for SwapJar {
    const NAME: &'static str = "swap_jar";
    const DESCRIPTION: &'static str = "Move money from one jar to another.";

    type Args = SwapJarArgs;

    fn describe_call(&self, args: &Self::Args) -> String {
        format!(
            "Moving {} VND from {} to {}",
            args.amount, args.from_jar, args.to_jar
        )
    }

    async fn execute(&self, args: Self::Args, ctx: &UserContext) -> ToolOutcome {
        ensure_finite(Self::NAME, "amount", args.amount)?;
        let amount = args.amount.abs().round() as i64;
        if amount == 0 {
            return Err(ToolError::validation(Self::NAME, "amount must not be zero"));
        }

        let jar = |name: &str| {
            Jar::from_name(name)
                .ok_or_else(|| ToolError::validation(Self::NAME, format!("Invalid jar name: {}", name)))
        };
        let from = jar(&args.from_jar)?;
        let to = jar(&args.to_jar)?;
        if from == to {
            return Err(ToolError::validation(
                Self::NAME,
                "source and target jar must differ",
            ));
        }

        let user = current_user(self.ledger.as_ref(), ctx).await?;
        let now = Utc::now();
        let leg = |jar: Jar, amount: i64, note: String| NewTransaction {
            user_id: user.id,
            jar,
            amount,
            description: note,
            source: "jar_swap".to_string(),
            occurred_at: now,
        };

        self.ledger
            .insert_transactions(vec![
                leg(from, -amount, format!("{} (from {})", args.description, from.name())),
                leg(to, amount, format!("{} (to {})", args.description, to.name())),
            ])
            .await?;

        Ok(format!(
            "Moved {} from {} to {} successfully",
            format_vnd(amount as f64),
            from.name(),
            to.name()
        ))
    }
}
