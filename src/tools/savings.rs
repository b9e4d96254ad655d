//! Savings target and savings-goal prediction

use super::{current_user, ensure_finite, format_vnd, Tool, ToolOutcome};
use crate::error::ToolError;
use crate::forecast::{SavingsForecaster, SeriesPoint};
use crate::ledger::{FinanceStore, Jar, LedgerEntry};
use crate::models::UserContext;
use async_trait::async_trait;
use chrono::{Months, NaiveDate, Utc};
use schemars::JsonSchema;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Transactions the rate-based fallback averages over
const RECENT_WINDOW: usize = 12;
/// Beyond this many months the answer carries a tip
const LONG_HORIZON_MONTHS: f64 = 24.0;

//
// ================= set_saving_target =================
//

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SetSavingTargetArgs {
    /// The target savings amount in VND
    pub target_amount: f64,
}

pub struct SetSavingTarget {
    ledger: Arc<dyn FinanceStore>,
}

impl SetSavingTarget {
    pub fn new(ledger: Arc<dyn FinanceStore>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl Tool for SetSavingTarget {
    const NAME: &'static str = "set_saving_target";
    const DESCRIPTION: &'static str = "Set or update the user's savings target amount.";

    type Args = SetSavingTargetArgs;

    fn describe_call(&self, args: &Self::Args) -> String {
        format!("Setting savings target to {} VND", args.target_amount)
    }

    async fn execute(&self, args: Self::Args, ctx: &UserContext) -> ToolOutcome {
        ensure_finite(Self::NAME, "target_amount", args.target_amount)?;
        if args.target_amount <= 0.0 {
            return Err(ToolError::validation(
                Self::NAME,
                "Target amount must be a positive number in VND.",
            ));
        }

        let user = current_user(self.ledger.as_ref(), ctx).await?;
        // The column keeps the legacy x100 scale.
        let target_cents = (args.target_amount * 100.0).round() as i64;
        self.ledger.set_saving_target(user.id, target_cents).await?;

        Ok(format!(
            "✅ Successfully updated\n\n💰 new target: {}\n\nYou can now track your savings progress on the savings chart.",
            format_vnd(args.target_amount)
        ))
    }
}

//
// ================= predict_savings =================
//

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, JsonSchema)]
pub enum ForecastFrequency {
    #[serde(rename = "D")]
    Daily,
    #[serde(rename = "W")]
    Weekly,
    #[default]
    #[serde(rename = "M")]
    Monthly,
}

impl ForecastFrequency {
    fn days(self) -> u32 {
        match self {
            ForecastFrequency::Daily => 1,
            ForecastFrequency::Weekly => 7,
            ForecastFrequency::Monthly => 30,
        }
    }

    fn unit(self) -> &'static str {
        match self {
            ForecastFrequency::Daily => "days",
            ForecastFrequency::Weekly => "weeks",
            ForecastFrequency::Monthly => "months",
        }
    }
}

fn default_periods() -> u32 {
    24
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct PredictSavingsArgs {
    /// Amount in VND the user wants to save or spend (e.g. 250000000 for a car)
    pub target_amount: f64,
    /// What the user is saving for (e.g. 'car', 'vacation', 'emergency fund')
    #[serde(default)]
    pub target_description: String,
    /// Number of periods to forecast. Default 24.
    #[serde(default = "default_periods")]
    pub forecast_periods: u32,
    /// 'D' daily, 'W' weekly or 'M' monthly periods. Default 'M'.
    #[serde(default)]
    pub forecast_frequency: ForecastFrequency,
}

pub struct PredictSavings {
    ledger: Arc<dyn FinanceStore>,
    forecaster: Option<Arc<dyn SavingsForecaster>>,
}

impl PredictSavings {
    pub fn new(
        ledger: Arc<dyn FinanceStore>,
        forecaster: Option<Arc<dyn SavingsForecaster>>,
    ) -> Self {
        Self { ledger, forecaster }
    }
}

/// Closing balance of each day that has savings activity
fn daily_balances(history: &[LedgerEntry]) -> Vec<SeriesPoint> {
    let mut series: Vec<SeriesPoint> = Vec::new();
    let mut balance = 0.0;
    for entry in history {
        balance += entry.amount as f64;
        let date = entry.occurred_at.date_naive();
        match series.last_mut() {
            Some(last) if last.date == date => last.value = balance,
            _ => series.push(SeriesPoint { date, value: balance }),
        }
    }
    series
}

struct Goal<'a> {
    target: f64,
    description: &'a str,
    current: f64,
}

impl Goal<'_> {
    fn remaining(&self) -> f64 {
        self.target - self.current
    }

    fn label(&self) -> String {
        if self.description.trim().is_empty() {
            format_vnd(self.target)
        } else {
            format!("{} for {}", format_vnd(self.target), self.description.trim())
        }
    }

    fn summary_lines(&self) -> String {
        format!(
            "- Current savings: {}\n- Target amount: {}\n- Remaining amount: {}\n",
            format_vnd(self.current),
            format_vnd(self.target),
            format_vnd(self.remaining())
        )
    }
}

fn tip(months: f64) -> &'static str {
    if months > LONG_HORIZON_MONTHS {
        "\n💡 Tip: Consider increasing your monthly savings or adjusting your target to reach your goal sooner."
    } else {
        ""
    }
}

fn forecast_answer(
    goal: &Goal<'_>,
    points: &[SeriesPoint],
    today: NaiveDate,
    args: &PredictSavingsArgs,
) -> String {
    match points.iter().find(|p| p.value >= goal.target) {
        Some(hit) => {
            let months = (hit.date - today).num_days() as f64 / 30.0;
            format!(
                "Based on the forecast of your savings history:\n{}- Estimated time to reach goal: {}\n{}",
                goal.summary_lines(),
                hit.date.format("%B %Y"),
                tip(months)
            )
        }
        None => {
            let projected = points.last().map(|p| p.value).unwrap_or(goal.current);
            format!(
                "Based on the forecast of your savings history:\n{}- The goal is not reached within {} {}; projected savings by then: {}\n{}",
                goal.summary_lines(),
                args.forecast_periods,
                args.forecast_frequency.unit(),
                format_vnd(projected),
                tip(f64::INFINITY)
            )
        }
    }
}

fn rate_answer(goal: &Goal<'_>, history: &[LedgerEntry], today: NaiveDate) -> String {
    let recent = &history[history.len().saturating_sub(RECENT_WINDOW)..];
    if recent.len() < 2 {
        return format!(
            "Not enough savings data to make a prediction. Current savings: {}. Target: {}.",
            format_vnd(goal.current),
            goal.label()
        );
    }

    let total_change: f64 = recent.iter().map(|e| e.amount as f64).sum();
    let monthly_rate = total_change / recent.len() as f64 * 30.0;
    if monthly_rate <= 0.0 {
        return format!(
            "Your current savings rate is not positive. You need to save more to reach your goal of {}.",
            goal.label()
        );
    }

    let months = goal.remaining() / monthly_rate;
    let target_date = today
        .checked_add_months(Months::new(months.ceil().min(u32::MAX as f64) as u32))
        .unwrap_or(NaiveDate::MAX);

    format!(
        "Based on your current savings rate of {} per month:\n{}- Estimated time to reach goal: {}\n{}",
        format_vnd(monthly_rate),
        goal.summary_lines(),
        target_date.format("%B %Y"),
        tip(months)
    )
}

#[async_trait]
impl Tool for PredictSavings {
    const NAME: &'static str = "predict_savings";
    const DESCRIPTION: &'static str = "Predict when the user can reach a savings goal or afford a purchase, \
        based on the history of their Savings jar.";

    type Args = PredictSavingsArgs;

    fn describe_call(&self, args: &Self::Args) -> String {
        format!(
            "Analyzing savings data to predict when you can reach {}",
            args.target_amount
        )
    }

    async fn execute(&self, args: Self::Args, ctx: &UserContext) -> ToolOutcome {
        ensure_finite(Self::NAME, "target_amount", args.target_amount)?;
        if args.target_amount <= 0.0 {
            return Err(ToolError::validation(Self::NAME, "target_amount must be positive"));
        }
        if args.forecast_periods == 0 {
            return Err(ToolError::validation(Self::NAME, "forecast_periods must be at least 1"));
        }

        let user = current_user(self.ledger.as_ref(), ctx).await?;
        let history = self.ledger.jar_history(user.id, Jar::Savings).await?;
        if history.is_empty() {
            return Ok(
                "No savings data found. Please start saving money first to get predictions."
                    .to_string(),
            );
        }

        let goal = Goal {
            target: args.target_amount,
            description: &args.target_description,
            current: history.iter().map(|e| e.amount as f64).sum(),
        };
        if goal.remaining() <= 0.0 {
            return Ok(format!(
                "Your current savings of {} already cover your goal of {}.",
                format_vnd(goal.current),
                goal.label()
            ));
        }

        let today = Utc::now().date_naive();
        if let Some(forecaster) = &self.forecaster {
            let horizon = args
                .forecast_periods
                .saturating_mul(args.forecast_frequency.days());
            let series = daily_balances(&history);
            match forecaster.forecast(&series, horizon).await {
                Ok(points) if !points.is_empty() => {
                    debug!(points = points.len(), "Forecast received");
                    return Ok(forecast_answer(&goal, &points, today, &args));
                }
                Ok(_) => warn!("Forecast service returned no points, using savings rate"),
                Err(e) => warn!(error = %e, "Forecast failed, using savings rate"),
            }
        }

        Ok(rate_answer(&goal, &history, today))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ForecastError;
    use crate::ledger::{InMemoryLedger, NewTransaction};
    use crate::tools::test_support::{args, ctx, ledger, USER};
    use crate::tools::ErasedTool;
    use serde_json::json;

    struct LinearForecaster {
        daily_gain: f64,
    }

    #[async_trait]
    impl SavingsForecaster for LinearForecaster {
        async fn forecast(
            &self,
            history: &[SeriesPoint],
            horizon_days: u32,
        ) -> std::result::Result<Vec<SeriesPoint>, ForecastError> {
            let last = history
                .last()
                .ok_or_else(|| ForecastError::InvalidResponse("empty history".to_string()))?;
            Ok((1..=horizon_days)
                .map(|day| SeriesPoint {
                    date: last.date + chrono::Duration::days(i64::from(day)),
                    value: last.value + self.daily_gain * f64::from(day),
                })
                .collect())
        }
    }

    struct BrokenForecaster;

    #[async_trait]
    impl SavingsForecaster for BrokenForecaster {
        async fn forecast(
            &self,
            _history: &[SeriesPoint],
            _horizon_days: u32,
        ) -> std::result::Result<Vec<SeriesPoint>, ForecastError> {
            Err(ForecastError::Status {
                status: reqwest::StatusCode::BAD_REQUEST,
                detail: "Need at least 30 days of data for prediction.".to_string(),
            })
        }
    }

    async fn seed_savings(ledger: &InMemoryLedger, amounts: &[i64]) {
        let user = ledger.user_by_identifier(USER).await.unwrap();
        let start = Utc::now() - chrono::Duration::days(amounts.len() as i64 * 30);
        let rows = amounts
            .iter()
            .enumerate()
            .map(|(i, amount)| NewTransaction {
                user_id: user.id,
                jar: Jar::Savings,
                amount: *amount,
                description: "saving".to_string(),
                source: "test".to_string(),
                occurred_at: start + chrono::Duration::days(i as i64 * 30),
            })
            .collect();
        ledger.insert_transactions(rows).await.unwrap();
    }

    #[tokio::test]
    async fn test_saving_target_stored_scaled() {
        let ledger = ledger();
        let tool = SetSavingTarget::new(ledger.clone());

        let response = tool
            .call(args(json!({"target_amount": 5_000_000})), &ctx())
            .await
            .unwrap();
        assert!(response.contains("Successfully updated"));
        assert!(response.contains("5,000,000 VND"));

        let profile = ledger.user_by_identifier(USER).await.unwrap();
        assert_eq!(profile.saving_target_cents, Some(500_000_000));
    }

    #[tokio::test]
    async fn test_saving_target_must_be_positive() {
        let tool = SetSavingTarget::new(ledger());
        let err = tool
            .call(args(json!({"target_amount": 0})), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_prediction_without_history() {
        let tool = PredictSavings::new(ledger(), None);
        let response = tool
            .call(args(json!({"target_amount": 1_000_000, "target_description": "bike"})), &ctx())
            .await
            .unwrap();
        assert!(response.starts_with("No savings data found"));
    }

    #[tokio::test]
    async fn test_rate_projection_with_long_horizon_tip() {
        let ledger = ledger();
        seed_savings(&ledger, &[100_000, 100_000, 100_000]).await;
        let tool = PredictSavings::new(ledger.clone(), None);

        let response = tool
            .call(
                args(json!({"target_amount": 500_000_000, "target_description": "car"})),
                &ctx(),
            )
            .await
            .unwrap();
        assert!(response.starts_with("Based on your current savings rate of 3,000,000 VND per month"));
        assert!(response.contains("- Current savings: 300,000 VND"));
        assert!(response.contains("💡 Tip"));
    }

    #[tokio::test]
    async fn test_forecast_finds_target_date() {
        let ledger = ledger();
        seed_savings(&ledger, &[1_000_000, 1_000_000]).await;
        let tool = PredictSavings::new(
            ledger.clone(),
            Some(Arc::new(LinearForecaster { daily_gain: 100_000.0 })),
        );

        let response = tool
            .call(
                args(json!({"target_amount": 3_000_000, "forecast_periods": 2, "forecast_frequency": "M"})),
                &ctx(),
            )
            .await
            .unwrap();
        assert!(response.starts_with("Based on the forecast of your savings history"));
        assert!(response.contains("- Remaining amount: 1,000,000 VND"));
        assert!(response.contains("Estimated time to reach goal"));
        assert!(!response.contains("💡 Tip"));
    }

    #[tokio::test]
    async fn test_forecast_failure_falls_back_to_rate() {
        let ledger = ledger();
        seed_savings(&ledger, &[200_000, 200_000]).await;
        let tool = PredictSavings::new(ledger.clone(), Some(Arc::new(BrokenForecaster)));

        let response = tool
            .call(args(json!({"target_amount": 1_000_000})), &ctx())
            .await
            .unwrap();
        assert!(response.starts_with("Based on your current savings rate"));
    }

    #[tokio::test]
    async fn test_goal_already_reached() {
        let ledger = ledger();
        seed_savings(&ledger, &[2_000_000]).await;
        let tool = PredictSavings::new(ledger.clone(), None);

        let response = tool
            .call(args(json!({"target_amount": 1_000_000, "target_description": "phone"})), &ctx())
            .await
            .unwrap();
        assert!(response.contains("already cover your goal of 1,000,000 VND for phone"));
    }

    #[test]
    fn test_daily_balances_keep_last_value_per_day() {
        let at = |day: u32, hour: u32| {
            NaiveDate::from_ymd_opt(2024, 1, day)
                .unwrap()
                .and_hms_opt(hour, 0, 0)
                .unwrap()
                .and_utc()
        };
        let entry = |amount: i64, day: u32, hour: u32| LedgerEntry {
            jar: Jar::Savings,
            amount,
            occurred_at: at(day, hour),
            description: String::new(),
            monthly_income_entry_id: None,
        };

        let series = daily_balances(&[entry(100, 1, 8), entry(50, 1, 20), entry(-30, 3, 9)]);
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].value, 150.0);
        assert_eq!(series[1].value, 120.0);
    }

    #[test]
    fn test_frequency_parses_letter_codes() {
        let parsed: PredictSavingsArgs =
            serde_json::from_value(json!({"target_amount": 1, "forecast_frequency": "W"})).unwrap();
        assert_eq!(parsed.forecast_frequency, ForecastFrequency::Weekly);
        assert_eq!(parsed.forecast_periods, 24);
    }
}
