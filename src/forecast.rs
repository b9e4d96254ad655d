//! Savings forecasting collaborator
//!
//! The forecasting model itself lives in a separate service; this module only
//! ships a balance series to it and reads the predicted series back.

use crate::error::ForecastError;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesPoint {
    pub date: NaiveDate,
    pub value: f64,
}

#[async_trait]
pub trait SavingsForecaster: Send + Sync {
    /// Predict `horizon_days` daily points following `history`
    async fn forecast(
        &self,
        history: &[SeriesPoint],
        horizon_days: u32,
    ) -> std::result::Result<Vec<SeriesPoint>, ForecastError>;
}

#[derive(Debug, Serialize)]
struct ForecastRequest {
    dates: Vec<String>,
    values: Vec<f64>,
    predict_days: u32,
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    predicted_dates: Vec<String>,
    predicted_values: Vec<f64>,
}

/// Client for the time-series service (`POST /predict`)
pub struct HttpForecaster {
    client: Client,
    base_url: String,
}

impl HttpForecaster {
    pub fn new(base_url: &str) -> crate::Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SavingsForecaster for HttpForecaster {
    async fn forecast(
        &self,
        history: &[SeriesPoint],
        horizon_days: u32,
    ) -> std::result::Result<Vec<SeriesPoint>, ForecastError> {
        let body = ForecastRequest {
            dates: history
                .iter()
                .map(|p| p.date.format("%Y-%m-%d").to_string())
                .collect(),
            values: history.iter().map(|p| p.value).collect(),
            predict_days: horizon_days,
        };

        let url = format!("{}/predict", self.base_url);
        debug!(points = history.len(), horizon_days, "Requesting savings forecast");

        let response = self.client.post(url).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ForecastError::Status { status, detail });
        }

        let parsed: ForecastResponse = response
            .json()
            .await
            .map_err(|e| ForecastError::InvalidResponse(e.to_string()))?;

        parse_points(parsed)
    }
}

fn parse_points(response: ForecastResponse) -> std::result::Result<Vec<SeriesPoint>, ForecastError> {
    if response.predicted_dates.len() != response.predicted_values.len() {
        return Err(ForecastError::InvalidResponse(
            "Forecast dates and values differ in length".to_string(),
        ));
    }

    response
        .predicted_dates
        .iter()
        .zip(response.predicted_values)
        .map(|(date, value)| {
            NaiveDate::parse_from_str(date, "%Y-%m-%d")
                .map(|date| SeriesPoint { date, value })
                .map_err(|e| {
                    ForecastError::InvalidResponse(format!("Invalid forecast date {}: {}", date, e))
                })
        })
        .collect()
}
