//! Runtime settings, read from the environment (and `.env` when present)

use crate::error::OrchestrationError;
use crate::Result;
use std::env;
use std::str::FromStr;

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// Loop bounds and emitter budget shared by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopLimits {
    /// Retries allowed when the model answers with neither text nor tool calls
    pub max_empty_retries: u32,
    /// Reasoning → tools round trips allowed per request
    pub max_tool_rounds: u32,
    /// Tool calls of one batch allowed to run at the same time
    pub tool_concurrency: usize,
    /// Words kept in a `thinking` / summary event
    pub thinking_word_budget: usize,
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self {
            max_empty_retries: 3,
            max_tool_rounds: 10,
            tool_concurrency: 4,
            thinking_word_budget: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub gemini_api_key: String,
    pub gemini_model: String,
    pub port: u16,
    pub database_url: Option<String>,
    pub forecast_service_url: Option<String>,
    pub tavily_api_key: Option<String>,
    pub limits: LoopLimits,
}

impl Settings {
    /// Load `.env` (if any) and read every setting from the process environment
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = LoopLimits::default();

        Ok(Self {
            gemini_api_key: non_empty("GEMINI_API_KEY").unwrap_or_default(),
            gemini_model: non_empty("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            port: parse_or(non_empty("PORT").or_else(|| non_empty("API_PORT")), "PORT", 8000)?,
            database_url: non_empty("POSTGRES_URL").or_else(|| non_empty("DATABASE_URL")),
            forecast_service_url: non_empty("FORECAST_SERVICE_URL"),
            tavily_api_key: non_empty("TAVILY_API_KEY"),
            limits: LoopLimits {
                max_empty_retries: parse_or(
                    non_empty("MAX_EMPTY_RETRIES"),
                    "MAX_EMPTY_RETRIES",
                    defaults.max_empty_retries,
                )?,
                max_tool_rounds: parse_or(
                    non_empty("MAX_TOOL_ROUNDS"),
                    "MAX_TOOL_ROUNDS",
                    defaults.max_tool_rounds,
                )?,
                tool_concurrency: parse_or(
                    non_empty("TOOL_CONCURRENCY"),
                    "TOOL_CONCURRENCY",
                    defaults.tool_concurrency,
                )?
                .max(1),
                thinking_word_budget: parse_or(
                    non_empty("THINKING_WORD_BUDGET"),
                    "THINKING_WORD_BUDGET",
                    defaults.thinking_word_budget,
                )?
                .max(1),
            },
        })
    }
}

fn parse_or<T: FromStr>(value: Option<String>, key: &str, default: T) -> Result<T> {
    match value {
        Some(raw) => raw.trim().parse().map_err(|_| {
            OrchestrationError::ConfigError(format!("{} has an invalid value: {}", key, raw))
        }),
        None => Ok(default),
    }
}
