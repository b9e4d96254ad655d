//! Error types for the jars assistant

use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Core Loop Errors
    // =============================

    #[error("Reasoning unavailable: {0}")]
    ReasoningUnavailable(String),

    #[error("Model returned no usable output after {0} retries")]
    EmptyResponse(u32),

    #[error("Exceeded {0} tool rounds without a final answer")]
    MaxToolRoundsExceeded(u32),

    #[error("State persistence error: {0}")]
    StateError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Failure of a single tool call.
///
/// Never propagated out of the dispatcher: it is rendered into the tool-result
/// message so the model can react to it on its next reasoning step.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("Invalid arguments for {tool}: {reason}")]
    Validation { tool: String, reason: String },

    #[error("{0}")]
    Execution(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),
}

impl ToolError {
    pub fn validation(tool: &str, reason: impl Into<String>) -> Self {
        ToolError::Validation {
            tool: tool.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors raised by the finance store backing the tools
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("User not found in database with identifier: {0}")]
    UserNotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Read-only query rejected: {0}")]
    QueryRejected(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by the external forecasting service
#[derive(Error, Debug)]
pub enum ForecastError {
    #[error("Forecast service request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Forecast service returned {status}: {detail}")]
    Status {
        status: reqwest::StatusCode,
        detail: String,
    },

    #[error("Invalid forecast response: {0}")]
    InvalidResponse(String),
}

/// Errors raised by the web search provider
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Search request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Search service returned {status}: {detail}")]
    Status {
        status: reqwest::StatusCode,
        detail: String,
    },

    #[error("Invalid search response: {0}")]
    InvalidResponse(String),
}

impl From<LedgerError> for ToolError {
    fn from(err: LedgerError) -> Self {
        ToolError::Execution(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_error_becomes_execution_failure() {
        let err: ToolError = LedgerError::UserNotFound("a@b.c".to_string()).into();
        assert_eq!(
            err,
            ToolError::Execution("User not found in database with identifier: a@b.c".to_string())
        );
    }

    #[test]
    fn test_validation_message_names_tool() {
        let err = ToolError::validation("set_saving_target", "target_amount must be positive");
        assert_eq!(
            err.to_string(),
            "Invalid arguments for set_saving_target: target_amount must be positive"
        );
    }
}
