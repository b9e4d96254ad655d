//! Component wiring shared by the binaries

use crate::agent::Orchestrator;
use crate::config::Settings;
use crate::error::OrchestrationError;
use crate::execution::ToolDispatcher;
use crate::forecast::{HttpForecaster, SavingsForecaster};
use crate::ledger::{FinanceStore, InMemoryLedger, PostgresLedger};
use crate::reasoning::{GeminiModel, ReasoningModel};
use crate::state::{ConversationStore, PostgresConversationBackend};
use crate::tools::{create_default_registry, TavilyClient, ToolDeps, WebSearch};
use crate::Result;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::{info, warn};

/// Stores every other component is built on
pub struct Backends {
    pub ledger: Arc<dyn FinanceStore>,
    pub conversations: Arc<ConversationStore>,
}

/// Postgres when a database URL is configured, in-memory otherwise
pub fn connect_backends(settings: &Settings) -> Result<Backends> {
    match &settings.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect_lazy(url)
                .map_err(|e| OrchestrationError::ConfigError(format!("Invalid database URL: {}", e)))?;
            info!("Using Postgres for finance records and conversations");
            Ok(Backends {
                ledger: Arc::new(PostgresLedger::new(pool.clone())),
                conversations: Arc::new(ConversationStore::new(Arc::new(
                    PostgresConversationBackend::new(pool),
                ))),
            })
        }
        None => {
            warn!("No database configured, finance records and conversations are in-memory");
            Ok(Backends {
                ledger: Arc::new(InMemoryLedger::auto_provisioning()),
                conversations: Arc::new(ConversationStore::in_memory()),
            })
        }
    }
}

/// Tool collaborators; optional services are skipped when unconfigured
pub fn tool_deps(settings: &Settings, ledger: Arc<dyn FinanceStore>) -> Result<ToolDeps> {
    let mut deps = ToolDeps::new(ledger);

    if let Some(url) = &settings.forecast_service_url {
        let forecaster: Arc<dyn SavingsForecaster> = Arc::new(HttpForecaster::new(url)?);
        deps.forecaster = Some(forecaster);
    } else {
        info!("FORECAST_SERVICE_URL not set, savings predictions use the average-rate projection");
    }

    if let Some(key) = &settings.tavily_api_key {
        let search: Arc<dyn WebSearch> = Arc::new(TavilyClient::new(key.clone())?);
        deps.search = Some(search);
    } else {
        info!("TAVILY_API_KEY not set, search_web will report itself unavailable");
    }

    Ok(deps)
}

pub fn gemini_model(settings: &Settings, ledger: Arc<dyn FinanceStore>) -> Result<Arc<dyn ReasoningModel>> {
    if settings.gemini_api_key.is_empty() {
        return Err(OrchestrationError::ConfigError(
            "GEMINI_API_KEY is not set".to_string(),
        ));
    }
    let model = GeminiModel::new(settings.gemini_api_key.clone(), settings.gemini_model.clone())?
        .with_profile_store(ledger);
    Ok(Arc::new(model))
}

/// Full orchestrator around the given reasoning model
pub fn build_orchestrator(
    settings: &Settings,
    model: Arc<dyn ReasoningModel>,
    backends: Backends,
) -> Result<Orchestrator> {
    let registry = create_default_registry(tool_deps(settings, backends.ledger)?);
    info!(tools = ?registry.list(), "Tool registry ready");

    let dispatcher = ToolDispatcher::new(Arc::new(registry), settings.limits.tool_concurrency);
    Ok(Orchestrator::new(
        model,
        dispatcher,
        backends.conversations,
        settings.limits,
    ))
}
