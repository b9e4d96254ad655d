use jars_assistant::{
    api::start_server,
    app::{build_orchestrator, connect_backends, gemini_model},
    config::Settings,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env()?;

    info!("🚀 Money Jars Assistant - API Server");
    info!("📍 Port: {}", settings.port);
    info!("🤖 Model: {}", settings.gemini_model);

    // Create components
    let backends = connect_backends(&settings)?;
    let model = gemini_model(&settings, backends.ledger.clone())?;
    let orchestrator = Arc::new(build_orchestrator(&settings, model, backends)?);

    info!("✅ Orchestrator initialized");
    info!("📡 Starting API server...");

    start_server(orchestrator, settings.port).await?;

    Ok(())
}
