use jars_assistant::{
    app::{build_orchestrator, connect_backends, gemini_model},
    config::Settings,
    models::{ChatRequest, Message, ToolCallRequest},
    reasoning::{ReasoningModel, ScriptedModel},
};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_USER: &str = "demo@example.com";
const DEFAULT_MESSAGE: &str = "I want to save 5,000,000 VND for a new laptop";

/// Offline stand-in for the model: one tool round, then an answer
fn demo_model() -> Arc<dyn ReasoningModel> {
    let mut arguments = serde_json::Map::new();
    arguments.insert("target_amount".to_string(), json!(5_000_000));

    Arc::new(
        ScriptedModel::new()
            .reply(Message::assistant_with_calls(
                "",
                vec![ToolCallRequest {
                    id: "call_demo".to_string(),
                    name: "set_saving_target".to_string(),
                    arguments,
                }],
            ))
            .reply(Message::assistant(
                "Your savings target is now 5,000,000 VND. Keep filling the Savings jar!",
            )),
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // chat [--user <id>] [--new-thread] [message...]
    let mut user = DEFAULT_USER.to_string();
    let mut new_thread = false;
    let mut words = Vec::new();
    let mut argv = std::env::args().skip(1);
    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "--user" => user = argv.next().ok_or("--user needs a value")?,
            "--new-thread" => new_thread = true,
            _ => words.push(arg),
        }
    }
    let message = if words.is_empty() {
        DEFAULT_MESSAGE.to_string()
    } else {
        words.join(" ")
    };

    let settings = Settings::from_env()?;
    let backends = connect_backends(&settings)?;
    let model = if settings.gemini_api_key.is_empty() {
        warn!("GEMINI_API_KEY not set, running the scripted demo model");
        demo_model()
    } else {
        gemini_model(&settings, backends.ledger.clone())?
    };
    let orchestrator = build_orchestrator(&settings, model, backends)?;

    info!(user = %user, new_thread, "Money jars assistant starting");

    let mut request = ChatRequest::new(user, message);
    request.new_thread = new_thread;

    let (tx, mut rx) = mpsc::channel::<jars_assistant::StreamEvent>(32);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            println!("data: {}", event.to_json());
        }
    });

    orchestrator.handle(request, tx).await;
    printer.await?;

    Ok(())
}
