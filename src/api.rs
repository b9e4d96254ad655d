//! HTTP surface for the jars assistant
//!
//! `POST /chat/stream` runs one conversation turn and streams its events as
//! Server-Sent Events (`data: <json>\n\n`), ending with `done`.

use axum::{
    extract::State,
    http::{header::HeaderName, HeaderValue},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::agent::Orchestrator;
use crate::models::ChatRequest;

/// Events buffered between the orchestrator task and the response body
const EVENT_BUFFER: usize = 32;

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

/// =============================
/// Info Endpoints
/// =============================

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": "Money jars assistant API",
        "endpoints": ["GET /health", "POST /chat/stream"],
    }))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Streaming Chat Endpoint
/// =============================

async fn chat_stream(
    State(state): State<ApiState>,
    Json(req): Json<ChatRequest>,
) -> impl IntoResponse {
    info!(
        user = %req.user_identifier,
        new_thread = req.new_thread,
        history = req.conversation_history.len(),
        "Received chat stream request"
    );

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let orchestrator = state.orchestrator.clone();

    // Dropping the response body drops `rx`; the emitter notices on its next send.
    tokio::spawn(async move {
        orchestrator.handle(req, tx).await;
    });

    let events = ReceiverStream::new(rx)
        .map(|event| Ok::<_, Infallible>(Event::default().data(event.to_json())));

    (
        [(
            HeaderName::from_static("x-accel-buffering"),
            HeaderValue::from_static("no"),
        )],
        Sse::new(events).keep_alive(KeepAlive::default()),
    )
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = ApiState { orchestrator };

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/chat/stream", post(chat_stream))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(orchestrator: Arc<Orchestrator>, port: u16) -> crate::Result<()> {
    let router = create_router(orchestrator);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
