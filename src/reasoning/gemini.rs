//! Gemini reasoning model
//!
//! Maps the conversation onto `generateContent` with function declarations.
//! Uses a long-lived reqwest::Client for connection pooling.

use super::ReasoningModel;
use crate::error::OrchestrationError;
use crate::ledger::FinanceStore;
use crate::models::{
    ContentPart, ConversationState, Message, MessageContent, Role, ToolCallRequest, UserContext,
};
use crate::tools::ToolSchema;
use crate::Result;
use async_trait::async_trait;
use chrono::Local;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Gemini client bound to one model (connection-pooled)
pub struct GeminiModel {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    profiles: Option<Arc<dyn FinanceStore>>,
}

impl GeminiModel {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
            base_url: GEMINI_BASE_URL.to_string(),
            profiles: None,
        })
    }

    /// Read the user's profile description into the system prompt
    pub fn with_profile_store(mut self, profiles: Arc<dyn FinanceStore>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    async fn profile_description(&self, ctx: &UserContext) -> String {
        let Some(profiles) = &self.profiles else {
            return "No user description available.".to_string();
        };
        match profiles.user_by_identifier(&ctx.user_identifier).await {
            Ok(profile) => profile
                .description
                .filter(|d| !d.trim().is_empty())
                .unwrap_or_else(|| "No user description available.".to_string()),
            Err(e) => {
                warn!(error = %e, "Failed to fetch user description");
                "Failed to fetch user description.".to_string()
            }
        }
    }
}

fn build_system_prompt(ctx: &UserContext, description: &str) -> String {
    let now = Local::now();
    format!(
        r#"The current user is {user}.
Current time: {time}
Current date: {date}
Money currency: VND

User's profile and transaction pattern:
{description}

You are a financial assistant built around the six money jars: Necessity, Play, Education, Investment, Charity and Savings.
- Use the tools to record income and transactions, move money between jars, manage the savings target, predict savings goals, query past transactions and search the web.
- Classify transactions into jars yourself; never ask the user to do it.
- To search transactions, read the schema with get_transaction_schema first, then query with sql_executor using a few short OR-ed keywords.
- Receipts and product photos may be attached as images; record what they show.
- Only mention the profile when it is relevant. Stay on financial topics."#,
        user = ctx.user_identifier,
        time = now.format("%H:%M"),
        date = now.format("%B %d, %Y"),
        description = description,
    )
}

//
// ================= Wire Types =================
//

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    system_instruction: Content,
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolDeclarations>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thought: Option<bool>,
}

impl Part {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolDeclarations {
    function_declarations: Vec<ToolSchema>,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

//
// ================= Mapping =================
//

fn user_parts(content: &MessageContent) -> Vec<Part> {
    match content {
        MessageContent::Text(text) => vec![Part::text(text.clone())],
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => Part::text(text.clone()),
                ContentPart::Image { mime_type, data } => Part {
                    inline_data: Some(InlineData {
                        mime_type: mime_type.clone(),
                        data: data.clone(),
                    }),
                    ..Default::default()
                },
            })
            .collect(),
    }
}

/// Conversation → Gemini contents. Consecutive tool results share one turn.
fn to_contents(state: &ConversationState) -> Vec<Content> {
    let mut contents: Vec<Content> = Vec::new();
    let mut in_tool_turn = false;

    for message in &state.messages {
        match message.role {
            Role::User => {
                in_tool_turn = false;
                contents.push(Content {
                    role: Some("user".to_string()),
                    parts: user_parts(&message.content),
                });
            }
            Role::Assistant => {
                in_tool_turn = false;
                let mut parts = Vec::new();
                let text = message.content.text();
                if !text.trim().is_empty() {
                    parts.push(Part::text(text));
                }
                parts.extend(message.tool_calls.iter().map(|call| Part {
                    function_call: Some(FunctionCall {
                        id: Some(call.id.clone()),
                        name: call.name.clone(),
                        args: call.arguments.clone(),
                    }),
                    ..Default::default()
                }));
                if !parts.is_empty() {
                    contents.push(Content {
                        role: Some("model".to_string()),
                        parts,
                    });
                }
            }
            Role::Tool => {
                let call_id = message.tool_call_id.clone().unwrap_or_default();
                let part = Part {
                    function_response: Some(FunctionResponse {
                        name: state.tool_name_for(&call_id).unwrap_or("unknown").to_string(),
                        id: Some(call_id),
                        response: json!({ "content": message.content.text() }),
                    }),
                    ..Default::default()
                };

                match contents.last_mut() {
                    Some(last) if in_tool_turn => last.parts.push(part),
                    _ => contents.push(Content {
                        role: Some("user".to_string()),
                        parts: vec![part],
                    }),
                }
                in_tool_turn = true;
            }
        }
    }

    contents
}

/// First candidate → assistant message. No candidate means an empty reply.
fn to_message(response: GenerateResponse) -> Message {
    let Some(content) = response
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| {
            if let Some(reason) = &candidate.finish_reason {
                debug!(finish_reason = %reason, "Gemini candidate received");
            }
            candidate.content
        })
    else {
        if let Some(feedback) = response.prompt_feedback {
            warn!(%feedback, "Gemini returned no candidates");
        }
        return Message::assistant("");
    };

    let mut text = String::new();
    let mut calls = Vec::new();
    for part in content.parts {
        if part.thought == Some(true) {
            continue;
        }
        if let Some(chunk) = part.text {
            text.push_str(&chunk);
        }
        if let Some(call) = part.function_call {
            calls.push(ToolCallRequest {
                id: call
                    .id
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple())),
                name: call.name,
                arguments: call.args,
            });
        }
    }

    Message::assistant_with_calls(text, calls)
}

#[async_trait]
impl ReasoningModel for GeminiModel {
    async fn invoke(&self, state: &ConversationState, tools: &[ToolSchema]) -> Result<Message> {
        if self.api_key.is_empty() {
            return Err(OrchestrationError::ReasoningUnavailable(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let description = self.profile_description(&state.user_context).await;
        let request = GenerateRequest {
            system_instruction: Content {
                role: None,
                parts: vec![Part::text(build_system_prompt(&state.user_context, &description))],
            },
            contents: to_contents(state),
            tools: if tools.is_empty() {
                Vec::new()
            } else {
                vec![ToolDeclarations {
                    function_declarations: tools.to_vec(),
                }]
            },
            generation_config: GenerationConfig { temperature: 0.0 },
        };

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        debug!(thread_id = %state.thread_id, model = %self.model, "Calling Gemini API");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                // the URL carries the API key
                let e = e.without_url();
                error!("Gemini API request failed: {}", e);
                OrchestrationError::ReasoningUnavailable(format!("Gemini API error: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Gemini API error response: {}", error_text);
            return Err(OrchestrationError::ReasoningUnavailable(format!(
                "Gemini API returned {}: {}",
                status, error_text
            )));
        }

        let parsed: GenerateResponse = response.json().await.map_err(|e| {
            let e = e.without_url();
            error!("Failed to parse Gemini response: {}", e);
            OrchestrationError::ReasoningUnavailable(format!("Gemini parse error: {}", e))
        })?;

        Ok(to_message(parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;

    fn call(id: &str, name: &str) -> ToolCallRequest {
        ToolCallRequest {
            id: id.to_string(),
            name: name.to_string(),
            arguments: Map::new(),
        }
    }

    #[test]
    fn test_tool_results_merge_into_one_turn() {
        let mut state = ConversationState::new("t", UserContext::new("lan@example.com"));
        state.messages = vec![
            Message::user_with_parts(vec![
                ContentPart::Text { text: "log this receipt".to_string() },
                ContentPart::Image {
                    mime_type: "image/jpeg".to_string(),
                    data: "AAAA".to_string(),
                },
            ]),
            Message::assistant_with_calls(
                "",
                vec![call("c1", "update_transaction"), call("c2", "search_web")],
            ),
            Message::tool("c1", "Added expense"),
            Message::tool("c2", "{\"results\":[]}"),
        ];

        let contents = to_contents(&state);
        assert_eq!(contents.len(), 3);

        let user = serde_json::to_value(&contents[0]).unwrap();
        assert_eq!(user["parts"][1]["inlineData"]["mimeType"], "image/jpeg");

        let model = serde_json::to_value(&contents[1]).unwrap();
        assert_eq!(model["role"], "model");
        assert_eq!(model["parts"].as_array().unwrap().len(), 2);
        assert_eq!(model["parts"][0]["functionCall"]["name"], "update_transaction");

        let tools = serde_json::to_value(&contents[2]).unwrap();
        assert_eq!(tools["role"], "user");
        assert_eq!(tools["parts"][1]["functionResponse"]["name"], "search_web");
        assert_eq!(tools["parts"][0]["functionResponse"]["response"]["content"], "Added expense");
    }

    #[test]
    fn test_response_with_calls_and_thoughts() {
        let response: GenerateResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        {"text": "planning...", "thought": true},
                        {"text": "Let me check."},
                        {"functionCall": {"name": "set_saving_target", "args": {"target_amount": 5000000}}}
                    ]
                },
                "finishReason": "STOP"
            }]
        }))
        .unwrap();

        let message = to_message(response);
        assert_eq!(message.content.text(), "Let me check.");
        assert_eq!(message.tool_calls.len(), 1);
        assert!(message.tool_calls[0].id.starts_with("call_"));
        assert_eq!(message.tool_calls[0].arguments["target_amount"], 5000000);
    }

    #[test]
    fn test_no_candidates_is_an_empty_reply() {
        let response: GenerateResponse =
            serde_json::from_value(json!({"promptFeedback": {"blockReason": "OTHER"}})).unwrap();
        let message = to_message(response);
        assert!(message.content.is_blank());
        assert!(message.tool_calls.is_empty());
    }

    #[test]
    fn test_declarations_serialize_camel_case() {
        let request = GenerateRequest {
            system_instruction: Content {
                role: None,
                parts: vec![Part::text("sys")],
            },
            contents: vec![],
            tools: vec![ToolDeclarations {
                function_declarations: vec![ToolSchema {
                    name: "get_transaction_schema".to_string(),
                    description: "columns".to_string(),
                    parameters: None,
                }],
            }],
            generation_config: GenerationConfig { temperature: 0.0 },
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["systemInstruction"]["parts"][0]["text"], "sys");
        assert_eq!(
            value["tools"][0]["functionDeclarations"][0]["name"],
            "get_transaction_schema"
        );
        assert!(value["tools"][0]["functionDeclarations"][0].get("parameters").is_none());
    }

    #[tokio::test]
    async fn test_system_prompt_uses_profile() {
        let ledger = Arc::new(
            InMemoryLedger::new().with_user("lan@example.com", Some("Student, drinks a lot of coffee")),
        );
        let model = GeminiModel::new("key", "gemini-2.5-flash")
            .unwrap()
            .with_profile_store(ledger);

        let ctx = UserContext::new("lan@example.com");
        let description = model.profile_description(&ctx).await;
        let prompt = build_system_prompt(&ctx, &description);
        assert!(prompt.contains("The current user is lan@example.com."));
        assert!(prompt.contains("Student, drinks a lot of coffee"));
        assert!(prompt.contains("Money currency: VND"));

        let unknown = model.profile_description(&UserContext::new("ghost@example.com")).await;
        assert_eq!(unknown, "Failed to fetch user description.");
    }

    /// Local HTTP server standing in for the Gemini endpoint
    async fn stub_endpoint(app: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_invoke_round_trip_against_endpoint() {
        use axum::http::{StatusCode, Uri};
        use axum::response::IntoResponse;

        let app = axum::Router::new().fallback(|uri: Uri| async move {
            let expected_path = uri.path() == "/models/gemini-2.5-flash:generateContent";
            let expected_key = uri.query() == Some("key=test-key");
            if !(expected_path && expected_key) {
                return StatusCode::NOT_FOUND.into_response();
            }
            axum::Json(json!({
                "candidates": [{
                    "content": {
                        "role": "model",
                        "parts": [
                            {"functionCall": {"name": "search_web", "args": {"query": "gold price"}}}
                        ]
                    }
                }]
            }))
            .into_response()
        });
        let base_url = stub_endpoint(app).await;

        let model = GeminiModel::new("test-key", "gemini-2.5-flash")
            .unwrap()
            .with_base_url(&format!("{}/", base_url));
        let mut state = ConversationState::new("t", UserContext::new("lan@example.com"));
        state.messages.push(Message::user("what is gold at?"));

        let reply = model.invoke(&state, &[]).await.unwrap();
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].name, "search_web");
        assert_eq!(reply.tool_calls[0].arguments["query"], "gold price");
    }

    #[tokio::test]
    async fn test_error_status_is_unavailable() {
        use axum::http::StatusCode;

        let app = axum::Router::new()
            .fallback(|| async { (StatusCode::TOO_MANY_REQUESTS, "quota exhausted") });
        let base_url = stub_endpoint(app).await;

        let model = GeminiModel::new("test-key", "gemini-2.5-flash")
            .unwrap()
            .with_base_url(&base_url);
        let state = ConversationState::new("t", UserContext::new("lan"));

        match model.invoke(&state, &[]).await {
            Err(OrchestrationError::ReasoningUnavailable(reason)) => {
                assert!(reason.contains("429"), "{}", reason);
                assert!(reason.contains("quota exhausted"));
                assert!(!reason.contains("test-key"));
            }
            other => panic!("expected ReasoningUnavailable, got {:?}", other.map(|m| m.content)),
        }
    }

    #[tokio::test]
    async fn test_missing_api_key_is_unavailable() {
        let model = GeminiModel::new("", "gemini-2.5-flash").unwrap();
        let state = ConversationState::new("t", UserContext::new("lan"));
        let err = model.invoke(&state, &[]).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::ReasoningUnavailable(_)));
    }
}
