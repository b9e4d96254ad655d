//! Agent loop - alternates model reasoning and tool execution
//!
//! INPUT → REASON → (EXECUTE TOOLS → REASON)* → FINAL
//!
//! Every transition is checkpointed into the conversation store and
//! surfaced to the client through the [`EventEmitter`].

use crate::config::LoopLimits;
use crate::error::{OrchestrationError, ToolError};
use crate::execution::ToolDispatcher;
use crate::models::{
    ChatRequest, ContentPart, ConversationState, HistoryMessage, ImageAttachment, Message,
    ToolCallRequest, ToolResult, UserContext,
};
use crate::reasoning::ReasoningModel;
use crate::state::{ConversationStore, ThreadLease};
use crate::stream::{EventEmitter, StreamEvent};
use crate::Result;
use base64::Engine;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Appended when the model answers with neither text nor tool calls
pub const EMPTY_RESPONSE_NUDGE: &str = "Respond with a real output.";

/// Result recorded for a call whose request stopped before it returned
const INTERRUPTED_CALL: &str = "Tool call was interrupted before it returned a result";

enum LoopState {
    Reasoning { empty_retries: u32 },
    ExecutingTools(Vec<ToolCallRequest>),
    Done(String),
}

/// How a request ended when no error was raised
enum Completion {
    Answered(String),
    ClientGone,
}

/// Main orchestrator that drives one conversation turn end to end
pub struct Orchestrator {
    model: Arc<dyn ReasoningModel>,
    dispatcher: ToolDispatcher,
    store: Arc<ConversationStore>,
    limits: LoopLimits,
}

impl Orchestrator {
    pub fn new(
        model: Arc<dyn ReasoningModel>,
        dispatcher: ToolDispatcher,
        store: Arc<ConversationStore>,
        limits: LoopLimits,
    ) -> Self {
        Self {
            model,
            dispatcher,
            store,
            limits,
        }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    /// Run one chat request, pushing its events onto `events`.
    ///
    /// Never fails: every error ends up as the `error` event of the stream.
    pub async fn handle(&self, request: ChatRequest, events: mpsc::Sender<StreamEvent>) {
        let start = Instant::now();
        let mut emitter = EventEmitter::new(events, self.limits.thinking_word_budget);

        info!(
            user = %request.user_identifier,
            new_thread = request.new_thread,
            has_image = request.attachment().is_some(),
            "Orchestrator: request received"
        );

        match self.run(request, &mut emitter).await {
            Ok(Completion::Answered(answer)) => {
                info!(
                    steps = emitter.step(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Orchestrator: final answer ready"
                );
                emitter.final_answer(answer).await;
            }
            Ok(Completion::ClientGone) => {
                info!(
                    steps = emitter.step(),
                    "Orchestrator: client disconnected, stopping before next reasoning step"
                );
            }
            Err(e) => {
                error!(error = %e, steps = emitter.step(), "Orchestrator: request failed");
                emitter.error(e).await;
            }
        }
    }

    async fn run(&self, request: ChatRequest, emitter: &mut EventEmitter) -> Result<Completion> {
        let user_identifier = request.user_identifier.trim().to_string();
        if user_identifier.is_empty() {
            return Err(OrchestrationError::InvalidRequest(
                "user_identifier is required".to_string(),
            ));
        }
        let user_message = build_user_message(&request)?;

        let thread_id = self
            .store
            .resolve_thread(&user_identifier, request.new_thread)
            .await?;
        let lease = self.store.lease(&thread_id).await;
        debug!(thread_id = %thread_id, "Thread lease acquired");

        let state = self
            .store
            .get_or_create(&lease, UserContext::new(user_identifier))
            .await?;

        // A request that died mid-batch leaves calls without results; close them
        // so the model never sees a function call with no response.
        let unanswered = state.unanswered_tool_calls();
        if !unanswered.is_empty() {
            warn!(thread_id = %thread_id, calls = unanswered.len(), "Closing interrupted tool calls");
            let closing = unanswered
                .into_iter()
                .map(|call| {
                    ToolResult {
                        tool_call_id: call.id,
                        tool_name: call.name,
                        outcome: Err(ToolError::Execution(INTERRUPTED_CALL.to_string())),
                    }
                    .to_message()
                })
                .collect();
            self.store.append(&lease, closing).await?;
        }

        // Client-side history only seeds a thread the store has never seen.
        if state.messages.is_empty() && !request.conversation_history.is_empty() {
            let seed = seed_history(&request.conversation_history);
            if !seed.is_empty() {
                debug!(thread_id = %thread_id, seeded = seed.len(), "Seeding thread from client history");
                self.store.append(&lease, seed).await?;
            }
        }

        let state = self.store.append(&lease, vec![user_message]).await?;
        self.drive(&lease, state, emitter).await
    }

    /// The state machine proper. Starts in `Reasoning` with the user message
    /// already appended.
    async fn drive(
        &self,
        lease: &ThreadLease,
        mut state: ConversationState,
        emitter: &mut EventEmitter,
    ) -> Result<Completion> {
        let schemas = self.dispatcher.registry().schemas();
        let mut rounds: u32 = 0;
        let mut current = LoopState::Reasoning { empty_retries: 0 };

        loop {
            current = match current {
                LoopState::Reasoning { empty_retries } => {
                    if emitter.is_disconnected() {
                        return Ok(Completion::ClientGone);
                    }

                    debug!(
                        thread_id = %lease.thread_id(),
                        messages = state.messages.len(),
                        empty_retries,
                        "Invoking reasoning model"
                    );
                    let reply = self.model.invoke(&state, &schemas).await?;

                    if !reply.tool_calls.is_empty() {
                        // Refuse before appending so the thread never holds calls without results.
                        if rounds >= self.limits.max_tool_rounds {
                            return Err(OrchestrationError::MaxToolRoundsExceeded(
                                self.limits.max_tool_rounds,
                            ));
                        }
                        rounds += 1;
                        let calls = reply.tool_calls.clone();
                        state = self.store.append(lease, vec![reply]).await?;
                        LoopState::ExecutingTools(calls)
                    } else if reply.content.is_blank() {
                        if empty_retries >= self.limits.max_empty_retries {
                            return Err(OrchestrationError::EmptyResponse(empty_retries));
                        }
                        warn!(
                            thread_id = %lease.thread_id(),
                            attempt = empty_retries + 1,
                            "Empty model response, nudging"
                        );
                        state = self
                            .store
                            .append(lease, vec![Message::user(EMPTY_RESPONSE_NUDGE)])
                            .await?;
                        LoopState::Reasoning {
                            empty_retries: empty_retries + 1,
                        }
                    } else {
                        let answer = reply.content.text();
                        self.store.append(lease, vec![reply]).await?;
                        LoopState::Done(answer)
                    }
                }

                LoopState::ExecutingTools(calls) => {
                    let step = emitter.begin_batch();
                    let registry = self.dispatcher.registry();
                    for call in &calls {
                        debug!(step, tool_name = %call.name, tool_call_id = %call.id, "Tool requested");
                        emitter
                            .thinking(&registry.describe(&call.name, &call.arguments))
                            .await;
                    }

                    let results = self.dispatcher.dispatch(&calls, &state.user_context).await;
                    for result in &results {
                        emitter.tool_summary(result).await;
                    }

                    let failed = results.iter().filter(|r| !r.succeeded()).count();
                    info!(
                        thread_id = %lease.thread_id(),
                        step,
                        calls = results.len(),
                        failed,
                        "Tool batch complete"
                    );

                    state = self
                        .store
                        .append(lease, results.iter().map(ToolResult::to_message).collect())
                        .await?;
                    LoopState::Reasoning { empty_retries: 0 }
                }

                LoopState::Done(answer) => return Ok(Completion::Answered(answer)),
            };
        }
    }
}

//
// ================= Request Shaping =================
//

/// The new user turn: plain text, or text plus an image block
fn build_user_message(request: &ChatRequest) -> Result<Message> {
    let Some(image) = request.attachment() else {
        if request.message.trim().is_empty() {
            return Err(OrchestrationError::InvalidRequest(
                "message must not be empty".to_string(),
            ));
        }
        return Ok(Message::user(request.message.clone()));
    };

    let mut parts = Vec::with_capacity(2);
    if !request.message.trim().is_empty() {
        parts.push(ContentPart::Text {
            text: request.message.clone(),
        });
    }
    parts.push(image_part(&image)?);
    Ok(Message::user_with_parts(parts))
}

fn image_part(image: &ImageAttachment) -> Result<ContentPart> {
    // Accept data URLs as well as bare base64.
    let data = match image.data.split_once(";base64,") {
        Some((_, payload)) => payload.trim(),
        None => image.data.trim(),
    };
    if data.is_empty() {
        return Err(OrchestrationError::InvalidRequest(
            "image data is empty".to_string(),
        ));
    }
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| OrchestrationError::InvalidRequest(format!("image data is not valid base64: {}", e)))?;

    let format = image.format.trim().to_lowercase();
    let mime_type = if format.is_empty() {
        "image/jpeg".to_string()
    } else if format.contains('/') {
        format
    } else {
        format!("image/{}", format)
    };

    Ok(ContentPart::Image {
        mime_type,
        data: data.to_string(),
    })
}

/// Client history as messages; unknown roles and blank entries are skipped
fn seed_history(history: &[HistoryMessage]) -> Vec<Message> {
    history
        .iter()
        .filter(|entry| !entry.content.trim().is_empty())
        .filter_map(|entry| match entry.role.trim().to_lowercase().as_str() {
            "user" | "human" => Some(Message::user(entry.content.clone())),
            "assistant" | "ai" | "model" | "bot" => Some(Message::assistant(entry.content.clone())),
            _ => None,
        })
        .collect()
}
