//! Reasoning step: the language model deciding what to do next

use crate::error::OrchestrationError;
use crate::models::{ConversationState, Message};
use crate::tools::ToolSchema;
use crate::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

pub mod gemini;
pub use gemini::GeminiModel;

/// One model round trip: full conversation + tool declarations in, one
/// assistant message out (final text, tool calls, or nothing at all).
#[async_trait]
pub trait ReasoningModel: Send + Sync {
    async fn invoke(&self, state: &ConversationState, tools: &[ToolSchema]) -> Result<Message>;
}

/// Model that replays a fixed script of replies, for tests and the demo CLI
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<Message>>>,
    seen: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn reply(self, message: Message) -> Self {
        self.push(Ok(message));
        self
    }

    pub fn fail(self, reason: &str) -> Self {
        self.push(Err(OrchestrationError::ReasoningUnavailable(reason.to_string())));
        self
    }

    fn push(&self, reply: Result<Message>) {
        self.replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(reply);
    }

    /// Conversation as the model saw it on each invocation
    pub fn transcripts(&self) -> Vec<Vec<Message>> {
        self.seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn invocations(&self) -> usize {
        self.seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReasoningModel for ScriptedModel {
    async fn invoke(&self, state: &ConversationState, _tools: &[ToolSchema]) -> Result<Message> {
        self.seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(state.messages.clone());

        self.replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .unwrap_or_else(|| {
                Err(OrchestrationError::ReasoningUnavailable(
                    "scripted model has no replies left".to_string(),
                ))
            })
    }
}
