//! Core data models for the jars assistant

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

//
// ================= Messages =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// One block of a multimodal message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    /// Base64 payload plus its MIME type (e.g. `image/jpeg`)
    Image { mime_type: String, data: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Concatenated text of the content, ignoring non-text blocks
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.text().trim().is_empty()
    }
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

/// A tool invocation requested by the reasoning step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user_with_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Parts(parts),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant_with_calls(text: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Text(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

//
// ================= Tool Results =================
//

/// Outcome of one tool call. Errors stay structured until rendered.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub tool_name: String,
    pub outcome: std::result::Result<String, crate::error::ToolError>,
}

impl ToolResult {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }

    /// String form handed to the model and the emitter
    pub fn content(&self) -> String {
        match &self.outcome {
            Ok(content) => content.clone(),
            Err(e) => format!("Error: {}", e),
        }
    }

    pub fn to_message(&self) -> Message {
        Message::tool(self.tool_call_id.clone(), self.content())
    }
}

//
// ================= Conversation =================
//

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserContext {
    pub user_identifier: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl UserContext {
    pub fn new(user_identifier: impl Into<String>) -> Self {
        Self {
            user_identifier: user_identifier.into(),
            fields: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    pub thread_id: String,
    pub messages: Vec<Message>,
    pub user_context: UserContext,
    pub created_at: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(thread_id: impl Into<String>, user_context: UserContext) -> Self {
        Self {
            thread_id: thread_id.into(),
            messages: Vec::new(),
            user_context,
            created_at: Utc::now(),
        }
    }

    /// Name of the tool that issued `tool_call_id`, searching newest first
    pub fn tool_name_for(&self, tool_call_id: &str) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .flat_map(|m| m.tool_calls.iter())
            .find(|call| call.id == tool_call_id)
            .map(|call| call.name.as_str())
    }

    /// Calls of the latest tool-requesting assistant turn that never got a
    /// result (the request died between the two appends)
    pub fn unanswered_tool_calls(&self) -> Vec<ToolCallRequest> {
        let Some(pos) = self
            .messages
            .iter()
            .rposition(|m| m.role == Role::Assistant && !m.tool_calls.is_empty())
        else {
            return Vec::new();
        };

        let answered: Vec<&str> = self.messages[pos + 1..]
            .iter()
            .filter(|m| m.role == Role::Tool)
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();

        self.messages[pos]
            .tool_calls
            .iter()
            .filter(|call| !answered.contains(&call.id.as_str()))
            .cloned()
            .collect()
    }
}

//
// ================= Inbound Request =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub data: String,
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub conversation_history: Vec<HistoryMessage>,
    #[serde(alias = "user_email")]
    pub user_identifier: String,
    #[serde(default)]
    pub image: Option<ImageAttachment>,
    #[serde(default, skip_serializing)]
    pub image_data: Option<String>,
    #[serde(default, skip_serializing)]
    pub image_format: Option<String>,
    #[serde(default)]
    pub new_thread: bool,
}

impl ChatRequest {
    pub fn new(user_identifier: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            conversation_history: Vec::new(),
            user_identifier: user_identifier.into(),
            image: None,
            image_data: None,
            image_format: None,
            new_thread: false,
        }
    }

    /// Image attachment, accepting either the nested or the flat wire form
    pub fn attachment(&self) -> Option<ImageAttachment> {
        if let Some(image) = &self.image {
            return Some(image.clone());
        }
        match (&self.image_data, &self.image_format) {
            (Some(data), Some(format)) => Some(ImageAttachment {
                data: data.clone(),
                format: format.clone(),
            }),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        write!(f, "{}", s)
    }
}
