//! Client-visible progress events
//!
//! The emitter turns loop transitions into an ordered event stream:
//! `thinking` / `tool_result_summary` per batch, then exactly one `final`
//! or `error`, then exactly one `done`. Nothing is sent after `done`.

use crate::models::ToolResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Thinking { content: String, step: u32 },
    ToolResultSummary { content: String, step: u32 },
    Final { content: String },
    Error { content: String },
    Done,
}

impl StreamEvent {
    /// Payload of one `data:` line
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"done"}"#.to_string())
    }

    pub fn step(&self) -> Option<u32> {
        match self {
            StreamEvent::Thinking { step, .. } | StreamEvent::ToolResultSummary { step, .. } => {
                Some(*step)
            }
            _ => None,
        }
    }
}

/// Keep the first `budget` words, marking the cut with `...`
pub fn truncate_words(text: &str, budget: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() > budget {
        format!("{}...", words[..budget].join(" "))
    } else {
        words.join(" ")
    }
}

/// One-line description of a tool result for the progress stream
pub fn summarize_result(result: &ToolResult) -> String {
    if !result.succeeded() {
        return "⚠️ Encountered an issue, trying alternative approach".to_string();
    }

    let content = result.content();
    let lowered = content.to_lowercase();
    if lowered.contains("successfully") {
        "✅ Task completed successfully, preparing response".to_string()
    } else if lowered.contains("found") || lowered.contains("results") {
        "📊 Found relevant data, analyzing results".to_string()
    } else {
        format!("Processing: {}", content.chars().take(80).collect::<String>())
    }
}

pub struct EventEmitter {
    tx: mpsc::Sender<StreamEvent>,
    word_budget: usize,
    step: u32,
    finished: bool,
    disconnected: bool,
}

impl EventEmitter {
    pub fn new(tx: mpsc::Sender<StreamEvent>, word_budget: usize) -> Self {
        Self {
            tx,
            word_budget: word_budget.max(1),
            step: 0,
            finished: false,
            disconnected: false,
        }
    }

    /// Open the next tool batch; its thinking and summary events share the step
    pub fn begin_batch(&mut self) -> u32 {
        self.step += 1;
        self.step
    }

    pub fn step(&self) -> u32 {
        self.step
    }

    /// The client went away (send failed or receiver dropped)
    pub fn is_disconnected(&self) -> bool {
        self.disconnected || self.tx.is_closed()
    }

    pub async fn thinking(&mut self, description: &str) {
        if self.finished {
            return;
        }
        let content = truncate_words(description, self.word_budget);
        let step = self.step;
        self.send(StreamEvent::Thinking { content, step }).await;
    }

    pub async fn tool_summary(&mut self, result: &ToolResult) {
        if self.finished {
            return;
        }
        let content = truncate_words(&summarize_result(result), self.word_budget);
        let step = self.step;
        self.send(StreamEvent::ToolResultSummary { content, step }).await;
    }

    /// Send `final` then `done`. Only the first terminal call has any effect.
    pub async fn final_answer(&mut self, content: String) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.send(StreamEvent::Final { content }).await;
        self.send(StreamEvent::Done).await;
    }

    /// Send `error` then `done`. Only the first terminal call has any effect.
    pub async fn error(&mut self, reason: impl fmt::Display) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.send(StreamEvent::Error {
            content: format!("Failed to process request: {}", reason),
        })
        .await;
        self.send(StreamEvent::Done).await;
    }

    async fn send(&mut self, event: StreamEvent) {
        if self.disconnected {
            return;
        }
        if self.tx.send(event).await.is_err() {
            debug!(step = self.step, "Event receiver dropped, client disconnected");
            self.disconnected = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolError;

    fn result(outcome: std::result::Result<&str, ToolError>) -> ToolResult {
        ToolResult {
            tool_call_id: "c1".to_string(),
            tool_name: "tool".to_string(),
            outcome: outcome.map(|s| s.to_string()),
        }
    }

    async fn drain(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_wire_format() {
        let thinking = StreamEvent::Thinking {
            content: "Setting savings target to 5000000 VND".to_string(),
            step: 1,
        };
        assert_eq!(
            thinking.to_json(),
            r#"{"type":"thinking","content":"Setting savings target to 5000000 VND","step":1}"#
        );
        assert_eq!(StreamEvent::Done.to_json(), r#"{"type":"done"}"#);

        let summary = StreamEvent::ToolResultSummary {
            content: "x".to_string(),
            step: 2,
        };
        assert!(summary.to_json().starts_with(r#"{"type":"tool_result_summary""#));
    }

    #[test]
    fn test_truncate_words() {
        let long = (1..=25).map(|i| i.to_string()).collect::<Vec<_>>().join(" ");
        let cut = truncate_words(&long, 20);
        assert!(cut.ends_with("20..."));
        assert_eq!(cut.split_whitespace().count(), 20);
        assert_eq!(truncate_words("  short   text ", 20), "short text");
    }

    #[test]
    fn test_summaries() {
        assert_eq!(
            summarize_result(&result(Err(ToolError::Execution("boom".to_string())))),
            "⚠️ Encountered an issue, trying alternative approach"
        );
        assert_eq!(
            summarize_result(&result(Ok("Income added successfully!"))),
            "✅ Task completed successfully, preparing response"
        );
        assert_eq!(
            summarize_result(&result(Ok("{\"message\":\"No results found\"}"))),
            "📊 Found relevant data, analyzing results"
        );
        assert_eq!(
            summarize_result(&result(Ok("Added expense of 10 VND"))),
            "Processing: Added expense of 10 VND"
        );
    }

    #[tokio::test]
    async fn test_terminal_events_are_exclusive() {
        let (tx, rx) = mpsc::channel(16);
        let mut emitter = EventEmitter::new(tx, 20);

        let step = emitter.begin_batch();
        emitter.thinking("Looking").await;
        emitter.tool_summary(&result(Ok("done"))).await;
        emitter.final_answer("Hi".to_string()).await;
        emitter.error("late").await;
        emitter.thinking("after the end").await;
        drop(emitter);

        let events = drain(rx).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Thinking { content: "Looking".to_string(), step },
                StreamEvent::ToolResultSummary { content: "Processing: done".to_string(), step },
                StreamEvent::Final { content: "Hi".to_string() },
                StreamEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_error_text() {
        let (tx, rx) = mpsc::channel(16);
        let mut emitter = EventEmitter::new(tx, 20);
        emitter.error("model offline").await;
        drop(emitter);

        let events = drain(rx).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Error { content: "Failed to process request: model offline".to_string() },
                StreamEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_dropped_receiver_marks_disconnect() {
        let (tx, rx) = mpsc::channel(16);
        let mut emitter = EventEmitter::new(tx, 20);
        assert!(!emitter.is_disconnected());

        drop(rx);
        assert!(emitter.is_disconnected());
        emitter.thinking("nobody listens").await;
        assert!(emitter.is_disconnected());
    }
}
