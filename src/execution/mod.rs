//! Tool dispatcher
//!
//! Runs one batch of tool calls requested by a reasoning step. Every request
//! yields exactly one result, in request order, whatever happens to its
//! siblings. Failures are data here, never errors.

use crate::error::ToolError;
use crate::models::{ToolCallRequest, ToolResult, UserContext};
use crate::tools::ToolRegistry;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Executes tool batches with bounded fan-out
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    concurrency: usize,
}

impl ToolDispatcher {
    /// `concurrency` of 1 runs a batch strictly one call at a time
    pub fn new(registry: Arc<ToolRegistry>, concurrency: usize) -> Self {
        Self {
            registry,
            concurrency: concurrency.max(1),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Execute all calls of a batch; results come back in input order
    pub async fn dispatch(
        &self,
        calls: &[ToolCallRequest],
        ctx: &UserContext,
    ) -> Vec<ToolResult> {
        debug!(batch_size = calls.len(), concurrency = self.concurrency, "Dispatching tool batch");

        let ctx = Arc::new(ctx.clone());
        stream::iter(calls.iter().cloned())
            .map(|call| self.run_one(call, ctx.clone()))
            .buffered(self.concurrency)
            .collect()
            .await
    }

    async fn run_one(&self, call: ToolCallRequest, ctx: Arc<UserContext>) -> ToolResult {
        let start = Instant::now();
        let ToolCallRequest { id, name, arguments } = call;

        let outcome = match self.registry.lookup(&name) {
            // Spawned so a panicking handler only fails its own call, and so a
            // started call runs to completion even if the request goes away.
            Ok(tool) => match tokio::spawn(async move { tool.call(arguments, &ctx).await }).await {
                Ok(outcome) => outcome,
                Err(join_error) => Err(ToolError::Execution(format!(
                    "Tool {} stopped unexpectedly: {}",
                    name, join_error
                ))),
            },
            Err(unknown) => Err(unknown),
        };

        let execution_time_ms = start.elapsed().as_millis() as u64;
        match &outcome {
            Ok(_) => debug!(tool_name = %name, tool_call_id = %id, execution_time_ms, "Tool call succeeded"),
            Err(e) => warn!(
                tool_name = %name,
                tool_call_id = %id,
                execution_time_ms,
                error = %e,
                "Tool call failed"
            ),
        }

        ToolResult {
            tool_call_id: id,
            tool_name: name,
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{Tool, ToolOutcome};
    use async_trait::async_trait;
    use schemars::JsonSchema;
    use serde::Deserialize;
    use serde_json::{json, Map, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Deserialize, JsonSchema)]
    struct SleepArgs {
        millis: u64,
        #[serde(default)]
        fail: bool,
        #[serde(default)]
        panic: bool,
    }

    #[derive(Default)]
    struct SleepTool {
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for SleepTool {
        const NAME: &'static str = "sleep";
        const DESCRIPTION: &'static str = "Sleep, then report";
        type Args = SleepArgs;

        fn describe_call(&self, args: &Self::Args) -> String {
            format!("Sleeping {}ms", args.millis)
        }

        async fn execute(&self, args: Self::Args, ctx: &UserContext) -> ToolOutcome {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(args.millis)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            if args.panic {
                panic!("handler bug");
            }
            if args.fail {
                return Err(ToolError::Execution("sleep failed".to_string()));
            }
            Ok(format!("slept {} for {}", args.millis, ctx.user_identifier))
        }
    }

    fn call(id: &str, name: &str, arguments: Value) -> ToolCallRequest {
        ToolCallRequest {
            id: id.to_string(),
            name: name.to_string(),
            arguments: match arguments {
                Value::Object(map) => map,
                _ => Map::new(),
            },
        }
    }

    fn dispatcher(concurrency: usize) -> (ToolDispatcher, Arc<AtomicUsize>) {
        let tool = SleepTool::default();
        let peak = tool.peak.clone();
        let mut registry = ToolRegistry::new();
        registry.register(tool);
        (ToolDispatcher::new(Arc::new(registry), concurrency), peak)
    }

    #[tokio::test]
    async fn test_results_keep_input_order() {
        let (dispatcher, _) = dispatcher(4);
        let calls = vec![
            call("a", "sleep", json!({"millis": 60})),
            call("b", "sleep", json!({"millis": 5})),
            call("c", "sleep", json!({"millis": 30})),
        ];

        let results = dispatcher.dispatch(&calls, &UserContext::new("lan")).await;
        let ids: Vec<&str> = results.iter().map(|r| r.tool_call_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(results[1].content(), "slept 5 for lan");
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let (dispatcher, _) = dispatcher(2);
        let calls = vec![
            call("ok-1", "sleep", json!({"millis": 1})),
            call("bad-args", "sleep", json!({"millis": "soon"})),
            call("unknown", "teleport", json!({})),
            call("fails", "sleep", json!({"millis": 1, "fail": true})),
            call("panics", "sleep", json!({"millis": 1, "panic": true})),
            call("ok-2", "sleep", json!({"millis": 1})),
        ];

        let results = dispatcher.dispatch(&calls, &UserContext::new("lan")).await;
        assert_eq!(results.len(), calls.len());

        let succeeded: Vec<bool> = results.iter().map(|r| r.succeeded()).collect();
        assert_eq!(succeeded, vec![true, false, false, false, false, true]);

        assert!(matches!(results[1].outcome, Err(ToolError::Validation { .. })));
        assert_eq!(
            results[2].outcome,
            Err(ToolError::UnknownTool("teleport".to_string()))
        );
        assert_eq!(results[3].content(), "Error: sleep failed");
        assert!(results[4].content().contains("stopped unexpectedly"));
    }

    #[tokio::test]
    async fn test_fan_out_is_bounded() {
        let (dispatcher, peak) = dispatcher(2);
        let calls: Vec<ToolCallRequest> = (0..6)
            .map(|i| call(&format!("c{}", i), "sleep", json!({"millis": 20})))
            .collect();

        dispatcher.dispatch(&calls, &UserContext::new("lan")).await;
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrency_of_one_serializes() {
        let (dispatcher, peak) = dispatcher(1);
        let calls = vec![
            call("a", "sleep", json!({"millis": 5})),
            call("b", "sleep", json!({"millis": 5})),
        ];

        dispatcher.dispatch(&calls, &UserContext::new("lan")).await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let (dispatcher, _) = dispatcher(4);
        let results = dispatcher.dispatch(&[], &UserContext::new("lan")).await;
        assert!(results.is_empty());
    }
}
