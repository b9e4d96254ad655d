//! Tool trait and registry
//!
//! Each tool declares a typed argument struct. The JSON schema advertised to
//! the model is derived from it, and the dispatcher deserializes the model's
//! arguments into it before the tool ever runs.

use crate::error::ToolError;
use crate::forecast::SavingsForecaster;
use crate::ledger::{FinanceStore, UserProfile};
use crate::models::UserContext;
use async_trait::async_trait;
use schemars::gen::SchemaSettings;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub mod jars;
pub mod query;
pub mod savings;
pub mod web_search;

pub use web_search::{SearchHit, TavilyClient, WebSearch};

pub type ToolOutcome = std::result::Result<String, ToolError>;

/// A single domain operation the model may request
#[async_trait]
pub trait Tool: Send + Sync + 'static {
    const NAME: &'static str;
    const DESCRIPTION: &'static str;

    type Args: DeserializeOwned + JsonSchema + Send + Sync;

    /// Short progress line shown to the user while the call runs
    fn describe_call(&self, args: &Self::Args) -> String;

    async fn execute(&self, args: Self::Args, ctx: &UserContext) -> ToolOutcome;
}

/// Function declaration handed to the reasoning model
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// `None` for tools without arguments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// Object-safe view of a [`Tool`], working on raw JSON arguments
#[async_trait]
pub trait ErasedTool: Send + Sync {
    fn name(&self) -> &'static str;
    fn schema(&self) -> ToolSchema;
    fn describe(&self, arguments: &Map<String, Value>) -> String;
    async fn call(&self, arguments: Map<String, Value>, ctx: &UserContext) -> ToolOutcome;
}

#[async_trait]
impl<T: Tool> ErasedTool for T {
    fn name(&self) -> &'static str {
        T::NAME
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: T::NAME.to_string(),
            description: T::DESCRIPTION.to_string(),
            parameters: parameters_schema::<T::Args>(),
        }
    }

    fn describe(&self, arguments: &Map<String, Value>) -> String {
        match parse_args::<T::Args>(T::NAME, arguments.clone()) {
            Ok(args) => self.describe_call(&args),
            Err(_) => format!("Using {} with parameters: {}", T::NAME, preview(arguments)),
        }
    }

    async fn call(&self, arguments: Map<String, Value>, ctx: &UserContext) -> ToolOutcome {
        let args = parse_args::<T::Args>(T::NAME, arguments)?;
        self.execute(args, ctx).await
    }
}

fn parse_args<A: DeserializeOwned>(
    tool: &str,
    arguments: Map<String, Value>,
) -> std::result::Result<A, ToolError> {
    serde_json::from_value(Value::Object(arguments))
        .map_err(|e| ToolError::validation(tool, e.to_string()))
}

fn preview(arguments: &Map<String, Value>) -> String {
    Value::Object(arguments.clone())
        .to_string()
        .chars()
        .take(50)
        .collect()
}

/// OpenAPI-flavoured schema with every keyword Gemini rejects removed
fn parameters_schema<A: JsonSchema>() -> Option<Value> {
    let settings = SchemaSettings::openapi3().with(|s| {
        s.inline_subschemas = true;
        s.meta_schema = None;
    });
    let root = settings.into_generator().into_root_schema_for::<A>();
    let mut value = serde_json::to_value(root).ok()?;
    strip_unsupported(&mut value);

    let has_properties = value
        .get("properties")
        .and_then(Value::as_object)
        .map(|props| !props.is_empty())
        .unwrap_or(false);

    has_properties.then_some(value)
}

fn strip_unsupported(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for key in ["title", "$schema", "definitions", "default", "format"] {
                map.remove(key);
            }
            for (key, child) in map.iter_mut() {
                // keys of `properties` are field names, only their schemas get stripped
                match (key.as_str(), child) {
                    ("properties", Value::Object(props)) => {
                        props.values_mut().for_each(strip_unsupported)
                    }
                    (_, child) => strip_unsupported(child),
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(strip_unsupported),
        _ => {}
    }
}

//
// ================= Registry =================
//

/// Tool registry, read-only once the orchestrator is built
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ErasedTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register<T: Tool>(&mut self, tool: T) {
        self.tools.insert(T::NAME.to_string(), Arc::new(tool));
    }

    pub fn lookup(&self, name: &str) -> std::result::Result<Arc<dyn ErasedTool>, ToolError> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))
    }

    /// Declarations for every registered tool, sorted by name
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self.tools.values().map(|t| t.schema()).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Progress line for a requested call, falling back for unknown tools
    pub fn describe(&self, name: &str, arguments: &Map<String, Value>) -> String {
        match self.tools.get(name) {
            Some(tool) => tool.describe(arguments),
            None => format!("Using {} with parameters: {}", name, preview(arguments)),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Collaborators the default tool suite is built from
#[derive(Clone)]
pub struct ToolDeps {
    pub ledger: Arc<dyn FinanceStore>,
    pub forecaster: Option<Arc<dyn SavingsForecaster>>,
    pub search: Option<Arc<dyn WebSearch>>,
}

impl ToolDeps {
    pub fn new(ledger: Arc<dyn FinanceStore>) -> Self {
        Self {
            ledger,
            forecaster: None,
            search: None,
        }
    }
}

/// Create the registry holding the full money-jars tool suite
pub fn create_default_registry(deps: ToolDeps) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register(jars::AddMonthlyIncome::new(deps.ledger.clone()));
    registry.register(jars::UpdateTransaction::new(deps.ledger.clone()));
    registry.register(jars::SwapJar::new(deps.ledger.clone()));
    registry.register(savings::SetSavingTarget::new(deps.ledger.clone()));
    registry.register(savings::PredictSavings::new(
        deps.ledger.clone(),
        deps.forecaster.clone(),
    ));
    registry.register(query::GetTransactionSchema::new(deps.ledger.clone()));
    registry.register(query::SqlExecutor::new(deps.ledger));
    registry.register(web_search::SearchWebTool::new(deps.search));

    registry
}

//
// ================= Shared Helpers =================
//

/// Profile of the user the request runs for. The identity comes from the
/// request context, never from model-supplied arguments.
pub(crate) async fn current_user(
    ledger: &dyn FinanceStore,
    ctx: &UserContext,
) -> std::result::Result<UserProfile, ToolError> {
    if ctx.user_identifier.trim().is_empty() {
        return Err(ToolError::Execution("User identifier is required".to_string()));
    }
    Ok(ledger.user_by_identifier(&ctx.user_identifier).await?)
}

/// `1234567` → `"1,234,567"`
pub(crate) fn group_thousands(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if value < 0 {
        format!("-{}", grouped)
    } else {
        grouped
    }
}

/// Rounded VND amount with separators, e.g. `"1,500,000 VND"`
pub(crate) fn format_vnd(amount: f64) -> String {
    format!("{} VND", group_thousands(amount.round() as i64))
}

pub(crate) fn ensure_finite(tool: &str, field: &str, value: f64) -> std::result::Result<(), ToolError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ToolError::validation(tool, format!("{} must be a finite number", field)))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::ledger::InMemoryLedger;

    pub const USER: &str = "lan@example.com";

    pub fn ledger() -> Arc<InMemoryLedger> {
        Arc::new(InMemoryLedger::new().with_user(USER, Some("Student saving for a laptop")))
    }

    pub fn ctx() -> UserContext {
        UserContext::new(USER)
    }

    pub fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}
