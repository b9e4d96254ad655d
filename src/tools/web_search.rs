//! Web search tool backed by Tavily

use super::{Tool, ToolOutcome};
use crate::error::{SearchError, ToolError};
use crate::models::UserContext;
use async_trait::async_trait;
use reqwest::Client;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const TAVILY_URL: &str = "https://api.tavily.com/search";
const MAX_RESULTS: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub content: String,
}

#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str) -> std::result::Result<Vec<SearchHit>, SearchError>;
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

pub struct TavilyClient {
    client: Client,
    api_key: String,
    endpoint: String,
}

impl TavilyClient {
    pub fn new(api_key: impl Into<String>) -> crate::Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            endpoint: TAVILY_URL.to_string(),
        })
    }
}

#[async_trait]
impl WebSearch for TavilyClient {
    async fn search(&self, query: &str) -> std::result::Result<Vec<SearchHit>, SearchError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "query": query,
                "max_results": MAX_RESULTS,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(SearchError::Status { status, detail });
        }

        let parsed: TavilyResponse = response
            .json()
            .await
            .map_err(|e| SearchError::InvalidResponse(e.to_string()))?;
        Ok(parsed.results.into_iter().take(MAX_RESULTS).collect())
    }
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SearchWebArgs {
    /// What to look up on the web
    pub query: String,
}

pub struct SearchWebTool {
    search: Option<Arc<dyn WebSearch>>,
}

impl SearchWebTool {
    pub fn new(search: Option<Arc<dyn WebSearch>>) -> Self {
        Self { search }
    }
}

#[async_trait]
impl Tool for SearchWebTool {
    const NAME: &'static str = "search_web";
    const DESCRIPTION: &'static str =
        "Search the web for current information such as prices, rates or financial news.";

    type Args = SearchWebArgs;

    fn describe_call(&self, args: &Self::Args) -> String {
        format!("Searching the web for {}", args.query)
    }

    async fn execute(&self, args: Self::Args, _ctx: &UserContext) -> ToolOutcome {
        let query = args.query.trim();
        if query.is_empty() {
            return Err(ToolError::validation(Self::NAME, "query must not be empty"));
        }

        let search = self.search.as_ref().ok_or_else(|| {
            ToolError::Execution("Web search is not configured (TAVILY_API_KEY is missing)".to_string())
        })?;

        let hits = search
            .search(query)
            .await
            .map_err(|e| ToolError::Execution(format!("Error searching web: {}", e)))?;
        debug!(query, hits = hits.len(), "Web search finished");

        Ok(json!({
            "query": query,
            "results": hits,
        })
        .to_string())
    }
}
