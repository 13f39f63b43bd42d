// Lorekeep Runtime — Gmail Tools
//
// gmail_search and gmail_read executors over the MailPort capability.
// Errors use the fixed `GMAIL_ERROR: <reason> — <detail>` string shape so
// the model sees the failure and can react. The read tool's search-scope check
// itself lives in the chat loop, which alone knows the searched-id set.

use super::{ToolContext, ToolExecutor};
use crate::atoms::error::EngineResult;
use crate::atoms::traits::MailPort;
use crate::engine::types::ToolDefinition;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn gmail_search_definition() -> ToolDefinition {
    ToolDefinition {
        name: "gmail_search".into(),
        description: "Search the connected mailbox. Returns message summaries with ids.".into(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Gmail search query" },
                "max_results": { "type": "integer", "minimum": 1, "maximum": 25 }
            },
            "required": ["query"]
        }),
    }
}

pub fn gmail_read_definition() -> ToolDefinition {
    ToolDefinition {
        name: "gmail_read".into(),
        description: "Read one message by id. The id must come from a prior gmail_search.".into(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "message_id": { "type": "string" }
            },
            "required": ["message_id"]
        }),
    }
}

pub struct GmailSearchTool {
    pub mail: Arc<dyn MailPort>,
}

#[async_trait]
impl ToolExecutor for GmailSearchTool {
    async fn execute(&self, args: &Value, _ctx: &ToolContext) -> EngineResult<String> {
        let Some(query) = args["query"].as_str().filter(|q| !q.trim().is_empty()) else {
            return Ok("GMAIL_ERROR: validation — 'query' is required.".into());
        };
        let max = args["max_results"].as_u64().unwrap_or(10).min(25) as usize;
        match self.mail.search(query, max).await {
            Ok(results) => Ok(results.to_string()),
            Err(e) => Ok(format!("GMAIL_ERROR: not_found — {e}")),
        }
    }
}

pub struct GmailReadTool {
    pub mail: Arc<dyn MailPort>,
}

#[async_trait]
impl ToolExecutor for GmailReadTool {
    async fn execute(&self, args: &Value, _ctx: &ToolContext) -> EngineResult<String> {
        let Some(id) = args["message_id"].as_str().filter(|s| !s.is_empty()) else {
            return Ok("GMAIL_ERROR: validation — 'message_id' is required.".into());
        };
        match self.mail.read(id).await {
            Ok(message) => Ok(message.to_string()),
            Err(e) => Ok(format!("GMAIL_ERROR: not_found — {e}")),
        }
    }
}

/// Pull message ids out of a gmail_search result so the loop can maintain
/// its read-only-what-you-searched set. Accepts both a top-level `messages`
/// array and a bare array of objects with `id` fields.
pub fn extract_message_ids(search_output: &str) -> Vec<String> {
    let Ok(value) = serde_json::from_str::<Value>(search_output) else {
        return vec![];
    };
    let items = value["messages"]
        .as_array()
        .or_else(|| value.as_array())
        .cloned()
        .unwrap_or_default();
    items
        .iter()
        .filter_map(|m| m["id"].as_str().map(|s| s.to_string()))
        .collect()
}
