// Lorekeep Runtime — Task-List Tools
//
// gtasks_create over the TaskListPort capability, with the fixed
// `GTASKS_ERROR: <reason> — <detail>` error string shape.

use super::{ToolContext, ToolExecutor};
use crate::atoms::error::EngineResult;
use crate::atoms::traits::TaskListPort;
use crate::engine::types::ToolDefinition;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn gtasks_create_definition() -> ToolDefinition {
    ToolDefinition {
        name: "gtasks_create".into(),
        description: "Create a task in the connected task list.".into(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "title": { "type": "string" },
                "notes": { "type": "string" }
            },
            "required": ["title"]
        }),
    }
}

pub struct GtasksCreateTool {
    pub tasks: Option<Arc<dyn TaskListPort>>,
}

#[async_trait]
impl ToolExecutor for GtasksCreateTool {
    async fn execute(&self, args: &Value, _ctx: &ToolContext) -> EngineResult<String> {
        let Some(tasks) = &self.tasks else {
            return Ok("GTASKS_ERROR: forbidden — task list not connected.".into());
        };
        let Some(title) = args["title"].as_str().filter(|t| !t.trim().is_empty()) else {
            return Ok("GTASKS_ERROR: validation — 'title' is required.".into());
        };
        let notes = args["notes"].as_str().unwrap_or("");
        match tasks.create_task(title, notes).await {
            Ok(task_id) => Ok(json!({ "ok": true, "task_id": task_id }).to_string()),
            Err(e) => Ok(format!("GTASKS_ERROR: rate_limited — {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::automation::actions::test_support::FakeTasks;

    fn ctx() -> ToolContext {
        ToolContext { domain_id: "d1".into(), session_id: "s1".into() }
    }

    #[tokio::test]
    async fn missing_client_is_forbidden() {
        let tool = GtasksCreateTool { tasks: None };
        let out = tool.execute(&json!({"title": "x"}), &ctx()).await.unwrap();
        assert!(out.starts_with("GTASKS_ERROR: forbidden"));
    }

    #[tokio::test]
    async fn create_returns_task_id() {
        let tool = GtasksCreateTool { tasks: Some(Arc::new(FakeTasks::new())) };
        let out = tool
            .execute(&json!({"title": "Review draft", "notes": "by Friday"}), &ctx())
            .await
            .unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["task_id"], "task-1");
    }
}
