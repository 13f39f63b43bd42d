// Lorekeep Runtime — Tool Registry
//
// Tools the chat loop can offer to a provider: a JSON-Schema definition
// plus an executor. Definitions are deep-cloned before being handed to
// adapters, which are allowed to mutate their copy.

pub mod gmail;
pub mod gtasks;

use crate::atoms::error::EngineResult;
use crate::engine::types::ToolDefinition;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Context handed to every executor invocation.
pub struct ToolContext {
    pub domain_id: String,
    pub session_id: String,
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, args: &Value, ctx: &ToolContext) -> EngineResult<String>;
}

pub struct Tool {
    pub definition: ToolDefinition,
    pub executor: Arc<dyn ToolExecutor>,
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Tool>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: ToolDefinition, executor: Arc<dyn ToolExecutor>) {
        let name = definition.name.clone();
        if !self.tools.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.tools.insert(name, Tool { definition, executor });
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Definitions for the provider, deep-cloned so adapter mutation never
    /// reaches the registry copies.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|t| ToolDefinition {
                name: t.definition.name.clone(),
                description: t.definition.description.clone(),
                input_schema: deep_clone(&t.definition.input_schema),
            })
            .collect()
    }
}

fn deep_clone(value: &Value) -> Value {
    // serde_json Clone is already deep; the named helper documents intent
    // at the adapter boundary.
    value.clone()
}
