// Lorekeep Runtime — AI Provider Registry
// AnyProvider wraps Arc<dyn Provider> so adding a new provider never
// requires modifying the factory enum — just implement the trait.

pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;

use crate::atoms::traits::{ChunkStream, Provider, ProviderError};
use crate::engine::types::{
    ChatMessage, ProviderConfig, ProviderKind, ToolDefinition, ToolUseResponse,
};
use serde_json::Value;
use std::sync::Arc;

// ── Provider factory ───────────────────────────────────────────────────────

/// Type-erased AI provider. Callers hold `AnyProvider` and call its three
/// operations without knowing which concrete backend is in use.
#[derive(Clone)]
pub struct AnyProvider(Arc<dyn Provider>);

impl AnyProvider {
    /// Construct the right concrete provider from a `ProviderConfig`.
    /// Message-block backends get the Anthropic adapter; everything else
    /// (OpenAI, Ollama, Custom) speaks the OpenAI-compatible wire format.
    pub fn from_config(config: &ProviderConfig) -> Self {
        let provider: Arc<dyn Provider> = match config.kind {
            ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(config)),
            _ => Arc::new(OpenAiProvider::new(config)),
        };
        AnyProvider(provider)
    }

    #[cfg(test)]
    pub fn from_arc(provider: Arc<dyn Provider>) -> Self {
        AnyProvider(provider)
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        system: Option<&str>,
        model: &str,
    ) -> Result<ChunkStream, ProviderError> {
        self.0.chat(messages, system, model).await
    }

    pub async fn chat_complete(
        &self,
        messages: &[ChatMessage],
        system: Option<&str>,
        model: &str,
    ) -> Result<String, ProviderError> {
        self.0.chat_complete(messages, system, model).await
    }

    pub async fn create_tool_use_message(
        &self,
        messages: &[ChatMessage],
        system: Option<&str>,
        tools: &[ToolDefinition],
        model: &str,
    ) -> Result<ToolUseResponse, ProviderError> {
        self.0.create_tool_use_message(messages, system, tools, model).await
    }

    pub fn synthesize_raw(&self, text: &str) -> Value {
        self.0.synthesize_raw(text)
    }

    pub fn serialize_raw(&self, raw: &Value) -> Result<Vec<u8>, ProviderError> {
        self.0.serialize_raw(raw)
    }

    pub fn deserialize_raw(&self, bytes: &[u8]) -> Result<Value, ProviderError> {
        self.0.deserialize_raw(bytes)
    }
}
