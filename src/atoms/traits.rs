// ── Lorekeep Atoms: Trait Seams ────────────────────────────────────────────
// The narrow contracts the engine consumes: LLM providers, the secret
// store, the UI sink, and the external-collaborator ports (mail, task
// lists). Concrete wiring lives in engine/; tests use fakes.

use crate::atoms::types::{
    ChatMessage, StopReason, ToolDefinition, ToolUseResponse, TokenUsage,
};
use async_trait::async_trait;
use serde_json::Value;

// ── Provider errors ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum ProviderError {
    /// Connection-level failure (DNS, TLS, socket, stream read).
    Transport(String),
    /// 401 / 403 — never retried.
    Auth(String),
    /// 429 with optional server-specified delay.
    RateLimited { message: String, retry_after_secs: Option<u64> },
    /// Any other non-success API response.
    Api { status: u16, message: String },
    /// The model or endpoint rejects tool definitions. The tool loop
    /// caches this and falls back to plain completion.
    ToolsNotSupported,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::Transport(m) => write!(f, "transport: {m}"),
            ProviderError::Auth(m) => write!(f, "auth: {m}"),
            ProviderError::RateLimited { message, .. } => write!(f, "rate limited: {message}"),
            ProviderError::Api { status, message } => write!(f, "api {status}: {message}"),
            ProviderError::ToolsNotSupported => write!(f, "tools not supported"),
        }
    }
}

impl std::error::Error for ProviderError {}

// ── Streaming ──────────────────────────────────────────────────────────────

/// One event from a streaming completion.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Text(String),
    Done { stop_reason: StopReason, usage: Option<TokenUsage> },
}

/// Iterator protocol over a streamed completion. The consumer owns the
/// loop: it calls `next()` until `Done` or error, and simply drops the
/// stream to cancel — the producer task notices the closed channel.
pub struct ChunkStream {
    rx: tokio::sync::mpsc::Receiver<Result<StreamEvent, ProviderError>>,
}

impl ChunkStream {
    pub fn new(rx: tokio::sync::mpsc::Receiver<Result<StreamEvent, ProviderError>>) -> Self {
        ChunkStream { rx }
    }

    /// Next chunk, `None` once the producer is done and the channel drained.
    pub async fn next(&mut self) -> Option<Result<StreamEvent, ProviderError>> {
        self.rx.recv().await
    }
}

// ── Provider contract ──────────────────────────────────────────────────────

/// Provider-agnostic LLM contract: streaming chat, non-streaming
/// completion, and non-streaming tool-use rounds. The assistant transcript
/// entry carries an opaque `raw_message` of provider-specific shape;
/// `serialize_raw`/`deserialize_raw` let the transcript be persisted
/// without the loop understanding vendor types.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Streaming chat completion (the no-tools path).
    async fn chat(
        &self,
        messages: &[ChatMessage],
        system: Option<&str>,
        model: &str,
    ) -> Result<ChunkStream, ProviderError>;

    /// Non-streaming chat completion (fallbacks, final summaries).
    async fn chat_complete(
        &self,
        messages: &[ChatMessage],
        system: Option<&str>,
        model: &str,
    ) -> Result<String, ProviderError>;

    /// Non-streaming tool-use round. Must return `ToolsNotSupported` when
    /// the backend rejects tool definitions so the loop can degrade.
    async fn create_tool_use_message(
        &self,
        messages: &[ChatMessage],
        system: Option<&str>,
        tools: &[ToolDefinition],
        model: &str,
    ) -> Result<ToolUseResponse, ProviderError>;

    /// Byte round-trip for opaque assistant raw messages.
    fn serialize_raw(&self, raw: &Value) -> Result<Vec<u8>, ProviderError> {
        serde_json::to_vec(raw).map_err(|e| ProviderError::Transport(e.to_string()))
    }

    fn deserialize_raw(&self, bytes: &[u8]) -> Result<Value, ProviderError> {
        serde_json::from_slice(bytes).map_err(|e| ProviderError::Transport(e.to_string()))
    }

    /// Build a provider-appropriate stand-in `raw_message` for assistant
    /// history that pre-dates the tool loop (plain text only).
    fn synthesize_raw(&self, text: &str) -> Value;
}

// ── Secret store ───────────────────────────────────────────────────────────

/// Host credential encryption, scoped to the user. Credentials refuse to
/// persist when `is_available()` is false.
pub trait SecretStore: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, String>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, String>;
    fn is_available(&self) -> bool;
}

// ── UI sink ────────────────────────────────────────────────────────────────

/// Fan-out of user-facing events to whatever shell hosts the runtime.
/// Must never fail; implementations swallow delivery errors.
pub trait UiSink: Send + Sync {
    fn emit(&self, event: crate::atoms::types::UiEvent);
}

/// Sink that drops everything. Default for headless runs and tests that
/// don't assert on UI output.
pub struct NullSink;

impl UiSink for NullSink {
    fn emit(&self, _event: crate::atoms::types::UiEvent) {}
}

// ── External collaborator ports ────────────────────────────────────────────

/// Mail access consumed by chat tools and the draft_gmail action.
#[async_trait]
pub trait MailPort: Send + Sync {
    /// True when the connected account has compose scope.
    fn has_compose_scope(&self) -> bool;

    /// Search; returns message summaries as JSON (must include `id` fields).
    async fn search(&self, query: &str, max_results: usize) -> Result<Value, String>;

    /// Fetch one message body by id.
    async fn read(&self, message_id: &str) -> Result<Value, String>;

    /// Create a draft; returns the draft id.
    async fn create_draft(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<String, String>;
}

/// Task-list access consumed by chat tools and the create_gtask action.
#[async_trait]
pub trait TaskListPort: Send + Sync {
    /// Create a task; returns the external task id.
    async fn create_task(&self, title: &str, notes: &str) -> Result<String, String>;

    /// Count tasks past their due date (portfolio health input).
    async fn count_overdue(&self) -> Result<i64, String>;
}
