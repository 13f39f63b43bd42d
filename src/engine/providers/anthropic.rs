// Lorekeep Runtime — Message-Block Provider (Anthropic wire format)
// Implements the Provider contract for backends that speak content-block
// messages with native tool_use blocks. All block-shape knowledge and SSE
// event parsing lives here; the tool loop never sees vendor types.

use crate::atoms::traits::{ChunkStream, Provider, ProviderError, StreamEvent};
use crate::engine::http::{
    is_retryable_status, parse_retry_after, retry_delay, CircuitBreaker, MAX_RETRIES,
};
use crate::engine::types::*;
use async_trait::async_trait;
use futures::StreamExt;
use log::{error, info, warn};
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::LazyLock;
use std::time::Duration;
use zeroize::Zeroizing;

/// Circuit breaker shared across all requests to this wire format.
static ANTHROPIC_CIRCUIT: LazyLock<CircuitBreaker> = LazyLock::new(|| CircuitBreaker::new(5, 60));

const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 8192;

pub struct AnthropicProvider {
    client: Client,
    base_url: String,
    /// API key wrapped in Zeroizing<> — automatically zeroed from RAM on drop.
    api_key: Zeroizing<String>,
}

impl AnthropicProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| config.kind.default_base_url().to_string());
        AnthropicProvider {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            base_url,
            api_key: Zeroizing::new(config.api_key.clone()),
        }
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }

    /// Transcript → wire messages. Assistant entries pass their
    /// `raw_message` through verbatim — it is the source of truth and must
    /// round-trip byte-equal. Tool results become user-role tool_result
    /// blocks. Assistants with no raw (pre-loop history) are synthesized.
    fn format_messages(&self, messages: &[ChatMessage]) -> Vec<Value> {
        let mut formatted = Vec::with_capacity(messages.len());
        for msg in messages {
            match msg {
                ChatMessage::User { content } => {
                    formatted.push(json!({ "role": "user", "content": content }));
                }
                ChatMessage::Assistant { raw_message, derived_text } => {
                    match raw_message {
                        Some(raw) => formatted.push(raw.clone()),
                        None => formatted.push(self.synthesize_raw(derived_text)),
                    }
                }
                ChatMessage::Tool { tool_call_id, content, .. } => {
                    formatted.push(json!({
                        "role": "user",
                        "content": [{
                            "type": "tool_result",
                            "tool_use_id": tool_call_id,
                            "content": content,
                        }]
                    }));
                }
            }
        }
        formatted
    }

    fn format_tools(tools: &[ToolDefinition]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect()
    }

    fn map_stop_reason(reason: Option<&str>) -> StopReason {
        match reason {
            Some("end_turn") | Some("stop_sequence") => StopReason::EndTurn,
            Some("tool_use") => StopReason::ToolUse,
            Some("max_tokens") => StopReason::MaxTokens,
            Some(other) => StopReason::Other(other.to_string()),
            None => StopReason::EndTurn,
        }
    }

    /// Classify a non-success response. A 400 that names tools means the
    /// backend refuses tool definitions — the loop caches this and falls
    /// back to plain completion.
    fn classify_error(status: u16, body: &str, retry_after: Option<u64>) -> ProviderError {
        if status == 401 || status == 403 {
            return ProviderError::Auth(format!("API error {status}"));
        }
        if status == 429 {
            return ProviderError::RateLimited {
                message: format!("API error 429: {}", truncate_utf8(body, 200)),
                retry_after_secs: retry_after,
            };
        }
        if status == 400 && body.contains("tool") && body.contains("not") {
            return ProviderError::ToolsNotSupported;
        }
        ProviderError::Api { status, message: format!("API error {status}: {}", truncate_utf8(body, 200)) }
    }

    async fn post_with_retry(&self, body: &Value) -> Result<reqwest::Response, ProviderError> {
        if let Err(msg) = ANTHROPIC_CIRCUIT.check() {
            return Err(ProviderError::Transport(msg));
        }

        let url = self.messages_url();
        let mut last_error = ProviderError::Transport("no attempt made".into());
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let retry_after = match &last_error {
                    ProviderError::RateLimited { retry_after_secs, .. } => *retry_after_secs,
                    _ => None,
                };
                let delay = retry_delay(attempt - 1, retry_after).await;
                warn!(
                    "[provider] anthropic retry {}/{} after {}ms",
                    attempt,
                    MAX_RETRIES,
                    delay.as_millis()
                );
            }

            let response = match self
                .client
                .post(&url)
                .header("anthropic-version", API_VERSION)
                .header("x-api-key", self.api_key.as_str())
                .header("Content-Type", "application/json")
                .json(body)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    ANTHROPIC_CIRCUIT.record_failure();
                    last_error = ProviderError::Transport(format!("HTTP request failed: {e}"));
                    continue;
                }
            };

            let status = response.status().as_u16();
            if response.status().is_success() {
                ANTHROPIC_CIRCUIT.record_success();
                return Ok(response);
            }

            ANTHROPIC_CIRCUIT.record_failure();
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body_text = response.text().await.unwrap_or_default();
            error!("[provider] anthropic error {}: {}", status, truncate_utf8(&body_text, 500));
            last_error = Self::classify_error(status, &body_text, retry_after);

            match &last_error {
                ProviderError::Auth(_) | ProviderError::ToolsNotSupported => return Err(last_error),
                _ if is_retryable_status(status) && attempt < MAX_RETRIES => continue,
                _ => return Err(last_error),
            }
        }
        Err(last_error)
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        system: Option<&str>,
        model: &str,
    ) -> Result<ChunkStream, ProviderError> {
        let mut body = json!({
            "model": model,
            "messages": self.format_messages(messages),
            "max_tokens": DEFAULT_MAX_TOKENS,
            "stream": true,
        });
        if let Some(sys) = system {
            body["system"] = json!(sys);
        }
        info!("[provider] anthropic stream model={}", model);

        let response = self.post_with_retry(&body).await?;

        // Producer task parses SSE lines and feeds the channel. The
        // consumer owns the loop; dropping the stream closes the channel
        // and the task bails on the next send.
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut stop_reason: Option<String> = None;
            let mut usage = TokenUsage::default();

            while let Some(result) = byte_stream.next().await {
                let bytes = match result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ProviderError::Transport(format!("Stream read error: {e}"))))
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer = buffer[line_end + 1..].to_string();
                    let Some(data) = line.strip_prefix("data: ") else { continue };
                    let Ok(v) = serde_json::from_str::<Value>(data) else { continue };
                    match v["type"].as_str() {
                        Some("content_block_delta") => {
                            if let Some(text) = v["delta"]["text"].as_str() {
                                if tx.send(Ok(StreamEvent::Text(text.to_string()))).await.is_err() {
                                    return; // consumer cancelled
                                }
                            }
                        }
                        Some("message_start") => {
                            if let Some(input) = v["message"]["usage"]["input_tokens"].as_u64() {
                                usage.input_tokens = input;
                            }
                        }
                        Some("message_delta") => {
                            if let Some(r) = v["delta"]["stop_reason"].as_str() {
                                stop_reason = Some(r.to_string());
                            }
                            if let Some(out) = v["usage"]["output_tokens"].as_u64() {
                                usage.output_tokens = out;
                            }
                        }
                        _ => {}
                    }
                }
            }

            usage.total_tokens = usage.input_tokens + usage.output_tokens;
            let _ = tx
                .send(Ok(StreamEvent::Done {
                    stop_reason: AnthropicProvider::map_stop_reason(stop_reason.as_deref()),
                    usage: Some(usage),
                }))
                .await;
        });

        Ok(ChunkStream::new(rx))
    }

    async fn chat_complete(
        &self,
        messages: &[ChatMessage],
        system: Option<&str>,
        model: &str,
    ) -> Result<String, ProviderError> {
        let mut body = json!({
            "model": model,
            "messages": self.format_messages(messages),
            "max_tokens": DEFAULT_MAX_TOKENS,
        });
        if let Some(sys) = system {
            body["system"] = json!(sys);
        }
        let response = self.post_with_retry(&body).await?;
        let v: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Transport(format!("Body read error: {e}")))?;

        let text = v["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| {
                        if b["type"].as_str() == Some("text") {
                            b["text"].as_str()
                        } else {
                            None
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        Ok(text)
    }

    async fn create_tool_use_message(
        &self,
        messages: &[ChatMessage],
        system: Option<&str>,
        tools: &[ToolDefinition],
        model: &str,
    ) -> Result<ToolUseResponse, ProviderError> {
        let mut body = json!({
            "model": model,
            "messages": self.format_messages(messages),
            "max_tokens": DEFAULT_MAX_TOKENS,
            "tools": Self::format_tools(tools),
        });
        if let Some(sys) = system {
            body["system"] = json!(sys);
        }
        info!("[provider] anthropic tool round model={} tools={}", model, tools.len());

        let response = self.post_with_retry(&body).await?;
        let v: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Transport(format!("Body read error: {e}")))?;

        let content = v["content"].as_array().cloned().unwrap_or_default();
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in &content {
            match block["type"].as_str() {
                Some("text") => {
                    if let Some(t) = block["text"].as_str() {
                        text.push_str(t);
                    }
                }
                Some("tool_use") => {
                    tool_calls.push(ToolInvocation {
                        id: block["id"].as_str().unwrap_or_default().to_string(),
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                        arguments: block["input"].clone(),
                    });
                }
                _ => {}
            }
        }

        let usage = v.get("usage").map(|u| TokenUsage {
            input_tokens: u["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: u["output_tokens"].as_u64().unwrap_or(0),
            total_tokens: u["input_tokens"].as_u64().unwrap_or(0)
                + u["output_tokens"].as_u64().unwrap_or(0),
        });

        // The raw message is exactly what goes back on the wire next round.
        let raw_message = json!({ "role": "assistant", "content": content });

        Ok(ToolUseResponse {
            raw_message,
            text,
            tool_calls,
            stop_reason: Self::map_stop_reason(v["stop_reason"].as_str()),
            usage,
        })
    }

    fn synthesize_raw(&self, text: &str) -> Value {
        json!({
            "role": "assistant",
            "content": [{ "type": "text", "text": text }]
        })
    }
}
