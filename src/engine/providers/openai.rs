// Lorekeep Runtime — OpenAI-Compatible Provider
// Handles OpenAI, Ollama, and any OpenAI-compatible REST API.
// The raw assistant message is the chat-completions `message` object
// (with its `tool_calls` array) and round-trips verbatim.

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

/// Circuit breaker shared across all OpenAI-compatible requests.
static OPENAI_CIRCUIT: LazyLock<CircuitBreaker> = LazyLock::new(|| CircuitBreaker::new(5, 60));

pub struct OpenAiProvider {
    client: Client,
    base_url: String,
    api_key: Zeroizing<String>,
}

impl OpenAiProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| config.kind.default_base_url().to_string());
        OpenAiProvider {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            base_url,
            api_key: Zeroizing::new(config.api_key.clone()),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn format_messages(&self, messages: &[ChatMessage], system: Option<&str>) -> Vec<Value> {
        let mut formatted = Vec::with_capacity(messages.len() + 1);
        if let Some(sys) = system {
            formatted.push(json!({ "role": "system", "content": sys }));
        }
        for msg in messages {
            match msg {
                ChatMessage::User { content } => {
                    formatted.push(json!({ "role": "user", "content": content }));
                }
                ChatMessage::Assistant { raw_message, derived_text } => match raw_message {
                    Some(raw) => formatted.push(raw.clone()),
                    None => formatted.push(self.synthesize_raw(derived_text)),
                },
                ChatMessage::Tool { tool_call_id, tool_name, content } => {
                    formatted.push(json!({
                        "role": "tool",
                        "tool_call_id": tool_call_id,
                        "name": tool_name,
                        "content": content,
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
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect()
    }

    fn map_finish_reason(reason: Option<&str>) -> StopReason {
        match reason {
            Some("stop") => StopReason::EndTurn,
            Some("tool_calls") => StopReason::ToolUse,
            Some("length") => StopReason::MaxTokens,
            Some(other) => StopReason::Other(other.to_string()),
            None => StopReason::EndTurn,
        }
    }

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
        // Ollama and some gateways reject the tools field outright.
        if (status == 400 || status == 404) && body.contains("tool") {
            return ProviderError::ToolsNotSupported;
        }
        ProviderError::Api { status, message: format!("API error {status}: {}", truncate_utf8(body, 200)) }
    }

    async fn post_with_retry(&self, body: &Value) -> Result<reqwest::Response, ProviderError> {
        if let Err(msg) = OPENAI_CIRCUIT.check() {
            return Err(ProviderError::Transport(msg));
        }

        let url = self.completions_url();
        let mut last_error = ProviderError::Transport("no attempt made".into());
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let retry_after = match &last_error {
                    ProviderError::RateLimited { retry_after_secs, .. } => *retry_after_secs,
                    _ => None,
                };
                let delay = retry_delay(attempt - 1, retry_after).await;
                warn!(
                    "[provider] openai retry {}/{} after {}ms",
                    attempt,
                    MAX_RETRIES,
                    delay.as_millis()
                );
            }

            let mut req = self.client.post(&url).header("Content-Type", "application/json");
            if !self.api_key.is_empty() {
                req = req.header("Authorization", format!("Bearer {}", self.api_key.as_str()));
            }
            let response = match req.json(body).send().await {
                Ok(r) => r,
                Err(e) => {
                    OPENAI_CIRCUIT.record_failure();
                    last_error = ProviderError::Transport(format!("HTTP request failed: {e}"));
                    continue;
                }
            };

            let status = response.status().as_u16();
            if response.status().is_success() {
                OPENAI_CIRCUIT.record_success();
                return Ok(response);
            }

            OPENAI_CIRCUIT.record_failure();
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body_text = response.text().await.unwrap_or_default();
            error!("[provider] openai error {}: {}", status, truncate_utf8(&body_text, 500));
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
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        system: Option<&str>,
        model: &str,
    ) -> Result<ChunkStream, ProviderError> {
        let body = json!({
            "model": model,
            "messages": self.format_messages(messages, system),
            "stream": true,
        });
        info!("[provider] openai stream model={}", model);

        let response = self.post_with_retry(&body).await?;

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut finish_reason: Option<String> = None;
            let mut usage: Option<TokenUsage> = None;

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
                    if data == "[DONE]" {
                        continue;
                    }
                    let Ok(v) = serde_json::from_str::<Value>(data) else { continue };
                    let choice = &v["choices"][0];
                    if let Some(text) = choice["delta"]["content"].as_str() {
                        if !text.is_empty()
                            && tx.send(Ok(StreamEvent::Text(text.to_string()))).await.is_err()
                        {
                            return;
                        }
                    }
                    if let Some(r) = choice["finish_reason"].as_str() {
                        finish_reason = Some(r.to_string());
                    }
                    if let Some(u) = v.get("usage").filter(|u| !u.is_null()) {
                        usage = Some(TokenUsage {
                            input_tokens: u["prompt_tokens"].as_u64().unwrap_or(0),
                            output_tokens: u["completion_tokens"].as_u64().unwrap_or(0),
                            total_tokens: u["total_tokens"].as_u64().unwrap_or(0),
                        });
                    }
                }
            }

            let _ = tx
                .send(Ok(StreamEvent::Done {
                    stop_reason: OpenAiProvider::map_finish_reason(finish_reason.as_deref()),
                    usage,
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
        let body = json!({
            "model": model,
            "messages": self.format_messages(messages, system),
        });
        let response = self.post_with_retry(&body).await?;
        let v: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Transport(format!("Body read error: {e}")))?;
        Ok(v["choices"][0]["message"]["content"].as_str().unwrap_or_default().to_string())
    }

    async fn create_tool_use_message(
        &self,
        messages: &[ChatMessage],
        system: Option<&str>,
        tools: &[ToolDefinition],
        model: &str,
    ) -> Result<ToolUseResponse, ProviderError> {
        let body = json!({
            "model": model,
            "messages": self.format_messages(messages, system),
            "tools": Self::format_tools(tools),
        });
        info!("[provider] openai tool round model={} tools={}", model, tools.len());

        let response = self.post_with_retry(&body).await?;
        let v: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Transport(format!("Body read error: {e}")))?;

        let choice = &v["choices"][0];
        let message = choice["message"].clone();
        let text = message["content"].as_str().unwrap_or_default().to_string();

        let mut tool_calls = Vec::new();
        if let Some(calls) = message["tool_calls"].as_array() {
            for call in calls {
                let arguments = call["function"]["arguments"]
                    .as_str()
                    .and_then(|s| serde_json::from_str(s).ok())
                    .unwrap_or_else(|| json!({}));
                tool_calls.push(ToolInvocation {
                    id: call["id"].as_str().unwrap_or_default().to_string(),
                    name: call["function"]["name"].as_str().unwrap_or_default().to_string(),
                    arguments,
                });
            }
        }

        let usage = v.get("usage").filter(|u| !u.is_null()).map(|u| TokenUsage {
            input_tokens: u["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: u["completion_tokens"].as_u64().unwrap_or(0),
            total_tokens: u["total_tokens"].as_u64().unwrap_or(0),
        });

        Ok(ToolUseResponse {
            raw_message: message,
            text,
            tool_calls,
            stop_reason: Self::map_finish_reason(choice["finish_reason"].as_str()),
            usage,
        })
    }

    fn synthesize_raw(&self, text: &str) -> Value {
        json!({ "role": "assistant", "content": text })
    }
}
