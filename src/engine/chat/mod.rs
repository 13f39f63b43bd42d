// Lorekeep Runtime — Chat Tool Loop
//
// Drives an LLM through zero or more tool rounds until it emits a final
// answer. Tool rounds are non-streaming; streaming is only used on the
// plain no-tools path. The loop maintains transcript integrity (every tool
// call gets a paired result), enforces the read-only-what-you-searched
// guard on mail reads, strips secrets and truncates tool output, detects
// capability negatives, and keeps the transcript bounded.
//
// Module layout:
//   transcript   — validation, flattening, byte accounting
//   guards       — search-scope denial string, secret stripping, truncation
//   capability   — (provider, model, base_url) tool-use cache
//   stale_claims — outdated "no tool access" claim reset
//   pins         — decaying advisory/force-KB counters
//   summary      — rolling five-section conversation digest

pub mod capability;
pub mod guards;
pub mod pins;
pub mod stale_claims;
pub mod summary;
pub mod transcript;

use crate::atoms::constants::{MAX_TOOL_CALLS_PER_ROUND, MAX_TOOL_ROUNDS, TRANSCRIPT_BUDGET_BYTES};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::traits::{ProviderError, UiSink};
use crate::engine::providers::AnyProvider;
use crate::engine::runtime::CancelToken;
use crate::engine::tools::{gmail::extract_message_ids, ToolContext, ToolRegistry};
use crate::engine::types::*;
use capability::{CapabilityCache, CapabilityKey};
use log::{info, warn};
use std::collections::HashSet;
use std::sync::Arc;

const ROUNDS_EXCEEDED_SUFFIX: &str =
    "Tool loop reached max rounds. Respond with best available info using tool results already obtained.";
const BUDGET_EXCEEDED_SUFFIX: &str =
    "The conversation transcript has reached its size limit. Answer now with the material already gathered from tool results.";

pub struct ChatLoopDeps {
    pub provider: AnyProvider,
    pub model: String,
    pub base_url: Option<String>,
    pub tools: ToolRegistry,
    pub ui: Arc<dyn UiSink>,
    pub capabilities: Arc<CapabilityCache>,
}

impl ChatLoopDeps {
    fn capability_key(&self) -> CapabilityKey {
        CapabilityKey {
            provider: self.provider.name().to_string(),
            model: self.model.clone(),
            base_url: self.base_url.clone(),
        }
    }
}

#[derive(Debug)]
pub struct ChatOutcome {
    pub text: String,
    pub cancelled: bool,
    pub rounds: u32,
    pub all_tool_calls: Vec<ToolInvocation>,
}

fn provider_err(provider: &str, e: ProviderError) -> EngineError {
    EngineError::Provider { provider: provider.to_string(), message: e.to_string() }
}

/// Pseudo-stream final text to the UI on paragraph boundaries, then signal
/// completion.
fn emit_final(ui: &Arc<dyn UiSink>, session_id: &str, text: &str) {
    for paragraph in transcript::paragraph_chunks(text) {
        ui.emit(UiEvent::ChatDelta { session_id: session_id.to_string(), text: paragraph.to_string() });
    }
    ui.emit(UiEvent::ChatComplete {
        session_id: session_id.to_string(),
        text: text.to_string(),
        cancelled: false,
    });
}

/// Last assistant text in the transcript, for the cancelled return path.
fn last_assistant_text(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .rev()
        .find_map(|m| match m {
            ChatMessage::Assistant { derived_text, .. } => Some(derived_text.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

/// Run one chat turn through the tool loop.
///
/// `messages` is the working transcript; the loop appends assistant and
/// tool messages as it goes. Stale-claim notes injected here are part of
/// the working copy only — the caller persists the transcript from its own
/// record, not this vec.
pub async fn run_tool_loop(
    deps: &ChatLoopDeps,
    messages: &mut Vec<ChatMessage>,
    system_prompt: Option<&str>,
    ctx: &ToolContext,
    cancel: &CancelToken,
) -> EngineResult<ChatOutcome> {
    let key = deps.capability_key();

    // Known-negative backends skip straight to plain completion.
    if deps.tools.is_empty()
        || deps.capabilities.get(&key) == capability::ToolCapability::NotSupported
    {
        return fallback_completion(deps, messages, system_prompt, ctx, None).await;
    }

    // Historical-assistant synthesis: assistants that pre-date the loop
    // have no raw_message; give them a provider-appropriate stand-in so
    // validation and the wire format both hold.
    for message in messages.iter_mut() {
        if let ChatMessage::Assistant { raw_message: raw @ None, derived_text } = message {
            *raw = Some(deps.provider.synthesize_raw(derived_text));
        }
    }

    // Stale-claim reset: one ephemeral note when old history denies
    // capabilities that are now live.
    if stale_claims::apply_stale_claim_reset(messages, &deps.tools.names()) {
        info!("[chat] Injected capability-reset note for session {}", ctx.session_id);
    }

    // Seed the searched-id scope with ids surfaced by searches earlier in
    // this conversation.
    let mut searched_ids: HashSet<String> = messages
        .iter()
        .filter_map(|m| match m {
            ChatMessage::Tool { tool_name, content, .. } if tool_name == "gmail_search" => {
                Some(extract_message_ids(content))
            }
            _ => None,
        })
        .flatten()
        .collect();

    let tool_definitions = deps.tools.definitions();
    let mut all_tool_calls: Vec<ToolInvocation> = Vec::new();
    let mut max_tokens_streak = 0u32;

    for round in 1..=MAX_TOOL_ROUNDS {
        // Checkpoint 1: top of round.
        if cancel.is_cancelled() {
            return Ok(cancelled_outcome(messages, round, all_tool_calls));
        }

        transcript::validate_transcript(messages)?;

        if transcript::transcript_bytes(messages) > TRANSCRIPT_BUDGET_BYTES {
            warn!("[chat] Transcript budget exceeded at round {} — finishing with completion", round);
            return fallback_completion(deps, messages, system_prompt, ctx, Some(BUDGET_EXCEEDED_SUFFIX))
                .await
                .map(|mut o| {
                    o.rounds = round;
                    o.all_tool_calls = all_tool_calls;
                    o
                });
        }

        info!(
            "[chat] Tool round {}/{} session={} tools={}",
            round,
            MAX_TOOL_ROUNDS,
            ctx.session_id,
            tool_definitions.len()
        );

        let response = match deps
            .provider
            .create_tool_use_message(messages, system_prompt, &tool_definitions, &deps.model)
            .await
        {
            Ok(r) => r,
            Err(ProviderError::ToolsNotSupported) => {
                warn!("[chat] Backend rejects tools — caching negative and falling back");
                deps.capabilities.record_not_supported(&key);
                return fallback_completion(deps, messages, system_prompt, ctx, None).await;
            }
            Err(e) => return Err(provider_err(deps.provider.name(), e)),
        };

        // Checkpoint 2: after the completion.
        if cancel.is_cancelled() {
            messages.push(ChatMessage::assistant(response.raw_message, response.text));
            return Ok(cancelled_outcome(messages, round, all_tool_calls));
        }

        messages.push(ChatMessage::assistant(response.raw_message.clone(), response.text.clone()));

        // ── No tool calls: the model is done (or starved) ──────────────
        if response.stop_reason != StopReason::ToolUse || response.tool_calls.is_empty() {
            if response.stop_reason == StopReason::MaxTokens {
                max_tokens_streak += 1;
                if response.tool_calls.is_empty() || max_tokens_streak >= 2 {
                    info!("[chat] max_tokens exit (streak {}) — continuation completion", max_tokens_streak);
                    return fallback_completion(
                        deps,
                        messages,
                        system_prompt,
                        ctx,
                        Some("Your previous response was cut off by the token limit. Continue and finish the answer."),
                    )
                    .await
                    .map(|mut o| {
                        o.rounds = round;
                        o.all_tool_calls = all_tool_calls;
                        o
                    });
                }
            } else {
                if response.stop_reason == StopReason::EndTurn {
                    deps.capabilities.record_tool_free_turn(&key);
                }
                emit_final(&deps.ui, &ctx.session_id, &response.text);
                return Ok(ChatOutcome {
                    text: response.text,
                    cancelled: false,
                    rounds: round,
                    all_tool_calls,
                });
            }
        } else {
            max_tokens_streak = 0;
        }

        // ── Execute tool calls in provider-returned order ──────────────
        for (i, call) in response.tool_calls.iter().enumerate() {
            // Checkpoint 3: before each tool.
            if cancel.is_cancelled() {
                // Pair the remaining calls so the transcript stays valid.
                for pending in &response.tool_calls[i..] {
                    messages.push(ChatMessage::tool(
                        pending.id.clone(),
                        pending.name.clone(),
                        "[Skipped: request cancelled]",
                    ));
                }
                return Ok(cancelled_outcome(messages, round, all_tool_calls));
            }

            all_tool_calls.push(call.clone());

            // Calls beyond the per-round cap get synthetic results so every
            // call has a paired tool message.
            if i >= MAX_TOOL_CALLS_PER_ROUND {
                messages.push(ChatMessage::tool(
                    call.id.clone(),
                    call.name.clone(),
                    "[Skipped: per-round tool call limit reached]",
                ));
                continue;
            }

            let output = execute_one_call(deps, ctx, call, &mut searched_ids, &key).await;
            messages.push(ChatMessage::tool(call.id.clone(), call.name.clone(), output));

            // Checkpoint 4: after each tool.
            if cancel.is_cancelled() {
                for pending in &response.tool_calls[i + 1..] {
                    messages.push(ChatMessage::tool(
                        pending.id.clone(),
                        pending.name.clone(),
                        "[Skipped: request cancelled]",
                    ));
                }
                return Ok(cancelled_outcome(messages, round, all_tool_calls));
            }
        }
    }

    // ── Round exhaustion ───────────────────────────────────────────────
    info!("[chat] Max tool rounds reached — final completion");
    fallback_completion(deps, messages, system_prompt, ctx, Some(ROUNDS_EXCEEDED_SUFFIX))
        .await
        .map(|mut o| {
            o.rounds = MAX_TOOL_ROUNDS;
            o.all_tool_calls = all_tool_calls;
            o
        })
}

/// Run one tool call: search-scope guard, executor dispatch, error wrapping,
/// output hygiene, searched-id bookkeeping, capability bookkeeping.
async fn execute_one_call(
    deps: &ChatLoopDeps,
    ctx: &ToolContext,
    call: &ToolInvocation,
    searched_ids: &mut HashSet<String>,
    key: &CapabilityKey,
) -> String {
    // Mail reads are restricted to ids a search already returned.
    if call.name == "gmail_read" {
        let requested = call.arguments["message_id"].as_str().unwrap_or("");
        if !searched_ids.contains(requested) {
            info!("[chat] Search-scope denied gmail_read of '{}' ", requested);
            return guards::SEARCH_SCOPE_DENIED.to_string();
        }
    }

    let Some(tool) = deps.tools.get(&call.name) else {
        return format!("TOOL_ERROR: executor — unknown tool '{}'", call.name);
    };

    let output = match tool.executor.execute(&call.arguments, ctx).await {
        Ok(out) => {
            deps.capabilities.record_tool_success(key);
            out
        }
        Err(e) => format!("TOOL_ERROR: executor — {e}"),
    };

    let sanitized = guards::sanitize_tool_output(&output);

    if call.name == "gmail_search" {
        for id in extract_message_ids(&sanitized) {
            searched_ids.insert(id);
        }
    }

    info!(
        "[chat] Tool {} id={} output_len={}",
        call.name,
        call.id,
        sanitized.len()
    );
    sanitized
}

fn cancelled_outcome(
    messages: &[ChatMessage],
    rounds: u32,
    all_tool_calls: Vec<ToolInvocation>,
) -> ChatOutcome {
    // No further "done" signal on cancel — the caller already knows.
    ChatOutcome {
        text: last_assistant_text(messages),
        cancelled: true,
        rounds,
        all_tool_calls,
    }
}

/// Non-tool completion over the deterministically flattened transcript,
/// with an optional system suffix.
async fn fallback_completion(
    deps: &ChatLoopDeps,
    messages: &[ChatMessage],
    system_prompt: Option<&str>,
    ctx: &ToolContext,
    suffix: Option<&str>,
) -> EngineResult<ChatOutcome> {
    let flattened = transcript::flatten_transcript(messages);
    let system = match (system_prompt, suffix) {
        (Some(base), Some(extra)) => Some(format!("{base}\n\n{extra}")),
        (None, Some(extra)) => Some(extra.to_string()),
        (Some(base), None) => Some(base.to_string()),
        (None, None) => None,
    };
    let text = deps
        .provider
        .chat_complete(&flattened, system.as_deref(), &deps.model)
        .await
        .map_err(|e| provider_err(deps.provider.name(), e))?;
    emit_final(&deps.ui, &ctx.session_id, &text);
    Ok(ChatOutcome { text, cancelled: false, rounds: 0, all_tool_calls: vec![] })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::traits::{ChunkStream, Provider};
    use crate::engine::automation::actions::test_support::RecordingSink;
    use crate::engine::tools::ToolExecutor;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    /// Provider scripted with a sequence of tool-use responses. After the
    /// script runs out it answers with a plain end_turn text. Also records
    /// every chat_complete system prompt it receives.
    struct ScriptedToolProvider {
        responses: Mutex<Vec<ToolUseResponse>>,
        pub completions: Mutex<Vec<Option<String>>>,
        fail_tools: bool,
    }

    impl ScriptedToolProvider {
        fn new(responses: Vec<ToolUseResponse>) -> Arc<Self> {
            Arc::new(ScriptedToolProvider {
                responses: Mutex::new(responses.into_iter().rev().collect()),
                completions: Mutex::new(vec![]),
                fail_tools: false,
            })
        }

        fn rejecting_tools() -> Arc<Self> {
            Arc::new(ScriptedToolProvider {
                responses: Mutex::new(vec![]),
                completions: Mutex::new(vec![]),
                fail_tools: true,
            })
        }
    }

    fn tool_round(calls: Vec<(&str, &str, Value)>) -> ToolUseResponse {
        let tool_calls: Vec<ToolInvocation> = calls
            .iter()
            .map(|(id, name, args)| ToolInvocation {
                id: id.to_string(),
                name: name.to_string(),
                arguments: args.clone(),
            })
            .collect();
        ToolUseResponse {
            raw_message: json!({"role": "assistant", "content": []}),
            text: String::new(),
            stop_reason: if tool_calls.is_empty() { StopReason::EndTurn } else { StopReason::ToolUse },
            tool_calls,
            usage: None,
        }
    }

    fn final_answer(text: &str) -> ToolUseResponse {
        ToolUseResponse {
            raw_message: json!({"role": "assistant", "content": [{"type": "text", "text": text}]}),
            text: text.to_string(),
            tool_calls: vec![],
            stop_reason: StopReason::EndTurn,
            usage: None,
        }
    }

    #[async_trait]
    impl Provider for ScriptedToolProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn chat(
            &self,
            _m: &[ChatMessage],
            _s: Option<&str>,
            _model: &str,
        ) -> Result<ChunkStream, ProviderError> {
            let (_tx, rx) = tokio::sync::mpsc::channel(1);
            Ok(ChunkStream::new(rx))
        }

        async fn chat_complete(
            &self,
            _m: &[ChatMessage],
            system: Option<&str>,
            _model: &str,
        ) -> Result<String, ProviderError> {
            self.completions.lock().push(system.map(|s| s.to_string()));
            Ok("fallback answer".into())
        }

        async fn create_tool_use_message(
            &self,
            _m: &[ChatMessage],
            _s: Option<&str>,
            _tools: &[ToolDefinition],
            _model: &str,
        ) -> Result<ToolUseResponse, ProviderError> {
            if self.fail_tools {
                return Err(ProviderError::ToolsNotSupported);
            }
            Ok(self
                .responses
                .lock()
                .pop()
                .unwrap_or_else(|| final_answer("all done")))
        }

        fn synthesize_raw(&self, text: &str) -> Value {
            json!({"role": "assistant", "content": [{"type": "text", "text": text}]})
        }
    }

    struct CannedTool {
        output: String,
    }

    #[async_trait]
    impl ToolExecutor for CannedTool {
        async fn execute(&self, _args: &Value, _ctx: &ToolContext) -> EngineResult<String> {
            Ok(self.output.clone())
        }
    }

    struct FailingTool;

    #[async_trait]
    impl ToolExecutor for FailingTool {
        async fn execute(&self, _args: &Value, _ctx: &ToolContext) -> EngineResult<String> {
            Err(EngineError::tool("boom_tool", "exploded"))
        }
    }

    fn definition(name: &str) -> ToolDefinition {
        ToolDefinition { name: name.into(), description: String::new(), input_schema: json!({}) }
    }

    fn deps_with(provider: Arc<ScriptedToolProvider>, tools: ToolRegistry) -> ChatLoopDeps {
        ChatLoopDeps {
            provider: AnyProvider::from_arc(provider),
            model: "scripted-model".into(),
            base_url: None,
            tools,
            ui: Arc::new(RecordingSink::default()),
            capabilities: Arc::new(CapabilityCache::new()),
        }
    }

    fn ctx() -> ToolContext {
        ToolContext { domain_id: "d1".into(), session_id: "s1".into() }
    }

    fn search_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(
            definition("gmail_search"),
            Arc::new(CannedTool { output: r#"{"messages": [{"id": "A"}]}"#.into() }),
        );
        registry.register(
            definition("gmail_read"),
            Arc::new(CannedTool { output: r#"{"id": "A", "body": "hello"}"#.into() }),
        );
        registry
    }

    #[tokio::test]
    async fn tool_round_pairs_every_call_with_a_result() {
        let provider = ScriptedToolProvider::new(vec![
            tool_round(vec![("tc1", "gmail_search", json!({"query": "x"}))]),
            final_answer("found it"),
        ]);
        let deps = deps_with(provider, search_registry());
        let mut messages = vec![ChatMessage::user("find mail")];
        let outcome =
            run_tool_loop(&deps, &mut messages, None, &ctx(), &CancelToken::new()).await.unwrap();
        assert_eq!(outcome.text, "found it");
        assert!(!outcome.cancelled);
        let tool_results = messages
            .iter()
            .filter(|m| matches!(m, ChatMessage::Tool { .. }))
            .count();
        assert_eq!(tool_results, outcome.all_tool_calls.len());
        assert_eq!(outcome.rounds, 2);
    }

    #[tokio::test]
    async fn search_scope_denies_unsearched_id_and_allows_searched() {
        let provider = ScriptedToolProvider::new(vec![
            tool_round(vec![
                ("tc1", "gmail_search", json!({"query": "x"})),
                ("tc2", "gmail_read", json!({"message_id": "B"})),
            ]),
            tool_round(vec![("tc3", "gmail_read", json!({"message_id": "A"}))]),
            final_answer("done"),
        ]);
        let deps = deps_with(provider, search_registry());
        let mut messages = vec![ChatMessage::user("read B")];
        run_tool_loop(&deps, &mut messages, None, &ctx(), &CancelToken::new()).await.unwrap();

        let tool_contents: Vec<(&str, &str)> = messages
            .iter()
            .filter_map(|m| match m {
                ChatMessage::Tool { tool_call_id, content, .. } => {
                    Some((tool_call_id.as_str(), content.as_str()))
                }
                _ => None,
            })
            .collect();
        // tc2 asked for B which no search returned.
        let tc2 = tool_contents.iter().find(|(id, _)| *id == "tc2").unwrap();
        assert_eq!(tc2.1, guards::SEARCH_SCOPE_DENIED);
        // tc3 asked for A, surfaced by the round-1 search.
        let tc3 = tool_contents.iter().find(|(id, _)| *id == "tc3").unwrap();
        assert!(tc3.1.contains("hello"));
    }

    #[tokio::test]
    async fn search_scope_seeds_from_prior_history() {
        let provider = ScriptedToolProvider::new(vec![
            tool_round(vec![("tc1", "gmail_read", json!({"message_id": "H"}))]),
            final_answer("done"),
        ]);
        let deps = deps_with(provider, search_registry());
        let mut messages = vec![
            ChatMessage::user("earlier"),
            ChatMessage::assistant(json!({"role": "assistant", "content": []}), ""),
            ChatMessage::tool("old1", "gmail_search", r#"{"messages": [{"id": "H"}]}"#),
            ChatMessage::user("read H"),
        ];
        run_tool_loop(&deps, &mut messages, None, &ctx(), &CancelToken::new()).await.unwrap();
        let read_result = messages
            .iter()
            .find_map(|m| match m {
                ChatMessage::Tool { tool_call_id, content, .. } if tool_call_id == "tc1" => {
                    Some(content.clone())
                }
                _ => None,
            })
            .unwrap();
        assert!(read_result.contains("hello"), "history-searched id must be readable");
    }

    #[tokio::test]
    async fn executor_failure_becomes_tool_error_string() {
        let mut registry = ToolRegistry::new();
        registry.register(definition("boom_tool"), Arc::new(FailingTool));
        let provider = ScriptedToolProvider::new(vec![
            tool_round(vec![("tc1", "boom_tool", json!({}))]),
            final_answer("recovered"),
        ]);
        let deps = deps_with(provider, registry);
        let mut messages = vec![ChatMessage::user("go")];
        let outcome =
            run_tool_loop(&deps, &mut messages, None, &ctx(), &CancelToken::new()).await.unwrap();
        assert_eq!(outcome.text, "recovered");
        let tool_msg = messages
            .iter()
            .find_map(|m| match m {
                ChatMessage::Tool { content, .. } => Some(content.clone()),
                _ => None,
            })
            .unwrap();
        assert!(tool_msg.starts_with("TOOL_ERROR: executor — "));
    }

    #[tokio::test]
    async fn calls_beyond_cap_get_synthetic_results() {
        let calls: Vec<(String, &str, Value)> =
            (0..7).map(|i| (format!("tc{i}"), "gmail_search", json!({"query": "q"}))).collect();
        let provider = ScriptedToolProvider::new(vec![
            tool_round(calls.iter().map(|(id, n, a)| (id.as_str(), *n, a.clone())).collect()),
            final_answer("ok"),
        ]);
        let deps = deps_with(provider, search_registry());
        let mut messages = vec![ChatMessage::user("go")];
        let outcome =
            run_tool_loop(&deps, &mut messages, None, &ctx(), &CancelToken::new()).await.unwrap();
        assert_eq!(outcome.all_tool_calls.len(), 7);
        let synthetic = messages
            .iter()
            .filter(|m| {
                matches!(m, ChatMessage::Tool { content, .. }
                    if content == "[Skipped: per-round tool call limit reached]")
            })
            .count();
        assert_eq!(synthetic, 2);
        // Parity: 7 calls, 7 results.
        let results = messages.iter().filter(|m| matches!(m, ChatMessage::Tool { .. })).count();
        assert_eq!(results, 7);
    }

    #[tokio::test]
    async fn round_exhaustion_finishes_with_suffix_completion() {
        // Five rounds of tool calls, never a final answer.
        let rounds: Vec<ToolUseResponse> = (0..5)
            .map(|i| ToolUseResponse {
                raw_message: json!({"role": "assistant", "content": []}),
                text: String::new(),
                tool_calls: (0..5)
                    .map(|j| ToolInvocation {
                        id: format!("tc{i}-{j}"),
                        name: "gmail_search".into(),
                        arguments: json!({"query": format!("q{i}{j}")}),
                    })
                    .collect(),
                stop_reason: StopReason::ToolUse,
                usage: None,
            })
            .collect();
        let provider = ScriptedToolProvider::new(rounds);
        let deps = deps_with(provider.clone(), search_registry());
        let mut messages = vec![ChatMessage::user("dig forever")];
        let outcome =
            run_tool_loop(&deps, &mut messages, Some("base prompt"), &ctx(), &CancelToken::new())
                .await
                .unwrap();
        assert_eq!(outcome.text, "fallback answer");
        assert_eq!(outcome.rounds, MAX_TOOL_ROUNDS);
        assert!(outcome.all_tool_calls.len() >= 25);
        let completions = provider.completions.lock();
        let system = completions[0].as_deref().unwrap();
        assert!(system.ends_with(ROUNDS_EXCEEDED_SUFFIX));
    }

    #[tokio::test]
    async fn transcript_over_budget_exits_to_completion() {
        // A transcript already past 400 KB never reaches a tool round.
        let provider = ScriptedToolProvider::new(vec![tool_round(vec![(
            "tc1",
            "gmail_search",
            json!({"query": "x"}),
        )])]);
        let deps = deps_with(provider.clone(), search_registry());
        let mut messages = vec![
            ChatMessage::user("x".repeat(TRANSCRIPT_BUDGET_BYTES + 1)),
            ChatMessage::user("now answer"),
        ];
        let outcome =
            run_tool_loop(&deps, &mut messages, Some("base"), &ctx(), &CancelToken::new())
                .await
                .unwrap();
        assert_eq!(outcome.text, "fallback answer");
        // The tool-round script was never consumed.
        assert_eq!(provider.responses.lock().len(), 1);
        let completions = provider.completions.lock();
        assert!(completions[0].as_deref().unwrap().contains("size limit"));
    }

    #[tokio::test]
    async fn tools_not_supported_falls_back_and_caches() {
        let provider = ScriptedToolProvider::rejecting_tools();
        let deps = deps_with(provider.clone(), search_registry());
        let mut messages = vec![ChatMessage::user("hello")];
        let outcome =
            run_tool_loop(&deps, &mut messages, None, &ctx(), &CancelToken::new()).await.unwrap();
        assert_eq!(outcome.text, "fallback answer");
        assert_eq!(
            deps.capabilities.get(&deps.capability_key()),
            capability::ToolCapability::NotSupported
        );
        // A second turn goes straight to completion without a tool attempt.
        let mut messages = vec![ChatMessage::user("again")];
        run_tool_loop(&deps, &mut messages, None, &ctx(), &CancelToken::new()).await.unwrap();
        assert_eq!(provider.completions.lock().len(), 2);
    }

    #[tokio::test]
    async fn cancellation_returns_last_text_without_done_signal() {
        let provider = ScriptedToolProvider::new(vec![final_answer("never seen")]);
        let sink = Arc::new(RecordingSink::default());
        let mut deps = deps_with(provider, search_registry());
        deps.ui = sink.clone();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut messages = vec![
            ChatMessage::user("q"),
            ChatMessage::assistant(json!({"role": "assistant", "content": []}), "partial answer"),
            ChatMessage::user("more"),
        ];
        let outcome = run_tool_loop(&deps, &mut messages, None, &ctx(), &cancel).await.unwrap();
        assert!(outcome.cancelled);
        assert_eq!(outcome.text, "partial answer");
        assert!(sink.events.lock().is_empty(), "no completion events after cancel");
    }

    #[tokio::test]
    async fn transcript_validation_fails_fast() {
        let provider = ScriptedToolProvider::new(vec![]);
        let deps = deps_with(provider, search_registry());
        // An empty tool_call_id cannot be repaired by synthesis.
        let mut messages = vec![ChatMessage::tool("", "gmail_search", "{}")];
        let err = run_tool_loop(&deps, &mut messages, None, &ctx(), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Integrity(_)));
    }

    #[tokio::test]
    async fn historical_assistants_are_synthesized_before_validation() {
        let provider = ScriptedToolProvider::new(vec![final_answer("ok")]);
        let deps = deps_with(provider, search_registry());
        let mut messages = vec![
            ChatMessage::Assistant { raw_message: None, derived_text: "old turn".into() },
            ChatMessage::user("new question"),
        ];
        let outcome =
            run_tool_loop(&deps, &mut messages, None, &ctx(), &CancelToken::new()).await.unwrap();
        assert_eq!(outcome.text, "ok");
        match &messages[0] {
            ChatMessage::Assistant { raw_message: Some(raw), .. } => {
                assert_eq!(raw["content"][0]["text"], "old turn");
            }
            other => panic!("expected synthesized assistant, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn two_tool_free_end_turns_mark_not_observed() {
        let deps = deps_with(
            ScriptedToolProvider::new(vec![final_answer("one")]),
            search_registry(),
        );
        let mut messages = vec![ChatMessage::user("a")];
        run_tool_loop(&deps, &mut messages, None, &ctx(), &CancelToken::new()).await.unwrap();
        assert_eq!(deps.capabilities.get(&deps.capability_key()), capability::ToolCapability::Unknown);

        let deps2 = ChatLoopDeps {
            provider: AnyProvider::from_arc(ScriptedToolProvider::new(vec![final_answer("two")])),
            capabilities: deps.capabilities.clone(),
            ..deps_with(ScriptedToolProvider::new(vec![]), search_registry())
        };
        let mut messages = vec![ChatMessage::user("b")];
        run_tool_loop(&deps2, &mut messages, None, &ctx(), &CancelToken::new()).await.unwrap();
        assert_eq!(
            deps.capabilities.get(&deps.capability_key()),
            capability::ToolCapability::NotObserved
        );
    }
}
