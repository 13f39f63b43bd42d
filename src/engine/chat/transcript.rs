// Lorekeep Runtime — Transcript Model
//
// Validation before each provider call, deterministic flattening for the
// no-tools fallback, and byte accounting for the transcript budget.

use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::types::ChatMessage;

/// Every assistant must carry a raw_message; every tool message needs a
/// call id, a name, and string content (enforced by type — emptiness is
/// checked here). Violations fail the round fast with a diagnostic.
pub fn validate_transcript(messages: &[ChatMessage]) -> EngineResult<()> {
    for (i, message) in messages.iter().enumerate() {
        match message {
            ChatMessage::Assistant { raw_message: None, .. } => {
                return Err(EngineError::Integrity(format!(
                    "transcript[{i}]: assistant message has no raw_message"
                )));
            }
            ChatMessage::Tool { tool_call_id, tool_name, .. } => {
                if tool_call_id.is_empty() {
                    return Err(EngineError::Integrity(format!(
                        "transcript[{i}]: tool message has empty tool_call_id"
                    )));
                }
                if tool_name.is_empty() {
                    return Err(EngineError::Integrity(format!(
                        "transcript[{i}]: tool message has empty tool_name"
                    )));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Deterministic flattening for the fallback chat_complete path.
/// Never merges adjacent messages.
pub fn flatten_transcript(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    messages
        .iter()
        .map(|message| match message {
            ChatMessage::User { content } => ChatMessage::user(content.clone()),
            ChatMessage::Assistant { derived_text, .. } => ChatMessage::Assistant {
                raw_message: None,
                derived_text: derived_text.clone(),
            },
            ChatMessage::Tool { tool_name, content, .. } => {
                ChatMessage::user(format!("[Tool result ({tool_name}): {content}]"))
            }
        })
        .collect()
}

/// Cumulative transcript size for the 400 KB budget check.
pub fn transcript_bytes(messages: &[ChatMessage]) -> usize {
    messages
        .iter()
        .map(|message| match message {
            ChatMessage::User { content } => content.len(),
            ChatMessage::Assistant { raw_message, derived_text } => {
                derived_text.len()
                    + raw_message.as_ref().map(|r| r.to_string().len()).unwrap_or(0)
            }
            ChatMessage::Tool { content, tool_name, tool_call_id } => {
                content.len() + tool_name.len() + tool_call_id.len()
            }
        })
        .sum()
}

/// Split final text on paragraph boundaries for pseudo-streaming to the UI.
pub fn paragraph_chunks(text: &str) -> Vec<&str> {
    text.split("\n\n").filter(|p| !p.is_empty()).collect()
}
