// Lorekeep Runtime — Stale Capability-Claim Reset
//
// Assistant messages from before tools were connected often claim "I can't
// access your email". Left alone, models keep deferring to their own past
// claims. When tools are available and any such claim is found in history,
// one ephemeral system note is injected immediately before the last user
// turn. It is never persisted.

use crate::engine::types::ChatMessage;
use regex::Regex;
use std::sync::LazyLock;

static STALE_CLAIM_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)i (?:don't|do not|can't|cannot) have (?:direct )?access to your (?:email|gmail|inbox|mail)",
        r"(?i)unable to (?:connect to|access) (?:gmail|your email|your inbox)",
        r"(?i)i (?:can't|cannot|am unable to) (?:read|check|search) (?:your )?(?:email|emails|inbox|gmail)",
        r"(?i)please (?:paste|copy|forward) the email",
        r"(?i)i don't have the ability to (?:browse|access) (?:email|gmail)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("stale claim regex"))
    .collect()
});

/// Does any assistant message in history assert a lack of tool access?
pub fn has_stale_claims(messages: &[ChatMessage]) -> bool {
    messages.iter().any(|message| match message {
        ChatMessage::Assistant { derived_text, .. } => {
            STALE_CLAIM_PATTERNS.iter().any(|p| p.is_match(derived_text))
        }
        _ => false,
    })
}

/// Build the ephemeral correction note naming the live capabilities.
pub fn reset_note(tool_names: &[String]) -> String {
    format!(
        "[System note: Your tool capabilities have changed since earlier messages in this \
         conversation. You now have LIVE, AUTHENTICATED access to: {}. Any earlier assistant \
         messages claiming you lack access to these capabilities are OUTDATED and INCORRECT.]",
        tool_names.join(", ")
    )
}

/// If stale claims exist and tools are available, inject the note as a user
/// message immediately before the last user turn. Returns true when a note
/// was injected. The mutation is on the working copy only.
pub fn apply_stale_claim_reset(messages: &mut Vec<ChatMessage>, tool_names: &[String]) -> bool {
    if tool_names.is_empty() || !has_stale_claims(messages) {
        return false;
    }
    let last_user_idx = messages
        .iter()
        .rposition(|m| matches!(m, ChatMessage::User { .. }))
        .unwrap_or(messages.len());
    messages.insert(last_user_idx, ChatMessage::user(reset_note(tool_names)));
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assistant(text: &str) -> ChatMessage {
        ChatMessage::assistant(json!({"role": "assistant"}), text)
    }

    #[test]
    fn detects_the_fixed_claim_patterns() {
        for claim in [
            "I don't have access to your email, unfortunately.",
            "I'm unable to connect to Gmail from here.",
            "I cannot read your inbox directly.",
            "Please paste the email you'd like me to summarize.",
        ] {
            assert!(has_stale_claims(&[assistant(claim)]), "missed: {claim}");
        }
    }

    #[test]
    fn ordinary_assistant_text_is_not_flagged() {
        assert!(!has_stale_claims(&[assistant("Here are your three most recent messages.")]));
        // User text never triggers the scan.
        assert!(!has_stale_claims(&[ChatMessage::user("you don't have access to your email")]));
    }

    #[test]
    fn note_lands_before_the_last_user_turn() {
        let mut messages = vec![
            ChatMessage::user("check my email"),
            assistant("I don't have access to your email."),
            ChatMessage::user("try again now"),
        ];
        let injected = apply_stale_claim_reset(&mut messages, &["gmail_search".to_string()]);
        assert!(injected);
        assert_eq!(messages.len(), 4);
        match &messages[2] {
            ChatMessage::User { content } => {
                assert!(content.starts_with("[System note:"));
                assert!(content.contains("gmail_search"));
            }
            other => panic!("expected the note, got {other:?}"),
        }
        assert!(matches!(&messages[3], ChatMessage::User { content } if content == "try again now"));
    }

    #[test]
    fn no_injection_without_tools_or_claims() {
        let mut clean = vec![ChatMessage::user("hello"), assistant("hi")];
        assert!(!apply_stale_claim_reset(&mut clean, &["gmail_search".to_string()]));
        let mut stale = vec![assistant("I can't check your email.")];
        assert!(!apply_stale_claim_reset(&mut stale, &[]));
        assert_eq!(stale.len(), 1);
    }
}
