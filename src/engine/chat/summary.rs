// Lorekeep Runtime — Rolling Conversation Summary
//
// A heuristic digest kept per session, updated after each turn without an
// LLM call. Five labeled sections, hard-capped at 1600 chars. Old entries
// age out of each section first; the cap then trims from the back.

use crate::atoms::constants::SUMMARY_MAX_CHARS;
use crate::engine::types::ChatMessage;

const SECTION_LABELS: [&str; 5] = ["Topics", "Decisions", "Questions", "Actions", "Tone"];
const MAX_ENTRIES_PER_SECTION: usize = 4;

#[derive(Debug, Default, Clone)]
pub struct ConversationSummary {
    sections: [Vec<String>; 5],
}

impl ConversationSummary {
    /// Re-hydrate from the stored text form; unknown lines are dropped.
    pub fn parse(text: &str) -> Self {
        let mut summary = ConversationSummary::default();
        let mut current: Option<usize> = None;
        for line in text.lines() {
            if let Some(idx) = SECTION_LABELS
                .iter()
                .position(|label| line.trim_end() == format!("{label}:"))
            {
                current = Some(idx);
                continue;
            }
            if let (Some(idx), Some(entry)) = (current, line.strip_prefix("- ")) {
                summary.sections[idx].push(entry.to_string());
            }
        }
        summary
    }

    /// Fold one completed turn into the digest.
    pub fn absorb_turn(&mut self, user_text: &str, assistant_text: &str) {
        self.push(0, first_sentence(user_text));
        if let Some(decision) = find_line_with(assistant_text, &["will ", "decided", "let's", "recommend"]) {
            self.push(1, decision);
        }
        if let Some(question) = user_text.split(['\n', '.']).find(|s| s.trim_end().ends_with('?')) {
            self.push(2, question.trim().to_string());
        }
        if let Some(action) = find_line_with(assistant_text, &["next step", "todo", "action:", "follow up", "due "]) {
            self.push(3, action);
        }
        self.set_tone(user_text);
    }

    fn push(&mut self, section: usize, entry: String) {
        let entry = clip(&entry, 120);
        if entry.is_empty() || self.sections[section].contains(&entry) {
            return;
        }
        self.sections[section].push(entry);
        if self.sections[section].len() > MAX_ENTRIES_PER_SECTION {
            self.sections[section].remove(0);
        }
    }

    fn set_tone(&mut self, user_text: &str) {
        let lower = user_text.to_lowercase();
        let tone = if lower.contains("urgent") || lower.contains("asap") || lower.contains('!') {
            "urgent"
        } else if lower.contains('?') {
            "inquisitive"
        } else {
            "directive"
        };
        self.sections[4] = vec![tone.to_string()];
    }

    /// Render the stored text form, clamped to the character cap.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (label, entries) in SECTION_LABELS.iter().zip(self.sections.iter()) {
            out.push_str(label);
            out.push_str(":\n");
            for entry in entries {
                out.push_str("- ");
                out.push_str(entry);
                out.push('\n');
            }
        }
        if out.len() > SUMMARY_MAX_CHARS {
            out = crate::engine::types::truncate_utf8(&out, SUMMARY_MAX_CHARS).to_string();
        }
        out
    }
}

/// Update the stored summary from the last user/assistant pair of a turn.
pub fn update_summary(previous: Option<&str>, messages: &[ChatMessage]) -> String {
    let mut summary = previous.map(ConversationSummary::parse).unwrap_or_default();
    let user_text = messages
        .iter()
        .rev()
        .find_map(|m| match m {
            ChatMessage::User { content } if !content.starts_with("[System note:") => {
                Some(content.as_str())
            }
            _ => None,
        })
        .unwrap_or("");
    let assistant_text = messages
        .iter()
        .rev()
        .find_map(|m| match m {
            ChatMessage::Assistant { derived_text, .. } => Some(derived_text.as_str()),
            _ => None,
        })
        .unwrap_or("");
    summary.absorb_turn(user_text, assistant_text);
    summary.render()
}

fn first_sentence(text: &str) -> String {
    text.split(['.', '\n', '?'])
        .next()
        .unwrap_or("")
        .trim()
        .to_string()
}

fn find_line_with(text: &str, needles: &[&str]) -> Option<String> {
    text.lines().find_map(|line| {
        let lower = line.to_lowercase();
        needles
            .iter()
            .any(|n| lower.contains(n))
            .then(|| line.trim().to_string())
    })
}

fn clip(s: &str, max: usize) -> String {
    crate::engine::types::truncate_utf8(s, max).to_string()
}
