// Lorekeep Runtime — Mission Output Parsers
//
// LLM output is scanned for triple-fenced blocks with known tags; each tag
// has a registered parser producing a typed record. Unknown tags land in
// the Unrecognized variant so new block types degrade gracefully instead
// of vanishing. Registration happens explicitly at Runtime::init() via
// register_mission_parsers() — no module-initialization side effects.

use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

// ── Parsed block variants ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedBlock {
    KbUpdate(crate::engine::kb_blocks::KbUpdateProposal),
    Decision { title: String, rationale: String },
    GapFlag { gap: String, severity: String },
    Stop { reason: String },
    Advisory { text: String },
    /// A proposed deadline; maps to a create_deadline action by ordinal.
    Deadline { title: String, due: String },
    /// Forward compatibility: a recognized fence shape with an unknown tag.
    Unrecognized { tag: String, body: String },
}

impl ParsedBlock {
    /// The output row kind this block persists under.
    pub fn kind(&self) -> &'static str {
        match self {
            ParsedBlock::KbUpdate(_) => "kb_update",
            ParsedBlock::Decision { .. } => "decision",
            ParsedBlock::GapFlag { .. } => "gap_flag",
            ParsedBlock::Stop { .. } => "stop",
            ParsedBlock::Advisory { .. } => "advisory",
            ParsedBlock::Deadline { .. } => "deadline",
            ParsedBlock::Unrecognized { .. } => "unrecognized",
        }
    }

    pub fn to_content(&self) -> Value {
        match self {
            ParsedBlock::KbUpdate(p) => p.to_content(),
            ParsedBlock::Decision { title, rationale } => {
                json!({ "title": title, "rationale": rationale })
            }
            ParsedBlock::GapFlag { gap, severity } => json!({ "gap": gap, "severity": severity }),
            ParsedBlock::Stop { reason } => json!({ "reason": reason }),
            ParsedBlock::Advisory { text } => json!({ "text": text }),
            ParsedBlock::Deadline { title, due } => json!({ "title": title, "due": due }),
            ParsedBlock::Unrecognized { tag, body } => json!({ "tag": tag, "body": body }),
        }
    }
}

// ── Parser registry ────────────────────────────────────────────────────────

type BlockParser = Arc<dyn Fn(&str) -> Option<ParsedBlock> + Send + Sync>;

#[derive(Default)]
pub struct ParserRegistry {
    parsers: RwLock<HashMap<String, BlockParser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tag: &str, parser: BlockParser) {
        self.parsers.write().insert(tag.to_string(), parser);
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.parsers.read().contains_key(tag)
    }

    /// Extract and parse every fenced block in `text`. Blocks whose tag has
    /// no parser, or whose parser rejects the body, become Unrecognized.
    pub fn parse_output(&self, text: &str) -> Vec<ParsedBlock> {
        let mut blocks = Vec::new();
        for (tag, body) in extract_fenced_blocks(text) {
            let parsed = self
                .parsers
                .read()
                .get(&tag)
                .and_then(|parser| parser(&body));
            blocks.push(parsed.unwrap_or(ParsedBlock::Unrecognized { tag, body }));
        }
        blocks
    }
}

/// Find ```tag … ``` fences. The tag is the word after the opening fence.
fn extract_fenced_blocks(text: &str) -> Vec<(String, String)> {
    let mut blocks = Vec::new();
    let mut lines = text.lines().peekable();
    while let Some(line) = lines.next() {
        let trimmed = line.trim_start();
        let Some(tag) = trimmed.strip_prefix("```").map(str::trim) else { continue };
        if tag.is_empty() {
            continue; // plain code fence, skip to its close
        }
        let mut body = String::new();
        for inner in lines.by_ref() {
            if inner.trim_start().starts_with("```") {
                break;
            }
            body.push_str(inner);
            body.push('\n');
        }
        blocks.push((tag.to_string(), body));
    }
    blocks
}

// ── Built-in parsers ───────────────────────────────────────────────────────

fn header_value<'a>(body: &'a str, key: &str) -> Option<&'a str> {
    body.lines().find_map(|line| {
        line.strip_prefix(key)
            .and_then(|rest| rest.strip_prefix(':'))
            .map(str::trim)
    })
}

/// Register the fixed parser set. Called once from Runtime::init(), before
/// default protocols are seeded.
pub fn register_mission_parsers(registry: &ParserRegistry) {
    registry.register(
        "kb-update",
        Arc::new(|body| {
            crate::engine::kb_blocks::parse_kb_update(body)
                .ok()
                .map(ParsedBlock::KbUpdate)
        }),
    );

    registry.register(
        "decision",
        Arc::new(|body| {
            let title = header_value(body, "title")?.to_string();
            let rationale = header_value(body, "rationale").unwrap_or("").to_string();
            Some(ParsedBlock::Decision { title, rationale })
        }),
    );

    registry.register(
        "gap-flag",
        Arc::new(|body| {
            let gap = header_value(body, "gap")?.to_string();
            let severity = header_value(body, "severity").unwrap_or("medium").to_string();
            Some(ParsedBlock::GapFlag { gap, severity })
        }),
    );

    registry.register(
        "stop",
        Arc::new(|body| {
            Some(ParsedBlock::Stop {
                reason: header_value(body, "reason").unwrap_or(body.trim()).to_string(),
            })
        }),
    );

    registry.register(
        "advisory",
        Arc::new(|body| {
            let text = body.trim();
            (!text.is_empty()).then(|| ParsedBlock::Advisory { text: text.to_string() })
        }),
    );

    registry.register(
        "deadline",
        Arc::new(|body| {
            let title = header_value(body, "title")?.to_string();
            let due = header_value(body, "due")?.to_string();
            Some(ParsedBlock::Deadline { title, due })
        }),
    );
}
