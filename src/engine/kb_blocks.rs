// Lorekeep Runtime — KB Update Proposal Blocks
//
// LLM output proposes KB changes through fenced `kb-update` blocks: header
// lines, a literal `---` separator, then the new content. Parsing is
// strict about the headers it needs; validation enforces tier write-mode
// rules and path containment before anything touches disk.

use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::types::{KbTier, WriteMode};
use serde_json::{json, Value};
use std::path::{Component, Path, PathBuf};

const ALLOWED_EXTENSIONS: [&str; 6] = ["md", "mdx", "json", "txt", "yaml", "yml"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KbAction {
    Create,
    Update,
    Delete,
}

impl KbAction {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(KbAction::Create),
            "update" => Some(KbAction::Update),
            "delete" => Some(KbAction::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KbAction::Create => "create",
            KbAction::Update => "update",
            KbAction::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KbUpdateProposal {
    pub file: String,
    pub action: KbAction,
    pub tier: KbTier,
    pub mode: WriteMode,
    pub basis: String,
    pub reasoning: String,
    /// For deletes: the literal `DELETE <filename>` confirmation.
    pub confirm: Option<String>,
    pub content: String,
}

impl KbUpdateProposal {
    pub fn to_content(&self) -> Value {
        json!({
            "file": self.file,
            "action": self.action.as_str(),
            "tier": self.tier.as_str(),
            "mode": self.mode.as_str(),
            "basis": self.basis,
            "reasoning": self.reasoning,
            "content_chars": self.content.len(),
        })
    }
}

// ── Parsing ────────────────────────────────────────────────────────────────

fn header<'a>(headers: &'a [(String, String)], key: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Parse the body of a `kb-update` fence (headers, `---`, content).
pub fn parse_kb_update(body: &str) -> EngineResult<KbUpdateProposal> {
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut content = String::new();
    let mut in_content = false;

    for line in body.lines() {
        if !in_content {
            if line.trim() == "---" {
                in_content = true;
                continue;
            }
            if let Some((key, value)) = line.split_once(':') {
                headers.push((key.trim().to_string(), value.trim().to_string()));
            }
            continue;
        }
        content.push_str(line);
        content.push('\n');
    }

    let file = header(&headers, "file")
        .ok_or_else(|| EngineError::Validation("kb-update: missing 'file' header".into()))?
        .to_string();
    let action = header(&headers, "action")
        .and_then(KbAction::parse)
        .ok_or_else(|| EngineError::Validation("kb-update: missing or invalid 'action'".into()))?;
    let tier = header(&headers, "tier")
        .and_then(KbTier::parse)
        .ok_or_else(|| EngineError::Validation("kb-update: missing or invalid 'tier'".into()))?;
    let mode = header(&headers, "mode")
        .and_then(WriteMode::parse)
        .ok_or_else(|| EngineError::Validation("kb-update: missing or invalid 'mode'".into()))?;

    let proposal = KbUpdateProposal {
        file,
        action,
        tier,
        mode,
        basis: header(&headers, "basis").unwrap_or("").to_string(),
        reasoning: header(&headers, "reasoning").unwrap_or("").to_string(),
        confirm: header(&headers, "confirm").map(|s| s.to_string()),
        content,
    };
    validate_proposal(&proposal)?;
    Ok(proposal)
}

// ── Validation ─────────────────────────────────────────────────────────────

fn validate_proposal(proposal: &KbUpdateProposal) -> EngineResult<()> {
    // Tier constrains write modes: structural accepts only patches.
    match proposal.tier {
        KbTier::Structural => {
            if proposal.mode != WriteMode::Patch {
                return Err(EngineError::Validation(
                    "structural files accept only mode: patch".into(),
                ));
            }
        }
        _ => {
            if proposal.mode == WriteMode::Patch {
                return Err(EngineError::Validation(format!(
                    "{} files accept mode: full or append",
                    proposal.tier.as_str()
                )));
            }
        }
    }

    if proposal.file.contains('\0') || proposal.content.contains('\0') {
        return Err(EngineError::Validation("kb-update: null bytes present".into()));
    }

    // Deletes need the explicit confirmation token naming the file.
    if proposal.action == KbAction::Delete {
        let filename = Path::new(&proposal.file)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("");
        let expected = format!("DELETE {filename}");
        if proposal.confirm.as_deref() != Some(expected.as_str()) {
            return Err(EngineError::Validation(format!(
                "kb-update delete requires 'confirm: {expected}'"
            )));
        }
    }

    validate_relative_path(&proposal.file)?;
    Ok(())
}

/// The path must stay inside the KB root by construction: relative, no
/// parent traversal, allow-listed extension.
fn validate_relative_path(file: &str) -> EngineResult<()> {
    let path = Path::new(file);
    if path.is_absolute() {
        return Err(EngineError::Validation("kb-update: path must be relative".into()));
    }
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            _ => {
                return Err(EngineError::Validation(
                    "kb-update: path escapes the KB root".into(),
                ))
            }
        }
    }
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    if !ALLOWED_EXTENSIONS.contains(&extension) {
        return Err(EngineError::Validation(format!(
            "kb-update: extension '.{extension}' is not allowed"
        )));
    }
    Ok(())
}

/// Resolve a proposal path against the KB root, refusing symlinks that
/// point outside it. Used at apply time, when the filesystem is in play.
pub fn resolve_in_root(kb_root: &Path, file: &str) -> EngineResult<PathBuf> {
    validate_relative_path(file)?;
    let joined = kb_root.join(file);
    // Canonicalize the deepest existing ancestor; a symlinked parent that
    // leaves the root is rejected even before the file exists.
    let mut probe = joined.clone();
    let resolved = loop {
        match probe.canonicalize() {
            Ok(real) => break real,
            Err(_) => match probe.parent() {
                Some(parent) => probe = parent.to_path_buf(),
                None => return Err(EngineError::Validation("kb-update: unresolvable path".into())),
            },
        }
    };
    let root = kb_root
        .canonicalize()
        .map_err(|e| EngineError::Validation(format!("KB root unavailable: {e}")))?;
    if !resolved.starts_with(&root) {
        return Err(EngineError::Validation(
            "kb-update: path resolves outside the KB root".into(),
        ));
    }
    Ok(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(headers: &str, content: &str) -> String {
        format!("{headers}\n---\n{content}")
    }

    #[test]
    fn full_update_parses() {
        let body = block(
            "file: notes/status.md\naction: update\ntier: status\nmode: full\nbasis: weekly sync\nreasoning: stale status lines",
            "# Status\nAll green.\n",
        );
        let proposal = parse_kb_update(&body).unwrap();
        assert_eq!(proposal.file, "notes/status.md");
        assert_eq!(proposal.action, KbAction::Update);
        assert_eq!(proposal.mode, WriteMode::Full);
        assert_eq!(proposal.content, "# Status\nAll green.\n");
    }

    #[test]
    fn structural_rejects_full_and_accepts_patch() {
        let full = block("file: map.md\naction: update\ntier: structural\nmode: full", "x");
        assert!(parse_kb_update(&full).is_err());
        let patch = block("file: map.md\naction: update\ntier: structural\nmode: patch", "@@ -1 +1 @@");
        assert!(parse_kb_update(&patch).is_ok());
    }

    #[test]
    fn non_structural_rejects_patch() {
        let body = block("file: a.md\naction: update\ntier: general\nmode: patch", "x");
        assert!(parse_kb_update(&body).is_err());
    }

    #[test]
    fn delete_requires_matching_confirm_token() {
        let without = block("file: old/notes.md\naction: delete\ntier: general\nmode: full", "");
        assert!(parse_kb_update(&without).is_err());

        let wrong = block(
            "file: old/notes.md\naction: delete\ntier: general\nmode: full\nconfirm: DELETE other.md",
            "",
        );
        assert!(parse_kb_update(&wrong).is_err());

        let right = block(
            "file: old/notes.md\naction: delete\ntier: general\nmode: full\nconfirm: DELETE notes.md",
            "",
        );
        assert!(parse_kb_update(&right).is_ok());
    }

    #[test]
    fn traversal_and_absolute_paths_are_rejected() {
        for file in ["../escape.md", "a/../../b.md", "/etc/passwd.md"] {
            let body = block(
                &format!("file: {file}\naction: update\ntier: general\nmode: full"),
                "x",
            );
            assert!(parse_kb_update(&body).is_err(), "accepted {file}");
        }
    }

    #[test]
    fn extension_allow_list_is_enforced() {
        let bad = block("file: run.sh\naction: create\ntier: general\nmode: full", "x");
        assert!(parse_kb_update(&bad).is_err());
        for ok in ["a.md", "a.mdx", "a.json", "a.txt", "a.yaml", "a.yml"] {
            let body = block(
                &format!("file: {ok}\naction: create\ntier: general\nmode: full"),
                "x",
            );
            assert!(parse_kb_update(&body).is_ok(), "rejected {ok}");
        }
    }

    #[test]
    fn null_bytes_are_rejected() {
        let body = block("file: a.md\naction: create\ntier: general\nmode: full", "bad\0byte");
        assert!(parse_kb_update(&body).is_err());
    }

    #[test]
    fn symlink_resolution_stays_in_root() {
        let root = std::env::temp_dir().join(format!("lorekeep-kb-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(root.join("sub")).unwrap();
        assert!(resolve_in_root(&root, "sub/notes.md").is_ok());

        #[cfg(unix)]
        {
            let outside = std::env::temp_dir().join(format!("lorekeep-out-{}", uuid::Uuid::new_v4()));
            std::fs::create_dir_all(&outside).unwrap();
            std::os::unix::fs::symlink(&outside, root.join("link")).unwrap();
            assert!(resolve_in_root(&root, "link/notes.md").is_err());
        }
    }
}
