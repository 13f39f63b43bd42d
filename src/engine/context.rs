// Lorekeep Runtime — Vector KB Context Builder
//
// Given a query, stored chunk embeddings, and a token budget, assemble an
// ordered list of file sections for the prompt. Scoring is a plain dot
// product (vectors are L2-normalized at embed time) plus a small boost for
// action-oriented headings. Selection is MMR-lite: greedy best-first with
// fixed same-file penalties in lieu of a second similarity computation.
// When no embeddings are usable, fall back to the string-based KB strategy
// chosen by the active prompt profile.

use crate::engine::embedding::EmbeddingClient;
use crate::engine::store::Store;
use crate::atoms::error::EngineResult;
use log::info;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Minimum effective score a chunk must reach to be considered.
const MIN_SCORE: f32 = 0.3;
/// Additive boost for chunks under action-oriented headings.
const HEADING_BOOST: f32 = 0.1;
/// MMR-lite penalties: same file + matching heading, same file otherwise.
const PENALTY_SAME_FILE_SAME_HEADING: f32 = 0.30;
const PENALTY_SAME_FILE: f32 = 0.10;

static BOOST_HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(STATUS|OPEN GAP|DEADLINE|PRIORITIES|NEXT ACTION|OVERDUE|CRITICAL)\b")
        .expect("boost heading regex")
});

/// Staleness bands derived from file mtime, annotated onto each section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    Fresh,
    Aging,
    Stale,
}

impl Staleness {
    pub fn label(&self) -> &'static str {
        match self {
            Staleness::Fresh => "fresh",
            Staleness::Aging => "aging (>7d)",
            Staleness::Stale => "stale (>30d)",
        }
    }

    pub fn from_age_days(days: i64) -> Self {
        if days > 30 {
            Staleness::Stale
        } else if days > 7 {
            Staleness::Aging
        } else {
            Staleness::Fresh
        }
    }
}

/// A scored retrieval candidate.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub chunk_id: String,
    pub kb_file_id: String,
    pub relative_path: String,
    pub heading_path: String,
    pub content: String,
    pub token_estimate: i64,
    pub effective_score: f32,
}

/// One packed file section in the final context.
#[derive(Debug, Clone)]
pub struct FileSection {
    pub relative_path: String,
    pub staleness: Staleness,
    pub chunks: Vec<Candidate>,
}

/// String-strategy fallback when vectors are unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KbStrategy {
    DigestOnly,
    DigestPlusStructural,
    Full,
}

// ── Scoring & selection ────────────────────────────────────────────────────

/// Score chunks against a normalized query vector and drop those below the
/// threshold. `stored` pairs each embedding with the chunk metadata it
/// belongs to.
pub fn score_candidates(
    query: &[f32],
    stored: &[(Vec<f32>, Candidate)],
) -> Vec<Candidate> {
    let mut scored = Vec::new();
    for (vector, candidate) in stored {
        let raw = dot(query, vector);
        let boost = if BOOST_HEADING_RE.is_match(&candidate.heading_path) {
            HEADING_BOOST
        } else {
            0.0
        };
        let effective = raw + boost;
        if effective >= MIN_SCORE {
            let mut c = candidate.clone();
            c.effective_score = effective;
            scored.push(c);
        }
    }
    scored
}

/// MMR-lite greedy selection. Repeatedly pick the highest-scoring unused
/// candidate; after each pick, penalize remaining candidates from the same
/// file — 0.30 when the heading path matches too, 0.10 otherwise.
pub fn select_diverse(mut candidates: Vec<Candidate>, top_k: usize) -> Vec<Candidate> {
    let mut selected = Vec::with_capacity(top_k.min(candidates.len()));
    while selected.len() < top_k && !candidates.is_empty() {
        let best_idx = candidates
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.effective_score
                    .partial_cmp(&b.effective_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(i, _)| i)
            .unwrap();
        let picked = candidates.swap_remove(best_idx);
        for candidate in candidates.iter_mut() {
            if candidate.kb_file_id == picked.kb_file_id {
                if candidate.heading_path == picked.heading_path {
                    candidate.effective_score -= PENALTY_SAME_FILE_SAME_HEADING;
                } else {
                    candidate.effective_score -= PENALTY_SAME_FILE;
                }
            }
        }
        selected.push(picked);
    }
    selected
}

/// Pack selected chunks into per-file sections until the token budget runs
/// out. Selection order decides which chunks make the cut; within a file,
/// chunks keep their selection order.
pub fn pack_sections(
    selected: Vec<Candidate>,
    token_budget: usize,
    staleness_of: &HashMap<String, Staleness>,
) -> Vec<FileSection> {
    let mut sections: Vec<FileSection> = Vec::new();
    let mut spent = 0usize;
    for candidate in selected {
        let cost = candidate.token_estimate.max(0) as usize;
        if spent + cost > token_budget {
            break;
        }
        spent += cost;
        match sections.iter_mut().find(|s| s.relative_path == candidate.relative_path) {
            Some(section) => section.chunks.push(candidate),
            None => {
                let staleness = staleness_of
                    .get(&candidate.relative_path)
                    .copied()
                    .unwrap_or(Staleness::Fresh);
                sections.push(FileSection {
                    relative_path: candidate.relative_path.clone(),
                    staleness,
                    chunks: vec![candidate],
                });
            }
        }
    }
    sections
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

// ── End-to-end assembly ────────────────────────────────────────────────────

/// Build vector context for a query, or None when the domain has no usable
/// embeddings (the caller then applies the string-strategy fallback).
pub async fn build_vector_context(
    store: &Store,
    client: &EmbeddingClient,
    domain_id: &str,
    query: &str,
    top_k: usize,
    token_budget: usize,
    staleness_of: &HashMap<String, Staleness>,
) -> EngineResult<Option<Vec<FileSection>>> {
    let embeddings = store.list_domain_embeddings(domain_id, client.model_name())?;
    if embeddings.is_empty() {
        return Ok(None);
    }

    let query_vec = client.embed(query).await?;

    // Join embeddings to chunk metadata.
    let chunks = store.list_chunks_for_domain(domain_id)?;
    let files = store.list_kb_files(domain_id)?;
    let path_of: HashMap<&str, &str> = files
        .iter()
        .map(|f| (f.id.as_str(), f.relative_path.as_str()))
        .collect();
    let by_id: HashMap<&str, &crate::engine::types::KbChunk> =
        chunks.iter().map(|c| (c.id.as_str(), c)).collect();

    let stored: Vec<(Vec<f32>, Candidate)> = embeddings
        .into_iter()
        .filter_map(|e| {
            let chunk = by_id.get(e.chunk_id.as_str())?;
            Some((
                e.vector,
                Candidate {
                    chunk_id: chunk.id.clone(),
                    kb_file_id: chunk.kb_file_id.clone(),
                    relative_path: path_of
                        .get(chunk.kb_file_id.as_str())
                        .unwrap_or(&"")
                        .to_string(),
                    heading_path: chunk.heading_path.clone(),
                    content: chunk.content.clone(),
                    token_estimate: chunk.token_estimate,
                    effective_score: 0.0,
                },
            ))
        })
        .collect();

    let scored = score_candidates(&query_vec, &stored);
    if scored.is_empty() {
        info!("[context] No chunk cleared min score for domain {}", domain_id);
        return Ok(Some(vec![]));
    }
    let selected = select_diverse(scored, top_k);
    Ok(Some(pack_sections(selected, token_budget, staleness_of)))
}

/// String-strategy fallback. Renders KB files directly: digests only, the
/// digests plus structural files, or everything, per the active profile.
pub fn build_fallback_context(
    store: &Store,
    domain_id: &str,
    strategy: KbStrategy,
    char_budget: usize,
) -> EngineResult<String> {
    let files = store.list_kb_files(domain_id)?;
    let mut out = String::new();
    for file in &files {
        let include = match strategy {
            KbStrategy::DigestOnly => file.relative_path.ends_with("DIGEST.md"),
            KbStrategy::DigestPlusStructural => {
                file.relative_path.ends_with("DIGEST.md")
                    || file.tier == crate::engine::types::KbTier::Structural
            }
            KbStrategy::Full => true,
        };
        if !include {
            continue;
        }
        for chunk in store.list_chunks_for_file(&file.id)? {
            if out.len() + chunk.content.len() > char_budget {
                return Ok(out);
            }
            out.push_str(&chunk.content);
            out.push('\n');
        }
    }
    Ok(out)
}

/// Render packed sections into prompt text, one annotated block per file.
pub fn render_sections(sections: &[FileSection]) -> String {
    let mut out = String::new();
    for section in sections {
        out.push_str(&format!(
            "### {} [{}]\n",
            section.relative_path,
            section.staleness.label()
        ));
        for chunk in &section.chunks {
            if !chunk.heading_path.is_empty() {
                out.push_str(&format!("> {}\n", chunk.heading_path));
            }
            out.push_str(&chunk.content);
            out.push_str("\n\n");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, file: &str, heading: &str, tokens: i64) -> Candidate {
        Candidate {
            chunk_id: id.to_string(),
            kb_file_id: file.to_string(),
            relative_path: format!("{file}.md"),
            heading_path: heading.to_string(),
            content: format!("content of {id}"),
            token_estimate: tokens,
            effective_score: 0.0,
        }
    }

    fn with_score(mut c: Candidate, score: f32) -> Candidate {
        c.effective_score = score;
        c
    }

    #[test]
    fn heading_boost_applies_word_bounded() {
        let query = vec![1.0, 0.0];
        let stored = vec![
            (vec![0.5, 0.0], candidate("a", "f1", "Project STATUS", 10)),
            (vec![0.5, 0.0], candidate("b", "f1", "statistics", 10)),
        ];
        let scored = score_candidates(&query, &stored);
        let a = scored.iter().find(|c| c.chunk_id == "a").unwrap();
        let b = scored.iter().find(|c| c.chunk_id == "b").unwrap();
        assert!((a.effective_score - 0.6).abs() < 1e-6);
        // "statistics" must not match \bSTATUS\b.
        assert!((b.effective_score - 0.5).abs() < 1e-6);
    }

    #[test]
    fn below_threshold_candidates_are_dropped() {
        let query = vec![1.0, 0.0];
        let stored = vec![(vec![0.2, 0.0], candidate("a", "f1", "", 10))];
        assert!(score_candidates(&query, &stored).is_empty());
    }

    #[test]
    fn same_file_same_heading_penalty_is_030() {
        // Two candidates share file and heading; both outscore a third from
        // another file. After the first pick, the sibling drops by exactly
        // 0.30 and loses to the other file's candidate.
        let candidates = vec![
            with_score(candidate("a", "f1", "## DEADLINE", 10), 0.9),
            with_score(candidate("b", "f1", "## DEADLINE", 10), 0.8),
            with_score(candidate("c", "f2", "## Notes", 10), 0.6),
        ];
        let selected = select_diverse(candidates, 3);
        assert_eq!(selected[0].chunk_id, "a");
        assert_eq!(selected[1].chunk_id, "c");
        assert_eq!(selected[2].chunk_id, "b");
        // b's score at selection time reflects the 0.30 penalty.
        assert!((selected[2].effective_score - 0.5).abs() < 1e-6);
    }

    #[test]
    fn same_file_different_heading_penalty_is_010() {
        let candidates = vec![
            with_score(candidate("a", "f1", "## Alpha", 10), 0.9),
            with_score(candidate("b", "f1", "## Beta", 10), 0.8),
        ];
        let selected = select_diverse(candidates, 2);
        assert!((selected[1].effective_score - 0.7).abs() < 1e-6);
    }

    #[test]
    fn packing_respects_token_budget() {
        let selected = vec![
            with_score(candidate("a", "f1", "", 40), 0.9),
            with_score(candidate("b", "f2", "", 40), 0.8),
            with_score(candidate("c", "f3", "", 40), 0.7),
        ];
        let sections = pack_sections(selected, 90, &HashMap::new());
        let total: usize = sections.iter().map(|s| s.chunks.len()).sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn sections_group_by_file_with_staleness() {
        let selected = vec![
            with_score(candidate("a", "f1", "", 10), 0.9),
            with_score(candidate("b", "f2", "", 10), 0.8),
            with_score(candidate("c", "f1", "", 10), 0.7),
        ];
        let mut staleness = HashMap::new();
        staleness.insert("f1.md".to_string(), Staleness::Stale);
        let sections = pack_sections(selected, 1000, &staleness);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].relative_path, "f1.md");
        assert_eq!(sections[0].chunks.len(), 2);
        assert_eq!(sections[0].staleness, Staleness::Stale);
        assert_eq!(sections[1].staleness, Staleness::Fresh);
    }

    #[test]
    fn staleness_bands() {
        assert_eq!(Staleness::from_age_days(0), Staleness::Fresh);
        assert_eq!(Staleness::from_age_days(8), Staleness::Aging);
        assert_eq!(Staleness::from_age_days(31), Staleness::Stale);
    }
}
