// Lorekeep Runtime — Domain KB Indexer
//
// One pass over a domain's files: sync chunk rows, enumerate chunks whose
// embedding is absent or stale (content hash or provider fingerprint
// mismatch), batch-embed, and upsert. Cooperative: the abort flag is
// checked between files and between batches.

use crate::atoms::constants::MIN_EMBED_CHARS;
use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::embedding::EmbeddingClient;
use crate::engine::store::Store;
use crate::engine::types::{ChunkInput, KbTier};
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A file handed to the indexer: already read and chunked by the caller.
pub struct IndexFile {
    pub relative_path: String,
    pub content_hash: String,
    pub size_bytes: i64,
    pub tier: KbTier,
    pub chunks: Vec<ChunkInput>,
}

/// Progress callback: (processed_files, total_files, embedded_chunks, total_chunks).
pub type ProgressFn = dyn Fn(i64, i64, i64, i64) + Send + Sync;

/// Index a domain's KB. Returns (processed_files, embedded_chunks).
pub async fn index_domain_kb(
    store: &Store,
    client: &EmbeddingClient,
    domain_id: &str,
    files: &[IndexFile],
    abort: &Arc<AtomicBool>,
    on_progress: Option<&ProgressFn>,
) -> EngineResult<(i64, i64)> {
    let fingerprint = client.fingerprint();
    let model = client.model_name().to_string();
    let total_files = files.len() as i64;
    let mut processed_files = 0i64;
    let mut embedded_chunks = 0i64;

    // First pass: sync chunk rows so staleness queries see current hashes.
    for file in files {
        if abort.load(Ordering::Relaxed) {
            return Err(EngineError::Cancelled);
        }
        let row = store.upsert_kb_file(
            domain_id,
            &file.relative_path,
            &file.content_hash,
            file.size_bytes,
            file.tier,
        )?;
        store.sync_file_chunks(&row.id, domain_id, &file.content_hash, &file.chunks)?;
        processed_files += 1;
        if let Some(cb) = on_progress {
            cb(processed_files, total_files, 0, 0);
        }
    }

    // Second pass: embed whatever is missing or stale for this client.
    let needing: Vec<_> = store
        .get_chunks_needing_embedding(domain_id, &model, &fingerprint)?
        .into_iter()
        .filter(|c| c.content.len() >= MIN_EMBED_CHARS)
        .collect();
    let total_chunks = needing.len() as i64;
    if total_chunks == 0 {
        info!("[indexer] Domain {} is fully embedded for '{}'", domain_id, model);
        return Ok((processed_files, 0));
    }

    info!(
        "[indexer] Domain {}: {} chunk(s) need embedding with '{}'",
        domain_id, total_chunks, model
    );

    // The client splits on provider batch caps internally; we chunk into
    // upsert-sized groups so progress moves and aborts land quickly.
    for group in needing.chunks(32) {
        if abort.load(Ordering::Relaxed) {
            return Err(EngineError::Cancelled);
        }
        let texts: Vec<String> = group.iter().map(|c| c.content.clone()).collect();
        let vectors = match client.embed_batch(&texts).await {
            Ok(v) => v,
            Err(e) => {
                warn!("[indexer] Batch embed failed for domain {}: {}", domain_id, e);
                return Err(e);
            }
        };
        for (chunk, vector) in group.iter().zip(vectors.iter()) {
            store.upsert_chunk_embedding(
                &chunk.id,
                &model,
                vector,
                &chunk.content_hash,
                &fingerprint,
            )?;
            embedded_chunks += 1;
        }
        if let Some(cb) = on_progress {
            cb(processed_files, total_files, embedded_chunks, total_chunks);
        }
    }

    info!(
        "[indexer] Domain {} indexed: {} file(s), {} chunk(s) embedded",
        domain_id, processed_files, embedded_chunks
    );
    Ok((processed_files, embedded_chunks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mission::hashing::sha256_hex;

    fn file(path: &str, chunks: Vec<(&str, &str)>) -> IndexFile {
        let joined: String = chunks.iter().map(|(_, c)| *c).collect();
        IndexFile {
            relative_path: path.to_string(),
            content_hash: sha256_hex(joined.as_bytes()),
            size_bytes: joined.len() as i64,
            tier: KbTier::General,
            chunks: chunks
                .into_iter()
                .enumerate()
                .map(|(i, (key, content))| ChunkInput {
                    chunk_key: key.to_string(),
                    content: content.to_string(),
                    content_hash: sha256_hex(content.as_bytes()),
                    ordinal: i as i64,
                    heading_path: String::new(),
                    token_estimate: (content.len() / 4) as i64,
                    line_start: None,
                    line_end: None,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn abort_flag_cancels_before_work() {
        let store = Store::open_in_memory().unwrap();
        store.create_domain("d1", "Research", "/kb").unwrap();
        let client = EmbeddingClient::new("http://localhost:1", "m");
        let abort = Arc::new(AtomicBool::new(true));
        let err = index_domain_kb(
            &store,
            &client,
            "d1",
            &[file("a.md", vec![("k", "some chunk content here")])],
            &abort,
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[tokio::test]
    async fn short_chunks_are_never_embedded() {
        let store = Store::open_in_memory().unwrap();
        store.create_domain("d1", "Research", "/kb").unwrap();
        // An unreachable client is fine: the only chunk is below the
        // minimum, so no embed call is attempted.
        let client = EmbeddingClient::new("http://localhost:1", "m");
        let abort = Arc::new(AtomicBool::new(false));
        let (files, embedded) = index_domain_kb(
            &store,
            &client,
            "d1",
            &[file("a.md", vec![("k", "tiny")])],
            &abort,
            None,
        )
        .await
        .unwrap();
        assert_eq!(files, 1);
        assert_eq!(embedded, 0);
    }
}
