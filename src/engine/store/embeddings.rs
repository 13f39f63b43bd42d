use super::{now_rfc3339, Store};
use crate::atoms::error::EngineResult;
use crate::engine::types::{ChunkEmbedding, EmbeddingJob, JobStatus, KbChunk};
use rusqlite::{params, OptionalExtension, Row};

// ── Vector blob codec ──────────────────────────────────────────────────────

/// Convert a byte slice (from a SQLite BLOB) to a Vec<f32>.
pub fn bytes_to_f32_vec(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Convert a Vec<f32> to bytes for SQLite BLOB storage (little-endian).
pub fn f32_vec_to_bytes(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn row_to_embedding(row: &Row<'_>) -> rusqlite::Result<ChunkEmbedding> {
    let blob: Vec<u8> = row.get(4)?;
    Ok(ChunkEmbedding {
        id: row.get(0)?,
        chunk_id: row.get(1)?,
        model_name: row.get(2)?,
        dimensions: row.get(3)?,
        vector: bytes_to_f32_vec(&blob),
        content_hash: row.get(5)?,
        provider_fingerprint: row.get(6)?,
        created_at: row.get(7)?,
    })
}

const EMB_COLS: &str =
    "id, chunk_id, model_name, dimensions, vector, content_hash, provider_fingerprint, created_at";

impl Store {
    // ── Chunk embeddings ───────────────────────────────────────────────

    /// Upsert is DELETE+INSERT per the `UNIQUE(chunk_id, model_name)` identity.
    pub fn upsert_chunk_embedding(
        &self,
        chunk_id: &str,
        model_name: &str,
        vector: &[f32],
        content_hash: &str,
        provider_fingerprint: &str,
    ) -> EngineResult<String> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM chunk_embeddings WHERE chunk_id = ?1 AND model_name = ?2",
            params![chunk_id, model_name],
        )?;
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO chunk_embeddings
                 (id, chunk_id, model_name, dimensions, vector, content_hash,
                  provider_fingerprint, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                chunk_id,
                model_name,
                vector.len() as i64,
                f32_vec_to_bytes(vector),
                content_hash,
                provider_fingerprint,
                now_rfc3339()
            ],
        )?;
        Ok(id)
    }

    pub fn get_chunk_embedding(
        &self,
        chunk_id: &str,
        model_name: &str,
    ) -> EngineResult<Option<ChunkEmbedding>> {
        let conn = self.conn.lock();
        let result = conn
            .query_row(
                &format!(
                    "SELECT {EMB_COLS} FROM chunk_embeddings
                     WHERE chunk_id = ?1 AND model_name = ?2"
                ),
                params![chunk_id, model_name],
                row_to_embedding,
            )
            .optional()?;
        Ok(result)
    }

    /// All embeddings for a domain under one model, joined to their chunks.
    pub fn list_domain_embeddings(
        &self,
        domain_id: &str,
        model_name: &str,
    ) -> EngineResult<Vec<ChunkEmbedding>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT e.id, e.chunk_id, e.model_name, e.dimensions, e.vector,
                    e.content_hash, e.provider_fingerprint, e.created_at
             FROM chunk_embeddings e
             JOIN kb_chunks c ON c.id = e.chunk_id
             WHERE c.domain_id = ?1 AND e.model_name = ?2",
        )?;
        let embeddings = stmt
            .query_map(params![domain_id, model_name], row_to_embedding)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(embeddings)
    }

    /// Chunks whose embedding is absent, or stale: the stored
    /// `content_hash` no longer matches the chunk, or the stored
    /// fingerprint differs from the active client's.
    pub fn get_chunks_needing_embedding(
        &self,
        domain_id: &str,
        model_name: &str,
        provider_fingerprint: &str,
    ) -> EngineResult<Vec<KbChunk>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT c.id, c.kb_file_id, c.domain_id, c.chunk_key, c.content,
                    c.content_hash, c.file_content_hash, c.ordinal, c.heading_path,
                    c.char_count, c.token_estimate, c.line_start, c.line_end
             FROM kb_chunks c
             LEFT JOIN chunk_embeddings e
                 ON e.chunk_id = c.id AND e.model_name = ?2
             WHERE c.domain_id = ?1
               AND (e.id IS NULL
                    OR e.content_hash != c.content_hash
                    OR e.provider_fingerprint != ?3)
             ORDER BY c.kb_file_id, c.ordinal",
        )?;
        let chunks = stmt
            .query_map(params![domain_id, model_name, provider_fingerprint], |row| {
                Ok(KbChunk {
                    id: row.get(0)?,
                    kb_file_id: row.get(1)?,
                    domain_id: row.get(2)?,
                    chunk_key: row.get(3)?,
                    content: row.get(4)?,
                    content_hash: row.get(5)?,
                    file_content_hash: row.get(6)?,
                    ordinal: row.get(7)?,
                    heading_path: row.get(8)?,
                    char_count: row.get(9)?,
                    token_estimate: row.get(10)?,
                    line_start: row.get(11)?,
                    line_end: row.get(12)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(chunks)
    }

    // ── Embedding jobs ─────────────────────────────────────────────────

    pub fn upsert_embedding_job(&self, job: &EmbeddingJob) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO embedding_jobs
                 (domain_id, model_name, status, total_files, processed_files,
                  total_chunks, embedded_chunks, last_error, provider_fingerprint,
                  started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(domain_id, model_name) DO UPDATE SET
                 status = excluded.status,
                 total_files = excluded.total_files,
                 processed_files = excluded.processed_files,
                 total_chunks = excluded.total_chunks,
                 embedded_chunks = excluded.embedded_chunks,
                 last_error = excluded.last_error,
                 provider_fingerprint = excluded.provider_fingerprint,
                 started_at = excluded.started_at,
                 finished_at = excluded.finished_at",
            params![
                job.domain_id,
                job.model_name,
                job.status.as_str(),
                job.total_files,
                job.processed_files,
                job.total_chunks,
                job.embedded_chunks,
                job.last_error,
                job.provider_fingerprint,
                job.started_at,
                job.finished_at
            ],
        )?;
        Ok(())
    }

    pub fn get_embedding_job(
        &self,
        domain_id: &str,
        model_name: &str,
    ) -> EngineResult<Option<EmbeddingJob>> {
        let conn = self.conn.lock();
        let result = conn
            .query_row(
                "SELECT domain_id, model_name, status, total_files, processed_files,
                        total_chunks, embedded_chunks, last_error, provider_fingerprint,
                        started_at, finished_at
                 FROM embedding_jobs WHERE domain_id = ?1 AND model_name = ?2",
                params![domain_id, model_name],
                |row| {
                    let status: String = row.get(2)?;
                    Ok(EmbeddingJob {
                        domain_id: row.get(0)?,
                        model_name: row.get(1)?,
                        status: JobStatus::parse(&status).unwrap_or(JobStatus::Idle),
                        total_files: row.get(3)?,
                        processed_files: row.get(4)?,
                        total_chunks: row.get(5)?,
                        embedded_chunks: row.get(6)?,
                        last_error: row.get(7)?,
                        provider_fingerprint: row.get(8)?,
                        started_at: row.get(9)?,
                        finished_at: row.get(10)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{ChunkInput, KbTier};

    fn chunk(key: &str, content: &str) -> ChunkInput {
        ChunkInput {
            chunk_key: key.to_string(),
            content: content.to_string(),
            content_hash: crate::engine::mission::hashing::sha256_hex(content.as_bytes()),
            ordinal: 0,
            heading_path: String::new(),
            token_estimate: 4,
            line_start: None,
            line_end: None,
        }
    }

    fn setup() -> (Store, String) {
        let store = Store::open_in_memory().unwrap();
        store.create_domain("d1", "Research", "/kb").unwrap();
        let file = store
            .upsert_kb_file("d1", "a.md", "fh1", 10, KbTier::General)
            .unwrap();
        (store, file.id)
    }

    #[test]
    fn blob_codec_round_trips() {
        let v = vec![0.25f32, -1.5, 3.75];
        assert_eq!(bytes_to_f32_vec(&f32_vec_to_bytes(&v)), v);
    }

    #[test]
    fn upsert_is_delete_plus_insert() {
        let (store, file_id) = setup();
        store.sync_file_chunks(&file_id, "d1", "fh1", &[chunk("k", "hello world")]).unwrap();
        let c = &store.list_chunks_for_file(&file_id).unwrap()[0];

        store
            .upsert_chunk_embedding(&c.id, "embed-v1", &[1.0, 0.0], &c.content_hash, "ollama:embed-v1:1")
            .unwrap();
        store
            .upsert_chunk_embedding(&c.id, "embed-v1", &[0.0, 1.0], &c.content_hash, "ollama:embed-v1:1")
            .unwrap();

        let count: i64 = store
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM chunk_embeddings", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
        let e = store.get_chunk_embedding(&c.id, "embed-v1").unwrap().unwrap();
        assert_eq!(e.vector, vec![0.0, 1.0]);
    }

    #[test]
    fn changed_hash_marks_chunk_stale() {
        let (store, file_id) = setup();
        store.sync_file_chunks(&file_id, "d1", "fh1", &[chunk("k", "hello world")]).unwrap();
        let c = &store.list_chunks_for_file(&file_id).unwrap()[0];
        store
            .upsert_chunk_embedding(&c.id, "m", &[1.0], &c.content_hash, "fp")
            .unwrap();

        assert!(store.get_chunks_needing_embedding("d1", "m", "fp").unwrap().is_empty());

        // Re-sync with new content: the embedding's snapshot hash no longer matches.
        store.sync_file_chunks(&file_id, "d1", "fh2", &[chunk("k", "hello again")]).unwrap();
        let stale = store.get_chunks_needing_embedding("d1", "m", "fp").unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].chunk_key, "k");
    }

    #[test]
    fn fingerprint_change_marks_chunk_stale() {
        let (store, file_id) = setup();
        store.sync_file_chunks(&file_id, "d1", "fh1", &[chunk("k", "hello world")]).unwrap();
        let c = &store.list_chunks_for_file(&file_id).unwrap()[0];
        store
            .upsert_chunk_embedding(&c.id, "m", &[1.0], &c.content_hash, "vendor:m:v1")
            .unwrap();

        assert!(store.get_chunks_needing_embedding("d1", "m", "vendor:m:v1").unwrap().is_empty());
        // A silent model swap shows up as a fingerprint mismatch.
        let stale = store.get_chunks_needing_embedding("d1", "m", "vendor:m:v2").unwrap();
        assert_eq!(stale.len(), 1);
    }

    #[test]
    fn deleting_chunks_cascades_embeddings() {
        let (store, file_id) = setup();
        store.sync_file_chunks(&file_id, "d1", "fh1", &[chunk("k", "hello world")]).unwrap();
        let c = &store.list_chunks_for_file(&file_id).unwrap()[0];
        store
            .upsert_chunk_embedding(&c.id, "m", &[1.0], &c.content_hash, "fp")
            .unwrap();

        store.sync_file_chunks(&file_id, "d1", "fh2", &[]).unwrap();
        let count: i64 = store
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM chunk_embeddings", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
