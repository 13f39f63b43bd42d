use super::{now_rfc3339, Store};
use crate::atoms::error::EngineResult;
use crate::engine::types::{ChunkInput, KbChunk, KbFile, KbTier};
use log::info;
use rusqlite::{params, OptionalExtension, Row};
use std::collections::HashMap;

fn row_to_file(row: &Row<'_>) -> rusqlite::Result<KbFile> {
    let tier: String = row.get(6)?;
    Ok(KbFile {
        id: row.get(0)?,
        domain_id: row.get(1)?,
        relative_path: row.get(2)?,
        content_hash: row.get(3)?,
        size_bytes: row.get(4)?,
        last_synced_at: row.get(5)?,
        tier: KbTier::parse(&tier).unwrap_or(KbTier::General),
    })
}

fn row_to_chunk(row: &Row<'_>) -> rusqlite::Result<KbChunk> {
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
}

const FILE_COLS: &str =
    "id, domain_id, relative_path, content_hash, size_bytes, last_synced_at, tier";
const CHUNK_COLS: &str = "id, kb_file_id, domain_id, chunk_key, content, content_hash, \
     file_content_hash, ordinal, heading_path, char_count, token_estimate, line_start, line_end";

impl Store {
    // ── KB files ───────────────────────────────────────────────────────

    /// Insert or update the file row for `(domain_id, relative_path)`.
    pub fn upsert_kb_file(
        &self,
        domain_id: &str,
        relative_path: &str,
        content_hash: &str,
        size_bytes: i64,
        tier: KbTier,
    ) -> EngineResult<KbFile> {
        let conn = self.conn.lock();
        let now = now_rfc3339();

        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM kb_files WHERE domain_id = ?1 AND relative_path = ?2",
                params![domain_id, relative_path],
                |r| r.get(0),
            )
            .optional()?;

        let id = match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE kb_files SET content_hash = ?1, size_bytes = ?2,
                         last_synced_at = ?3, tier = ?4 WHERE id = ?5",
                    params![content_hash, size_bytes, now, tier.as_str(), id],
                )?;
                id
            }
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                conn.execute(
                    "INSERT INTO kb_files
                         (id, domain_id, relative_path, content_hash, size_bytes, last_synced_at, tier)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![id, domain_id, relative_path, content_hash, size_bytes, now, tier.as_str()],
                )?;
                id
            }
        };

        Ok(KbFile {
            id,
            domain_id: domain_id.to_string(),
            relative_path: relative_path.to_string(),
            content_hash: content_hash.to_string(),
            size_bytes,
            last_synced_at: now,
            tier,
        })
    }

    pub fn get_kb_file(&self, domain_id: &str, relative_path: &str) -> EngineResult<Option<KbFile>> {
        let conn = self.conn.lock();
        let result = conn
            .query_row(
                &format!("SELECT {FILE_COLS} FROM kb_files WHERE domain_id = ?1 AND relative_path = ?2"),
                params![domain_id, relative_path],
                row_to_file,
            )
            .optional()?;
        Ok(result)
    }

    pub fn list_kb_files(&self, domain_id: &str) -> EngineResult<Vec<KbFile>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {FILE_COLS} FROM kb_files WHERE domain_id = ?1 ORDER BY relative_path"
        ))?;
        let files = stmt
            .query_map(params![domain_id], row_to_file)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(files)
    }

    /// Chunks and embeddings cascade.
    pub fn delete_kb_file(&self, id: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM kb_files WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ── Chunk sync ─────────────────────────────────────────────────────

    /// Reconcile a file's chunk rows against a fresh chunking pass.
    /// Chunks are matched by `chunk_key`: equal-hash chunks are preserved
    /// (their embeddings stay valid), changed chunks are updated in place,
    /// and keys absent from the new set are deleted (embeddings cascade).
    /// Returns (inserted, updated, deleted).
    pub fn sync_file_chunks(
        &self,
        kb_file_id: &str,
        domain_id: &str,
        file_content_hash: &str,
        chunks: &[ChunkInput],
    ) -> EngineResult<(usize, usize, usize)> {
        let conn = self.conn.lock();

        let mut existing: HashMap<String, (String, String)> = HashMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT chunk_key, id, content_hash FROM kb_chunks WHERE kb_file_id = ?1",
            )?;
            let rows = stmt.query_map(params![kb_file_id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?))
            })?;
            for row in rows {
                let (key, id, hash) = row?;
                existing.insert(key, (id, hash));
            }
        }

        let mut inserted = 0usize;
        let mut updated = 0usize;

        for chunk in chunks {
            match existing.remove(&chunk.chunk_key) {
                Some((id, old_hash)) => {
                    if old_hash == chunk.content_hash {
                        // Content unchanged — refresh positional metadata only.
                        conn.execute(
                            "UPDATE kb_chunks SET file_content_hash = ?1, ordinal = ?2,
                                 heading_path = ?3, line_start = ?4, line_end = ?5
                             WHERE id = ?6",
                            params![
                                file_content_hash,
                                chunk.ordinal,
                                chunk.heading_path,
                                chunk.line_start,
                                chunk.line_end,
                                id
                            ],
                        )?;
                    } else {
                        conn.execute(
                            "UPDATE kb_chunks SET content = ?1, content_hash = ?2,
                                 file_content_hash = ?3, ordinal = ?4, heading_path = ?5,
                                 char_count = ?6, token_estimate = ?7,
                                 line_start = ?8, line_end = ?9
                             WHERE id = ?10",
                            params![
                                chunk.content,
                                chunk.content_hash,
                                file_content_hash,
                                chunk.ordinal,
                                chunk.heading_path,
                                chunk.content.chars().count() as i64,
                                chunk.token_estimate,
                                chunk.line_start,
                                chunk.line_end,
                                id
                            ],
                        )?;
                        updated += 1;
                    }
                }
                None => {
                    let id = uuid::Uuid::new_v4().to_string();
                    conn.execute(
                        "INSERT INTO kb_chunks
                             (id, kb_file_id, domain_id, chunk_key, content, content_hash,
                              file_content_hash, ordinal, heading_path, char_count,
                              token_estimate, line_start, line_end)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                        params![
                            id,
                            kb_file_id,
                            domain_id,
                            chunk.chunk_key,
                            chunk.content,
                            chunk.content_hash,
                            file_content_hash,
                            chunk.ordinal,
                            chunk.heading_path,
                            chunk.content.chars().count() as i64,
                            chunk.token_estimate,
                            chunk.line_start,
                            chunk.line_end
                        ],
                    )?;
                    inserted += 1;
                }
            }
        }

        // Whatever is left in `existing` was not re-produced by the chunker.
        let deleted = existing.len();
        for (_, (id, _)) in existing {
            conn.execute("DELETE FROM kb_chunks WHERE id = ?1", params![id])?;
        }

        if inserted + updated + deleted > 0 {
            info!(
                "[store] Chunk sync for file {}: +{} ~{} -{}",
                kb_file_id, inserted, updated, deleted
            );
        }

        Ok((inserted, updated, deleted))
    }

    pub fn list_chunks_for_file(&self, kb_file_id: &str) -> EngineResult<Vec<KbChunk>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHUNK_COLS} FROM kb_chunks WHERE kb_file_id = ?1 ORDER BY ordinal"
        ))?;
        let chunks = stmt
            .query_map(params![kb_file_id], row_to_chunk)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(chunks)
    }

    pub fn list_chunks_for_domain(&self, domain_id: &str) -> EngineResult<Vec<KbChunk>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHUNK_COLS} FROM kb_chunks WHERE domain_id = ?1 ORDER BY kb_file_id, ordinal"
        ))?;
        let chunks = stmt
            .query_map(params![domain_id], row_to_chunk)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(key: &str, content: &str) -> ChunkInput {
        ChunkInput {
            chunk_key: key.to_string(),
            content: content.to_string(),
            content_hash: crate::engine::mission::hashing::sha256_hex(content.as_bytes()),
            ordinal: 0,
            heading_path: String::new(),
            token_estimate: (content.len() / 4) as i64,
            line_start: None,
            line_end: None,
        }
    }

    fn setup() -> (Store, String) {
        let store = Store::open_in_memory().unwrap();
        store.create_domain("d1", "Research", "/kb").unwrap();
        let file = store
            .upsert_kb_file("d1", "notes/status.md", "hash-v1", 100, KbTier::Status)
            .unwrap();
        (store, file.id)
    }

    #[test]
    fn sync_inserts_updates_and_deletes_by_key() {
        let (store, file_id) = setup();

        let v1 = vec![chunk("intro", "alpha"), chunk("body", "bravo")];
        let (ins, upd, del) = store.sync_file_chunks(&file_id, "d1", "fh1", &v1).unwrap();
        assert_eq!((ins, upd, del), (2, 0, 0));

        // "intro" unchanged, "body" changed, "tail" new, nothing matches "body"? —
        // second pass drops nothing; third drops "intro".
        let v2 = vec![chunk("intro", "alpha"), chunk("body", "bravo-2"), chunk("tail", "charlie")];
        let (ins, upd, del) = store.sync_file_chunks(&file_id, "d1", "fh2", &v2).unwrap();
        assert_eq!((ins, upd, del), (1, 1, 0));

        let v3 = vec![chunk("body", "bravo-2"), chunk("tail", "charlie")];
        let (ins, upd, del) = store.sync_file_chunks(&file_id, "d1", "fh3", &v3).unwrap();
        assert_eq!((ins, upd, del), (0, 0, 1));

        let chunks = store.list_chunks_for_file(&file_id).unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.chunk_key != "intro"));
    }

    #[test]
    fn unchanged_chunk_keeps_its_row_id() {
        let (store, file_id) = setup();
        store
            .sync_file_chunks(&file_id, "d1", "fh1", &[chunk("intro", "alpha")])
            .unwrap();
        let before = store.list_chunks_for_file(&file_id).unwrap();
        store
            .sync_file_chunks(&file_id, "d1", "fh2", &[chunk("intro", "alpha")])
            .unwrap();
        let after = store.list_chunks_for_file(&file_id).unwrap();
        assert_eq!(before[0].id, after[0].id);
        assert_eq!(after[0].file_content_hash, "fh2");
    }
}
