use super::{now_rfc3339, Store};
use crate::atoms::error::EngineResult;
use crate::engine::types::{IntakeItem, IntakeSourceType};
use rusqlite::{params, OptionalExtension, Row};

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<IntakeItem> {
    let source_type: String = row.get(1)?;
    let metadata: Option<String> = row.get(9)?;
    Ok(IntakeItem {
        id: row.get(0)?,
        source_type: IntakeSourceType::parse(&source_type).unwrap_or(IntakeSourceType::Manual),
        external_id: row.get(2)?,
        source_url: row.get(3)?,
        title: row.get(4)?,
        content: row.get(5)?,
        extraction_mode: row.get(6)?,
        classification: row.get(7)?,
        status: row.get(8)?,
        metadata: metadata.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: row.get(10)?,
    })
}

const ITEM_COLS: &str = "id, source_type, external_id, source_url, title, content, \
     extraction_mode, classification, status, metadata, created_at";

impl Store {
    // ── Intake items ───────────────────────────────────────────────────

    /// `UNIQUE(source_type, external_id)` surfaces Duplicate to callers.
    #[allow(clippy::too_many_arguments)]
    pub fn create_intake_item(
        &self,
        id: &str,
        source_type: IntakeSourceType,
        external_id: &str,
        source_url: Option<&str>,
        title: &str,
        content: &str,
        extraction_mode: Option<&str>,
        metadata: Option<&serde_json::Value>,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO intake_items
                 (id, source_type, external_id, source_url, title, content,
                  extraction_mode, status, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'new', ?8, ?9)",
            params![
                id,
                source_type.as_str(),
                external_id,
                source_url,
                title,
                content,
                extraction_mode,
                metadata.map(|v| v.to_string()),
                now_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Dedupe-check semantics for `GET /api/intake/check`.
    pub fn intake_item_exists(
        &self,
        source_type: IntakeSourceType,
        external_id: &str,
    ) -> EngineResult<bool> {
        let conn = self.conn.lock();
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM intake_items WHERE source_type = ?1 AND external_id = ?2",
                params![source_type.as_str(), external_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    pub fn get_intake_item(&self, id: &str) -> EngineResult<Option<IntakeItem>> {
        let conn = self.conn.lock();
        let result = conn
            .query_row(
                &format!("SELECT {ITEM_COLS} FROM intake_items WHERE id = ?1"),
                params![id],
                row_to_item,
            )
            .optional()?;
        Ok(result)
    }

    pub fn set_intake_classification(
        &self,
        id: &str,
        classification: &str,
        status: &str,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE intake_items SET classification = ?1, status = ?2 WHERE id = ?3",
            params![classification, status, id],
        )?;
        Ok(())
    }
}
