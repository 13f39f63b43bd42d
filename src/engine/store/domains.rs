use super::{now_rfc3339, Store};
use crate::atoms::error::EngineResult;
use crate::engine::types::Domain;
use rusqlite::{params, OptionalExtension, Row};

fn row_to_domain(row: &Row<'_>) -> rusqlite::Result<Domain> {
    Ok(Domain {
        id: row.get(0)?,
        name: row.get(1)?,
        kb_root: row.get(2)?,
        provider_override: row.get(3)?,
        model_override: row.get(4)?,
        allow_integrations: row.get::<_, i64>(5)? != 0,
        sort_order: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

const DOMAIN_COLS: &str = "id, name, kb_root, provider_override, model_override, \
     allow_integrations, sort_order, created_at, updated_at";

impl Store {
    // ── Domain CRUD ────────────────────────────────────────────────────

    pub fn create_domain(&self, id: &str, name: &str, kb_root: &str) -> EngineResult<Domain> {
        let conn = self.conn.lock();
        let now = now_rfc3339();
        let sort_order: i64 = conn
            .query_row("SELECT COALESCE(MAX(sort_order), -1) + 1 FROM domains", [], |r| r.get(0))?;
        conn.execute(
            "INSERT INTO domains (id, name, kb_root, sort_order, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![id, name, kb_root, sort_order, now],
        )?;
        Ok(Domain {
            id: id.to_string(),
            name: name.to_string(),
            kb_root: kb_root.to_string(),
            provider_override: None,
            model_override: None,
            allow_integrations: false,
            sort_order,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn get_domain(&self, id: &str) -> EngineResult<Option<Domain>> {
        let conn = self.conn.lock();
        let result = conn
            .query_row(
                &format!("SELECT {DOMAIN_COLS} FROM domains WHERE id = ?1"),
                params![id],
                row_to_domain,
            )
            .optional()?;
        Ok(result)
    }

    pub fn list_domains(&self) -> EngineResult<Vec<Domain>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare(&format!("SELECT {DOMAIN_COLS} FROM domains ORDER BY sort_order"))?;
        let domains = stmt
            .query_map([], row_to_domain)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(domains)
    }

    pub fn update_domain_overrides(
        &self,
        id: &str,
        provider: Option<&str>,
        model: Option<&str>,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE domains SET provider_override = ?1, model_override = ?2,
                 updated_at = ?3 WHERE id = ?4",
            params![provider, model, now_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn set_domain_integrations(&self, id: &str, allow: bool) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE domains SET allow_integrations = ?1, updated_at = ?2 WHERE id = ?3",
            params![allow as i64, now_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Deletes the domain; files, chunks, embeddings, automations, runs,
    /// and sessions cascade.
    pub fn delete_domain(&self, id: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM domains WHERE id = ?1", params![id])?;
        Ok(())
    }
}
