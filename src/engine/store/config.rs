use super::Store;
use crate::atoms::error::EngineResult;
use rusqlite::{params, OptionalExtension};

impl Store {
    // ── Key/value runtime config ───────────────────────────────────────

    pub fn get_config(&self, key: &str) -> EngineResult<Option<String>> {
        let conn = self.conn.lock();
        let result = conn
            .query_row(
                "SELECT value FROM runtime_config WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()?;
        Ok(result)
    }

    pub fn set_config(&self, key: &str, value: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO runtime_config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_overwrites() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.get_config("k").unwrap().is_none());
        store.set_config("k", "v1").unwrap();
        store.set_config("k", "v2").unwrap();
        assert_eq!(store.get_config("k").unwrap().unwrap(), "v2");
    }
}
