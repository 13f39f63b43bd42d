use super::{now_rfc3339, Store};
use crate::atoms::error::EngineResult;
use log::info;
use rusqlite::{params, OptionalExtension};

/// Built-in protocol documents seeded at Runtime::init(). A NULL domain_id
/// row is the shared default; domains may shadow it by name.
const DEFAULT_PROTOCOLS: &[(&str, &str)] = &[
    (
        "kb-update-discipline",
        "Propose KB changes only through fenced kb-update blocks. Structural \
         files take patches; status and intelligence files take full rewrites \
         or appends. Always state the basis for the change.",
    ),
    (
        "escalation",
        "When a decision is blocked on missing information, emit a gap-flag \
         block naming the gap instead of guessing.",
    ),
    (
        "advisory-tone",
        "Advisories are short, concrete, and tied to a deadline or status \
         line in the KB. One advisory per block.",
    ),
];

impl Store {
    // ── Protocols ──────────────────────────────────────────────────────

    /// Idempotent: existing rows (by name, shared scope) are left alone.
    pub fn seed_default_protocols(&self) -> EngineResult<usize> {
        let conn = self.conn.lock();
        let mut seeded = 0usize;
        for (name, body) in DEFAULT_PROTOCOLS {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM protocols WHERE domain_id IS NULL AND name = ?1",
                    params![name],
                    |r| r.get(0),
                )
                .optional()?;
            if exists.is_none() {
                conn.execute(
                    "INSERT INTO protocols (id, domain_id, name, body, builtin, created_at)
                     VALUES (?1, NULL, ?2, ?3, 1, ?4)",
                    params![uuid::Uuid::new_v4().to_string(), name, body, now_rfc3339()],
                )?;
                seeded += 1;
            }
        }
        if seeded > 0 {
            info!("[store] Seeded {} default protocol(s)", seeded);
        }
        Ok(seeded)
    }

    /// Shared protocols plus the domain's own, domain rows shadowing shared
    /// rows of the same name.
    pub fn list_protocols(&self, domain_id: &str) -> EngineResult<Vec<(String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name, body FROM protocols
             WHERE domain_id = ?1
                OR (domain_id IS NULL AND name NOT IN
                    (SELECT name FROM protocols WHERE domain_id = ?1))
             ORDER BY name",
        )?;
        let protocols = stmt
            .query_map(params![domain_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(protocols)
    }
}
