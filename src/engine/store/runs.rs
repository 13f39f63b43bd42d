use super::{now_rfc3339, Store};
use crate::atoms::constants::{
    CRASH_RECOVERY_PENDING_MINS, CRASH_RECOVERY_RUNNING_MINS, RUN_RETENTION_DAYS,
    RUN_RETENTION_KEEP,
};
use crate::atoms::error::EngineResult;
use crate::engine::types::{
    AutomationRun, BusEventKind, RunErrorCode, RunStatus, TriggerKind,
};
use log::info;
use rusqlite::{params, OptionalExtension, Row};

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<AutomationRun> {
    let trigger_kind: String = row.get(3)?;
    let trigger_event: Option<String> = row.get(4)?;
    let trigger_data: Option<String> = row.get(5)?;
    let status: String = row.get(7)?;
    let error_code: Option<String> = row.get(8)?;
    let action_result: Option<String> = row.get(12)?;
    Ok(AutomationRun {
        id: row.get(0)?,
        automation_id: row.get(1)?,
        domain_id: row.get(2)?,
        trigger_kind: TriggerKind::parse(&trigger_kind).unwrap_or(TriggerKind::Manual),
        trigger_event: trigger_event.as_deref().and_then(BusEventKind::parse),
        trigger_data: trigger_data.and_then(|s| serde_json::from_str(&s).ok()),
        dedupe_key: row.get(6)?,
        status: RunStatus::parse(&status).unwrap_or(RunStatus::Pending),
        error_code: error_code.as_deref().and_then(RunErrorCode::parse),
        error_message: row.get(9)?,
        prompt_hash: row.get(10)?,
        response_hash: row.get(11)?,
        action_result: action_result.and_then(|s| serde_json::from_str(&s).ok()),
        action_external_id: row.get(13)?,
        created_at: row.get(14)?,
        started_at: row.get(15)?,
        completed_at: row.get(16)?,
        duration_ms: row.get(17)?,
    })
}

const RUN_COLS: &str = "id, automation_id, domain_id, trigger_kind, trigger_event, trigger_data, \
     dedupe_key, status, error_code, error_message, prompt_hash, response_hash, action_result, \
     action_external_id, created_at, started_at, completed_at, duration_ms";

impl Store {
    // ── Run insert (dedupe point) ──────────────────────────────────────

    /// Insert a pending run. The globally-unique `dedupe_key` makes this
    /// the dedupe point: concurrent inserts with the same key surface
    /// `EngineError::Duplicate` to exactly one loser per extra attempt.
    pub fn try_insert_run(
        &self,
        id: &str,
        automation_id: &str,
        domain_id: &str,
        trigger_kind: TriggerKind,
        trigger_event: Option<BusEventKind>,
        trigger_data: Option<&serde_json::Value>,
        dedupe_key: &str,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO automation_runs
                 (id, automation_id, domain_id, trigger_kind, trigger_event,
                  trigger_data, dedupe_key, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8)",
            params![
                id,
                automation_id,
                domain_id,
                trigger_kind.as_str(),
                trigger_event.map(|e| e.as_str()),
                trigger_data.map(|v| v.to_string()),
                dedupe_key,
                now_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn get_run(&self, id: &str) -> EngineResult<Option<AutomationRun>> {
        let conn = self.conn.lock();
        let result = conn
            .query_row(
                &format!("SELECT {RUN_COLS} FROM automation_runs WHERE id = ?1"),
                params![id],
                row_to_run,
            )
            .optional()?;
        Ok(result)
    }

    pub fn list_runs(&self, automation_id: &str, limit: i64) -> EngineResult<Vec<AutomationRun>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLS} FROM automation_runs
             WHERE automation_id = ?1 ORDER BY created_at DESC LIMIT ?2"
        ))?;
        let runs = stmt
            .query_map(params![automation_id, limit], row_to_run)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    // ── Status transitions ─────────────────────────────────────────────

    /// pending → running. `running` requires a non-null started_at.
    pub fn mark_run_running(&self, id: &str) -> EngineResult<String> {
        let conn = self.conn.lock();
        let now = now_rfc3339();
        conn.execute(
            "UPDATE automation_runs SET status = 'running', started_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        Ok(now)
    }

    pub fn set_run_prompt_hash(&self, id: &str, prompt_hash: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE automation_runs SET prompt_hash = ?1 WHERE id = ?2",
            params![prompt_hash, id],
        )?;
        Ok(())
    }

    /// Terminal transition. duration_ms is derived from started_at when set.
    #[allow(clippy::too_many_arguments)]
    pub fn finalize_run(
        &self,
        id: &str,
        status: RunStatus,
        error_code: Option<RunErrorCode>,
        error_message: Option<&str>,
        response_hash: Option<&str>,
        action_result: Option<&serde_json::Value>,
        action_external_id: Option<&str>,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now();
        let started_at: Option<String> = conn
            .query_row(
                "SELECT started_at FROM automation_runs WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .optional()?
            .flatten();
        let duration_ms = started_at
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|s| (now - s.with_timezone(&chrono::Utc)).num_milliseconds());

        conn.execute(
            "UPDATE automation_runs SET status = ?1, error_code = ?2, error_message = ?3,
                 response_hash = ?4, action_result = ?5, action_external_id = ?6,
                 completed_at = ?7, duration_ms = ?8
             WHERE id = ?9",
            params![
                status.as_str(),
                error_code.map(|c| c.as_str()),
                error_message,
                response_hash,
                action_result.map(|v| v.to_string()),
                action_external_id,
                now.to_rfc3339(),
                duration_ms,
                id
            ],
        )?;
        Ok(())
    }

    // ── Startup jobs ───────────────────────────────────────────────────

    /// Crash recovery: fail runs stranded by a previous process.
    /// `pending` older than 10 min and `running` older than 20 min.
    /// Idempotent — a second invocation touches 0 rows.
    pub fn recover_crashed_runs(&self) -> EngineResult<usize> {
        let conn = self.conn.lock();
        let now = now_rfc3339();
        let pending = conn.execute(
            "UPDATE automation_runs SET status = 'failed', error_code = 'crash_recovery',
                 error_message = 'run stranded in pending at startup', completed_at = ?1
             WHERE status = 'pending'
               AND created_at < datetime('now', ?2)",
            params![now, format!("-{} minutes", CRASH_RECOVERY_PENDING_MINS)],
        )?;
        let running = conn.execute(
            "UPDATE automation_runs SET status = 'failed', error_code = 'crash_recovery',
                 error_message = 'run stranded in running at startup', completed_at = ?1
             WHERE status = 'running'
               AND started_at < datetime('now', ?2)",
            params![now, format!("-{} minutes", CRASH_RECOVERY_RUNNING_MINS)],
        )?;
        let total = pending + running;
        if total > 0 {
            info!("[store] Crash recovery failed {} stranded run(s)", total);
        }
        Ok(total)
    }

    /// Retention: delete runs that are BOTH older than 90 days AND beyond
    /// the newest 200 per automation. Idempotent.
    pub fn cleanup_old_runs(&self) -> EngineResult<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM automation_runs WHERE created_at < datetime('now', ?1)
               AND id NOT IN (
                   SELECT id FROM automation_runs r2
                   WHERE r2.automation_id = automation_runs.automation_id
                   ORDER BY r2.created_at DESC LIMIT ?2
               )",
            params![format!("-{} days", RUN_RETENTION_DAYS), RUN_RETENTION_KEEP],
        )?;
        if deleted > 0 {
            info!("[store] Retention deleted {} old run(s)", deleted);
        }
        Ok(deleted)
    }
}
