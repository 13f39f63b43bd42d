use super::{now_rfc3339, Store};
use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::types::{
    ContextSnapshot, GateStatus, Mission, MissionActionStatus, MissionRun, MissionRunAction,
    MissionRunGate, MissionRunOutput, MissionRunStatus,
};
use rusqlite::{params, OptionalExtension, Row};

fn row_to_mission(row: &Row<'_>) -> rusqlite::Result<Mission> {
    let definition: String = row.get(2)?;
    let domain_ids: String = row.get(4)?;
    let param_schema: String = row.get(5)?;
    Ok(Mission {
        id: row.get(0)?,
        name: row.get(1)?,
        definition: serde_json::from_str(&definition).unwrap_or_default(),
        enabled: row.get::<_, i64>(3)? != 0,
        domain_ids: serde_json::from_str(&domain_ids).unwrap_or_default(),
        param_schema: serde_json::from_str(&param_schema).unwrap_or_default(),
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn row_to_mission_run(row: &Row<'_>) -> rusqlite::Result<MissionRun> {
    let inputs: String = row.get(4)?;
    let snapshot: Option<String> = row.get(9)?;
    let status: String = row.get(10)?;
    Ok(MissionRun {
        id: row.get(0)?,
        mission_id: row.get(1)?,
        domain_id: row.get(2)?,
        request_id: row.get(3)?,
        inputs: serde_json::from_str(&inputs).unwrap_or_default(),
        definition_hash: row.get(5)?,
        prompt_hash: row.get(6)?,
        model: row.get(7)?,
        provider: row.get(8)?,
        context_snapshot: snapshot.and_then(|s| serde_json::from_str(&s).ok()),
        status: MissionRunStatus::parse(&status).unwrap_or(MissionRunStatus::Pending),
        error: row.get(11)?,
        created_at: row.get(12)?,
        started_at: row.get(13)?,
        completed_at: row.get(14)?,
    })
}

const MISSION_COLS: &str =
    "id, name, definition, enabled, domain_ids, param_schema, created_at, updated_at";
const MISSION_RUN_COLS: &str = "id, mission_id, domain_id, request_id, inputs, definition_hash, \
     prompt_hash, model, provider, context_snapshot, status, error, created_at, started_at, \
     completed_at";

impl Store {
    // ── Missions ───────────────────────────────────────────────────────

    pub fn upsert_mission(&self, mission: &Mission) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO missions (id, name, definition, enabled, domain_ids, param_schema,
                                   created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 definition = excluded.definition,
                 enabled = excluded.enabled,
                 domain_ids = excluded.domain_ids,
                 param_schema = excluded.param_schema,
                 updated_at = excluded.updated_at",
            params![
                mission.id,
                mission.name,
                mission.definition.to_string(),
                mission.enabled as i64,
                serde_json::to_string(&mission.domain_ids)?,
                mission.param_schema.to_string(),
                now_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn get_mission(&self, id: &str) -> EngineResult<Option<Mission>> {
        let conn = self.conn.lock();
        let result = conn
            .query_row(
                &format!("SELECT {MISSION_COLS} FROM missions WHERE id = ?1"),
                params![id],
                row_to_mission,
            )
            .optional()?;
        Ok(result)
    }

    pub fn list_missions(&self) -> EngineResult<Vec<Mission>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {MISSION_COLS} FROM missions ORDER BY name"))?;
        let missions = stmt
            .query_map([], row_to_mission)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(missions)
    }

    // ── Mission runs ───────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn create_mission_run(
        &self,
        id: &str,
        mission_id: &str,
        domain_id: &str,
        request_id: Option<&str>,
        inputs: &serde_json::Value,
        definition_hash: &str,
        model: Option<&str>,
        provider: Option<&str>,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO mission_runs
                 (id, mission_id, domain_id, request_id, inputs, definition_hash,
                  model, provider, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9)",
            params![
                id,
                mission_id,
                domain_id,
                request_id,
                inputs.to_string(),
                definition_hash,
                model,
                provider,
                now_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn get_mission_run(&self, id: &str) -> EngineResult<Option<MissionRun>> {
        let conn = self.conn.lock();
        let result = conn
            .query_row(
                &format!("SELECT {MISSION_RUN_COLS} FROM mission_runs WHERE id = ?1"),
                params![id],
                row_to_mission_run,
            )
            .optional()?;
        Ok(result)
    }

    /// Most recent run created with a caller request id, for cancel-by-request.
    pub fn find_mission_run_by_request(&self, request_id: &str) -> EngineResult<Option<MissionRun>> {
        let conn = self.conn.lock();
        let result = conn
            .query_row(
                &format!(
                    "SELECT {MISSION_RUN_COLS} FROM mission_runs
                     WHERE request_id = ?1 ORDER BY created_at DESC LIMIT 1"
                ),
                params![request_id],
                row_to_mission_run,
            )
            .optional()?;
        Ok(result)
    }

    pub fn update_mission_run_status(
        &self,
        id: &str,
        status: MissionRunStatus,
        error: Option<&str>,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        let now = now_rfc3339();
        match status {
            MissionRunStatus::Running => {
                conn.execute(
                    "UPDATE mission_runs SET status = ?1, error = ?2, started_at = ?3
                     WHERE id = ?4",
                    params![status.as_str(), error, now, id],
                )?;
            }
            MissionRunStatus::Success
            | MissionRunStatus::Failed
            | MissionRunStatus::Cancelled => {
                conn.execute(
                    "UPDATE mission_runs SET status = ?1, error = ?2, completed_at = ?3
                     WHERE id = ?4",
                    params![status.as_str(), error, now, id],
                )?;
            }
            _ => {
                conn.execute(
                    "UPDATE mission_runs SET status = ?1, error = ?2 WHERE id = ?3",
                    params![status.as_str(), error, id],
                )?;
            }
        }
        Ok(())
    }

    pub fn set_mission_run_context(
        &self,
        id: &str,
        prompt_hash: &str,
        snapshot: &ContextSnapshot,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE mission_runs SET prompt_hash = ?1, context_snapshot = ?2 WHERE id = ?3",
            params![prompt_hash, serde_json::to_string(snapshot)?, id],
        )?;
        Ok(())
    }

    // ── Outputs (append-only) ──────────────────────────────────────────

    pub fn append_mission_output(
        &self,
        run_id: &str,
        kind: &str,
        content: &serde_json::Value,
    ) -> EngineResult<String> {
        let conn = self.conn.lock();
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO mission_run_outputs (id, run_id, kind, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, run_id, kind, content.to_string(), now_rfc3339()],
        )?;
        Ok(id)
    }

    pub fn list_mission_outputs(&self, run_id: &str) -> EngineResult<Vec<MissionRunOutput>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, run_id, kind, content, created_at FROM mission_run_outputs
             WHERE run_id = ?1 ORDER BY created_at, id",
        )?;
        let outputs = stmt
            .query_map(params![run_id], |row| {
                let content: String = row.get(3)?;
                Ok(MissionRunOutput {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    kind: row.get(2)?,
                    content: serde_json::from_str(&content).unwrap_or_default(),
                    created_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(outputs)
    }

    // ── Gates ──────────────────────────────────────────────────────────

    /// Create the single pending gate for a run. Refuses a second pending
    /// gate — exactly one may exist at a time.
    pub fn create_mission_gate(
        &self,
        run_id: &str,
        gate_id: &str,
        message: &str,
    ) -> EngineResult<String> {
        let conn = self.conn.lock();
        let pending: i64 = conn.query_row(
            "SELECT COUNT(*) FROM mission_run_gates WHERE run_id = ?1 AND status = 'pending'",
            params![run_id],
            |r| r.get(0),
        )?;
        if pending > 0 {
            return Err(EngineError::Integrity(format!(
                "run {run_id} already has a pending gate"
            )));
        }
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO mission_run_gates (id, run_id, gate_id, message, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            params![id, run_id, gate_id, message, now_rfc3339()],
        )?;
        Ok(id)
    }

    pub fn get_pending_gate(&self, run_id: &str) -> EngineResult<Option<MissionRunGate>> {
        let conn = self.conn.lock();
        let result = conn
            .query_row(
                "SELECT id, run_id, gate_id, message, status, decided_at, created_at
                 FROM mission_run_gates WHERE run_id = ?1 AND status = 'pending'",
                params![run_id],
                |row| {
                    let status: String = row.get(4)?;
                    Ok(MissionRunGate {
                        id: row.get(0)?,
                        run_id: row.get(1)?,
                        gate_id: row.get(2)?,
                        message: row.get(3)?,
                        status: GateStatus::parse(&status).unwrap_or(GateStatus::Pending),
                        decided_at: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    pub fn decide_mission_gate(&self, gate_row_id: &str, status: GateStatus) -> EngineResult<()> {
        if status == GateStatus::Pending {
            return Err(EngineError::Validation("gate decision cannot be pending".into()));
        }
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE mission_run_gates SET status = ?1, decided_at = ?2
             WHERE id = ?3 AND status = 'pending'",
            params![status.as_str(), now_rfc3339(), gate_row_id],
        )?;
        Ok(())
    }

    // ── Actions ────────────────────────────────────────────────────────

    pub fn create_mission_action(
        &self,
        run_id: &str,
        action_type: &str,
        payload: &serde_json::Value,
    ) -> EngineResult<String> {
        let conn = self.conn.lock();
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO mission_run_actions (id, run_id, action_type, payload, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            params![id, run_id, action_type, payload.to_string(), now_rfc3339()],
        )?;
        Ok(id)
    }

    /// Pending actions in insertion order.
    pub fn list_pending_actions(&self, run_id: &str) -> EngineResult<Vec<MissionRunAction>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, run_id, action_type, payload, status, result, error, created_at
             FROM mission_run_actions
             WHERE run_id = ?1 AND status = 'pending'
             ORDER BY created_at, id",
        )?;
        let actions = stmt
            .query_map(params![run_id], |row| {
                let payload: String = row.get(3)?;
                let status: String = row.get(4)?;
                let result: Option<String> = row.get(5)?;
                Ok(MissionRunAction {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    action_type: row.get(2)?,
                    payload: serde_json::from_str(&payload).unwrap_or_default(),
                    status: MissionActionStatus::parse(&status)
                        .unwrap_or(MissionActionStatus::Pending),
                    result: result.and_then(|s| serde_json::from_str(&s).ok()),
                    error: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(actions)
    }

    pub fn resolve_mission_action(
        &self,
        action_id: &str,
        status: MissionActionStatus,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE mission_run_actions SET status = ?1, result = ?2, error = ?3 WHERE id = ?4",
            params![status.as_str(), result.map(|v| v.to_string()), error, action_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> Store {
        let store = Store::open_in_memory().unwrap();
        store.create_domain("d1", "Research", "/kb").unwrap();
        store
            .upsert_mission(&Mission {
                id: "m1".into(),
                name: "weekly review".into(),
                definition: json!({"type": "review"}),
                enabled: true,
                domain_ids: vec!["d1".into()],
                param_schema: json!({"depth": "brief"}),
                created_at: String::new(),
                updated_at: String::new(),
            })
            .unwrap();
        store
            .create_mission_run("run1", "m1", "d1", Some("req-1"), &json!({}), "defhash", None, None)
            .unwrap();
        store
    }

    #[test]
    fn outputs_are_append_only_and_ordered() {
        let store = setup();
        store.append_mission_output("run1", "raw", &json!({"text": "one"})).unwrap();
        store.append_mission_output("run1", "review", &json!({"items": []})).unwrap();
        let outputs = store.list_mission_outputs("run1").unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].kind, "raw");
        assert_eq!(outputs[1].kind, "review");
    }

    #[test]
    fn only_one_pending_gate_at_a_time() {
        let store = setup();
        store.create_mission_gate("run1", "approve-actions", "2 drafts queued").unwrap();
        let err = store.create_mission_gate("run1", "another", "msg").unwrap_err();
        assert!(matches!(err, EngineError::Integrity(_)));
    }

    #[test]
    fn gate_decision_clears_pending() {
        let store = setup();
        let gid = store.create_mission_gate("run1", "g", "msg").unwrap();
        store.decide_mission_gate(&gid, GateStatus::Approved).unwrap();
        assert!(store.get_pending_gate("run1").unwrap().is_none());
        // A new gate may now be created.
        store.create_mission_gate("run1", "g2", "msg").unwrap();
    }

    #[test]
    fn pending_actions_come_back_in_insertion_order() {
        let store = setup();
        store.create_mission_action("run1", "create_deadline", &json!({"ord": 0})).unwrap();
        store.create_mission_action("run1", "create_deadline", &json!({"ord": 1})).unwrap();
        store.create_mission_action("run1", "draft_email", &json!({"ord": 2})).unwrap();
        let actions = store.list_pending_actions("run1").unwrap();
        assert_eq!(actions.len(), 3);
        for (i, a) in actions.iter().enumerate() {
            assert_eq!(a.payload["ord"], json!(i));
        }
    }

    #[test]
    fn find_run_by_request_id() {
        let store = setup();
        let run = store.find_mission_run_by_request("req-1").unwrap().unwrap();
        assert_eq!(run.id, "run1");
        assert!(store.find_mission_run_by_request("nope").unwrap().is_none());
    }
}
