use super::{now_rfc3339, Store};
use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::types::{ActionKind, Automation, BusEventKind, TriggerKind};
use rusqlite::{params, OptionalExtension, Row};

fn row_to_automation(row: &Row<'_>) -> rusqlite::Result<Automation> {
    let trigger_kind: String = row.get(4)?;
    let trigger_event: Option<String> = row.get(6)?;
    let action_kind: String = row.get(7)?;
    let action_config: String = row.get(8)?;
    Ok(Automation {
        id: row.get(0)?,
        domain_id: row.get(1)?,
        name: row.get(2)?,
        prompt_template: row.get(3)?,
        trigger_kind: TriggerKind::parse(&trigger_kind).unwrap_or(TriggerKind::Manual),
        trigger_cron: row.get(5)?,
        trigger_event: trigger_event.as_deref().and_then(BusEventKind::parse),
        action_kind: ActionKind::parse(&action_kind).unwrap_or(ActionKind::Notification),
        action_config: serde_json::from_str(&action_config).unwrap_or_default(),
        enabled: row.get::<_, i64>(9)? != 0,
        failure_streak: row.get(10)?,
        cooldown_until: row.get(11)?,
        run_count: row.get(12)?,
        last_run_at: row.get(13)?,
        store_payloads: row.get::<_, i64>(14)? != 0,
        catch_up_enabled: row.get::<_, i64>(15)? != 0,
        deadline_window_days: row.get(16)?,
        duplicate_skip_count: row.get(17)?,
        last_duplicate_at: row.get(18)?,
        created_at: row.get(19)?,
        updated_at: row.get(20)?,
    })
}

const AUTOMATION_COLS: &str = "id, domain_id, name, prompt_template, trigger_kind, trigger_cron, \
     trigger_event, action_kind, action_config, enabled, failure_streak, cooldown_until, \
     run_count, last_run_at, store_payloads, catch_up_enabled, deadline_window_days, \
     duplicate_skip_count, last_duplicate_at, created_at, updated_at";

/// Fields accepted at create/update time. The trigger invariants are
/// validated here, before any row is written.
#[derive(Debug, Clone)]
pub struct AutomationSpec {
    pub domain_id: String,
    pub name: String,
    pub prompt_template: String,
    pub trigger_kind: TriggerKind,
    pub trigger_cron: Option<String>,
    pub trigger_event: Option<BusEventKind>,
    pub action_kind: ActionKind,
    pub action_config: serde_json::Value,
    pub store_payloads: bool,
    pub catch_up_enabled: bool,
    pub deadline_window_days: Option<i64>,
}

impl AutomationSpec {
    /// Trigger fields are mutually exclusive per kind; catch_up only for
    /// schedule; deadline_window_days only for deadline_approaching.
    fn validate(&self) -> EngineResult<()> {
        match self.trigger_kind {
            TriggerKind::Schedule => {
                if self.trigger_cron.as_deref().map_or(true, str::is_empty) {
                    return Err(EngineError::Validation(
                        "schedule trigger requires trigger_cron".into(),
                    ));
                }
                if self.trigger_event.is_some() {
                    return Err(EngineError::Validation(
                        "schedule trigger must not set trigger_event".into(),
                    ));
                }
            }
            TriggerKind::Event => {
                if self.trigger_event.is_none() {
                    return Err(EngineError::Validation(
                        "event trigger requires trigger_event".into(),
                    ));
                }
                if self.trigger_cron.is_some() {
                    return Err(EngineError::Validation(
                        "event trigger must not set trigger_cron".into(),
                    ));
                }
            }
            TriggerKind::Manual => {
                if self.trigger_cron.is_some() || self.trigger_event.is_some() {
                    return Err(EngineError::Validation(
                        "manual trigger must not set trigger_cron or trigger_event".into(),
                    ));
                }
            }
        }
        if self.catch_up_enabled && self.trigger_kind != TriggerKind::Schedule {
            return Err(EngineError::Validation(
                "catch_up_enabled is only valid for schedule triggers".into(),
            ));
        }
        if self.deadline_window_days.is_some()
            && self.trigger_event != Some(BusEventKind::DeadlineApproaching)
        {
            return Err(EngineError::Validation(
                "deadline_window_days is only valid for the deadline_approaching event".into(),
            ));
        }
        Ok(())
    }
}

impl Store {
    // ── Automation CRUD ────────────────────────────────────────────────

    pub fn create_automation(&self, id: &str, spec: &AutomationSpec) -> EngineResult<Automation> {
        spec.validate()?;
        let conn = self.conn.lock();
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO automations
                 (id, domain_id, name, prompt_template, trigger_kind, trigger_cron,
                  trigger_event, action_kind, action_config, store_payloads,
                  catch_up_enabled, deadline_window_days, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
            params![
                id,
                spec.domain_id,
                spec.name,
                spec.prompt_template,
                spec.trigger_kind.as_str(),
                spec.trigger_cron,
                spec.trigger_event.map(|e| e.as_str()),
                spec.action_kind.as_str(),
                spec.action_config.to_string(),
                spec.store_payloads as i64,
                spec.catch_up_enabled as i64,
                spec.deadline_window_days,
                now
            ],
        )?;
        drop(conn);
        self.get_automation(id)?
            .ok_or_else(|| EngineError::Integrity(format!("automation {id} vanished after insert")))
    }

    pub fn get_automation(&self, id: &str) -> EngineResult<Option<Automation>> {
        let conn = self.conn.lock();
        let result = conn
            .query_row(
                &format!("SELECT {AUTOMATION_COLS} FROM automations WHERE id = ?1"),
                params![id],
                row_to_automation,
            )
            .optional()?;
        Ok(result)
    }

    pub fn list_automations(&self, domain_id: Option<&str>) -> EngineResult<Vec<Automation>> {
        let conn = self.conn.lock();
        let automations = match domain_id {
            Some(did) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {AUTOMATION_COLS} FROM automations WHERE domain_id = ?1 ORDER BY name"
                ))?;
                let rows = stmt
                    .query_map(params![did], row_to_automation)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn
                    .prepare(&format!("SELECT {AUTOMATION_COLS} FROM automations ORDER BY name"))?;
                let rows = stmt
                    .query_map([], row_to_automation)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(automations)
    }

    /// Enabled schedule automations with a cron expression.
    pub fn list_schedule_automations(&self) -> EngineResult<Vec<Automation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {AUTOMATION_COLS} FROM automations
             WHERE enabled = 1 AND trigger_kind = 'schedule' AND trigger_cron IS NOT NULL"
        ))?;
        let rows = stmt
            .query_map([], row_to_automation)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Enabled event automations subscribed to `event`.
    pub fn list_event_automations(&self, event: BusEventKind) -> EngineResult<Vec<Automation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {AUTOMATION_COLS} FROM automations
             WHERE enabled = 1 AND trigger_kind = 'event' AND trigger_event = ?1"
        ))?;
        let rows = stmt
            .query_map(params![event.as_str()], row_to_automation)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn set_automation_enabled(&self, id: &str, enabled: bool) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE automations SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
            params![enabled as i64, now_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn set_automation_cooldown(&self, id: &str, until: Option<&str>) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE automations SET cooldown_until = ?1, updated_at = ?2 WHERE id = ?3",
            params![until, now_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn reset_failure_streak(&self, id: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE automations SET failure_streak = 0, updated_at = ?1 WHERE id = ?2",
            params![now_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Returns the new streak value.
    pub fn increment_failure_streak(&self, id: &str) -> EngineResult<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE automations SET failure_streak = failure_streak + 1, updated_at = ?1
             WHERE id = ?2",
            params![now_rfc3339(), id],
        )?;
        let streak =
            conn.query_row("SELECT failure_streak FROM automations WHERE id = ?1", params![id], |r| {
                r.get(0)
            })?;
        Ok(streak)
    }

    pub fn record_automation_run(&self, id: &str, at: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE automations SET run_count = run_count + 1, last_run_at = ?1,
                 updated_at = ?1 WHERE id = ?2",
            params![at, id],
        )?;
        Ok(())
    }

    /// Called when a run insert lost the dedupe race.
    pub fn record_duplicate_skip(&self, id: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        let now = now_rfc3339();
        conn.execute(
            "UPDATE automations SET duplicate_skip_count = duplicate_skip_count + 1,
                 last_duplicate_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        Ok(())
    }

    pub fn delete_automation(&self, id: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM automations WHERE id = ?1", params![id])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_spec() -> AutomationSpec {
        AutomationSpec {
            domain_id: "d1".into(),
            name: "morning digest".into(),
            prompt_template: "Summarize {{domain_name}}".into(),
            trigger_kind: TriggerKind::Schedule,
            trigger_cron: Some("0 9 * * *".into()),
            trigger_event: None,
            action_kind: ActionKind::Notification,
            action_config: json!({}),
            store_payloads: false,
            catch_up_enabled: false,
            deadline_window_days: None,
        }
    }

    fn store_with_domain() -> Store {
        let store = Store::open_in_memory().unwrap();
        store.create_domain("d1", "Research", "/kb").unwrap();
        store
    }

    #[test]
    fn trigger_fields_are_mutually_exclusive() {
        let store = store_with_domain();

        let mut spec = base_spec();
        spec.trigger_event = Some(BusEventKind::IntakeCreated);
        assert!(matches!(
            store.create_automation("a1", &spec),
            Err(EngineError::Validation(_))
        ));

        let mut spec = base_spec();
        spec.trigger_kind = TriggerKind::Event;
        spec.trigger_cron = None;
        spec.trigger_event = None;
        assert!(matches!(
            store.create_automation("a2", &spec),
            Err(EngineError::Validation(_))
        ));

        let mut spec = base_spec();
        spec.trigger_kind = TriggerKind::Manual;
        assert!(matches!(
            store.create_automation("a3", &spec),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn catch_up_requires_schedule() {
        let store = store_with_domain();
        let mut spec = base_spec();
        spec.trigger_kind = TriggerKind::Manual;
        spec.trigger_cron = None;
        spec.catch_up_enabled = true;
        assert!(matches!(
            store.create_automation("a1", &spec),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn deadline_window_requires_deadline_event() {
        let store = store_with_domain();
        let mut spec = base_spec();
        spec.trigger_kind = TriggerKind::Event;
        spec.trigger_cron = None;
        spec.trigger_event = Some(BusEventKind::IntakeCreated);
        spec.deadline_window_days = Some(7);
        assert!(matches!(
            store.create_automation("a1", &spec),
            Err(EngineError::Validation(_))
        ));

        spec.trigger_event = Some(BusEventKind::DeadlineApproaching);
        let a = store.create_automation("a2", &spec).unwrap();
        assert_eq!(a.deadline_window_days, Some(7));
    }

    #[test]
    fn streak_and_duplicate_counters() {
        let store = store_with_domain();
        store.create_automation("a1", &base_spec()).unwrap();
        assert_eq!(store.increment_failure_streak("a1").unwrap(), 1);
        assert_eq!(store.increment_failure_streak("a1").unwrap(), 2);
        store.reset_failure_streak("a1").unwrap();
        let a = store.get_automation("a1").unwrap().unwrap();
        assert_eq!(a.failure_streak, 0);

        store.record_duplicate_skip("a1").unwrap();
        let a = store.get_automation("a1").unwrap().unwrap();
        assert_eq!(a.duplicate_skip_count, 1);
        assert!(a.last_duplicate_at.is_some());
    }
}
